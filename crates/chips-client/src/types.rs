use serde::Serialize;
use tokio::sync::mpsc;

/// Which side of the handshake this client plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Lexicographic tie-break over the two peer ids.
    ///
    /// The smaller id offers. Both peers evaluate this with the arguments
    /// swapped and so land on complementary roles.
    pub fn decide(local_id: &str, partner_id: &str) -> Self {
        if local_id < partner_id {
            Self::Initiator
        } else {
            Self::Responder
        }
    }
}

/// Per-session transport state as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Idle,
    Negotiating,
    DirectConnected,
    Degraded,
    RelayOnly,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkQuality {
    Unknown,
    Excellent,
    Good,
    Poor,
}

impl std::fmt::Display for LinkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Poor => "poor",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Direct,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Text,
    Image,
    PhotoRequest,
    Control,
}

/// Local-then-confirmed delivery status for outgoing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    pub direction: Direction,
    pub kind: MessageKind,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// ISO-8601
    pub timestamp: String,
    pub status: DeliveryStatus,
    /// Transport the message left or arrived on, once known.
    pub via: Option<Transport>,
}

/// One matched pairing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub role: Role,
    pub partner_id: String,
    pub partner_name: String,
    pub room_id: String,
    pub created_at_ms: u64,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Leave,
    Report,
    PartnerDisconnected(Option<String>),
    ServerDisconnected,
    /// Reconnect attempts ran out with no direct link to fall back on.
    SignalingExhausted,
    SignalingReset,
    Rematched,
    Shutdown,
}

/// Counters handed to analytics when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub duration_ms: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub used_direct_link: bool,
}

/// Point-in-time performance counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub average_latency_ms: Option<f64>,
    pub latency_samples: usize,
    pub dedup_cache_size: usize,
    pub connection_attempts: u64,
    pub failed_connections: u64,
    pub direct_link_established_ms: Option<u64>,
}

/// Signaling connectivity as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingStatus {
    Connecting,
    Connected,
    Retrying { attempt: u32, max: u32 },
    Disconnected { recoverable: bool },
}

/// Everything the session core tells the application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    Signaling { status: SignalingStatus, message: Option<String> },
    Matched { session: Session },
    MessageAdded { message: Message },
    MessageUpdated { message: Message },
    MessagesCleared,
    ConnectionState { state: ConnectionState },
    Quality { quality: LinkQuality },
    SessionEnded { reason: EndReason },
    QueueTimeout { message: String },
    RateLimited,
    /// Reconnect attempts exhausted; only a manual reconnect helps now.
    LinkExhausted { attempts: u32, message: String },
    Stats { stats: SessionStats },
}

/// Fan-out of [`Notification`]s to whoever is listening.
///
/// A dropped receiver is not an error; notifications are then discarded.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn new(tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}
