//! Inputs to [`SessionController::handle`](crate::session::SessionController::handle).
//!
//! Every callback from the outside world (signaling socket, peer connection,
//! timers, image worker, user) is turned into one of these and fed through a
//! single dispatch point.

use chips_common::{Error, ServerFrame};
use serde_json::Value;

use crate::ports::{LinkId, SendTag, TimerId};

/// An image picked by the user.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageUpload {
    pub filename: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    /// Local id of an earlier image this one supersedes.
    pub replace_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect,
    Join { name: String },
    SendText(String),
    SendImage(ImageUpload),
    RequestPhoto,
    Leave,
    Report,
    /// Manual reconnect, allowed after the link is exhausted.
    Reconnect,
    ClearMessages,
    ReportStats,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the connection on purpose; no automatic reconnect.
    Server,
    /// The transport dropped; reconnect automatically.
    Transport(String),
}

impl DisconnectReason {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[derive(Debug)]
pub enum SignalEvent {
    Connected,
    ConnectError(String),
    Disconnected(DisconnectReason),
    Inbound(ServerFrame),
    /// A frame arrived that could not be decoded.
    Malformed(Error),
}

/// Peer connection state as reported by the handshake context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    LocalOffer(Value),
    LocalAnswer(Value),
    LocalCandidate(Value),
    StateChanged(PeerState),
    ChannelOpen,
    ChannelClosed,
    ChannelMessage(String),
    ChannelError(String),
    /// A queued send on the sub-channel failed.
    SendFailed { tag: SendTag, error: String },
    /// Creating or applying a session description failed.
    NegotiationFailed(String),
}

#[derive(Debug)]
pub enum SessionEvent {
    Command(Command),
    Signal(SignalEvent),
    Link { link_id: LinkId, event: LinkEvent },
    Timer(TimerId),
    ImageCompressed {
        job: u64,
        result: chips_common::Result<Vec<u8>>,
    },
}

impl From<Command> for SessionEvent {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<SignalEvent> for SessionEvent {
    fn from(event: SignalEvent) -> Self {
        Self::Signal(event)
    }
}
