//! Seams between the session state machine and the outside world.
//!
//! Production implementations live in [`crate::runtime`], in-memory ones in
//! [`crate::dummy`].

use std::time::Duration;

use chips_common::{ClientFrame, Result};
use serde_json::Value;

use crate::types::Role;

/// Generation tag of one direct link; events from older links are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Travels with a direct-link payload and comes back in
/// `LinkEvent::SendFailed` if the transmit fails after it was queued.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendTag {
    /// Local message carried by the payload.
    pub message_id: Option<String>,
    /// Frame to relay instead when the direct transmit fails.
    pub fallback: Option<ClientFrame>,
}

impl SendTag {
    /// Probes and other traffic nobody waits on.
    pub fn untracked() -> Self {
        Self::default()
    }
}

/// Control channel to the matchmaking server.
pub trait SignalingTransport: Send {
    /// Start a connection attempt. The outcome arrives later as
    /// `SignalEvent::Connected` or `SignalEvent::ConnectError`.
    fn connect(&mut self) -> Result<()>;

    fn send(&mut self, frame: ClientFrame) -> Result<()>;

    /// Drop the connection without reporting a disconnect. Idempotent.
    fn disconnect(&mut self);
}

/// Creates direct links.
pub trait PeerConnector: Send {
    /// Create the handshake context. An initiator also creates the `chat`
    /// sub-channel and produces a local offer.
    fn open(&mut self, link_id: LinkId, role: Role) -> Result<Box<dyn DirectLink>>;
}

/// One negotiated peer channel.
pub trait DirectLink: Send {
    fn accept_offer(&mut self, offer: Value) -> Result<()>;
    fn accept_answer(&mut self, answer: Value) -> Result<()>;
    fn add_candidate(&mut self, candidate: Value) -> Result<()>;

    /// Queue one text payload on the sub-channel, preserving order. `Ok` only
    /// means queued; a later transmit failure is reported as
    /// `LinkEvent::SendFailed` carrying `tag`.
    fn send(&mut self, payload: &str, tag: SendTag) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Release the handshake context and sub-channel. Idempotent.
    fn close(&mut self);
}

/// One-shot timers. A fired timer arrives as `SessionEvent::Timer`.
pub trait Scheduler: Send {
    fn schedule(&mut self, after: Duration) -> TimerId;

    /// Idempotent; a cancelled timer never fires.
    fn cancel(&mut self, id: TimerId);
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressJob {
    pub id: u64,
    pub bytes: Vec<u8>,
    pub quality: f32,
    pub max_edge: u32,
}

/// Recompresses images off the event loop; the result arrives as
/// `SessionEvent::ImageCompressed`.
pub trait ImageCompressor: Send {
    fn compress(&mut self, job: CompressJob) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chips_common::helpers::now_ms()
    }
}
