//! Chips session core.
//!
//! Pairs two anonymous peers and carries their chat over a direct WebRTC
//! data channel when one can be negotiated, or over the matchmaking server's
//! relay when it cannot.
//!
//! The state machine ([`session::SessionController`]) is synchronous and
//! driven by [`event::SessionEvent`]s; all I/O sits behind the traits in
//! [`ports`]. [`runtime::ChatClient`] wires tokio implementations of those
//! ports to a single event loop.

#![forbid(unsafe_code)]

pub mod analytics;
pub mod config;
pub mod dummy;
pub mod event;
pub mod images;
pub mod negotiator;
pub mod ports;
pub mod quality;
pub mod router;
pub mod runtime;
pub mod session;
pub mod signaling;
pub mod types;
pub mod webrtc_link;
pub mod ws;

pub use config::ClientConfig;
pub use event::{Command, ImageUpload, SessionEvent};
pub use runtime::ChatClient;
pub use session::{SessionController, SessionPorts};
pub use types::*;
