//! Common error types for Chips.

use thiserror::Error;

/// Result type alias using Chips' error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Chips operations.
///
/// The first five variants are the session-level taxonomy. Only
/// [`Error::LinkExhausted`] ever requires the user to step in; everything else
/// is recovered locally and at most reported to analytics.
#[derive(Debug, Error)]
pub enum Error {
    /// Direct-link handshake or candidate exchange failed
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// A single send failed on an otherwise open channel
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Malformed inbound payload
    #[error("parse error: {0}")]
    Parse(String),

    /// No progress within an expected window
    #[error("timeout: {0}")]
    Timeout(String),

    /// Signaling reconnect attempts exhausted
    #[error("signaling link exhausted after {attempts} attempts")]
    LinkExhausted { attempts: u32 },

    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Image decode/encode error
    #[error("image error: {0}")]
    Image(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    /// Create a transport send error from any displayable type.
    pub fn transport_send(msg: impl std::fmt::Display) -> Self {
        Self::TransportSend(msg.to_string())
    }

    /// Create a parse error from any displayable type.
    pub fn parse(msg: impl std::fmt::Display) -> Self {
        Self::Parse(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an image error from any displayable type.
    pub fn image(msg: impl std::fmt::Display) -> Self {
        Self::Image(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Short identifier used when reporting the error to analytics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Negotiation(_) => "negotiation_error",
            Self::TransportSend(_) => "transport_send_error",
            Self::Parse(_) => "parse_error",
            Self::Timeout(_) => "timeout",
            Self::LinkExhausted { .. } => "link_exhausted",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Config(_) => "config_error",
            Self::Image(_) => "image_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Area of the client an error is reported under.
    pub fn feature(&self) -> &'static str {
        match self {
            Self::Negotiation(_) | Self::Timeout(_) => "webrtc",
            Self::TransportSend(_) | Self::Parse(_) => "messaging",
            Self::LinkExhausted { .. } => "socket",
            Self::Image(_) => "image",
            Self::Io(_) | Self::Serialization(_) | Self::Config(_) | Self::Internal(_) => "client",
        }
    }

    /// True only for conditions no automatic recovery will fix.
    pub fn requires_manual_intervention(&self) -> bool {
        matches!(self, Self::LinkExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_link_exhausted_needs_user() {
        assert!(Error::LinkExhausted { attempts: 5 }.requires_manual_intervention());
        assert!(!Error::negotiation("ice failed").requires_manual_intervention());
        assert!(!Error::timeout("grace elapsed").requires_manual_intervention());
        assert!(!Error::parse("bad json").requires_manual_intervention());
        assert!(!Error::transport_send("closed").requires_manual_intervention());
    }

    #[test]
    fn test_display_and_kind() {
        let err = Error::LinkExhausted { attempts: 5 };
        assert_eq!(err.to_string(), "signaling link exhausted after 5 attempts");
        assert_eq!(err.kind(), "link_exhausted");
        assert_eq!(Error::parse("x").kind(), "parse_error");
        assert_eq!(err.feature(), "socket");
        assert_eq!(Error::timeout("grace").feature(), "webrtc");
    }
}
