use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Every signaling frame travels as `{"event": <name>, "data": <payload>}`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Frames the client sends to the matchmaking server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// Enter the matchmaking queue under a display name.
    Join { name: String },
    /// Leave the current pairing.
    Leave,
    /// Report the partner and leave.
    Report,
    /// Opaque handshake offer for the partner.
    Offer { offer: Value },
    /// Opaque handshake answer for the partner.
    Answer { answer: Value },
    /// Trickled connectivity candidate for the partner.
    IceCandidate { candidate: Value },
    /// Chat text relayed by the server.
    Message { text: String },
    /// Ask the partner for a photo.
    ReqPhoto,
}

impl ClientFrame {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave => "leave",
            Self::Report => "report",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Message { .. } => "message",
            Self::ReqPhoto => "req-photo",
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let data = match self {
            Self::Join { name } => serde_json::json!({ "name": name }),
            Self::Offer { offer } => serde_json::json!({ "offer": offer }),
            Self::Answer { answer } => serde_json::json!({ "answer": answer }),
            Self::IceCandidate { candidate } => serde_json::json!({ "candidate": candidate }),
            Self::Message { text } => serde_json::json!({ "text": text }),
            Self::Leave | Self::Report | Self::ReqPhoto => serde_json::json!({}),
        };
        Envelope {
            event: self.event_name().to_string(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(&self.to_envelope()).map_err(Error::serialization)
    }
}

/// Pairing notification sent once the server has found a partner.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MatchedInfo {
    #[serde(rename = "partnerId")]
    pub partner_id: String,
    #[serde(rename = "partnerName", default)]
    pub partner_name: String,
    #[serde(rename = "roomId", default)]
    pub room_id: String,
}

/// Server timestamps arrive either as epoch milliseconds or as a string.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(i64),
    Text(String),
}

impl std::fmt::Display for WireTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Millis(ms) => write!(f, "{ms}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Chat message delivered through the relay path.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RelayMessage {
    pub text: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
}

/// Frames the matchmaking server sends to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Matched(MatchedInfo),
    Offer { offer: Value },
    Answer { answer: Value },
    IceCandidate { candidate: Value },
    Message(RelayMessage),
    /// Photo request; `legacy` is set for the older `photo-request` event name.
    PhotoRequest { legacy: bool },
    PartnerDisconnected { reason: Option<String> },
    QueueTimeout,
    RateLimited,
}

#[derive(Deserialize)]
struct OfferData {
    offer: Value,
}

#[derive(Deserialize)]
struct AnswerData {
    answer: Value,
}

#[derive(Deserialize)]
struct CandidateData {
    candidate: Value,
}

#[derive(Deserialize, Default)]
struct DisconnectData {
    #[serde(default)]
    reason: Option<String>,
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| Error::parse(format!("{event}: {e}")))
}

impl ServerFrame {
    /// Decode one text frame from the signaling socket.
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text).map_err(Error::parse)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        let Envelope { event, data } = envelope;
        let frame = match event.as_str() {
            "matched" => Self::Matched(payload(&event, data)?),
            "offer" => Self::Offer {
                offer: payload::<OfferData>(&event, data)?.offer,
            },
            "answer" => Self::Answer {
                answer: payload::<AnswerData>(&event, data)?.answer,
            },
            "ice-candidate" => Self::IceCandidate {
                candidate: payload::<CandidateData>(&event, data)?.candidate,
            },
            "message" => Self::Message(payload(&event, data)?),
            "req-photo" => Self::PhotoRequest { legacy: false },
            "photo-request" => Self::PhotoRequest { legacy: true },
            "partner-disconnected" => {
                let data: DisconnectData = if data.is_null() {
                    DisconnectData::default()
                } else {
                    payload(&event, data)?
                };
                Self::PartnerDisconnected {
                    reason: data.reason,
                }
            }
            "queue-timeout" => Self::QueueTimeout,
            "rate-limited" => Self::RateLimited,
            other => return Err(Error::parse(format!("unknown event `{other}`"))),
        };
        Ok(frame)
    }
}

/// Application payloads carried on the direct data channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerPayload {
    /// Chat text.
    Message {
        text: String,
        #[serde(rename = "sentAt", default, skip_serializing_if = "Option::is_none")]
        sent_at: Option<u64>,
    },

    /// Encoded image. `replace_message_id` names an image this one supersedes.
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        filename: String,
        data: String,
        #[serde(
            rename = "replaceMessageId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        replace_message_id: Option<String>,
    },

    /// Ask the partner for a photo.
    PhotoRequest,

    /// Latency probe.
    Ping {
        #[serde(rename = "sentAt")]
        sent_at: u64,
    },

    /// Probe echo; carries the `sentAt` of the ping it answers.
    Pong {
        #[serde(rename = "sentAt")]
        sent_at: u64,
    },
}

impl PeerPayload {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::serialization)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::parse)
    }
}
