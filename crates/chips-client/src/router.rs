//! Message routing between the application and whichever transport is live.
//!
//! Outbound traffic goes over the direct link when it is open and over the
//! signaling relay otherwise. The transport for a send is chosen once, when
//! the send starts; a direct failure moves that single message to the relay.
//!
//! Inbound relay messages pass through a [`DedupCache`] keyed on a SHA-256
//! fingerprint of sender, timestamp and the first 50 characters of text.

use std::collections::{HashMap, HashSet, VecDeque};

use chips_common::helpers::{iso_timestamp, truncate_chars};
use chips_common::{ClientFrame, Error, PeerPayload, RelayMessage, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::analytics::Reporter;
use crate::ports::SendTag;
use crate::types::{
    DeliveryStatus, Direction, Message, MessageKind, Notification, Notifier, Transport,
};

/// Characters of message text that feed the fingerprint.
pub const FINGERPRINT_TEXT_CHARS: usize = 50;

const PHOTO_REQUEST_TEXT: &str = "requested a photo";

pub type Fingerprint = [u8; 32];

pub fn fingerprint(from: &str, timestamp: &str, text: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    for part in [from, timestamp, truncate_chars(text, FINGERPRINT_TEXT_CHARS)] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().into()
}

/// Bounded set of recently seen fingerprints.
///
/// When full, the oldest fingerprint is evicted to make room, so a duplicate
/// is suppressed for as long as its fingerprint is among the last `capacity`
/// distinct ones seen.
#[derive(Debug, Clone)]
pub struct DedupCache {
    seen: HashSet<Fingerprint>,
    order: VecDeque<Fingerprint>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns true the first time a fingerprint is seen.
    pub fn insert(&mut self, fp: Fingerprint) -> bool {
        if self.seen.contains(&fp) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(fp);
        self.order.push_back(fp);
        true
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.seen.contains(fp)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

/// The two transports as seen by the router.
pub trait Outbound {
    fn direct_open(&self) -> bool;
    fn send_direct(&mut self, payload: &str, tag: SendTag) -> Result<()>;
    fn send_relay(&mut self, frame: ClientFrame) -> Result<()>;
}

/// Result of an outbound send.
#[derive(Debug)]
pub struct SendReport {
    pub message_id: String,
    pub via: Option<Transport>,
    /// Set when the direct link was tried and failed.
    pub direct_error: Option<Error>,
}

/// A payload from the direct link that is not a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFrame {
    Ping { sent_at: u64 },
    Pong { sent_at: u64 },
}

pub struct MessageRouter {
    messages: Vec<Message>,
    counter: u64,
    dedup: DedupCache,
    /// Sender's image ids mapped to local ids, for in-place replacement.
    remote_images: HashMap<String, String>,
    messages_sent: u64,
    messages_received: u64,
    notifier: Notifier,
    analytics: Reporter,
}

impl MessageRouter {
    pub fn new(dedup_capacity: usize, notifier: Notifier, analytics: Reporter) -> Self {
        Self {
            messages: Vec::new(),
            counter: 0,
            dedup: DedupCache::new(dedup_capacity),
            remote_images: HashMap::new(),
            messages_sent: 0,
            messages_received: 0,
            notifier,
            analytics,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    fn next_id(&mut self, now_ms: u64) -> String {
        self.counter += 1;
        format!("msg_{now_ms}_{}", self.counter)
    }

    fn push(&mut self, message: Message) {
        self.notifier.send(Notification::MessageAdded {
            message: message.clone(),
        });
        self.messages.push(message);
    }

    fn update(&mut self, id: &str, f: impl FnOnce(&mut Message)) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            f(message);
            self.notifier.send(Notification::MessageUpdated {
                message: message.clone(),
            });
        }
    }

    pub fn set_status(&mut self, id: &str, status: DeliveryStatus, via: Option<Transport>) {
        self.update(id, |m| {
            m.status = status;
            if via.is_some() {
                m.via = via;
            }
        });
    }

    /// Send chat text. Whitespace-only input is ignored.
    pub fn send_text(
        &mut self,
        text: &str,
        now_ms: u64,
        out: &mut dyn Outbound,
    ) -> Option<SendReport> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let id = self.next_id(now_ms);
        self.push(Message {
            id: id.clone(),
            direction: Direction::Sent,
            kind: MessageKind::Text,
            text: text.to_string(),
            image_data: None,
            replace_message_id: None,
            from: None,
            timestamp: iso_timestamp(now_ms),
            status: DeliveryStatus::Pending,
            via: None,
        });

        let mut direct_error = None;
        if out.direct_open() {
            let payload = PeerPayload::Message {
                text: text.to_string(),
                sent_at: Some(now_ms),
            };
            let tag = SendTag {
                message_id: Some(id.clone()),
                fallback: Some(ClientFrame::Message {
                    text: text.to_string(),
                }),
            };
            match payload.encode().and_then(|p| out.send_direct(&p, tag)) {
                Ok(()) => {
                    return Some(self.confirm(id, text.len(), Transport::Direct, None));
                }
                Err(e) => {
                    warn!(error = %e, "direct send failed, falling back to relay");
                    self.analytics.error("webrtc_send_failed", "messaging");
                    direct_error = Some(e);
                }
            }
        }

        match out.send_relay(ClientFrame::Message {
            text: text.to_string(),
        }) {
            Ok(()) => Some(self.confirm(id, text.len(), Transport::Relay, direct_error)),
            Err(e) => {
                warn!(error = %e, "relay send failed");
                self.analytics.error("message_send_failed", "messaging");
                self.set_status(&id, DeliveryStatus::Failed, None);
                Some(SendReport {
                    message_id: id,
                    via: None,
                    direct_error,
                })
            }
        }
    }

    fn confirm(
        &mut self,
        id: String,
        length: usize,
        via: Transport,
        direct_error: Option<Error>,
    ) -> SendReport {
        self.messages_sent += 1;
        self.analytics.message_sent(length, None);
        self.set_status(&id, DeliveryStatus::Sent, Some(via));
        debug!(id = %id, ?via, "message sent");
        SendReport {
            message_id: id,
            via: Some(via),
            direct_error,
        }
    }

    /// Ask the partner for a photo; no local message is recorded.
    pub fn request_photo(&mut self, out: &mut dyn Outbound) -> Option<Transport> {
        if out.direct_open() {
            let tag = SendTag {
                message_id: None,
                fallback: Some(ClientFrame::ReqPhoto),
            };
            match PeerPayload::PhotoRequest
                .encode()
                .and_then(|p| out.send_direct(&p, tag))
            {
                Ok(()) => return Some(Transport::Direct),
                Err(e) => warn!(error = %e, "direct photo request failed, using relay"),
            }
        }
        match out.send_relay(ClientFrame::ReqPhoto) {
            Ok(()) => Some(Transport::Relay),
            Err(e) => {
                warn!(error = %e, "photo request could not be sent");
                None
            }
        }
    }

    /// A direct payload that was already counted as sent failed on the wire.
    /// Text and photo requests go out again over the relay; images have no
    /// relay path and are marked failed. Returns where the payload went.
    pub fn direct_send_failed(
        &mut self,
        tag: SendTag,
        error: &Error,
        out: &mut dyn Outbound,
    ) -> Option<Transport> {
        let SendTag {
            message_id,
            fallback,
        } = tag;
        let kind = message_id
            .as_deref()
            .and_then(|id| self.message(id))
            .map(|m| m.kind);
        if kind == Some(MessageKind::Image) {
            warn!(error = %error, "image lost on the direct link");
            self.analytics.error("image_send_failed", "webrtc");
            if let Some(id) = &message_id {
                self.set_status(id, DeliveryStatus::Failed, None);
            }
            return None;
        }

        warn!(error = %error, id = ?message_id, "queued direct send failed, falling back to relay");
        self.analytics.error("webrtc_send_failed", "messaging");
        let frame = fallback?;
        match out.send_relay(frame) {
            Ok(()) => {
                if let Some(id) = &message_id {
                    self.set_status(id, DeliveryStatus::Sent, Some(Transport::Relay));
                }
                Some(Transport::Relay)
            }
            Err(e) => {
                warn!(error = %e, "relay fallback failed");
                self.analytics.error("message_send_failed", "messaging");
                if let Some(id) = &message_id {
                    self.set_status(id, DeliveryStatus::Failed, None);
                }
                None
            }
        }
    }

    /// Record an outgoing image before it is transmitted. With
    /// `replace_message_id` the earlier image is updated in place.
    pub fn upsert_sent_image(
        &mut self,
        filename: &str,
        data_url: String,
        replace_message_id: Option<&str>,
        now_ms: u64,
    ) -> String {
        if let Some(existing) = replace_message_id.filter(|id| self.message(id).is_some()) {
            let id = existing.to_string();
            self.update(&id, |m| {
                m.text = format!("Image: {filename}");
                m.image_data = Some(data_url);
                m.timestamp = iso_timestamp(now_ms);
                m.status = DeliveryStatus::Pending;
                m.via = None;
            });
            return id;
        }
        let id = self.next_id(now_ms);
        self.push(Message {
            id: id.clone(),
            direction: Direction::Sent,
            kind: MessageKind::Image,
            text: format!("Image: {filename}"),
            image_data: Some(data_url),
            replace_message_id: replace_message_id.map(str::to_string),
            from: None,
            timestamp: iso_timestamp(now_ms),
            status: DeliveryStatus::Pending,
            via: None,
        });
        id
    }

    /// Handle one payload from the direct link. Probe frames are handed back
    /// to the caller and never become chat messages.
    pub fn receive_direct(&mut self, raw: &str, now_ms: u64) -> Option<ProbeFrame> {
        let payload = match PeerPayload::decode(raw) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "dropping malformed direct payload");
                self.analytics.error("message_parse_error", "webrtc");
                return None;
            }
        };
        match payload {
            PeerPayload::Ping { sent_at } => Some(ProbeFrame::Ping { sent_at }),
            PeerPayload::Pong { sent_at } => Some(ProbeFrame::Pong { sent_at }),
            PeerPayload::Message { text, .. } => {
                self.receive(MessageKind::Text, text, None, Transport::Direct, now_ms);
                None
            }
            PeerPayload::PhotoRequest => {
                self.receive_photo_request(Transport::Direct, now_ms);
                None
            }
            PeerPayload::Image {
                id,
                filename,
                data,
                replace_message_id,
            } => {
                self.receive_image(id, filename, data, replace_message_id, now_ms);
                None
            }
        }
    }

    /// Handle a relayed chat message. Returns false for a suppressed duplicate.
    pub fn receive_relay(&mut self, msg: RelayMessage, now_ms: u64) -> bool {
        let from = msg.from.clone().unwrap_or_default();
        let stamp = msg.timestamp.as_ref().map(|t| t.to_string()).unwrap_or_default();
        let fp = fingerprint(&from, &stamp, &msg.text);
        if !self.dedup.insert(fp) {
            debug!(fingerprint = %hex::encode(&fp[..6]), "duplicate relay message suppressed");
            return false;
        }
        let timestamp = match msg.timestamp {
            Some(chips_common::WireTimestamp::Text(s)) => s,
            Some(chips_common::WireTimestamp::Millis(ms)) => {
                iso_timestamp(u64::try_from(ms).unwrap_or(now_ms))
            }
            None => iso_timestamp(now_ms),
        };
        let id = self.next_id(now_ms);
        self.messages_received += 1;
        self.push(Message {
            id,
            direction: Direction::Received,
            kind: MessageKind::Text,
            text: msg.text,
            image_data: None,
            replace_message_id: None,
            from: msg.from,
            timestamp,
            status: DeliveryStatus::Sent,
            via: Some(Transport::Relay),
        });
        true
    }

    pub fn receive_photo_request(&mut self, via: Transport, now_ms: u64) {
        self.receive(
            MessageKind::PhotoRequest,
            PHOTO_REQUEST_TEXT.to_string(),
            None,
            via,
            now_ms,
        );
    }

    fn receive(
        &mut self,
        kind: MessageKind,
        text: String,
        image_data: Option<String>,
        via: Transport,
        now_ms: u64,
    ) -> String {
        let id = self.next_id(now_ms);
        if kind == MessageKind::Text {
            self.messages_received += 1;
        }
        self.push(Message {
            id: id.clone(),
            direction: Direction::Received,
            kind,
            text,
            image_data,
            replace_message_id: None,
            from: None,
            timestamp: iso_timestamp(now_ms),
            status: DeliveryStatus::Sent,
            via: Some(via),
        });
        id
    }

    fn receive_image(
        &mut self,
        remote_id: Option<String>,
        filename: String,
        data: String,
        replace: Option<String>,
        now_ms: u64,
    ) {
        let target = replace
            .as_ref()
            .and_then(|r| self.remote_images.get(r))
            .filter(|local| self.message(local).is_some())
            .cloned();
        if let Some(local) = target {
            self.update(&local, |m| {
                m.text = format!("Image: {filename}");
                m.image_data = Some(data);
                m.timestamp = iso_timestamp(now_ms);
            });
            if let Some(remote) = remote_id {
                self.remote_images.insert(remote, local);
            }
            return;
        }
        let local = self.receive(
            MessageKind::Image,
            format!("Image: {filename}"),
            Some(data),
            Transport::Direct,
            now_ms,
        );
        if let Some(remote) = remote_id {
            self.remote_images.insert(remote, local);
        }
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.remote_images.clear();
        self.notifier.send(Notification::MessagesCleared);
    }

    /// Drop per-session state: dedup fingerprints, image id mappings and
    /// counters. The message list itself is left to the caller.
    pub fn reset_session(&mut self) {
        self.dedup.clear();
        self.remote_images.clear();
        self.messages_sent = 0;
        self.messages_received = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::Reporter;
    use crate::dummy::RecordingAnalytics;
    use chips_common::WireTimestamp;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeWire {
        open: bool,
        fail_direct: bool,
        direct: Vec<String>,
        relay: Vec<ClientFrame>,
    }

    impl Outbound for FakeWire {
        fn direct_open(&self) -> bool {
            self.open
        }

        fn send_direct(&mut self, payload: &str, _tag: SendTag) -> Result<()> {
            if self.fail_direct {
                return Err(Error::transport_send("buffer full"));
            }
            self.direct.push(payload.to_string());
            Ok(())
        }

        fn send_relay(&mut self, frame: ClientFrame) -> Result<()> {
            self.relay.push(frame);
            Ok(())
        }
    }

    fn router() -> (MessageRouter, RecordingAnalytics) {
        let analytics = RecordingAnalytics::new();
        let (notifier, _rx) = Notifier::channel();
        (
            MessageRouter::new(1000, notifier, Reporter::new(Arc::new(analytics.clone()))),
            analytics,
        )
    }

    fn relay_msg(text: &str, from: &str, ts: i64) -> RelayMessage {
        RelayMessage {
            text: text.into(),
            from: Some(from.into()),
            timestamp: Some(WireTimestamp::Millis(ts)),
        }
    }

    #[test]
    fn test_whitespace_is_noop() {
        let (mut router, _) = router();
        let mut wire = FakeWire::default();
        assert!(router.send_text("   \n\t", 0, &mut wire).is_none());
        assert!(router.messages().is_empty());
        assert!(wire.relay.is_empty());
    }

    #[test]
    fn test_direct_when_open() {
        let (mut router, _) = router();
        let mut wire = FakeWire {
            open: true,
            ..Default::default()
        };
        let report = router.send_text(" hello ", 7, &mut wire).unwrap();
        assert_eq!(report.via, Some(Transport::Direct));
        assert_eq!(wire.direct.len(), 1);
        assert!(wire.relay.is_empty());
        let msg = &router.messages()[0];
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.status, DeliveryStatus::Sent);
        assert_eq!(msg.id, "msg_7_1");
    }

    #[test]
    fn test_direct_failure_falls_back_for_one_message() {
        let (mut router, analytics) = router();
        let mut wire = FakeWire {
            open: true,
            fail_direct: true,
            ..Default::default()
        };
        let report = router.send_text("hi", 0, &mut wire).unwrap();
        assert_eq!(report.via, Some(Transport::Relay));
        assert!(matches!(report.direct_error, Some(Error::TransportSend(_))));
        assert_eq!(
            wire.relay,
            vec![ClientFrame::Message { text: "hi".into() }]
        );
        assert!(analytics.has_error("webrtc_send_failed"));

        wire.fail_direct = false;
        let report = router.send_text("again", 1, &mut wire).unwrap();
        assert_eq!(report.via, Some(Transport::Direct));
    }

    #[test]
    fn test_queued_failure_resends_text_over_relay() {
        let (mut router, analytics) = router();
        let mut wire = FakeWire {
            open: true,
            ..Default::default()
        };
        let report = router.send_text("hi", 0, &mut wire).unwrap();
        let tag = SendTag {
            message_id: Some(report.message_id.clone()),
            fallback: Some(ClientFrame::Message { text: "hi".into() }),
        };
        let via = router.direct_send_failed(tag, &Error::transport_send("sctp"), &mut wire);
        assert_eq!(via, Some(Transport::Relay));
        assert_eq!(wire.relay, vec![ClientFrame::Message { text: "hi".into() }]);
        let msg = router.message(&report.message_id).unwrap();
        assert_eq!(msg.via, Some(Transport::Relay));
        assert_eq!(msg.status, DeliveryStatus::Sent);
        assert!(analytics.has_error("webrtc_send_failed"));
        assert_eq!(router.messages_sent(), 1);
    }

    #[test]
    fn test_queued_image_failure_marks_failed() {
        let (mut router, analytics) = router();
        let mut wire = FakeWire::default();
        let id = router.upsert_sent_image("a.png", "data".into(), None, 0);
        let tag = SendTag {
            message_id: Some(id.clone()),
            fallback: None,
        };
        assert_eq!(
            router.direct_send_failed(tag, &Error::transport_send("sctp"), &mut wire),
            None
        );
        assert!(wire.relay.is_empty());
        assert_eq!(router.message(&id).unwrap().status, DeliveryStatus::Failed);
        assert!(analytics.has_error("image_send_failed"));
    }

    #[test]
    fn test_relay_duplicates_suppressed() {
        let (mut router, _) = router();
        assert!(router.receive_relay(relay_msg("yo", "b", 100), 0));
        assert!(!router.receive_relay(relay_msg("yo", "b", 100), 0));
        assert!(router.receive_relay(relay_msg("yo", "b", 101), 0));
        assert_eq!(router.messages().len(), 2);
        assert_eq!(router.dedup().len(), 2);
    }

    #[test]
    fn test_fingerprint_uses_prefix_only() {
        let long_a = format!("{}{}", "x".repeat(50), "tail-a");
        let long_b = format!("{}{}", "x".repeat(50), "tail-b");
        assert_eq!(fingerprint("b", "1", &long_a), fingerprint("b", "1", &long_b));
        assert_ne!(fingerprint("b", "1", "x"), fingerprint("b1", "", "x"));
    }

    #[test]
    fn test_dedup_evicts_oldest() {
        let mut cache = DedupCache::new(2);
        let a = fingerprint("a", "", "");
        let b = fingerprint("b", "", "");
        let c = fingerprint("c", "", "");
        assert!(cache.insert(a));
        assert!(cache.insert(b));
        assert!(cache.insert(c));
        assert!(!cache.contains(&a));
        assert!(!cache.insert(b));
        assert!(!cache.insert(c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_direct_inbound_kinds() {
        let (mut router, analytics) = router();
        assert_eq!(
            router.receive_direct(r#"{"type":"ping","sentAt":5}"#, 0),
            Some(ProbeFrame::Ping { sent_at: 5 })
        );
        assert_eq!(
            router.receive_direct(r#"{"type":"pong","sentAt":5}"#, 0),
            Some(ProbeFrame::Pong { sent_at: 5 })
        );
        assert!(router.messages().is_empty());

        router.receive_direct(r#"{"type":"message","text":"hey","sentAt":1}"#, 0);
        router.receive_direct(r#"{"type":"photo-request"}"#, 0);
        router.receive_direct("{not json", 0);
        let kinds: Vec<_> = router.messages().iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MessageKind::Text, MessageKind::PhotoRequest]);
        assert_eq!(router.messages()[1].text, "requested a photo");
        assert!(analytics.has_error("message_parse_error"));
    }

    #[test]
    fn test_received_image_replaced_in_place() {
        let (mut router, _) = router();
        router.receive_direct(
            r#"{"type":"image","id":"msg_1_1","filename":"a.jpg","data":"low"}"#,
            0,
        );
        router.receive_direct(
            r#"{"type":"image","id":"msg_1_1","filename":"a.jpg","data":"high","replaceMessageId":"msg_1_1"}"#,
            0,
        );
        assert_eq!(router.messages().len(), 1);
        assert_eq!(router.messages()[0].image_data.as_deref(), Some("high"));

        router.receive_direct(
            r#"{"type":"image","filename":"b.jpg","data":"x","replaceMessageId":"unknown"}"#,
            0,
        );
        assert_eq!(router.messages().len(), 2);
    }

    #[test]
    fn test_sent_image_upsert() {
        let (mut router, _) = router();
        let id = router.upsert_sent_image("a.png", "v1".into(), None, 3);
        let same = router.upsert_sent_image("a.png", "v2".into(), Some(&id), 4);
        assert_eq!(id, same);
        assert_eq!(router.messages().len(), 1);
        assert_eq!(router.messages()[0].image_data.as_deref(), Some("v2"));
        assert_eq!(router.messages()[0].status, DeliveryStatus::Pending);
    }

    #[test]
    fn test_photo_request_prefers_direct() {
        let (mut router, _) = router();
        let mut wire = FakeWire::default();
        assert_eq!(router.request_photo(&mut wire), Some(Transport::Relay));
        assert_eq!(wire.relay, vec![ClientFrame::ReqPhoto]);

        wire.open = true;
        assert_eq!(router.request_photo(&mut wire), Some(Transport::Direct));
        assert_eq!(wire.direct, vec![r#"{"type":"photo-request"}"#.to_string()]);
        assert!(router.messages().is_empty());
    }
}
