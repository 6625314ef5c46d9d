//! Direct-link negotiation and failure handling.
//!
//! ```text
//! Idle ──start──► Offering | Answering ──channel open──► Connected
//!                        │                                  │  ▲
//!                        │                       disconnected│  │ connected
//!                        ▼                                  ▼  │
//!                      Failed ◄──── failed / error ────── Degraded
//!                        │
//!                  grace elapsed ──► relay only (link released)
//!
//! any state ──close──► Closed
//! ```
//!
//! `Connected` is entered exactly once per session. Later recoveries from
//! `Degraded` or `Failed` (before the grace timer fires) go back to
//! `Connected` without repeating the establishment side effects. After the
//! grace period the negotiator gives up for the rest of the session; it never
//! renegotiates on its own.

use std::time::Duration;

use chips_common::{ClientFrame, Error, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::event::{LinkEvent, PeerState};
use crate::ports::{DirectLink, LinkId, PeerConnector, Scheduler, SendTag, TimerId};
use crate::types::{ConnectionState, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    Idle,
    Offering,
    Answering,
    Connected,
    Degraded,
    Failed,
    Closed,
}

/// What the controller has to do after a link event.
#[derive(Debug)]
pub enum LinkOutcome {
    Nothing,
    /// Pass a handshake blob to the partner over signaling.
    Forward(ClientFrame),
    /// First transition to `Connected`.
    Established { after_ms: u64 },
    Recovered,
    Degraded { reason: String },
    /// Grace timer started.
    Failed { error: Error },
    /// The sub-channel went away. `error` is set when this started the
    /// grace timer.
    ChannelClosed { error: Option<Error> },
    /// A queued payload was not transmitted; `tag` says what it carried.
    SendFailed {
        tag: SendTag,
        error: Error,
        degraded: bool,
    },
    Inbound(String),
}

pub struct TransportNegotiator {
    state: NegotiatorState,
    link_id: LinkId,
    role: Option<Role>,
    link: Option<Box<dyn DirectLink>>,
    channel_open: bool,
    started_at_ms: u64,
    established_after_ms: Option<u64>,
    relay_only: bool,
    grace: Duration,
    grace_timer: Option<TimerId>,
}

impl TransportNegotiator {
    pub fn new(link_id: LinkId, grace: Duration) -> Self {
        Self {
            state: NegotiatorState::Idle,
            link_id,
            role: None,
            link: None,
            channel_open: false,
            started_at_ms: 0,
            established_after_ms: None,
            relay_only: false,
            grace,
            grace_timer: None,
        }
    }

    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_relay_only(&self) -> bool {
        self.relay_only
    }

    pub fn grace_timer(&self) -> Option<TimerId> {
        self.grace_timer
    }

    pub fn established_after_ms(&self) -> Option<u64> {
        self.established_after_ms
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.state == NegotiatorState::Closed {
            return ConnectionState::Closed;
        }
        if self.relay_only {
            return ConnectionState::RelayOnly;
        }
        match self.state {
            NegotiatorState::Idle => ConnectionState::Idle,
            NegotiatorState::Offering | NegotiatorState::Answering => ConnectionState::Negotiating,
            NegotiatorState::Connected => ConnectionState::DirectConnected,
            NegotiatorState::Degraded | NegotiatorState::Failed => ConnectionState::Degraded,
            NegotiatorState::Closed => ConnectionState::Closed,
        }
    }

    /// True when an application payload may be sent over the direct link.
    pub fn is_direct_open(&self) -> bool {
        !self.relay_only
            && self.state != NegotiatorState::Closed
            && self.channel_open
            && self.link.as_ref().is_some_and(|l| l.is_open())
    }

    /// Create the handshake context for `role`.
    ///
    /// A failure here commits the session to relay-only immediately.
    pub fn start(
        &mut self,
        role: Role,
        connector: &mut dyn PeerConnector,
        now_ms: u64,
    ) -> Result<()> {
        if self.state != NegotiatorState::Idle {
            return Err(Error::internal(format!(
                "negotiator already started ({:?})",
                self.state
            )));
        }
        self.role = Some(role);
        self.started_at_ms = now_ms;
        self.state = match role {
            Role::Initiator => NegotiatorState::Offering,
            Role::Responder => NegotiatorState::Answering,
        };
        info!(link = self.link_id.0, ?role, "starting direct link negotiation");
        match connector.open(self.link_id, role) {
            Ok(link) => {
                self.link = Some(link);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "could not create handshake context; relay only");
                self.relay_only = true;
                self.state = NegotiatorState::Failed;
                Err(Error::negotiation(e))
            }
        }
    }

    fn accepting(&self) -> bool {
        !self.relay_only && self.state != NegotiatorState::Closed && self.link.is_some()
    }

    pub fn on_remote_offer(
        &mut self,
        offer: Value,
        scheduler: &mut dyn Scheduler,
    ) -> LinkOutcome {
        if !self.accepting() {
            debug!("remote offer ignored");
            return LinkOutcome::Nothing;
        }
        if self.role != Some(Role::Responder) {
            warn!("remote offer received while offering; ignoring");
            return LinkOutcome::Nothing;
        }
        let result = match self.link.as_mut() {
            Some(link) => link.accept_offer(offer),
            None => return LinkOutcome::Nothing,
        };
        match result {
            Ok(()) => LinkOutcome::Nothing,
            Err(e) => self.fail(Error::negotiation(e), scheduler),
        }
    }

    pub fn on_remote_answer(
        &mut self,
        answer: Value,
        scheduler: &mut dyn Scheduler,
    ) -> LinkOutcome {
        if !self.accepting() || self.role != Some(Role::Initiator) {
            debug!("remote answer ignored");
            return LinkOutcome::Nothing;
        }
        let result = match self.link.as_mut() {
            Some(link) => link.accept_answer(answer),
            None => return LinkOutcome::Nothing,
        };
        match result {
            Ok(()) => LinkOutcome::Nothing,
            Err(e) => self.fail(Error::negotiation(e), scheduler),
        }
    }

    /// Candidates arrive in any order and may repeat; a bad one is only logged.
    pub fn on_remote_candidate(&mut self, candidate: Value) {
        if !self.accepting() {
            return;
        }
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.add_candidate(candidate) {
                warn!(error = %e, "failed to add remote candidate");
            }
        }
    }

    pub fn on_link_event(
        &mut self,
        event: LinkEvent,
        now_ms: u64,
        scheduler: &mut dyn Scheduler,
    ) -> LinkOutcome {
        let gave_up = self.state == NegotiatorState::Closed || self.relay_only;
        if gave_up && !matches!(event, LinkEvent::SendFailed { .. }) {
            debug!(?event, "link event after negotiator gave up; ignoring");
            return LinkOutcome::Nothing;
        }
        match event {
            LinkEvent::LocalOffer(offer) => LinkOutcome::Forward(ClientFrame::Offer { offer }),
            LinkEvent::LocalAnswer(answer) => LinkOutcome::Forward(ClientFrame::Answer { answer }),
            LinkEvent::LocalCandidate(candidate) => {
                LinkOutcome::Forward(ClientFrame::IceCandidate { candidate })
            }
            LinkEvent::ChannelOpen => {
                self.channel_open = true;
                self.connected(now_ms, scheduler)
            }
            LinkEvent::StateChanged(PeerState::Connected) => {
                if self.established_after_ms.is_some() && self.channel_open {
                    self.connected(now_ms, scheduler)
                } else {
                    LinkOutcome::Nothing
                }
            }
            LinkEvent::StateChanged(PeerState::Disconnected) => {
                self.degrade("peer connection disconnected")
            }
            LinkEvent::StateChanged(PeerState::Failed) => {
                self.fail(Error::negotiation("peer connection failed"), scheduler)
            }
            LinkEvent::StateChanged(PeerState::Closed) => {
                self.fail(Error::negotiation("peer connection closed"), scheduler)
            }
            LinkEvent::StateChanged(PeerState::New | PeerState::Connecting) => {
                LinkOutcome::Nothing
            }
            LinkEvent::ChannelClosed => {
                self.channel_open = false;
                match self.fail(Error::negotiation("data channel closed"), scheduler) {
                    LinkOutcome::Failed { error } => {
                        LinkOutcome::ChannelClosed { error: Some(error) }
                    }
                    _ => LinkOutcome::ChannelClosed { error: None },
                }
            }
            LinkEvent::ChannelMessage(text) => LinkOutcome::Inbound(text),
            LinkEvent::ChannelError(e) => self.fail(Error::negotiation(e), scheduler),
            LinkEvent::NegotiationFailed(e) => self.fail(Error::negotiation(e), scheduler),
            LinkEvent::SendFailed { tag, error } => self.send_failed(tag, error),
        }
    }

    /// Reported in every state, including after the negotiator gave up.
    fn send_failed(&mut self, tag: SendTag, error: String) -> LinkOutcome {
        let degraded = !self.relay_only
            && self.state != NegotiatorState::Closed
            && matches!(
                self.degrade(&format!("send failed: {error}")),
                LinkOutcome::Degraded { .. }
            );
        LinkOutcome::SendFailed {
            tag,
            error: Error::transport_send(error),
            degraded,
        }
    }

    fn connected(&mut self, now_ms: u64, scheduler: &mut dyn Scheduler) -> LinkOutcome {
        if let Some(id) = self.grace_timer.take() {
            scheduler.cancel(id);
        }
        let previous = self.state;
        self.state = NegotiatorState::Connected;
        if self.established_after_ms.is_none() {
            let after_ms = now_ms.saturating_sub(self.started_at_ms);
            self.established_after_ms = Some(after_ms);
            info!(link = self.link_id.0, after_ms, "direct link established");
            return LinkOutcome::Established { after_ms };
        }
        if previous == NegotiatorState::Connected {
            return LinkOutcome::Nothing;
        }
        info!(link = self.link_id.0, "direct link recovered");
        LinkOutcome::Recovered
    }

    fn degrade(&mut self, reason: &str) -> LinkOutcome {
        match self.state {
            NegotiatorState::Failed | NegotiatorState::Degraded => LinkOutcome::Nothing,
            _ => {
                warn!(link = self.link_id.0, reason, "direct link degraded");
                self.state = NegotiatorState::Degraded;
                LinkOutcome::Degraded {
                    reason: reason.to_string(),
                }
            }
        }
    }

    fn fail(&mut self, error: Error, scheduler: &mut dyn Scheduler) -> LinkOutcome {
        if self.state == NegotiatorState::Failed {
            return LinkOutcome::Nothing;
        }
        warn!(link = self.link_id.0, error = %error, grace = ?self.grace, "direct link failed");
        self.state = NegotiatorState::Failed;
        self.grace_timer = Some(scheduler.schedule(self.grace));
        LinkOutcome::Failed { error }
    }

    /// Grace timer handling. Returns the fallback reason when the negotiator
    /// gives up and commits the session to the relay.
    pub fn on_timer(&mut self, id: TimerId) -> Option<Error> {
        if self.grace_timer != Some(id) {
            return None;
        }
        self.grace_timer = None;
        if self.state != NegotiatorState::Failed || self.relay_only {
            return None;
        }
        info!(link = self.link_id.0, "no recovery within grace period; relay only");
        self.relay_only = true;
        self.channel_open = false;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        Some(Error::timeout(format!(
            "direct link did not recover within {} ms",
            self.grace.as_millis()
        )))
    }

    /// Send one payload over the sub-channel. A failure marks the link
    /// degraded; the caller decides where the payload goes instead.
    pub fn send(&mut self, payload: &str, tag: SendTag) -> Result<()> {
        if !self.is_direct_open() {
            return Err(Error::transport_send("direct link not open"));
        }
        let result = match self.link.as_mut() {
            Some(link) => link.send(payload, tag),
            None => Err(Error::transport_send("direct link not open")),
        };
        if let Err(e) = &result {
            self.degrade(&e.to_string());
        }
        result
    }

    /// Release the link and cancel the grace timer. Returns false if already
    /// closed.
    pub fn close(&mut self, scheduler: &mut dyn Scheduler) -> bool {
        if self.state == NegotiatorState::Closed {
            return false;
        }
        if let Some(id) = self.grace_timer.take() {
            scheduler.cancel(id);
        }
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.channel_open = false;
        self.state = NegotiatorState::Closed;
        info!(link = self.link_id.0, "direct link closed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyConnector, DummyScheduler};
    use serde_json::json;

    fn started(role: Role) -> (TransportNegotiator, DummyConnector, DummyScheduler) {
        let mut connector = DummyConnector::new();
        let mut negotiator = TransportNegotiator::new(LinkId(1), Duration::from_secs(5));
        negotiator.start(role, &mut connector, 1_000).unwrap();
        (negotiator, connector, DummyScheduler::new())
    }

    #[test]
    fn test_establishes_once() {
        let (mut neg, _conn, mut sched) = started(Role::Initiator);
        assert_eq!(neg.connection_state(), ConnectionState::Negotiating);
        assert!(matches!(
            neg.on_link_event(LinkEvent::ChannelOpen, 1_250, &mut sched),
            LinkOutcome::Established { after_ms: 250 }
        ));
        assert!(matches!(
            neg.on_link_event(LinkEvent::ChannelOpen, 1_300, &mut sched),
            LinkOutcome::Nothing
        ));
        assert_eq!(neg.established_after_ms(), Some(250));
        assert!(neg.is_direct_open());
    }

    #[test]
    fn test_local_blobs_are_forwarded() {
        let (mut neg, _conn, mut sched) = started(Role::Initiator);
        let out = neg.on_link_event(LinkEvent::LocalOffer(json!({"sdp": "x"})), 0, &mut sched);
        match out {
            LinkOutcome::Forward(frame) => assert_eq!(
                frame,
                ClientFrame::Offer {
                    offer: json!({"sdp": "x"})
                }
            ),
            other => panic!("unexpected outcome {other:?}"),
        }
        let out = neg.on_link_event(LinkEvent::LocalCandidate(json!("c1")), 0, &mut sched);
        assert!(matches!(out, LinkOutcome::Forward(ClientFrame::IceCandidate { .. })));
    }

    #[test]
    fn test_responder_applies_offer_only() {
        let (mut neg, conn, mut sched) = started(Role::Responder);
        neg.on_remote_answer(json!({"sdp": "a"}), &mut sched);
        neg.on_remote_offer(json!({"sdp": "o"}), &mut sched);
        neg.on_remote_candidate(json!("c"));
        neg.on_remote_candidate(json!("c"));
        let log = conn.log();
        assert_eq!(log.offers, vec![json!({"sdp": "o"})]);
        assert!(log.answers.is_empty());
        assert_eq!(log.candidates.len(), 2);
    }

    #[test]
    fn test_failed_then_grace_commits_relay_only() {
        let (mut neg, conn, mut sched) = started(Role::Initiator);
        neg.on_link_event(LinkEvent::ChannelOpen, 0, &mut sched);
        let out = neg.on_link_event(LinkEvent::StateChanged(PeerState::Failed), 0, &mut sched);
        assert!(matches!(out, LinkOutcome::Failed { error: Error::Negotiation(_) }));
        let timer = neg.grace_timer().unwrap();
        assert_eq!(sched.delay_of(timer), Some(Duration::from_secs(5)));

        let reason = neg.on_timer(timer).unwrap();
        assert!(matches!(reason, Error::Timeout(_)));
        assert!(neg.is_relay_only());
        assert!(!neg.is_direct_open());
        assert_eq!(neg.connection_state(), ConnectionState::RelayOnly);
        assert_eq!(conn.log().closes, 1);
        assert!(neg.send("{}", SendTag::untracked()).is_err());
    }

    #[test]
    fn test_recovery_within_grace_cancels_timer() {
        let (mut neg, _conn, mut sched) = started(Role::Initiator);
        neg.on_link_event(LinkEvent::ChannelOpen, 0, &mut sched);
        neg.on_link_event(LinkEvent::StateChanged(PeerState::Failed), 0, &mut sched);
        let timer = neg.grace_timer().unwrap();
        assert!(matches!(
            neg.on_link_event(LinkEvent::StateChanged(PeerState::Connected), 0, &mut sched),
            LinkOutcome::Recovered
        ));
        assert!(sched.is_cancelled(timer));
        assert!(neg.on_timer(timer).is_none());
        assert_eq!(neg.connection_state(), ConnectionState::DirectConnected);
    }

    #[test]
    fn test_disconnected_degrades() {
        let (mut neg, _conn, mut sched) = started(Role::Responder);
        neg.on_link_event(LinkEvent::ChannelOpen, 0, &mut sched);
        let out = neg.on_link_event(
            LinkEvent::StateChanged(PeerState::Disconnected),
            0,
            &mut sched,
        );
        assert!(matches!(out, LinkOutcome::Degraded { .. }));
        assert_eq!(neg.connection_state(), ConnectionState::Degraded);
        assert!(neg.grace_timer().is_none());
    }

    #[test]
    fn test_send_error_degrades() {
        let (mut neg, conn, mut sched) = started(Role::Initiator);
        neg.on_link_event(LinkEvent::ChannelOpen, 0, &mut sched);
        conn.fail_sends(true);
        assert!(matches!(
            neg.send("{}", SendTag::untracked()),
            Err(Error::TransportSend(_))
        ));
        assert_eq!(neg.state(), NegotiatorState::Degraded);
    }

    #[test]
    fn test_channel_close_arms_grace_timer() {
        let (mut neg, _conn, mut sched) = started(Role::Initiator);
        neg.on_link_event(LinkEvent::ChannelOpen, 0, &mut sched);
        let out = neg.on_link_event(LinkEvent::ChannelClosed, 0, &mut sched);
        assert!(matches!(out, LinkOutcome::ChannelClosed { error: Some(_) }));
        assert!(!neg.is_direct_open());
        assert_eq!(neg.connection_state(), ConnectionState::Degraded);

        let timer = neg.grace_timer().unwrap();
        assert!(neg.on_timer(timer).is_some());
        assert_eq!(neg.connection_state(), ConnectionState::RelayOnly);
    }

    #[test]
    fn test_queued_send_failure_returns_tag() {
        let (mut neg, _conn, mut sched) = started(Role::Initiator);
        neg.on_link_event(LinkEvent::ChannelOpen, 0, &mut sched);
        let tag = SendTag {
            message_id: Some("msg_1_1".into()),
            fallback: Some(ClientFrame::Message { text: "hi".into() }),
        };
        let failed = LinkEvent::SendFailed {
            tag: tag.clone(),
            error: "sctp write failed".into(),
        };
        match neg.on_link_event(failed.clone(), 0, &mut sched) {
            LinkOutcome::SendFailed {
                tag: returned,
                error: Error::TransportSend(_),
                degraded: true,
            } => assert_eq!(returned, tag),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(neg.state(), NegotiatorState::Degraded);

        neg.close(&mut sched);
        assert!(matches!(
            neg.on_link_event(failed, 0, &mut sched),
            LinkOutcome::SendFailed { degraded: false, .. }
        ));
    }

    #[test]
    fn test_open_failure_goes_relay_only() {
        let mut connector = DummyConnector::new();
        connector.fail_open(true);
        let mut neg = TransportNegotiator::new(LinkId(2), Duration::from_secs(5));
        assert!(matches!(
            neg.start(Role::Initiator, &mut connector, 0),
            Err(Error::Negotiation(_))
        ));
        assert_eq!(neg.connection_state(), ConnectionState::RelayOnly);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut neg, conn, mut sched) = started(Role::Initiator);
        neg.on_link_event(LinkEvent::ChannelOpen, 0, &mut sched);
        neg.on_link_event(LinkEvent::ChannelError("boom".into()), 0, &mut sched);
        let timer = neg.grace_timer().unwrap();

        assert!(neg.close(&mut sched));
        assert!(!neg.close(&mut sched));
        assert_eq!(conn.log().closes, 1);
        assert!(sched.is_cancelled(timer));
        assert_eq!(neg.connection_state(), ConnectionState::Closed);
        assert!(matches!(
            neg.on_link_event(LinkEvent::ChannelOpen, 0, &mut sched),
            LinkOutcome::Nothing
        ));
    }
}
