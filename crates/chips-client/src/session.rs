//! Session lifecycle: join → matched → active → ended.
//!
//! [`SessionController::handle`] is the only entry point. Handlers never run
//! concurrently; the runtime feeds events one at a time from a single task.
//! Every exit from a session (leave, report, partner gone, server gone,
//! rematch, shutdown) goes through the same teardown, which closes the
//! negotiator, stops the quality monitor and clears per-session caches.

use std::sync::Arc;

use chips_common::{ClientFrame, Error, PeerPayload, Result, ServerFrame};
use tracing::{debug, error, info, warn};

use crate::analytics::Reporter;
use crate::config::ClientConfig;
use crate::event::{Command, LinkEvent, SessionEvent, SignalEvent};
use crate::images::ImageDeliveryPipeline;
use crate::negotiator::{LinkOutcome, TransportNegotiator};
use crate::ports::{
    Clock, ImageCompressor, LinkId, PeerConnector, Scheduler, SendTag, SignalingTransport, TimerId,
};
use crate::quality::QualityMonitor;
use crate::router::{MessageRouter, Outbound, ProbeFrame};
use crate::signaling::{ConnectFailure, ReconnectPolicy, SignalingLink};
use crate::types::{
    ConnectionState, EndReason, LinkQuality, Message, Notification, Notifier, Role, Session,
    SessionStats, SessionSummary, SignalingStatus, Transport,
};

const RETRY_EXHAUSTED_TEXT: &str =
    "Unable to connect to server. Please check your connection and try again.";
const SERVER_DISCONNECTED_TEXT: &str = "Server disconnected. Please refresh the page.";
const QUEUE_TIMEOUT_TEXT: &str = "No partner found. Please try again.";

/// External effects the controller needs.
pub struct SessionPorts {
    pub signaling: Box<dyn SignalingTransport>,
    pub connector: Box<dyn PeerConnector>,
    pub scheduler: Box<dyn Scheduler>,
    pub compressor: Box<dyn ImageCompressor>,
    pub analytics: Reporter,
    pub clock: Arc<dyn Clock>,
}

struct ActiveSession {
    session: Session,
    negotiator: TransportNegotiator,
    monitor: QualityMonitor,
}

/// Both transports, borrowed for the duration of one send.
struct Wire<'a> {
    negotiator: Option<&'a mut TransportNegotiator>,
    signaling: &'a mut SignalingLink,
}

impl Outbound for Wire<'_> {
    fn direct_open(&self) -> bool {
        self.negotiator.as_ref().is_some_and(|n| n.is_direct_open())
    }

    fn send_direct(&mut self, payload: &str, tag: SendTag) -> Result<()> {
        match self.negotiator.as_mut() {
            Some(n) => n.send(payload, tag),
            None => Err(Error::transport_send("no session")),
        }
    }

    fn send_relay(&mut self, frame: ClientFrame) -> Result<()> {
        self.signaling.send(frame)
    }
}

fn mark_quality(monitor: &mut QualityMonitor, notifier: &Notifier, quality: LinkQuality) {
    if let Some(quality) = monitor.set_quality(quality) {
        notifier.send(Notification::Quality { quality });
    }
}

pub struct SessionController {
    config: ClientConfig,
    local_id: String,
    signaling: SignalingLink,
    connector: Box<dyn PeerConnector>,
    scheduler: Box<dyn Scheduler>,
    compressor: Box<dyn ImageCompressor>,
    analytics: Reporter,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    router: MessageRouter,
    images: ImageDeliveryPipeline,
    active: Option<ActiveSession>,
    next_link: u64,
    joined_at_ms: Option<u64>,
    idle_state: ConnectionState,
    last_state: ConnectionState,
    shut_down: bool,
}

impl SessionController {
    pub fn new(
        config: ClientConfig,
        local_id: String,
        ports: SessionPorts,
        notifier: Notifier,
    ) -> Self {
        let SessionPorts {
            signaling,
            connector,
            scheduler,
            compressor,
            analytics,
            clock,
        } = ports;
        Self {
            signaling: SignalingLink::new(signaling, ReconnectPolicy::from_config(&config)),
            router: MessageRouter::new(config.dedup_capacity, notifier.clone(), analytics.clone()),
            images: ImageDeliveryPipeline::new(&config, analytics.clone()),
            config,
            local_id,
            connector,
            scheduler,
            compressor,
            analytics,
            clock,
            notifier,
            active: None,
            next_link: 0,
            joined_at_ms: None,
            idle_state: ConnectionState::Idle,
            last_state: ConnectionState::Idle,
            shut_down: false,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn negotiator(&self) -> Option<&TransportNegotiator> {
        self.active.as_ref().map(|a| &a.negotiator)
    }

    pub fn monitor(&self) -> Option<&QualityMonitor> {
        self.active.as_ref().map(|a| &a.monitor)
    }

    pub fn signaling(&self) -> &SignalingLink {
        &self.signaling
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn messages(&self) -> &[Message] {
        self.router.messages()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.active
            .as_ref()
            .map(|a| a.negotiator.connection_state())
            .unwrap_or(self.idle_state)
    }

    pub fn quality(&self) -> LinkQuality {
        self.active
            .as_ref()
            .map(|a| a.monitor.quality())
            .unwrap_or(LinkQuality::Unknown)
    }

    pub fn stats(&self) -> SessionStats {
        let window = self.active.as_ref().map(|a| a.monitor.window());
        SessionStats {
            messages_sent: self.router.messages_sent(),
            messages_received: self.router.messages_received(),
            average_latency_ms: window.and_then(|w| w.mean()),
            latency_samples: window.map_or(0, |w| w.len()),
            dedup_cache_size: self.router.dedup().len(),
            connection_attempts: self.signaling.connection_attempts(),
            failed_connections: self.signaling.failed_connections(),
            direct_link_established_ms: self
                .active
                .as_ref()
                .and_then(|a| a.negotiator.established_after_ms()),
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Apply one event. After shutdown every event is a no-op.
    pub fn handle(&mut self, event: SessionEvent) {
        if self.shut_down {
            debug!("controller shut down; event ignored");
            return;
        }
        match event {
            SessionEvent::Command(command) => self.on_command(command),
            SessionEvent::Signal(signal) => self.on_signal(signal),
            SessionEvent::Link { link_id, event } => self.on_link(link_id, event),
            SessionEvent::Timer(id) => self.on_timer(id),
            SessionEvent::ImageCompressed { job, result } => {
                let mut wire = Wire {
                    negotiator: self.active.as_mut().map(|a| &mut a.negotiator),
                    signaling: &mut self.signaling,
                };
                self.images
                    .on_compressed(job, result, &mut self.router, &mut wire);
            }
        }
        self.publish_state();
    }

    fn publish_state(&mut self) {
        let state = self.connection_state();
        if state != self.last_state {
            debug!(from = ?self.last_state, to = ?state, "connection state");
            self.last_state = state;
            self.notifier.send(Notification::ConnectionState { state });
        }
    }

    fn on_command(&mut self, command: Command) {
        let now = self.now();
        match command {
            Command::Connect => {
                self.notifier.send(Notification::Signaling {
                    status: SignalingStatus::Connecting,
                    message: None,
                });
                if let Err(e) = self.signaling.connect(now, self.scheduler.as_mut()) {
                    warn!(error = %e, "could not start signaling connection");
                }
            }
            Command::Join { name } => {
                if self.active.is_some() {
                    self.teardown(EndReason::Leave);
                }
                self.router.clear_messages();
                self.joined_at_ms = Some(now);
                if let Err(e) = self.signaling.send(ClientFrame::Join { name }) {
                    warn!(error = %e, "join not sent");
                }
                self.analytics.session_started();
            }
            Command::SendText(text) => {
                let mut wire = Wire {
                    negotiator: self.active.as_mut().map(|a| &mut a.negotiator),
                    signaling: &mut self.signaling,
                };
                let report = self.router.send_text(&text, now, &mut wire);
                if report.is_some_and(|r| r.direct_error.is_some()) {
                    if let Some(active) = self.active.as_mut() {
                        mark_quality(&mut active.monitor, &self.notifier, LinkQuality::Poor);
                    }
                }
            }
            Command::SendImage(upload) => {
                let mut wire = Wire {
                    negotiator: self.active.as_mut().map(|a| &mut a.negotiator),
                    signaling: &mut self.signaling,
                };
                self.images.send_image(
                    upload,
                    now,
                    &mut self.router,
                    self.compressor.as_mut(),
                    &mut wire,
                );
            }
            Command::RequestPhoto => {
                let mut wire = Wire {
                    negotiator: self.active.as_mut().map(|a| &mut a.negotiator),
                    signaling: &mut self.signaling,
                };
                self.router.request_photo(&mut wire);
            }
            Command::Leave => self.leave(ClientFrame::Leave, EndReason::Leave),
            Command::Report => self.leave(ClientFrame::Report, EndReason::Report),
            Command::Reconnect => {
                self.notifier.send(Notification::Signaling {
                    status: SignalingStatus::Connecting,
                    message: None,
                });
                if let Err(e) = self.signaling.manual_reconnect(now, self.scheduler.as_mut()) {
                    warn!(error = %e, "manual reconnect failed to start");
                }
            }
            Command::ClearMessages => self.router.clear_messages(),
            Command::ReportStats => self.notifier.send(Notification::Stats {
                stats: self.stats(),
            }),
            Command::Shutdown => {
                self.teardown(EndReason::Shutdown);
                self.router.clear_messages();
                self.signaling.close(self.scheduler.as_mut());
                self.shut_down = true;
                info!("session controller shut down");
            }
        }
    }

    fn leave(&mut self, frame: ClientFrame, reason: EndReason) {
        if let Err(e) = self.signaling.send(frame) {
            warn!(error = %e, "leave frame not sent");
        }
        self.router.clear_messages();
        self.teardown(reason);
    }

    fn on_signal(&mut self, signal: SignalEvent) {
        let now = self.now();
        match signal {
            SignalEvent::Connected => {
                let (was_reconnect, elapsed) = self.signaling.on_connected(now);
                self.analytics.connection_made(elapsed, false);
                self.notifier.send(Notification::Signaling {
                    status: SignalingStatus::Connected,
                    message: None,
                });
                if was_reconnect {
                    let keep = self
                        .active
                        .as_ref()
                        .map(|a| a.negotiator.is_direct_open());
                    match keep {
                        Some(true) => info!("signaling reconnected; direct link still up"),
                        Some(false) => self.teardown(EndReason::SignalingReset),
                        None => {}
                    }
                }
            }
            SignalEvent::ConnectError(reason) => {
                let failure = self
                    .signaling
                    .on_connect_error(&reason, self.scheduler.as_mut());
                match failure {
                    ConnectFailure::Retrying { attempt, max, .. } => {
                        self.analytics.error("connection_failed", "socket");
                        self.notifier.send(Notification::Signaling {
                            status: SignalingStatus::Retrying { attempt, max },
                            message: Some(format!(
                                "Connection failed. Retrying... ({attempt}/{max})"
                            )),
                        });
                    }
                    ConnectFailure::Exhausted { attempts } => {
                        let err = Error::LinkExhausted { attempts };
                        error!(error = %err, "giving up on signaling server");
                        self.analytics.error(err.kind(), err.feature());
                        self.notifier.send(Notification::LinkExhausted {
                            attempts,
                            message: RETRY_EXHAUSTED_TEXT.to_string(),
                        });
                        let direct = self
                            .active
                            .as_ref()
                            .is_some_and(|a| a.negotiator.is_direct_open());
                        if direct {
                            info!("signaling exhausted; keeping session on the direct link");
                        } else {
                            self.teardown(EndReason::SignalingExhausted);
                        }
                    }
                }
            }
            SignalEvent::Disconnected(reason) => {
                self.analytics.error("socket_disconnect", "connection");
                let recoverable = reason.is_recoverable();
                self.signaling
                    .on_disconnected(&reason, self.scheduler.as_mut());
                if !recoverable {
                    self.teardown(EndReason::ServerDisconnected);
                }
                self.notifier.send(Notification::Signaling {
                    status: SignalingStatus::Disconnected { recoverable },
                    message: (!recoverable).then(|| SERVER_DISCONNECTED_TEXT.to_string()),
                });
            }
            SignalEvent::Inbound(frame) => self.on_frame(frame, now),
            SignalEvent::Malformed(e) => {
                warn!(error = %e, "dropping malformed signaling frame");
                self.analytics.error("message_parse_error", "socket");
            }
        }
    }

    fn on_frame(&mut self, frame: ServerFrame, now: u64) {
        match frame {
            ServerFrame::Matched(info) => {
                if self.active.is_some() {
                    self.teardown(EndReason::Rematched);
                }
                self.router.reset_session();
                let role = Role::decide(&self.local_id, &info.partner_id);
                self.next_link += 1;
                let mut negotiator =
                    TransportNegotiator::new(LinkId(self.next_link), self.config.failure_grace());
                let mut monitor =
                    QualityMonitor::new(self.config.probe_interval(), self.config.latency_window);
                let started = negotiator.start(role, self.connector.as_mut(), now);
                let session = Session {
                    role,
                    partner_id: info.partner_id,
                    partner_name: info.partner_name,
                    room_id: info.room_id,
                    created_at_ms: now,
                };
                info!(partner = %session.partner_id, room = %session.room_id, ?role, "matched");
                let waited = now.saturating_sub(self.joined_at_ms.unwrap_or(now));
                self.analytics.connection_made(waited, false);
                self.notifier.send(Notification::Matched {
                    session: session.clone(),
                });
                if let Err(e) = started {
                    self.analytics.error(e.kind(), e.feature());
                    self.analytics.direct_link_fallback("init_failed");
                    mark_quality(&mut monitor, &self.notifier, LinkQuality::Poor);
                }
                self.active = Some(ActiveSession {
                    session,
                    negotiator,
                    monitor,
                });
            }
            ServerFrame::Offer { offer } => {
                let Some(active) = self.active.as_mut() else {
                    debug!("offer without a session; ignoring");
                    return;
                };
                let outcome = active
                    .negotiator
                    .on_remote_offer(offer, self.scheduler.as_mut());
                self.apply(outcome, now);
            }
            ServerFrame::Answer { answer } => {
                let Some(active) = self.active.as_mut() else {
                    debug!("answer without a session; ignoring");
                    return;
                };
                let outcome = active
                    .negotiator
                    .on_remote_answer(answer, self.scheduler.as_mut());
                self.apply(outcome, now);
            }
            ServerFrame::IceCandidate { candidate } => {
                if let Some(active) = self.active.as_mut() {
                    active.negotiator.on_remote_candidate(candidate);
                }
            }
            ServerFrame::Message(msg) => {
                self.router.receive_relay(msg, now);
            }
            ServerFrame::PhotoRequest { legacy } => {
                debug!(legacy, "photo request via relay");
                self.router.receive_photo_request(Transport::Relay, now);
            }
            ServerFrame::PartnerDisconnected { reason } => {
                info!(?reason, "partner disconnected");
                self.teardown(EndReason::PartnerDisconnected(reason));
            }
            ServerFrame::QueueTimeout => {
                self.analytics.error("queue_timeout", "matchmaking");
                self.notifier.send(Notification::QueueTimeout {
                    message: QUEUE_TIMEOUT_TEXT.to_string(),
                });
            }
            ServerFrame::RateLimited => {
                warn!("rate limited by server");
                self.analytics.error("rate_limited", "messaging");
                self.notifier.send(Notification::RateLimited);
            }
        }
    }

    fn on_link(&mut self, link_id: LinkId, event: LinkEvent) {
        let now = self.now();
        let Some(active) = self.active.as_mut() else {
            debug!(link = link_id.0, "link event without a session; ignoring");
            return;
        };
        if active.negotiator.link_id() != link_id {
            debug!(link = link_id.0, "stale link event; ignoring");
            return;
        }
        let outcome = active
            .negotiator
            .on_link_event(event, now, self.scheduler.as_mut());
        self.apply(outcome, now);
    }

    fn apply(&mut self, outcome: LinkOutcome, now: u64) {
        if let LinkOutcome::Forward(frame) = outcome {
            if let Err(e) = self.signaling.send(frame) {
                warn!(error = %e, "handshake blob not forwarded");
            }
            return;
        }
        if let LinkOutcome::SendFailed {
            tag,
            error,
            degraded,
        } = outcome
        {
            self.send_failed(tag, error, degraded);
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let scheduler = self.scheduler.as_mut();
        match outcome {
            LinkOutcome::Nothing | LinkOutcome::Forward(_) | LinkOutcome::SendFailed { .. } => {}
            LinkOutcome::Established { after_ms } => {
                self.analytics.direct_link_established(after_ms);
                active.monitor.start(scheduler);
            }
            LinkOutcome::Recovered => {
                active.monitor.start(scheduler);
                let quality = active.monitor.window().classify();
                mark_quality(&mut active.monitor, &self.notifier, quality);
            }
            LinkOutcome::Degraded { .. } => {
                mark_quality(&mut active.monitor, &self.notifier, LinkQuality::Poor);
            }
            LinkOutcome::Failed { error } => {
                self.analytics.error(error.kind(), error.feature());
                mark_quality(&mut active.monitor, &self.notifier, LinkQuality::Poor);
            }
            LinkOutcome::ChannelClosed { error } => {
                active.monitor.stop(scheduler);
                if let Some(error) = error {
                    self.analytics.error(error.kind(), error.feature());
                }
                mark_quality(&mut active.monitor, &self.notifier, LinkQuality::Unknown);
            }
            LinkOutcome::Inbound(text) => match self.router.receive_direct(&text, now) {
                Some(ProbeFrame::Ping { sent_at }) => {
                    let pong = PeerPayload::Pong { sent_at }.encode();
                    let sent = pong.and_then(|p| active.negotiator.send(&p, SendTag::untracked()));
                    if let Err(e) = sent {
                        debug!(error = %e, "pong not sent");
                    }
                }
                Some(ProbeFrame::Pong { sent_at }) => {
                    if let Some(quality) = active.monitor.on_pong(sent_at, now) {
                        self.notifier.send(Notification::Quality { quality });
                    }
                }
                None => {}
            },
        }
    }

    /// A queued direct payload never made it out. Whatever it carried is
    /// rerouted or marked failed even if the link has since been given up.
    fn send_failed(&mut self, tag: SendTag, error: Error, degraded: bool) {
        let mut wire = Wire {
            negotiator: self.active.as_mut().map(|a| &mut a.negotiator),
            signaling: &mut self.signaling,
        };
        self.router.direct_send_failed(tag, &error, &mut wire);
        if degraded {
            if let Some(active) = self.active.as_mut() {
                mark_quality(&mut active.monitor, &self.notifier, LinkQuality::Poor);
            }
        }
    }

    fn on_timer(&mut self, id: TimerId) {
        let now = self.now();
        if self.signaling.on_timer(id, now, self.scheduler.as_mut()) {
            return;
        }
        let Some(active) = self.active.as_mut() else {
            debug!(timer = id.0, "timer without a session; ignoring");
            return;
        };
        let scheduler = self.scheduler.as_mut();
        if let Some(ping) = active.monitor.on_timer(id, now, scheduler) {
            let sent = ping
                .encode()
                .and_then(|p| active.negotiator.send(&p, SendTag::untracked()));
            if let Err(e) = sent {
                warn!(error = %e, "probe not sent; stopping quality monitor");
                active.monitor.stop(scheduler);
                mark_quality(&mut active.monitor, &self.notifier, LinkQuality::Poor);
            }
            return;
        }
        if let Some(reason) = active.negotiator.on_timer(id) {
            active.monitor.stop(scheduler);
            self.analytics.direct_link_fallback(&reason.to_string());
            mark_quality(&mut active.monitor, &self.notifier, LinkQuality::Poor);
            return;
        }
        debug!(timer = id.0, "stale timer ignored");
    }

    /// End the current session, if any. Safe to call repeatedly.
    fn teardown(&mut self, reason: EndReason) {
        self.images.clear(&mut self.router);
        let Some(mut active) = self.active.take() else {
            self.router.reset_session();
            return;
        };
        let scheduler = self.scheduler.as_mut();
        active.negotiator.close(scheduler);
        active.monitor.stop(scheduler);

        let summary = SessionSummary {
            duration_ms: self.clock.now_ms().saturating_sub(active.session.created_at_ms),
            messages_sent: self.router.messages_sent(),
            messages_received: self.router.messages_received(),
            used_direct_link: active.negotiator.established_after_ms().is_some(),
        };
        self.router.reset_session();
        self.analytics.session_ended(&summary);

        if active.monitor.quality() != LinkQuality::Unknown {
            self.notifier.send(Notification::Quality {
                quality: LinkQuality::Unknown,
            });
        }
        self.idle_state = ConnectionState::Closed;
        info!(?reason, duration_ms = summary.duration_ms, "session ended");
        self.notifier.send(Notification::SessionEnded { reason });
    }
}
