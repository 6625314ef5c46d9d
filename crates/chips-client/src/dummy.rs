//! In-memory port implementations.
//!
//! Every dummy is a cheap handle over shared state, so a test can keep one
//! clone for inspection after handing another to the controller. Nothing here
//! touches the network or spawns tasks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chips_common::{ClientFrame, Error, Result};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::analytics::{Analytics, Reporter};
use crate::config::ClientConfig;
use crate::ports::{
    Clock, CompressJob, DirectLink, ImageCompressor, LinkId, PeerConnector, Scheduler, SendTag,
    SignalingTransport, TimerId,
};
use crate::session::{SessionController, SessionPorts};
use crate::types::{Notification, Notifier, Role, SessionSummary};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct SignalingState {
    connects: u32,
    disconnects: u32,
    frames: Vec<ClientFrame>,
    fail_sends: bool,
}

/// Records frames instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct DummySignaling {
    state: Arc<Mutex<SignalingState>>,
}

impl DummySignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connects(&self) -> u32 {
        lock(&self.state).connects
    }

    pub fn disconnects(&self) -> u32 {
        lock(&self.state).disconnects
    }

    pub fn frames(&self) -> Vec<ClientFrame> {
        lock(&self.state).frames.clone()
    }

    pub fn take_frames(&self) -> Vec<ClientFrame> {
        std::mem::take(&mut lock(&self.state).frames)
    }

    pub fn fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }
}

impl SignalingTransport for DummySignaling {
    fn connect(&mut self) -> Result<()> {
        lock(&self.state).connects += 1;
        Ok(())
    }

    fn send(&mut self, frame: ClientFrame) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_sends {
            return Err(Error::transport_send("dummy signaling send failure"));
        }
        state.frames.push(frame);
        Ok(())
    }

    fn disconnect(&mut self) {
        lock(&self.state).disconnects += 1;
    }
}

/// What happened to the most recently opened dummy link.
#[derive(Debug, Clone, Default)]
pub struct LinkLog {
    pub opened: Vec<(LinkId, Role)>,
    pub offers: Vec<Value>,
    pub answers: Vec<Value>,
    pub candidates: Vec<Value>,
    pub sent: Vec<String>,
    /// Tag of every queued payload, including ones taken with `take_sent`.
    pub tags: Vec<SendTag>,
    pub closes: u32,
}

#[derive(Debug, Default)]
struct ConnectorState {
    log: LinkLog,
    fail_open: bool,
    fail_sends: bool,
    channel_open: bool,
}

/// Hands out [`DummyLink`]s that share one log.
///
/// The channel counts as open once the test says so with
/// [`DummyConnector::set_channel_open`], mirroring the `ChannelOpen` event it
/// feeds the controller.
#[derive(Debug, Clone, Default)]
pub struct DummyConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl DummyConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> LinkLog {
        lock(&self.state).log.clone()
    }

    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut lock(&self.state).log.sent)
    }

    pub fn last_tag(&self) -> Option<SendTag> {
        lock(&self.state).log.tags.last().cloned()
    }

    pub fn fail_open(&self, fail: bool) {
        lock(&self.state).fail_open = fail;
    }

    pub fn fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }

    pub fn set_channel_open(&self, open: bool) {
        lock(&self.state).channel_open = open;
    }
}

impl PeerConnector for DummyConnector {
    fn open(&mut self, link_id: LinkId, role: Role) -> Result<Box<dyn DirectLink>> {
        let mut state = lock(&self.state);
        if state.fail_open {
            return Err(Error::negotiation("dummy connector refused"));
        }
        state.log.opened.push((link_id, role));
        state.channel_open = true;
        Ok(Box::new(DummyLink {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

pub struct DummyLink {
    state: Arc<Mutex<ConnectorState>>,
    closed: bool,
}

impl DirectLink for DummyLink {
    fn accept_offer(&mut self, offer: Value) -> Result<()> {
        lock(&self.state).log.offers.push(offer);
        Ok(())
    }

    fn accept_answer(&mut self, answer: Value) -> Result<()> {
        lock(&self.state).log.answers.push(answer);
        Ok(())
    }

    fn add_candidate(&mut self, candidate: Value) -> Result<()> {
        lock(&self.state).log.candidates.push(candidate);
        Ok(())
    }

    fn send(&mut self, payload: &str, tag: SendTag) -> Result<()> {
        let mut state = lock(&self.state);
        if self.closed || !state.channel_open {
            return Err(Error::transport_send("dummy channel closed"));
        }
        if state.fail_sends {
            return Err(Error::transport_send("dummy send failure"));
        }
        state.log.sent.push(payload.to_string());
        state.log.tags.push(tag);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed && lock(&self.state).channel_open
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = lock(&self.state);
        state.log.closes += 1;
        state.channel_open = false;
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    next: u64,
    scheduled: BTreeMap<TimerId, Duration>,
    cancelled: Vec<TimerId>,
}

/// Hands out timer ids and remembers them; tests fire them by feeding
/// `SessionEvent::Timer` themselves.
#[derive(Debug, Clone, Default)]
pub struct DummyScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl DummyScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timers scheduled and not cancelled, in creation order.
    pub fn pending(&self) -> Vec<TimerId> {
        let state = lock(&self.state);
        state
            .scheduled
            .keys()
            .filter(|id| !state.cancelled.contains(id))
            .copied()
            .collect()
    }

    pub fn is_cancelled(&self, id: TimerId) -> bool {
        lock(&self.state).cancelled.contains(&id)
    }

    pub fn delay_of(&self, id: TimerId) -> Option<Duration> {
        lock(&self.state).scheduled.get(&id).copied()
    }
}

impl Scheduler for DummyScheduler {
    fn schedule(&mut self, after: Duration) -> TimerId {
        let mut state = lock(&self.state);
        state.next += 1;
        let id = TimerId(state.next);
        state.scheduled.insert(id, after);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        let mut state = lock(&self.state);
        if !state.cancelled.contains(&id) {
            state.cancelled.push(id);
        }
    }
}

#[derive(Debug, Default)]
struct CompressorState {
    jobs: Vec<CompressJob>,
    refuse: bool,
}

/// Queues jobs; the test decides the result.
#[derive(Debug, Clone, Default)]
pub struct DummyCompressor {
    state: Arc<Mutex<CompressorState>>,
}

impl DummyCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<CompressJob> {
        lock(&self.state).jobs.clone()
    }

    pub fn refuse(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }
}

impl ImageCompressor for DummyCompressor {
    fn compress(&mut self, job: CompressJob) -> Result<()> {
        let mut state = lock(&self.state);
        if state.refuse {
            return Err(Error::image("dummy compressor refused"));
        }
        state.jobs.push(job);
        Ok(())
    }
}

/// Settable clock.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalyticsEvent {
    SessionStarted,
    ConnectionMade { duration_ms: u64, via_direct: bool },
    DirectLinkEstablished { duration_ms: u64 },
    DirectLinkFallback { reason: String },
    MessageSent { length: usize },
    ImageShared { size: usize, compressed: bool },
    Error { kind: String, feature: String },
    SessionEnded(SessionSummary),
}

/// Keeps every analytics call for later assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingAnalytics {
    events: Arc<Mutex<Vec<AnalyticsEvent>>>,
}

impl RecordingAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        lock(&self.events).clone()
    }

    pub fn has_error(&self, kind: &str) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, AnalyticsEvent::Error { kind: k, .. } if k == kind))
    }

    pub fn images(&self) -> Vec<(usize, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AnalyticsEvent::ImageShared { size, compressed } => Some((size, compressed)),
                _ => None,
            })
            .collect()
    }

    pub fn sessions_ended(&self) -> Vec<SessionSummary> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AnalyticsEvent::SessionEnded(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: AnalyticsEvent) {
        lock(&self.events).push(event);
    }
}

impl Analytics for RecordingAnalytics {
    fn session_started(&self) {
        self.record(AnalyticsEvent::SessionStarted);
    }

    fn connection_made(&self, duration_ms: u64, via_direct: bool) {
        self.record(AnalyticsEvent::ConnectionMade {
            duration_ms,
            via_direct,
        });
    }

    fn direct_link_established(&self, duration_ms: u64) {
        self.record(AnalyticsEvent::DirectLinkEstablished { duration_ms });
    }

    fn direct_link_fallback(&self, reason: &str) {
        self.record(AnalyticsEvent::DirectLinkFallback {
            reason: reason.to_string(),
        });
    }

    fn message_sent(&self, length: usize, _latency_ms: Option<u64>) {
        self.record(AnalyticsEvent::MessageSent { length });
    }

    fn image_shared(&self, size_bytes: usize, was_compressed: bool) {
        self.record(AnalyticsEvent::ImageShared {
            size: size_bytes,
            compressed: was_compressed,
        });
    }

    fn error(&self, kind: &str, feature: &str) {
        self.record(AnalyticsEvent::Error {
            kind: kind.to_string(),
            feature: feature.to_string(),
        });
    }

    fn session_ended(&self, summary: &SessionSummary) {
        self.record(AnalyticsEvent::SessionEnded(summary.clone()));
    }
}

/// A controller wired to dummies, plus handles to inspect them.
pub struct DummyRig {
    pub controller: SessionController,
    pub signaling: DummySignaling,
    pub connector: DummyConnector,
    pub scheduler: DummyScheduler,
    pub compressor: DummyCompressor,
    pub analytics: RecordingAnalytics,
    pub clock: ManualClock,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

impl DummyRig {
    pub fn new(local_id: &str) -> Self {
        Self::with_config(local_id, ClientConfig::default())
    }

    pub fn with_config(local_id: &str, config: ClientConfig) -> Self {
        let signaling = DummySignaling::new();
        let connector = DummyConnector::new();
        let scheduler = DummyScheduler::new();
        let compressor = DummyCompressor::new();
        let analytics = RecordingAnalytics::new();
        let clock = ManualClock::new(1_000);
        let (notifier, notifications) = Notifier::channel();
        let ports = SessionPorts {
            signaling: Box::new(signaling.clone()),
            connector: Box::new(connector.clone()),
            scheduler: Box::new(scheduler.clone()),
            compressor: Box::new(compressor.clone()),
            analytics: Reporter::new(Arc::new(analytics.clone())),
            clock: Arc::new(clock.clone()),
        };
        Self {
            controller: SessionController::new(config, local_id.to_string(), ports, notifier),
            signaling,
            connector,
            scheduler,
            compressor,
            analytics,
            clock,
            notifications,
        }
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n);
        }
        out
    }
}
