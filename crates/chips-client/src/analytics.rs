//! Fire-and-forget usage reporting.
//!
//! Implementations may fail however they like; [`Reporter`] makes sure none of
//! it reaches the session state machine.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{info, warn};

use crate::types::SessionSummary;

pub trait Analytics: Send + Sync {
    fn session_started(&self) {}
    fn connection_made(&self, _duration_ms: u64, _via_direct: bool) {}
    fn direct_link_established(&self, _duration_ms: u64) {}
    fn direct_link_fallback(&self, _reason: &str) {}
    fn message_sent(&self, _length: usize, _latency_ms: Option<u64>) {}
    fn image_shared(&self, _size_bytes: usize, _was_compressed: bool) {}
    fn error(&self, _kind: &str, _feature: &str) {}
    fn session_ended(&self, _summary: &SessionSummary) {}
}

pub struct NoopAnalytics;

impl Analytics for NoopAnalytics {}

/// Records every call as a `tracing` event under `chips::analytics`.
pub struct TracingAnalytics;

impl Analytics for TracingAnalytics {
    fn session_started(&self) {
        info!(target: "chips::analytics", "session started");
    }

    fn connection_made(&self, duration_ms: u64, via_direct: bool) {
        info!(target: "chips::analytics", duration_ms, via_direct, "connection made");
    }

    fn direct_link_established(&self, duration_ms: u64) {
        info!(target: "chips::analytics", duration_ms, "direct link established");
    }

    fn direct_link_fallback(&self, reason: &str) {
        info!(target: "chips::analytics", reason, "direct link fallback");
    }

    fn message_sent(&self, length: usize, latency_ms: Option<u64>) {
        info!(target: "chips::analytics", length, ?latency_ms, "message sent");
    }

    fn image_shared(&self, size_bytes: usize, was_compressed: bool) {
        info!(target: "chips::analytics", size_bytes, was_compressed, "image shared");
    }

    fn error(&self, kind: &str, feature: &str) {
        info!(target: "chips::analytics", kind, feature, "error");
    }

    fn session_ended(&self, summary: &SessionSummary) {
        info!(
            target: "chips::analytics",
            duration_ms = summary.duration_ms,
            sent = summary.messages_sent,
            received = summary.messages_received,
            direct = summary.used_direct_link,
            "session ended"
        );
    }
}

/// Guards every analytics call against panics in the collaborator.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<dyn Analytics>,
}

impl Reporter {
    pub fn new(inner: Arc<dyn Analytics>) -> Self {
        Self { inner }
    }

    fn guarded(&self, call: &'static str, f: impl FnOnce(&dyn Analytics)) {
        let inner = self.inner.as_ref();
        if catch_unwind(AssertUnwindSafe(|| f(inner))).is_err() {
            warn!(call, "analytics collaborator panicked; ignoring");
        }
    }

    pub fn session_started(&self) {
        self.guarded("session_started", |a| a.session_started());
    }

    pub fn connection_made(&self, duration_ms: u64, via_direct: bool) {
        self.guarded("connection_made", |a| a.connection_made(duration_ms, via_direct));
    }

    pub fn direct_link_established(&self, duration_ms: u64) {
        self.guarded("direct_link_established", |a| {
            a.direct_link_established(duration_ms)
        });
    }

    pub fn direct_link_fallback(&self, reason: &str) {
        self.guarded("direct_link_fallback", |a| a.direct_link_fallback(reason));
    }

    pub fn message_sent(&self, length: usize, latency_ms: Option<u64>) {
        self.guarded("message_sent", |a| a.message_sent(length, latency_ms));
    }

    pub fn image_shared(&self, size_bytes: usize, was_compressed: bool) {
        self.guarded("image_shared", |a| a.image_shared(size_bytes, was_compressed));
    }

    pub fn error(&self, kind: &str, feature: &str) {
        self.guarded("error", |a| a.error(kind, feature));
    }

    pub fn session_ended(&self, summary: &SessionSummary) {
        self.guarded("session_ended", |a| a.session_ended(summary));
    }
}
