//! Direct-link latency probing and quality classification.

use std::collections::VecDeque;
use std::time::Duration;

use chips_common::PeerPayload;
use tracing::{debug, info};

use crate::ports::{Scheduler, TimerId};
use crate::types::LinkQuality;

pub const EXCELLENT_BELOW_MS: f64 = 50.0;
pub const GOOD_BELOW_MS: f64 = 150.0;

/// Bounded sequence of RTT samples; the oldest sample drops first.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, rtt_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum as f64 / self.samples.len() as f64)
    }

    pub fn classify(&self) -> LinkQuality {
        classify(self.mean())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

pub fn classify(mean_ms: Option<f64>) -> LinkQuality {
    match mean_ms {
        None => LinkQuality::Unknown,
        Some(m) if m < EXCELLENT_BELOW_MS => LinkQuality::Excellent,
        Some(m) if m < GOOD_BELOW_MS => LinkQuality::Good,
        Some(_) => LinkQuality::Poor,
    }
}

/// Periodic ping over the direct link while it is up.
pub struct QualityMonitor {
    window: LatencyWindow,
    interval: Duration,
    probe_timer: Option<TimerId>,
    quality: LinkQuality,
}

impl QualityMonitor {
    pub fn new(interval: Duration, window: usize) -> Self {
        Self {
            window: LatencyWindow::new(window),
            interval,
            probe_timer: None,
            quality: LinkQuality::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        self.probe_timer.is_some()
    }

    pub fn probe_timer(&self) -> Option<TimerId> {
        self.probe_timer
    }

    pub fn quality(&self) -> LinkQuality {
        self.quality
    }

    pub fn window(&self) -> &LatencyWindow {
        &self.window
    }

    /// Arm the probe timer. A running monitor is left alone.
    pub fn start(&mut self, scheduler: &mut dyn Scheduler) {
        if self.is_active() {
            return;
        }
        debug!(interval = ?self.interval, "quality monitor started");
        self.probe_timer = Some(scheduler.schedule(self.interval));
    }

    /// Cancel the probe timer and discard collected samples. Idempotent.
    pub fn stop(&mut self, scheduler: &mut dyn Scheduler) {
        if let Some(id) = self.probe_timer.take() {
            scheduler.cancel(id);
            debug!("quality monitor stopped");
        }
        self.window.clear();
    }

    /// Returns the ping to send if `id` is the probe timer, and re-arms it.
    pub fn on_timer(
        &mut self,
        id: TimerId,
        now_ms: u64,
        scheduler: &mut dyn Scheduler,
    ) -> Option<PeerPayload> {
        if self.probe_timer != Some(id) {
            return None;
        }
        self.probe_timer = Some(scheduler.schedule(self.interval));
        Some(PeerPayload::Ping { sent_at: now_ms })
    }

    /// Record the echo of a ping sent at `sent_at`. Returns the new
    /// classification when it changed.
    pub fn on_pong(&mut self, sent_at: u64, now_ms: u64) -> Option<LinkQuality> {
        if !self.is_active() {
            return None;
        }
        let rtt = now_ms.saturating_sub(sent_at);
        self.window.push(rtt);
        debug!(rtt_ms = rtt, samples = self.window.len(), "rtt sample");
        self.set_quality(self.window.classify())
    }

    /// Force a classification. Returns it when it changed.
    pub fn set_quality(&mut self, quality: LinkQuality) -> Option<LinkQuality> {
        if self.quality == quality {
            return None;
        }
        info!(from = %self.quality, to = %quality, "link quality changed");
        self.quality = quality;
        Some(quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummyScheduler;

    fn window_of(samples: &[u64]) -> LatencyWindow {
        let mut w = LatencyWindow::new(100);
        for s in samples {
            w.push(*s);
        }
        w
    }

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(window_of(&[40]).classify(), LinkQuality::Excellent);
        assert_eq!(window_of(&[30, 50]).classify(), LinkQuality::Excellent);
        assert_eq!(window_of(&[100]).classify(), LinkQuality::Good);
        assert_eq!(window_of(&[300]).classify(), LinkQuality::Poor);
        assert_eq!(window_of(&[]).classify(), LinkQuality::Unknown);
        assert_eq!(window_of(&[50]).classify(), LinkQuality::Good);
        assert_eq!(window_of(&[150]).classify(), LinkQuality::Poor);
    }

    #[test]
    fn test_window_drops_oldest() {
        let mut w = LatencyWindow::new(100);
        w.push(10_000);
        for _ in 0..100 {
            w.push(10);
        }
        assert_eq!(w.len(), 100);
        assert_eq!(w.mean(), Some(10.0));
    }

    #[test]
    fn test_probe_rearms_and_measures() {
        let mut sched = DummyScheduler::new();
        let mut monitor = QualityMonitor::new(Duration::from_secs(10), 100);
        monitor.start(&mut sched);
        monitor.start(&mut sched);
        assert_eq!(sched.pending().len(), 1);

        let first = monitor.probe_timer().unwrap();
        let ping = monitor.on_timer(first, 5_000, &mut sched).unwrap();
        assert_eq!(ping, PeerPayload::Ping { sent_at: 5_000 });
        let second = monitor.probe_timer().unwrap();
        assert_ne!(first, second);
        assert_eq!(sched.delay_of(second), Some(Duration::from_secs(10)));

        assert_eq!(monitor.on_pong(5_000, 5_040), Some(LinkQuality::Excellent));
        assert_eq!(monitor.on_pong(5_000, 5_040), None);
    }

    #[test]
    fn test_stop_cancels_and_clears() {
        let mut sched = DummyScheduler::new();
        let mut monitor = QualityMonitor::new(Duration::from_secs(10), 100);
        monitor.start(&mut sched);
        monitor.on_pong(0, 20);
        let timer = monitor.probe_timer().unwrap();
        monitor.stop(&mut sched);
        monitor.stop(&mut sched);
        assert!(sched.is_cancelled(timer));
        assert!(monitor.window().is_empty());
        assert!(monitor.on_timer(timer, 0, &mut sched).is_none());
        assert_eq!(monitor.on_pong(0, 20), None);
    }
}
