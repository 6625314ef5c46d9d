//! Control channel to the matchmaking server and its reconnect policy.
//!
//! The link counts consecutive failed connection attempts. Each failure below
//! the limit schedules another attempt with capped exponential backoff; the
//! failure that reaches the limit is terminal until the user asks for a manual
//! reconnect. Any successful connection resets the count.

use std::time::Duration;

use chips_common::{ClientFrame, Error, Result};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::event::DisconnectReason;
use crate::ports::{Scheduler, SignalingTransport, TimerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting for the reconnect timer.
    Backoff,
    Exhausted,
    Closed,
}

/// Outcome of a failed connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    Retrying {
        attempt: u32,
        max: u32,
        delay: Duration,
    },
    Exhausted {
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            initial_delay: Duration::from_millis(config.reconnect_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_delay_max_ms),
        }
    }

    /// Delay before the attempt following `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

pub struct SignalingLink {
    transport: Box<dyn SignalingTransport>,
    policy: ReconnectPolicy,
    state: LinkState,
    failures: u32,
    reconnect_timer: Option<TimerId>,
    has_connected: bool,
    connect_started_ms: u64,
    connection_attempts: u64,
    failed_connections: u64,
}

impl SignalingLink {
    pub fn new(transport: Box<dyn SignalingTransport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            state: LinkState::Disconnected,
            failures: 0,
            reconnect_timer: None,
            has_connected: false,
            connect_started_ms: 0,
            connection_attempts: 0,
            failed_connections: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts
    }

    pub fn failed_connections(&self) -> u64 {
        self.failed_connections
    }

    pub fn reconnect_timer(&self) -> Option<TimerId> {
        self.reconnect_timer
    }

    /// Start a connection attempt.
    pub fn connect(&mut self, now_ms: u64, scheduler: &mut dyn Scheduler) -> Result<()> {
        match self.state {
            LinkState::Closed => return Err(Error::internal("signaling link is closed")),
            LinkState::Connecting | LinkState::Connected => {
                debug!(state = ?self.state, "connect ignored");
                return Ok(());
            }
            _ => {}
        }
        self.cancel_reconnect(scheduler);
        self.state = LinkState::Connecting;
        self.connect_started_ms = now_ms;
        self.connection_attempts += 1;
        info!(attempt = self.failures + 1, "connecting to signaling server");
        self.transport.connect()
    }

    /// User-initiated retry; the only way out of [`LinkState::Exhausted`].
    pub fn manual_reconnect(&mut self, now_ms: u64, scheduler: &mut dyn Scheduler) -> Result<()> {
        if self.state == LinkState::Connected {
            return Ok(());
        }
        if self.state == LinkState::Connecting {
            self.transport.disconnect();
            self.state = LinkState::Disconnected;
        }
        self.connect(now_ms, scheduler)
    }

    /// Returns whether this connection replaces an earlier one, and how long
    /// the attempt took.
    pub fn on_connected(&mut self, now_ms: u64) -> (bool, u64) {
        let was_reconnect = self.has_connected;
        self.state = LinkState::Connected;
        self.has_connected = true;
        self.failures = 0;
        let elapsed = now_ms.saturating_sub(self.connect_started_ms);
        info!(was_reconnect, elapsed_ms = elapsed, "signaling connected");
        (was_reconnect, elapsed)
    }

    pub fn on_connect_error(
        &mut self,
        reason: &str,
        scheduler: &mut dyn Scheduler,
    ) -> ConnectFailure {
        self.failures += 1;
        self.failed_connections += 1;
        if self.failures >= self.policy.max_attempts {
            warn!(attempts = self.failures, reason, "signaling reconnect attempts exhausted");
            self.state = LinkState::Exhausted;
            self.transport.disconnect();
            return ConnectFailure::Exhausted {
                attempts: self.failures,
            };
        }
        let delay = self.policy.delay_for(self.failures);
        warn!(
            attempt = self.failures,
            max = self.policy.max_attempts,
            ?delay,
            reason,
            "signaling connect failed, retrying"
        );
        self.state = LinkState::Backoff;
        self.reconnect_timer = Some(scheduler.schedule(delay));
        ConnectFailure::Retrying {
            attempt: self.failures,
            max: self.policy.max_attempts,
            delay,
        }
    }

    /// Returns the reconnect delay if a retry was scheduled.
    pub fn on_disconnected(
        &mut self,
        reason: &DisconnectReason,
        scheduler: &mut dyn Scheduler,
    ) -> Option<Duration> {
        if self.state == LinkState::Closed {
            return None;
        }
        match reason {
            DisconnectReason::Server => {
                info!("signaling closed by server; not reconnecting");
                self.cancel_reconnect(scheduler);
                self.transport.disconnect();
                self.state = LinkState::Disconnected;
                None
            }
            DisconnectReason::Transport(cause) => {
                let delay = self.policy.delay_for(1);
                warn!(cause = %cause, ?delay, "signaling dropped, reconnecting");
                self.transport.disconnect();
                self.state = LinkState::Backoff;
                self.cancel_reconnect(scheduler);
                self.reconnect_timer = Some(scheduler.schedule(delay));
                Some(delay)
            }
        }
    }

    /// Returns true if `id` was this link's reconnect timer.
    pub fn on_timer(&mut self, id: TimerId, now_ms: u64, scheduler: &mut dyn Scheduler) -> bool {
        if self.reconnect_timer != Some(id) {
            return false;
        }
        self.reconnect_timer = None;
        if self.state == LinkState::Backoff {
            self.state = LinkState::Disconnected;
            if let Err(e) = self.connect(now_ms, scheduler) {
                warn!(error = %e, "reconnect attempt could not start");
            }
        }
        true
    }

    pub fn send(&mut self, frame: ClientFrame) -> Result<()> {
        if self.state == LinkState::Closed {
            return Err(Error::transport_send("signaling link is closed"));
        }
        debug!(event = frame.event_name(), "signaling send");
        self.transport.send(frame)
    }

    pub fn cancel_reconnect(&mut self, scheduler: &mut dyn Scheduler) {
        if let Some(id) = self.reconnect_timer.take() {
            scheduler.cancel(id);
        }
    }

    /// Tear the link down for good. Idempotent.
    pub fn close(&mut self, scheduler: &mut dyn Scheduler) {
        if self.state == LinkState::Closed {
            return;
        }
        self.cancel_reconnect(scheduler);
        self.transport.disconnect();
        self.state = LinkState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyScheduler, DummySignaling};

    fn link() -> (SignalingLink, DummySignaling, DummyScheduler) {
        let transport = DummySignaling::new();
        let policy = ReconnectPolicy::from_config(&ClientConfig::default());
        (
            SignalingLink::new(Box::new(transport.clone()), policy),
            transport,
            DummyScheduler::new(),
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::from_config(&ClientConfig::default());
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(5000));
    }

    #[test]
    fn test_fifth_failure_is_terminal() {
        let (mut link, transport, mut sched) = link();
        link.connect(0, &mut sched).unwrap();
        for attempt in 1..5 {
            let outcome = link.on_connect_error("refused", &mut sched);
            assert!(
                matches!(outcome, ConnectFailure::Retrying { attempt: a, max: 5, .. } if a == attempt)
            );
            let timer = link.reconnect_timer().unwrap();
            assert!(link.on_timer(timer, 0, &mut sched));
            assert_eq!(link.state(), LinkState::Connecting);
        }
        let outcome = link.on_connect_error("refused", &mut sched);
        assert_eq!(outcome, ConnectFailure::Exhausted { attempts: 5 });
        assert_eq!(link.state(), LinkState::Exhausted);
        assert_eq!(link.reconnect_timer(), None);
        assert_eq!(transport.connects(), 5);
    }

    #[test]
    fn test_manual_retry_resets_counter_on_success() {
        let (mut link, transport, mut sched) = link();
        link.connect(0, &mut sched).unwrap();
        for _ in 0..5 {
            if let ConnectFailure::Retrying { .. } = link.on_connect_error("refused", &mut sched) {
                let timer = link.reconnect_timer().unwrap();
                link.on_timer(timer, 0, &mut sched);
            }
        }
        assert_eq!(link.state(), LinkState::Exhausted);

        link.manual_reconnect(10, &mut sched).unwrap();
        assert_eq!(transport.connects(), 6);
        let (was_reconnect, _) = link.on_connected(20);
        assert!(!was_reconnect);
        assert_eq!(link.failures(), 0);
        assert!(link.is_connected());
    }

    #[test]
    fn test_server_disconnect_does_not_retry() {
        let (mut link, _transport, mut sched) = link();
        link.connect(0, &mut sched).unwrap();
        link.on_connected(5);
        assert_eq!(link.on_disconnected(&DisconnectReason::Server, &mut sched), None);
        assert!(sched.pending().is_empty());
    }

    #[test]
    fn test_transport_drop_schedules_reconnect() {
        let (mut link, transport, mut sched) = link();
        link.connect(0, &mut sched).unwrap();
        link.on_connected(5);
        let delay = link.on_disconnected(&DisconnectReason::Transport("reset".into()), &mut sched);
        assert_eq!(delay, Some(Duration::from_millis(1000)));
        let timer = link.reconnect_timer().unwrap();
        assert!(link.on_timer(timer, 1000, &mut sched));
        assert_eq!(transport.connects(), 2);
        let (was_reconnect, elapsed) = link.on_connected(1200);
        assert!(was_reconnect);
        assert_eq!(elapsed, 200);
    }

    #[test]
    fn test_stale_timer_is_ignored() {
        let (mut link, transport, mut sched) = link();
        link.connect(0, &mut sched).unwrap();
        assert!(!link.on_timer(TimerId(999), 0, &mut sched));
        assert_eq!(transport.connects(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut link, transport, mut sched) = link();
        link.connect(0, &mut sched).unwrap();
        link.on_connect_error("refused", &mut sched);
        let timer = link.reconnect_timer().unwrap();
        link.close(&mut sched);
        link.close(&mut sched);
        assert!(sched.is_cancelled(timer));
        assert_eq!(transport.disconnects(), 1);
        assert!(link.send(ClientFrame::Leave).is_err());
    }
}
