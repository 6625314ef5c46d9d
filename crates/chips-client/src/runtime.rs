//! Tokio wiring: real ports feeding one event loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chips_common::{Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::analytics::{Analytics, Reporter};
use crate::config::ClientConfig;
use crate::event::{Command, ImageUpload, SessionEvent};
use crate::images::recompress;
use crate::ports::{CompressJob, ImageCompressor, Scheduler, SystemClock, TimerId};
use crate::session::{SessionController, SessionPorts};
use crate::types::{Notification, Notifier};
use crate::webrtc_link::RtcConnector;
use crate::ws::WsSignaling;

/// One-shot timers backed by `tokio::time::sleep`.
pub struct TokioScheduler {
    next: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    timers: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioScheduler {
    pub fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            next: 0,
            events,
            timers: HashMap::new(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, after: Duration) -> TimerId {
        self.timers.retain(|_, handle| !handle.is_finished());
        self.next += 1;
        let id = TimerId(self.next);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(SessionEvent::Timer(id));
        });
        self.timers.insert(id, handle);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

/// Runs [`recompress`] on the blocking pool.
pub struct BlockingCompressor {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl BlockingCompressor {
    pub fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { events }
    }
}

impl ImageCompressor for BlockingCompressor {
    fn compress(&mut self, job: CompressJob) -> Result<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            let id = job.id;
            let result = tokio::task::spawn_blocking(move || {
                recompress(&job.bytes, job.quality, job.max_edge)
            })
            .await
            .unwrap_or_else(|e| Err(Error::internal(e)));
            let _ = events.send(SessionEvent::ImageCompressed { job: id, result });
        });
        Ok(())
    }
}

/// Handle to a running chat session loop.
///
/// All methods enqueue a command and return immediately; outcomes arrive on
/// the notification receiver returned by [`ChatClient::spawn`].
pub struct ChatClient {
    local_id: String,
    events: mpsc::UnboundedSender<SessionEvent>,
    task: JoinHandle<()>,
}

impl ChatClient {
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: ClientConfig,
        analytics: Arc<dyn Analytics>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notification>)> {
        config.validate()?;
        let local_id = uuid::Uuid::new_v4().to_string();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (notifier, notifications) = Notifier::channel();

        let ports = SessionPorts {
            signaling: Box::new(WsSignaling::new(
                &config.server_url,
                &local_id,
                events_tx.clone(),
            )?),
            connector: Box::new(RtcConnector::new(
                config.ice_servers.clone(),
                events_tx.clone(),
            )),
            scheduler: Box::new(TokioScheduler::new(events_tx.clone())),
            compressor: Box::new(BlockingCompressor::new(events_tx.clone())),
            analytics: Reporter::new(analytics),
            clock: Arc::new(SystemClock),
        };
        let mut controller = SessionController::new(config, local_id.clone(), ports, notifier);

        info!(peer = %local_id, "starting chat client");
        let task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let last = matches!(event, SessionEvent::Command(Command::Shutdown));
                controller.handle(event);
                if last {
                    break;
                }
            }
            debug!("session event loop finished");
        });

        Ok((
            Self {
                local_id,
                events: events_tx,
                task,
            },
            notifications,
        ))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn send(&self, command: Command) -> Result<()> {
        self.events
            .send(SessionEvent::Command(command))
            .map_err(|_| Error::internal("session loop has stopped"))
    }

    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    pub fn join(&self, name: impl Into<String>) -> Result<()> {
        self.send(Command::Join { name: name.into() })
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SendText(text.into()))
    }

    pub fn send_image(&self, upload: ImageUpload) -> Result<()> {
        self.send(Command::SendImage(upload))
    }

    pub fn request_photo(&self) -> Result<()> {
        self.send(Command::RequestPhoto)
    }

    pub fn leave(&self) -> Result<()> {
        self.send(Command::Leave)
    }

    pub fn report(&self) -> Result<()> {
        self.send(Command::Report)
    }

    pub fn reconnect(&self) -> Result<()> {
        self.send(Command::Reconnect)
    }

    pub fn clear_messages(&self) -> Result<()> {
        self.send(Command::ClearMessages)
    }

    pub fn request_stats(&self) -> Result<()> {
        self.send(Command::ReportStats)
    }

    /// Tear everything down and wait for the loop to exit.
    pub async fn shutdown(self) -> Result<()> {
        // The loop may already be gone; joining below still succeeds.
        let _ = self.send(Command::Shutdown);
        self.task.await.map_err(Error::internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_fires_and_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sched = TokioScheduler::new(tx);
        let keep = sched.schedule(Duration::from_secs(10));
        let dropped = sched.schedule(Duration::from_secs(5));
        sched.cancel(dropped);
        sched.cancel(dropped);

        match rx.recv().await {
            Some(SessionEvent::Timer(id)) => assert_eq!(id, keep),
            other => panic!("expected timer, got {other:?}"),
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_compressor_reports_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut compressor = BlockingCompressor::new(tx);
        compressor
            .compress(CompressJob {
                id: 9,
                bytes: b"not an image".to_vec(),
                quality: 0.7,
                max_edge: 1024,
            })
            .unwrap();
        match rx.recv().await {
            Some(SessionEvent::ImageCompressed { job: 9, result }) => {
                assert!(matches!(result, Err(Error::Image(_))));
            }
            other => panic!("expected compression result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_rejects_invalid_config() {
        let config = ClientConfig {
            server_url: "ftp://nope".into(),
            ..Default::default()
        };
        let result = ChatClient::spawn(config, Arc::new(crate::analytics::NoopAnalytics));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_client_shutdown_stops_loop() {
        let (client, mut notifications) = ChatClient::spawn(
            ClientConfig::default(),
            Arc::new(crate::analytics::NoopAnalytics),
        )
        .unwrap();
        client.clear_messages().unwrap();
        client.shutdown().await.unwrap();
        assert_eq!(
            notifications.recv().await,
            Some(Notification::MessagesCleared)
        );
    }
}
