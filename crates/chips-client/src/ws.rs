use chips_common::{ClientFrame, Error, Result, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::event::{DisconnectReason, SessionEvent, SignalEvent};
use crate::ports::SignalingTransport;

/// Append `peer=<local id>` so the server reports it as our id to the partner.
pub fn signaling_url(base: &str, local_id: &str) -> Result<Url> {
    let mut url = Url::parse(base).map_err(Error::config)?;
    url.query_pairs_mut().append_pair("peer", local_id);
    Ok(url)
}

/// WebSocket signaling transport.
///
/// Each `connect` spawns one connection task. Frames sent before the socket
/// is up wait in the writer channel and are flushed once it connects.
pub struct WsSignaling {
    url: Url,
    events: mpsc::UnboundedSender<SessionEvent>,
    writer: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

impl WsSignaling {
    pub fn new(
        server_url: &str,
        local_id: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        Ok(Self {
            url: signaling_url(server_url, local_id)?,
            events,
            writer: None,
            task: None,
        })
    }
}

impl SignalingTransport for WsSignaling {
    fn connect(&mut self) -> Result<()> {
        self.disconnect();
        let (tx, rx) = mpsc::unbounded_channel();
        self.writer = Some(tx);
        self.task = Some(tokio::spawn(run_connection(
            self.url.clone(),
            self.events.clone(),
            rx,
        )));
        Ok(())
    }

    fn send(&mut self, frame: ClientFrame) -> Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| Error::transport_send("signaling not connected"))?;
        writer
            .send(frame.encode()?)
            .map_err(|_| Error::transport_send("signaling connection closed"))
    }

    fn disconnect(&mut self) {
        self.writer = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for WsSignaling {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn emit(events: &mpsc::UnboundedSender<SessionEvent>, event: SignalEvent) {
    let _ = events.send(SessionEvent::Signal(event));
}

async fn run_connection(
    url: Url,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("Failed to connect to signaling server: {}", e);
            emit(&events, SignalEvent::ConnectError(e.to_string()));
            return;
        }
    };
    info!("Connected to signaling server: {}", url);
    emit(&events, SignalEvent::Connected);

    let (mut write, mut read) = ws_stream.split();
    let reason = loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(text) => {
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        error!("Failed to send signaling message: {}", e);
                        break DisconnectReason::Transport(e.to_string());
                    }
                }
                None => {
                    debug!("signaling writer dropped; closing socket");
                    let _ = write.close().await;
                    return;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => match ServerFrame::decode(&text) {
                    Ok(frame) => emit(&events, SignalEvent::Inbound(frame)),
                    Err(e) => {
                        warn!("Failed to parse signaling message: {}", e);
                        emit(&events, SignalEvent::Malformed(e));
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let server_initiated = frame
                        .as_ref()
                        .is_some_and(|f| matches!(f.code, CloseCode::Normal | CloseCode::Policy));
                    break if server_initiated {
                        DisconnectReason::Server
                    } else {
                        DisconnectReason::Transport("closed".to_string())
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Signaling WebSocket error: {}", e);
                    break DisconnectReason::Transport(e.to_string());
                }
                None => break DisconnectReason::Transport("stream ended".to_string()),
            },
        }
    };
    emit(&events, SignalEvent::Disconnected(reason));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_url_appends_peer() {
        let url = signaling_url("ws://localhost:3001/ws", "abc-123").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:3001/ws?peer=abc-123");

        let url = signaling_url("wss://chips.example/ws?v=2", "p").unwrap();
        assert_eq!(url.query(), Some("v=2&peer=p"));
    }

    #[test]
    fn test_signaling_url_rejects_garbage() {
        assert!(matches!(
            signaling_url("not a url", "p"),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut ws = WsSignaling::new("ws://127.0.0.1:1/ws", "p", tx).unwrap();
        assert!(matches!(
            ws.send(ClientFrame::Leave),
            Err(Error::TransportSend(_))
        ));
        ws.disconnect();
        ws.disconnect();
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ws = WsSignaling::new("ws://127.0.0.1:1/ws", "p", tx).unwrap();
        ws.connect().unwrap();
        match rx.recv().await {
            Some(SessionEvent::Signal(SignalEvent::ConnectError(_))) => {}
            other => panic!("expected connect error, got {other:?}"),
        }
    }
}
