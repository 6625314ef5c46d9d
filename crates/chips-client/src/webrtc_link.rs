use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result as AnyResult;
use chips_common::{Error, Result};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::event::{LinkEvent, PeerState, SessionEvent};
use crate::ports::{DirectLink, LinkId, PeerConnector, SendTag};
use crate::types::Role;

pub const CHANNEL_LABEL: &str = "chat";
pub const CHANNEL_MAX_RETRANSMITS: u16 = 3;

enum LinkCommand {
    AcceptOffer(Value),
    AcceptAnswer(Value),
    AddCandidate(Value),
    Send { payload: String, tag: SendTag },
}

/// Opens WebRTC data-channel links.
pub struct RtcConnector {
    ice_servers: Vec<String>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            ice_servers,
            events,
        }
    }
}

impl PeerConnector for RtcConnector {
    fn open(&mut self, link_id: LinkId, role: Role) -> Result<Box<dyn DirectLink>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let driver = LinkDriver {
            link_id,
            role,
            ice_servers: self.ice_servers.clone(),
            events: self.events.clone(),
            open: Arc::clone(&open),
        };
        tokio::spawn(driver.run(rx));
        Ok(Box::new(RtcLink {
            commands: Some(tx),
            open,
        }))
    }
}

/// Handle to a peer connection driven by its own task. Commands are applied
/// in the order they are issued.
pub struct RtcLink {
    commands: Option<mpsc::UnboundedSender<LinkCommand>>,
    open: Arc<AtomicBool>,
}

impl RtcLink {
    fn command(&self, command: LinkCommand) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or_else(|| Error::negotiation("link closed"))?
            .send(command)
            .map_err(|_| Error::negotiation("link task ended"))
    }
}

impl DirectLink for RtcLink {
    fn accept_offer(&mut self, offer: Value) -> Result<()> {
        self.command(LinkCommand::AcceptOffer(offer))
    }

    fn accept_answer(&mut self, answer: Value) -> Result<()> {
        self.command(LinkCommand::AcceptAnswer(answer))
    }

    fn add_candidate(&mut self, candidate: Value) -> Result<()> {
        self.command(LinkCommand::AddCandidate(candidate))
    }

    fn send(&mut self, payload: &str, tag: SendTag) -> Result<()> {
        if !self.is_open() {
            return Err(Error::transport_send("data channel not open"));
        }
        self.command(LinkCommand::Send {
            payload: payload.to_string(),
            tag,
        })
        .map_err(Error::transport_send)
    }

    fn is_open(&self) -> bool {
        self.commands.is_some() && self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        // Dropping the sender ends the driver loop, which closes the peer
        // connection.
        if self.commands.take().is_some() {
            self.open.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for RtcLink {
    fn drop(&mut self) {
        self.close();
    }
}

struct LinkDriver {
    link_id: LinkId,
    role: Role,
    ice_servers: Vec<String>,
    events: mpsc::UnboundedSender<SessionEvent>,
    open: Arc<AtomicBool>,
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

#[derive(Clone)]
struct Emitter {
    link_id: LinkId,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Emitter {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(SessionEvent::Link {
            link_id: self.link_id,
            event,
        });
    }
}

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

fn wire_channel(channel: Arc<RTCDataChannel>, emitter: Emitter, open: Arc<AtomicBool>) {
    let on_open = emitter.clone();
    let open_flag = Arc::clone(&open);
    channel.on_open(Box::new(move || {
        let emitter = on_open.clone();
        let open = Arc::clone(&open_flag);
        Box::pin(async move {
            info!("WebRTC data channel opened");
            open.store(true, Ordering::SeqCst);
            emitter.emit(LinkEvent::ChannelOpen);
        })
    }));

    let on_close = emitter.clone();
    let close_flag = Arc::clone(&open);
    channel.on_close(Box::new(move || {
        let emitter = on_close.clone();
        let open = Arc::clone(&close_flag);
        Box::pin(async move {
            info!("WebRTC data channel closed");
            open.store(false, Ordering::SeqCst);
            emitter.emit(LinkEvent::ChannelClosed);
        })
    }));

    let on_error = emitter.clone();
    channel.on_error(Box::new(move |err| {
        let emitter = on_error.clone();
        Box::pin(async move {
            warn!("WebRTC data channel error: {}", err);
            emitter.emit(LinkEvent::ChannelError(err.to_string()));
        })
    }));

    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let emitter = emitter.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => emitter.emit(LinkEvent::ChannelMessage(text)),
                Err(_) => warn!("dropping non-UTF-8 data channel message"),
            }
        })
    }));
}

impl LinkDriver {
    async fn run(self, commands: mpsc::UnboundedReceiver<LinkCommand>) {
        let emitter = Emitter {
            link_id: self.link_id,
            events: self.events.clone(),
        };
        if let Err(e) = self.drive(emitter.clone(), commands).await {
            warn!(link = self.link_id.0, "WebRTC negotiation failed: {}", e);
            self.open.store(false, Ordering::SeqCst);
            emitter.emit(LinkEvent::NegotiationFailed(e.to_string()));
        }
    }

    async fn drive(
        &self,
        emitter: Emitter,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    ) -> AnyResult<()> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(m).build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let channel: ChannelSlot = Arc::new(Mutex::new(None));

        let on_state = emitter.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let emitter = on_state.clone();
            Box::pin(async move {
                debug!("peer connection state: {}", state);
                emitter.emit(LinkEvent::StateChanged(map_state(state)));
            })
        }));

        let on_candidate = emitter.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let emitter = on_candidate.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate
                    .to_json()
                    .map_err(anyhow::Error::from)
                    .and_then(|init| serde_json::to_value(init).map_err(anyhow::Error::from))
                {
                    Ok(value) => emitter.emit(LinkEvent::LocalCandidate(value)),
                    Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        match self.role {
            Role::Initiator => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    max_retransmits: Some(CHANNEL_MAX_RETRANSMITS),
                    ..Default::default()
                };
                let dc = pc.create_data_channel(CHANNEL_LABEL, Some(init)).await?;
                wire_channel(Arc::clone(&dc), emitter.clone(), Arc::clone(&self.open));
                *channel.lock().await = Some(dc);

                let offer = pc.create_offer(None).await?;
                pc.set_local_description(offer.clone()).await?;
                emitter.emit(LinkEvent::LocalOffer(serde_json::to_value(&offer)?));
            }
            Role::Responder => {
                let slot = Arc::clone(&channel);
                let on_channel = emitter.clone();
                let open = Arc::clone(&self.open);
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = Arc::clone(&slot);
                    let emitter = on_channel.clone();
                    let open = Arc::clone(&open);
                    Box::pin(async move {
                        if dc.label() != CHANNEL_LABEL {
                            debug!("ignoring data channel {}", dc.label());
                            return;
                        }
                        wire_channel(Arc::clone(&dc), emitter, open);
                        *slot.lock().await = Some(dc);
                    })
                }));
            }
        }

        while let Some(command) = commands.recv().await {
            match command {
                LinkCommand::AcceptOffer(offer) => {
                    let offer: RTCSessionDescription = serde_json::from_value(offer)?;
                    pc.set_remote_description(offer).await?;
                    let answer = pc.create_answer(None).await?;
                    pc.set_local_description(answer.clone()).await?;
                    emitter.emit(LinkEvent::LocalAnswer(serde_json::to_value(&answer)?));
                }
                LinkCommand::AcceptAnswer(answer) => {
                    let answer: RTCSessionDescription = serde_json::from_value(answer)?;
                    pc.set_remote_description(answer).await?;
                }
                LinkCommand::AddCandidate(candidate) => {
                    match serde_json::from_value::<RTCIceCandidateInit>(candidate) {
                        Ok(init) => {
                            if let Err(e) = pc.add_ice_candidate(init).await {
                                warn!("Failed to add ICE candidate: {}", e);
                            }
                        }
                        Err(e) => warn!("Malformed ICE candidate: {}", e),
                    }
                }
                LinkCommand::Send { payload, tag } => {
                    let dc = channel.lock().await.clone();
                    let error = match dc {
                        Some(dc) => dc.send_text(payload).await.err().map(|e| e.to_string()),
                        None => Some("data channel not ready".to_string()),
                    };
                    if let Some(error) = error {
                        warn!(link = self.link_id.0, "data channel send failed: {}", error);
                        emitter.emit(LinkEvent::SendFailed { tag, error });
                    }
                }
            }
        }

        self.open.store(false, Ordering::SeqCst);
        if let Err(e) = pc.close().await {
            debug!("peer connection close: {}", e);
        }
        Ok(())
    }
}
