//! Chips terminal client: meet a stranger, chat, send photos.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chips_client::analytics::TracingAnalytics;
use chips_client::{
    ChatClient, ClientConfig, Direction, EndReason, ImageUpload, MessageKind, Notification,
    SignalingStatus,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "chips")]
#[command(about = "Anonymous one-to-one chat")]
struct Args {
    /// Signaling server WebSocket URL
    #[arg(short, long, env = "CHIPS_SERVER_URL")]
    server: Option<String>,

    /// Display name sent to the matchmaker
    #[arg(short, long, env = "CHIPS_NAME", default_value = "Anonymous")]
    name: String,

    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// STUN/TURN server URL (repeatable, replaces the defaults)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Print notifications as JSON lines
    #[arg(long)]
    json: bool,
}

const HELP: &str = "commands: /photo  /image <path>  /leave  /report  /join  /reconnect  /stats  /clear  /quit";

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(server) = &args.server {
        config.server_url = server.clone();
    }
    if !args.ice_servers.is_empty() {
        config.ice_servers = args.ice_servers.clone();
    }
    Ok(config)
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

async fn read_image(path: &str) -> Result<ImageUpload> {
    let path = Path::new(path);
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(ImageUpload {
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string()),
        mime: mime_for(path).to_string(),
        bytes,
        replace_message_id: None,
    })
}

fn render(notification: &Notification) -> Option<String> {
    match notification {
        Notification::Signaling { status, message } => Some(match (status, message) {
            (_, Some(message)) => format!("* {message}"),
            (SignalingStatus::Connecting, None) => "* connecting...".to_string(),
            (SignalingStatus::Connected, None) => "* connected, waiting for a partner".to_string(),
            (status, None) => format!("* signaling {status:?}"),
        }),
        Notification::Matched { session } => Some(format!(
            "* matched with {} ({:?})",
            if session.partner_name.is_empty() {
                "a stranger"
            } else {
                session.partner_name.as_str()
            },
            session.role
        )),
        Notification::MessageAdded { message } => {
            let who = match message.direction {
                Direction::Sent => "you",
                Direction::Received => "them",
            };
            match message.kind {
                MessageKind::Text => Some(format!("<{who}> {}", message.text)),
                MessageKind::Image => Some(format!("<{who}> [{}]", message.text)),
                MessageKind::PhotoRequest => Some(format!("* {who} {}", message.text)),
                MessageKind::Control => Some(format!("* {}", message.text)),
            }
        }
        Notification::MessageUpdated { message } => {
            debug!(id = %message.id, status = ?message.status, via = ?message.via, "message updated");
            None
        }
        Notification::MessagesCleared => Some("* messages cleared".to_string()),
        Notification::ConnectionState { state } => Some(format!("* link {state:?}")),
        Notification::Quality { quality } => Some(format!("* quality {quality}")),
        Notification::SessionEnded { reason } => {
            Some(match reason {
                EndReason::SignalingReset => "* chat ended; finding a new partner".to_string(),
                EndReason::SignalingExhausted => {
                    "* chat ended; /reconnect to look for a new partner".to_string()
                }
                reason => format!("* chat ended ({reason:?}); /join for a new partner"),
            })
        }
        Notification::QueueTimeout { message } => Some(format!("* {message}")),
        Notification::RateLimited => Some("* slow down, you are rate limited".to_string()),
        Notification::LinkExhausted { message, .. } => {
            Some(format!("* {message} (/reconnect to try again)"))
        }
        Notification::Stats { stats } => serde_json::to_string_pretty(stats).ok(),
    }
}

/// The server forgets the queue entry when the socket goes away, so the user
/// is queued again once a fresh connection is up. Returns true when a `join`
/// should be sent now.
fn needs_rejoin(notification: &Notification, rejoin_on_connect: &mut bool) -> bool {
    match notification {
        Notification::SessionEnded {
            reason: EndReason::SignalingReset,
        } => true,
        Notification::SessionEnded {
            reason: EndReason::SignalingExhausted,
        } => {
            *rejoin_on_connect = true;
            false
        }
        Notification::Signaling {
            status: SignalingStatus::Connected,
            ..
        } => std::mem::take(rejoin_on_connect),
        _ => false,
    }
}

/// Returns false when the user asked to quit.
async fn dispatch(
    client: &ChatClient,
    name: &str,
    line: &str,
    rejoin_on_connect: &mut bool,
) -> Result<bool> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(true);
    }
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    match cmd {
        "/quit" | "/exit" => return Ok(false),
        "/help" => println!("{HELP}"),
        "/photo" => client.request_photo()?,
        "/image" if !rest.trim().is_empty() => match read_image(rest.trim()).await {
            Ok(upload) => client.send_image(upload)?,
            Err(e) => eprintln!("{e:#}"),
        },
        "/image" => println!("usage: /image <path>"),
        "/leave" => client.leave()?,
        "/report" => client.report()?,
        "/join" => client.join(name)?,
        "/reconnect" => {
            *rejoin_on_connect = true;
            client.reconnect()?
        }
        "/stats" => client.request_stats()?,
        "/clear" => client.clear_messages()?,
        _ => client.send_text(line)?,
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    chips_common::init_tracing_with_default("warn");

    let args = Args::parse();
    let config = load_config(&args)?;

    let (client, mut notifications) = ChatClient::spawn(config, Arc::new(TracingAnalytics))?;
    debug!(peer = %client.local_id(), "client started");
    client.connect()?;
    client.join(&args.name)?;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut rejoin_on_connect = false;
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !dispatch(&client, &args.name, &line, &mut rejoin_on_connect).await? {
                        break;
                    }
                }
                None => break,
            },
            notification = notifications.recv() => match notification {
                Some(n) => {
                    if args.json {
                        println!("{}", serde_json::to_string(&n)?);
                    } else if let Some(text) = render(&n) {
                        println!("{text}");
                    }
                    if needs_rejoin(&n, &mut rejoin_on_connect) {
                        debug!("joining the matchmaking queue again");
                        client.join(&args.name)?;
                    }
                }
                None => {
                    warn!("session loop ended");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await?;
    Ok(())
}
