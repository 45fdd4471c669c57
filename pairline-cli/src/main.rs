use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use pairline_sync::media::{SourceKind, SyntheticBackend, SyntheticSfu};
use pairline_sync::store::{HttpSessionApi, MemoryStore, SessionRow, SessionStatus};
use pairline_sync::{
    open, JoinRequest, Language, LocalHub, RelayConfig, RelayServer, SessionEvent, SessionHandle, SessionServices,
    SyncConfig, WsConnector,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pairline", about = "Live coding session sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket relay.
    Relay {
        #[arg(long, default_value = "127.0.0.1:9090")]
        bind: String,
    },
    /// Join a session through a relay and drive it from stdin.
    Join {
        session: Uuid,
        #[arg(long)]
        name: Option<String>,
        /// Overrides `channel_url` from the config.
        #[arg(long)]
        url: Option<String>,
        /// TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Two in-process participants; stdin drives the first.
    Demo,
}

const HELP: &str = "commands: /lang <name>, /chat <text>, /call, /hangup, /mute mic|camera, /screen on|off, /retry, /quit; any other line replaces the document";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Relay { bind } => {
            let server = RelayServer::new(RelayConfig {
                bind_addr: bind,
                ..RelayConfig::default()
            });
            server.run().await.map_err(|e| anyhow::anyhow!(e)).context("relay stopped")
        }
        Command::Join {
            session,
            name,
            url,
            config,
        } => {
            let mut config = match config {
                Some(path) => SyncConfig::load(&path).with_context(|| format!("loading {}", path.display()))?,
                None => SyncConfig::from_env(),
            };
            if let Some(url) = url {
                config.channel_url = url;
            }
            let services = remote_services(&config, session)?;
            let handle = open(
                &config,
                services,
                JoinRequest {
                    session_id: session,
                    participant_id: Uuid::new_v4(),
                    display_name: name,
                },
            )
            .await;
            drive(handle).await
        }
        Command::Demo => demo().await,
    }
}

fn remote_services(config: &SyncConfig, session: Uuid) -> Result<SessionServices> {
    let connector = Arc::new(WsConnector::new(config.channel_url.clone()));
    // No SFU client is bundled; calls run against an in-process one.
    let media = Arc::new(SyntheticBackend::new(SyntheticSfu::new()));

    match &config.api_url {
        Some(api_url) => {
            let api = Arc::new(HttpSessionApi::new(api_url.clone(), config.grant_url.clone())?);
            Ok(SessionServices {
                connector,
                store: api.clone(),
                grants: api.clone(),
                profiles: api,
                media,
            })
        }
        None => {
            info!("No session API configured; document will not outlive the process");
            let store = Arc::new(MemoryStore::new());
            store.insert_session(live_session(session));
            Ok(SessionServices {
                connector,
                store: store.clone(),
                grants: store.clone(),
                profiles: store,
                media,
            })
        }
    }
}

fn live_session(id: Uuid) -> SessionRow {
    SessionRow {
        id,
        host_id: Uuid::nil(),
        status: SessionStatus::Live,
        scheduled_start: None,
        duration_minutes: 60,
    }
}

async fn demo() -> Result<()> {
    let hub = LocalHub::new();
    let store = Arc::new(MemoryStore::new());
    let sfu = SyntheticSfu::new();
    let session_id = Uuid::new_v4();
    store.insert_session(live_session(session_id));
    let config = SyncConfig::default();

    let mut peer = open(
        &config,
        SessionServices::local(&hub, store.clone(), &sfu),
        JoinRequest {
            session_id,
            participant_id: Uuid::new_v4(),
            display_name: Some("peer".into()),
        },
    )
    .await;
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let peer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                event = peer.next_event() => match event {
                    Some(SessionEvent::DocumentReplaced(doc)) => {
                        println!("[peer] document ({}):\n{}", doc.language, doc.text);
                    }
                    Some(SessionEvent::Chat(message)) => println!("[peer] chat: {}", message.text),
                    Some(_) => {}
                    None => break,
                },
            }
        }
        peer
    });

    let handle = open(
        &config,
        SessionServices::local(&hub, store, &sfu),
        JoinRequest {
            session_id,
            participant_id: Uuid::new_v4(),
            display_name: Some("you".into()),
        },
    )
    .await;
    let result = drive(handle).await;
    let _ = stop_tx.send(());
    if let Ok(peer) = peer_task.await {
        peer.leave().await?;
    }
    result
}

/// Read commands from stdin and print session events until `/quit` or EOF.
async fn drive(mut handle: SessionHandle) -> Result<()> {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                match parse_line(&line) {
                    Input::Quit => break,
                    Input::Edit(text) => handle.edit(text)?,
                    Input::Language(name) => match name.parse::<Language>() {
                        Ok(language) => handle.change_language(language)?,
                        Err(e) => eprintln!("{e}"),
                    },
                    Input::Chat(text) => handle.send_chat(text)?,
                    Input::Call => handle.join_call()?,
                    Input::Hangup => handle.leave_call()?,
                    Input::Mute(kind) => handle.toggle_mute(kind)?,
                    Input::Screen(on) => handle.share_screen(on)?,
                    Input::Retry => handle.retry_connection()?,
                    Input::Invalid(message) => eprintln!("{message}\n{HELP}"),
                }
            }
            event = handle.next_event() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
        }
    }

    handle.leave().await?;
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Input {
    Quit,
    Edit(String),
    Language(String),
    Chat(String),
    Call,
    Hangup,
    Mute(SourceKind),
    Screen(bool),
    Retry,
    Invalid(String),
}

fn parse_line(line: &str) -> Input {
    let Some(command) = line.strip_prefix('/') else {
        // Lines are joined with literal "\n" escapes so multi-line code fits on one line.
        return Input::Edit(line.replace("\\n", "\n"));
    };
    let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
    let arg = arg.trim();
    match (name, arg) {
        ("quit", _) => Input::Quit,
        ("lang", lang) if !lang.is_empty() => Input::Language(lang.to_string()),
        ("chat", text) if !text.is_empty() => Input::Chat(text.to_string()),
        ("call", _) => Input::Call,
        ("hangup", _) => Input::Hangup,
        ("mute", "mic" | "") => Input::Mute(SourceKind::Microphone),
        ("mute", "camera") => Input::Mute(SourceKind::Camera),
        ("screen", "on") => Input::Screen(true),
        ("screen", "off") => Input::Screen(false),
        ("retry", _) => Input::Retry,
        _ => Input::Invalid(format!("unknown command: /{command}")),
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Connection(state) => println!("connection: {state:?}"),
        SessionEvent::Roster { participants, .. } => {
            let names: Vec<String> = participants.iter().map(|p| p.display_name()).collect();
            println!("participants: {}", names.join(", "));
        }
        SessionEvent::DocumentReplaced(doc) => println!("document ({}):\n{}", doc.language, doc.text),
        SessionEvent::TypingChanged(ids) if !ids.is_empty() => println!("{} typing", ids.len()),
        SessionEvent::TypingChanged(_) | SessionEvent::CursorMoved { .. } => {}
        SessionEvent::Chat(message) => println!("<{}> {}", message.sender_id, message.text),
        SessionEvent::CallState(state) => println!("call: {state:?}"),
        SessionEvent::Tiles(tiles) => {
            for tile in tiles {
                println!(
                    "tile {:?} {}{} audio_muted={} video_muted={}",
                    tile.kind,
                    tile.participant,
                    if tile.local { " (you)" } else { "" },
                    tile.audio_muted,
                    tile.video_muted
                );
            }
        }
        SessionEvent::Speaking(speaking) => log::debug!("speaking: {speaking}"),
        SessionEvent::Error { class, message } => eprintln!("{class} error: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_line("/quit"), Input::Quit);
        assert_eq!(parse_line("/lang go"), Input::Language("go".into()));
        assert_eq!(parse_line("/chat hi there"), Input::Chat("hi there".into()));
        assert_eq!(parse_line("/mute"), Input::Mute(SourceKind::Microphone));
        assert_eq!(parse_line("/mute camera"), Input::Mute(SourceKind::Camera));
        assert_eq!(parse_line("/screen on"), Input::Screen(true));
        assert!(matches!(parse_line("/chat"), Input::Invalid(_)));
        assert!(matches!(parse_line("/bogus"), Input::Invalid(_)));
    }

    #[test]
    fn test_plain_line_is_edit() {
        assert_eq!(parse_line("fn main() {}\\n"), Input::Edit("fn main() {}\n".into()));
    }
}
