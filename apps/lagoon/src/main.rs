use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use lagoon::config::Config;
use lagoon::engine::PeerConnectionFactory;
use lagoon::media::mock::MockMediaDevices;
use lagoon::session::{CallController, CallError, CallHandle, CallSnapshot, SessionConfig};
use lagoon::signaling::websocket::WebSocketRelay;
use lagoon::telemetry::logging::{self, LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "lagoon", about = "Two-party audio/video room client")]
struct Cli {
    #[arg(long, env = "LAGOON_ROOM", help = "Room to join")]
    room: String,

    #[arg(long, env = "LAGOON_USER", help = "User id announced to the room")]
    user: Option<String>,

    #[arg(long, help = "Display name")]
    username: Option<String>,

    #[arg(long, help = "Relay URL (overrides LAGOON_RELAY_URL)")]
    relay: Option<String>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialize logging")?;

    let mut config = Config::from_env();
    if let Some(relay) = cli.relay.clone() {
        config = config.with_relay_url(relay);
    }
    let user_id = cli
        .user
        .clone()
        .unwrap_or_else(|| format!("user-{}", Uuid::new_v4().simple()));

    let (relay, relay_events) = WebSocketRelay::connect(&config.relay_url)
        .await
        .with_context(|| format!("failed to connect to relay at {}", config.relay_url))?;
    let session = SessionConfig::new(cli.room.clone(), user_id.clone())
        .with_ice_servers(config.ice_servers.clone());
    let (handle, controller) = CallController::spawn(
        session,
        build_engine()?,
        Arc::new(MockMediaDevices::new()),
        relay,
        relay_events,
    );

    let name = cli.username.as_deref().unwrap_or(&user_id);
    println!("{name} joined room {}", cli.room);
    println!("commands: video, voice, mute, camera, hangup, status, quit");

    let mut state = handle.state();
    let printer = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let snapshot = state.borrow_and_update().clone();
            println!("{}", describe(&snapshot));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_command(&handle, line.trim()) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                eprintln!("{err}");
                break;
            }
        }
    }

    let _ = handle.shutdown();
    controller.await.context("call controller panicked")?;
    printer.abort();
    Ok(())
}

/// Returns `Ok(false)` when the user asked to leave.
fn run_command(handle: &CallHandle, command: &str) -> Result<bool, CallError> {
    match command {
        "video" => handle.start_video_call()?,
        "voice" => handle.start_voice_call()?,
        "mute" => handle.toggle_mute()?,
        "camera" => handle.toggle_video()?,
        "hangup" => handle.hangup()?,
        "status" => println!("{}", describe(&handle.snapshot())),
        "quit" | "exit" => return Ok(false),
        "" => {}
        other => eprintln!("unknown command: {other}"),
    }
    Ok(true)
}

fn describe(snapshot: &CallSnapshot) -> String {
    let kind = snapshot
        .call_kind
        .map(|kind| kind.to_string())
        .unwrap_or_else(|| "-".to_string());
    let remote = snapshot
        .remote
        .as_ref()
        .map(|remote| format!("{}@{}", remote.user_id, remote.address))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "state={:?} kind={kind} muted={} camera={} quality={:?} remote={remote} remote_media={} remote_muted={}",
        snapshot.state,
        snapshot.is_muted,
        snapshot.is_video_enabled,
        snapshot.quality,
        snapshot.has_remote_media,
        snapshot.remote_muted,
    );
    if let Some(error) = &snapshot.last_error {
        line.push_str(" error=");
        line.push_str(error);
    }
    line
}

#[cfg(feature = "webrtc-engine")]
fn build_engine() -> Result<Arc<dyn PeerConnectionFactory>> {
    let engine =
        lagoon::engine::webrtc::WebRtcEngine::new().context("failed to build webrtc engine")?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "webrtc-engine"))]
fn build_engine() -> Result<Arc<dyn PeerConnectionFactory>> {
    Ok(Arc::new(lagoon::engine::mock::MockEngine::new()))
}
