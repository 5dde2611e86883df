//! Headless mesh participant
//!
//! Joins a room with synthetic media and logs what happens in it. Useful for
//! filling a room with test participants.
//!
//! # Usage
//!
//! ```bash
//! # Join with a pre-issued token
//! cargo run --bin mesh_client -- --room standup --token a1 --mic --camera
//!
//! # Provision the room first
//! cargo run --bin mesh_client -- \
//!   --room standup \
//!   --provision-url http://localhost:8080/rooms \
//!   --display-name bot-1
//!
//! # Custom signaling and STUN servers
//! cargo run --bin mesh_client -- \
//!   --signaling-url wss://meet.example.com/ws \
//!   --stun-servers stun:stun.l.google.com:19302,stun:stun1.l.google.com:19302 \
//!   --room standup --token a1
//! ```

use clap::Parser;
use mesh_session::{
    fetch_room_grant, MediaKind, MeetingState, MeshConfig, MeshSession, RoomGrant, SessionEvent,
    SyntheticCapture, WebRtcTransport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mesh session client
///
/// Joins a mesh room over WebSocket signaling and WebRTC peer connections.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket signaling URL
    #[arg(
        long,
        default_value = "ws://localhost:8080/ws",
        env = "MESH_SIGNALING_URL"
    )]
    signaling_url: String,

    /// Room to join
    #[arg(long, env = "MESH_ROOM")]
    room: String,

    /// Access token (required unless --provision-url is given)
    #[arg(long, env = "MESH_TOKEN")]
    token: Option<String>,

    /// Provisioning endpoint that issues room grants
    #[arg(long, env = "MESH_PROVISION_URL")]
    provision_url: Option<String>,

    /// Display name sent when provisioning
    #[arg(long, default_value = "mesh-client")]
    display_name: String,

    /// Fallback STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    stun_servers: Vec<String>,

    /// Send a synthetic microphone track
    #[arg(long)]
    mic: bool,

    /// Send a synthetic camera track
    #[arg(long)]
    camera: bool,

    /// Send a synthetic screen track
    #[arg(long)]
    screen: bool,

    /// Log as JSON lines
    #[arg(long, env = "MESH_LOG_JSON")]
    log_json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(1);
        }
        eprintln!("Ctrl+C received, leaving room...");
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("mesh-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.log_json)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        signaling_url = %args.signaling_url,
        room = %args.room,
        "Mesh client starting"
    );

    let config = MeshConfig {
        signaling_url: args.signaling_url.clone(),
        fallback_stun_servers: args.stun_servers.clone(),
        ..Default::default()
    };

    let grant = match &args.provision_url {
        Some(endpoint) => {
            let client = reqwest::Client::new();
            let body = serde_json::json!({
                "roomId": args.room,
                "displayName": args.display_name,
            });
            fetch_room_grant(&client, endpoint, Some(body)).await?
        }
        None => {
            let token = args
                .token
                .clone()
                .ok_or("--token is required when --provision-url is not given")?;
            RoomGrant::new(args.room.clone(), token)
        }
    };

    let session = MeshSession::new(
        config,
        Arc::new(WebRtcTransport::new()),
        Arc::new(SyntheticCapture::new()),
    )?;

    for (kind, wanted) in [
        (MediaKind::Mic, args.mic),
        (MediaKind::Camera, args.camera),
        (MediaKind::Screen, args.screen),
    ] {
        if wanted && !session.set_media_enabled(kind, true).await {
            warn!("Could not enable {}", kind);
        }
    }

    let mut events = session.subscribe();
    session.connect(grant).await?;

    while !shutdown_flag.load(Ordering::SeqCst) {
        let event = match tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!("Skipped {} session events", skipped);
                continue;
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => continue,
        };

        log_event(&session, &event);
        match event {
            SessionEvent::StateChanged(MeetingState::Idle) => {
                let snapshot = session.snapshot().await;
                info!(reason = ?snapshot.last_error, "Session ended");
                return Ok(());
            }
            SessionEvent::StateChanged(MeetingState::Error) => break,
            _ => {}
        }
    }

    session.leave().await;
    info!("Left room");
    Ok(())
}

fn log_event(session: &MeshSession, event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged(state) => info!(state = %state, "Meeting state changed"),
        SessionEvent::ParticipantJoined(id) => info!(peer_id = %id, "Participant joined"),
        SessionEvent::ParticipantLeft(id) => info!(peer_id = %id, "Participant left"),
        SessionEvent::ParticipantUpdated(id) => {
            if let Some(p) = session.participant(id) {
                info!(
                    peer_id = %p.id,
                    link = %p.state,
                    speaking = p.speaking,
                    camera = p.streams.camera.is_some(),
                    screen = p.streams.screen.is_some(),
                    showing = ?p.preferred_stream().map(|s| s.track_ids().join(",")),
                    "Participant updated"
                );
            }
        }
        SessionEvent::LocalMediaChanged(flags) => info!(
            mic = flags.mic,
            camera = flags.camera,
            screen = flags.screen,
            "Local media changed"
        ),
        SessionEvent::LocalSpeaking(speaking) => info!(speaking, "Local speaking"),
    }
}

fn init_tracing(json: bool) -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG wins over the default level
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init()?;

    Ok(())
}
