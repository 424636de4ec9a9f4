use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use duet::config::ConfigStore;
use duet::events::{CallEvent, EventBus};
use duet::rtc::{MuteState, RelayMessage, RtcTransportFactory, SignalingTransport, WsRelayClient};
use duet::session::SessionRegistry;

/// Interval of the stale session sweep
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// duet command line arguments
#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(version, about = "Low-latency peer-to-peer audio calls over WebRTC", long_about = None)]
struct CliArgs {
    /// Signaling relay WebSocket URL (overrides config)
    #[arg(short = 'r', long, value_name = "URL")]
    relay: Option<String>,

    /// Display name announced to the room (overrides config)
    #[arg(short = 'n', long, value_name = "NAME")]
    name: Option<String>,

    /// Join muted
    #[arg(long)]
    muted: bool,

    /// Data directory path (default: $HOME/.config/duet)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting duet v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let config_store = ConfigStore::new(&data_dir.join("duet.json")).await?;

    // CLI overrides are persisted so the next start picks them up
    if args.relay.is_some() || args.name.is_some() || args.muted {
        config_store
            .update(|config| {
                if let Some(relay) = args.relay {
                    config.signaling.relay_url = relay;
                }
                if let Some(name) = args.name {
                    config.signaling.display_name = name;
                }
                if args.muted {
                    config.signaling.start_muted = true;
                }
            })
            .await?;
    }
    let config = config_store.get();

    let events = Arc::new(EventBus::new());
    let (relay, mut inbound) = WsRelayClient::connect(&config.signaling.relay_url).await?;
    let relay = Arc::new(relay);

    let registry = Arc::new(SessionRegistry::new(
        config_store.clone(),
        Arc::new(RtcTransportFactory::new(config_store.clone())),
        relay.clone(),
        events.clone(),
    ));

    let initial_mute_state = if config.signaling.start_muted {
        MuteState::Muted
    } else {
        MuteState::Unmuted
    };
    relay
        .send(RelayMessage::Join {
            display_name: config.signaling.display_name.clone(),
            initial_mute_state,
        })
        .await?;
    tracing::info!(
        "Joined relay {} as '{}'",
        relay.url(),
        config.signaling.display_name
    );

    let log_task = tokio::spawn(log_events(events.subscribe()));

    let mut cleanup_timer = tokio::time::interval(CLEANUP_INTERVAL);
    cleanup_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            message = inbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = registry.handle_relay_message(message).await {
                        tracing::warn!("Relay message not handled: {}", e);
                    }
                }
                None => {
                    tracing::error!("Signaling relay connection lost");
                    break;
                }
            },
            _ = cleanup_timer.tick() => {
                let removed = registry.cleanup_stale_sessions().await;
                if removed > 0 {
                    tracing::info!("Removed {} stale session(s)", removed);
                }
            }
        }
    }

    registry.close_all().await;
    relay.shutdown();
    log_task.abort();
    tracing::info!("duet stopped");
    Ok(())
}

/// Log sink for call events
async fn log_events(mut rx: broadcast::Receiver<CallEvent>) {
    loop {
        match rx.recv().await {
            Ok(CallEvent::StatsUpdated { participant_id, snapshot }) => {
                tracing::debug!(
                    "Stats {}: lost={:?} jitter={:?}ms rx={:?}kbps",
                    participant_id,
                    snapshot.inbound.packets_lost,
                    snapshot.inbound.jitter_ms,
                    snapshot.inbound.payload_kbps
                );
            }
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!("{}", json),
                Err(e) => tracing::warn!("Unserializable event {}: {}", event.event_name(), e),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Event log lagged {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "duet=error,webrtc=error",
        LogLevel::Warn => "duet=warn,webrtc=warn",
        LogLevel::Info => "duet=info,webrtc=warn",
        LogLevel::Verbose => "duet=debug,webrtc=warn",
        LogLevel::Debug => "duet=debug,webrtc=info",
        LogLevel::Trace => "duet=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("DUET_DATA_DIR") {
        return PathBuf::from(path);
    }

    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".config").join("duet"),
        Err(_) => PathBuf::from(".duet"),
    }
}
