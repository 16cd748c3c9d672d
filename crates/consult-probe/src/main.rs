//! # consult-probe
//!
//! Joins a consultation room as a silent participant and logs what the
//! room-coordination server relays: presence, negotiation payloads and
//! camera toggles. Leaves the room on Ctrl-C.

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use consult_call::signaling::SignalingChannel;
use consult_call::RoomId;

#[derive(Parser, Debug)]
#[command(name = "consult-probe")]
#[command(about = "Join a consultation room and log relayed signaling events")]
struct Args {
    /// Room to join
    #[arg(long, env = "CONSULT_PROBE_ROOM")]
    room: String,

    /// Signaling server URL (overrides configuration)
    #[arg(long)]
    url: Option<String>,

    /// Announce a camera toggle once connected
    #[arg(long, value_enum)]
    video_toggle: Option<Toggle>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = consult_call::config::load().context("loading configuration")?;
    if let Some(url) = args.url {
        config.signaling.url = url;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consult_call=debug,consult_probe=debug".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Consult probe v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(url = %config.signaling.url, room = %args.room, "Connecting");

    let room = RoomId::new(args.room);
    let channel = SignalingChannel::from_config(&config);

    let _subscriptions = [
        channel.on_participant_joined(|| tracing::info!("participant-joined")),
        channel.on_participant_left(|| tracing::info!("participant-left")),
        channel.on_signal(|payload| tracing::info!(signal = %payload.as_value(), "webrtc-signal")),
        channel.on_video_toggle(|enabled| tracing::info!(enabled, "video-toggle")),
        channel.on_reconnect(|| tracing::warn!("Reconnected, room re-joined")),
    ];

    channel.connect();
    channel.join_room(&room);

    if let Some(toggle) = args.video_toggle {
        let mut connected = channel.connection_state();
        connected
            .wait_for(|up| *up)
            .await
            .context("signaling channel closed")?;
        let enabled = matches!(toggle, Toggle::On);
        channel.send_video_toggle(&room, enabled);
        tracing::info!(enabled, "Announced video toggle");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Leaving room");
    channel.leave_room(&room);
    channel.disconnect();

    // Give the transport a moment to flush the leave frame.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}
