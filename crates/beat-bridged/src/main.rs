mod bridge;
mod config;
mod daemon_link;
mod discovery;
mod error;
mod finders;
mod presence;
mod virtual_player;

use std::sync::Arc;

use clap::{CommandFactory, Parser};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::bridge::establish_bridge_mode;
use crate::config::Config;
use crate::daemon_link::{DaemonLink, TempoSync};
use crate::discovery::DeviceRegistry;
use crate::finders::Finders;
use crate::presence::PresenceMonitor;
use crate::virtual_player::{PlayerControl, VirtualPlayer};

#[derive(Parser, Debug)]
#[command(
    name = "beat-bridged",
    about = "Pose as a player on the DJ-gear network and bridge its tempo to a sync daemon"
)]
struct Args {
    /// Try to pose as a real player (device #1-4)
    #[arg(short = 'r', long)]
    real_player: bool,

    /// Use a fixed device number (1-127, overrides --real-player)
    #[arg(short = 'd', long, value_name = "num", default_value_t = 0,
          value_parser = clap::value_parser!(u8).range(0..=127))]
    device_number: u8,

    /// Bridge tempo to the external sync daemon
    #[arg(short = 'B', long)]
    bridge: bool,

    /// When bridging, the Ableton Link timeline wins
    #[arg(short = 'a', long)]
    ableton_master: bool,

    /// When bridging, align individual beats only, not whole bars
    #[arg(short = 'b', long)]
    beat_align: bool,

    /// TCP port of the tempo-sync daemon
    #[arg(short = 'c', long, value_name = "port", default_value_t = beat_protocol::DEFAULT_DAEMON_PORT,
          value_parser = clap::value_parser!(u16).range(1..))]
    daemon_port: u16,

    /// How many milliseconds we run behind the real players
    #[arg(short = 'l', long, value_name = "ms", default_value_t = 20,
          value_parser = clap::value_parser!(i32).range(-1000..=1000))]
    latency: i32,

    /// Name to announce on the player network
    #[arg(long, value_name = "name", default_value = "beat-bridge")]
    device_name: String,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            device_number: self.device_number,
            use_standard_player_number: self.real_player,
            bridge_enabled: self.bridge,
            ableton_is_master: self.ableton_master,
            sync_to_bars: !self.beat_align,
            daemon_port: self.daemon_port,
            latency_ms: self.latency,
            device_name: self.device_name,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.into_config();
    if let Err(message) = config.validate() {
        Args::command()
            .error(clap::error::ErrorKind::ArgumentConflict, message)
            .exit();
    }
    let config = Arc::new(config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if config.device_number > 0 {
        info!(
            device = config.device_number,
            "Virtual player will attempt to use a fixed device number"
        );
    } else if config.use_standard_player_number {
        info!("Virtual player will attempt to pose as a standard player, device #1 through #4");
    }

    let registry = Arc::new(DeviceRegistry::new());
    let player = Arc::new(VirtualPlayer::new(Arc::clone(&registry)));
    player.set_device_name(&config.device_name);
    player.set_use_standard_player_number(config.use_standard_player_number);

    let finders = Arc::new(Finders::new());
    let daemon = Arc::new(DaemonLink::new());
    daemon.set_daemon_port(config.daemon_port);
    daemon.set_latency(config.latency_ms);
    daemon.set_sync_to_bars(config.sync_to_bars);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(64);

    // Discovery feeds the presence monitor; the monitor owns startup and
    // shutdown of the virtual player.
    let discovery_handle = {
        let registry = Arc::clone(&registry);
        let local_name = config.device_name.clone();
        tokio::spawn(async move {
            if let Err(e) = discovery::run(registry, events_tx, local_name).await {
                error!("Discovery error: {:#}", e);
            }
        })
    };

    let monitor = PresenceMonitor::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&player) as Arc<dyn PlayerControl>,
        Arc::clone(&finders),
        Arc::clone(&daemon) as Arc<dyn TempoSync>,
    );
    let presence_handle = tokio::spawn(monitor.run(events_rx));

    if config.bridge_enabled {
        // Poll task: services the daemon session and fires disconnection
        // listeners when an established session drops.
        tokio::spawn(Arc::clone(&daemon).run_poll(shutdown_rx.clone()));

        // Self-heal: when the daemon goes away, reconnect on a fresh task
        // and re-establish the bridge if the network is still online.
        {
            let daemon = Arc::clone(&daemon);
            let player = Arc::clone(&player);
            let config = Arc::clone(&config);
            let shutdown_rx = shutdown_rx.clone();
            let reconnect_daemon = Arc::clone(&daemon);
            reconnect_daemon.add_disconnection_listener(move || {
                let daemon = Arc::clone(&daemon);
                let player = Arc::clone(&player);
                let config = Arc::clone(&config);
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    if daemon.connect_with_retry(shutdown_rx).await && player.is_running() {
                        establish_bridge_mode(&config, &*player, &*daemon);
                    }
                });
            });
        }

        // Initial connection, off the main control path: the retry loop
        // blocks indefinitely while the daemon is down.
        {
            let daemon = Arc::clone(&daemon);
            let player = Arc::clone(&player);
            let config = Arc::clone(&config);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if daemon.connect_with_retry(shutdown_rx).await && player.is_running() {
                    establish_bridge_mode(&config, &*player, &*daemon);
                }
            });
        }
    }

    info!("Waiting for devices on the player network...");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let _ = shutdown_tx.send(true);
    player.stop();
    finders.stop_all();
    discovery_handle.abort();
    presence_handle.abort();

    Ok(())
}
