/// Presence-driven startup and shutdown.
///
/// The first device to appear on the player network is the signal to
/// bring the virtual player online and start the dependent finders; the
/// last device to leave is the signal to shut the player down. Startup
/// can block or fail slowly, so it runs on its own task, never on the
/// discovery event loop; an atomic in-flight guard keeps two devices
/// arriving back-to-back from racing two startup sequences.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use beat_protocol::announce::DeviceAnnouncement;

use crate::bridge::establish_bridge_mode;
use crate::config::Config;
use crate::daemon_link::TempoSync;
use crate::discovery::{DeviceEvent, DeviceRegistry};
use crate::finders::Finders;
use crate::virtual_player::PlayerControl;

pub struct PresenceMonitor {
    config: Arc<Config>,
    registry: Arc<DeviceRegistry>,
    player: Arc<dyn PlayerControl>,
    finders: Arc<Finders>,
    daemon: Arc<dyn TempoSync>,
    startup_in_flight: AtomicBool,
}

impl PresenceMonitor {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<DeviceRegistry>,
        player: Arc<dyn PlayerControl>,
        finders: Arc<Finders>,
        daemon: Arc<dyn TempoSync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            player,
            finders,
            daemon,
            startup_in_flight: AtomicBool::new(false),
        })
    }

    /// Consume discovery events until the channel closes. Events arrive
    /// strictly one at a time; only the startup work leaves this task.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<DeviceEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                DeviceEvent::Found(announcement) => self.on_device_found(&announcement),
                DeviceEvent::Lost(announcement) => self.on_device_lost(&announcement),
            }
        }
    }

    fn on_device_found(self: &Arc<Self>, announcement: &DeviceAnnouncement) {
        info!(device = %announcement, "Player network device found");
        if self.player.is_running() {
            return;
        }
        // Test-and-set: a second arrival while a startup is in flight
        // must not spawn a second sequence.
        if self.startup_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = monitor.run_startup() {
                error!("Problem bringing the virtual player online: {:#}", e);
            }
            monitor.startup_in_flight.store(false, Ordering::SeqCst);
        });
    }

    /// The full startup sequence. Runs on its own task; every failure is
    /// logged here and never reaches the discovery loop.
    fn run_startup(&self) -> anyhow::Result<()> {
        match self.player.start(self.config.device_number) {
            Ok(()) => {}
            Err(e) => {
                // Not fatal: the next device arrival retries.
                warn!("Virtual player failed to start: {:#}", e);
                return Ok(());
            }
        }

        info!(
            player = self.player.device_number(),
            "Virtual player running, starting finders"
        );
        self.finders.start_all();

        // Start out conservatively; a standard player identity unlocks
        // active metadata queries and status sending.
        self.finders.metadata.set_passive(true);
        if self.player.is_real_player() {
            match self.player.set_sending_status(true) {
                Ok(()) => self.finders.metadata.set_passive(false),
                Err(e) => warn!("Could not enable status sending: {:#}", e),
            }
        }

        establish_bridge_mode(&self.config, &*self.player, &*self.daemon);

        // The last device may have left while we were starting; converge
        // to offline rather than lingering on an empty network.
        if self.registry.is_empty() && self.player.is_running() {
            info!("Network emptied during startup, shutting the virtual player down");
            self.player.stop();
        }
        Ok(())
    }

    fn on_device_lost(&self, announcement: &DeviceAnnouncement) {
        info!(
            device = %announcement,
            remaining = self.registry.len(),
            "Player network device lost"
        );
        if self.registry.is_empty() {
            info!("Last device left, shutting down the virtual player");
            self.player.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::daemon_link::DaemonState;
    use crate::error::{DaemonError, PlayerError};
    use beat_protocol::daemon::SyncMode;

    /// Player fake whose start takes long enough for events to race it.
    #[derive(Default)]
    struct SlowPlayer {
        running: Mutex<bool>,
        start_calls: AtomicUsize,
        stop_calls: AtomicUsize,
        start_delay: Duration,
    }

    impl PlayerControl for SlowPlayer {
        fn start(&self, _preferred: u8) -> anyhow::Result<()> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.start_delay);
            *self.running.lock().unwrap() = true;
            Ok(())
        }
        fn stop(&self) {
            let mut running = self.running.lock().unwrap();
            if *running {
                self.stop_calls.fetch_add(1, Ordering::SeqCst);
                *running = false;
            }
        }
        fn is_running(&self) -> bool {
            *self.running.lock().unwrap()
        }
        fn device_number(&self) -> u8 {
            5
        }
        fn set_sending_status(&self, _send: bool) -> anyhow::Result<()> {
            Ok(())
        }
        fn is_sending_status(&self) -> bool {
            false
        }
        fn become_tempo_master(&self) -> Result<(), PlayerError> {
            Err(PlayerError::NotSendingStatus)
        }
        fn set_tempo(&self, _bpm: f64) -> Result<(), PlayerError> {
            Ok(())
        }
        fn set_synced(&self, _synced: bool) -> Result<(), PlayerError> {
            Ok(())
        }
    }

    struct OfflineDaemon;

    impl TempoSync for OfflineDaemon {
        fn state(&self) -> DaemonState {
            DaemonState {
                port: 17000,
                latency_ms: 20,
                sync_to_bars: true,
                sync_mode: SyncMode::Off,
                link_tempo: None,
                connected: false,
            }
        }
        fn set_sync_mode(&self, _mode: SyncMode) -> Result<(), DaemonError> {
            Err(DaemonError::NotConnected)
        }
    }

    fn config() -> Arc<Config> {
        Arc::new(Config {
            device_number: 0,
            use_standard_player_number: false,
            bridge_enabled: false,
            ableton_is_master: false,
            sync_to_bars: true,
            daemon_port: 17000,
            latency_ms: 20,
            device_name: "beat-bridge".to_string(),
        })
    }

    fn announcement(number: u8) -> DeviceAnnouncement {
        DeviceAnnouncement {
            device_number: number,
            name: format!("player-{number}"),
            mac: [0; 6],
            address: Ipv4Addr::new(192, 168, 1, number),
        }
    }

    fn monitor(
        player: Arc<SlowPlayer>,
        registry: Arc<DeviceRegistry>,
    ) -> Arc<PresenceMonitor> {
        PresenceMonitor::new(
            config(),
            registry,
            player,
            Arc::new(Finders::new()),
            Arc::new(OfflineDaemon),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rapid_arrivals_trigger_exactly_one_startup() {
        let player = Arc::new(SlowPlayer {
            start_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let registry = Arc::new(DeviceRegistry::new());
        registry.observe(announcement(1));
        registry.observe(announcement(2));

        let monitor = monitor(Arc::clone(&player), registry);
        monitor.on_device_found(&announcement(1));
        monitor.on_device_found(&announcement(2));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(player.start_calls.load(Ordering::SeqCst), 1);
        assert!(player.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn arrivals_after_startup_do_not_restart() {
        let player = Arc::new(SlowPlayer::default());
        let registry = Arc::new(DeviceRegistry::new());
        registry.observe(announcement(1));

        let monitor = monitor(Arc::clone(&player), Arc::clone(&registry));
        monitor.on_device_found(&announcement(1));
        tokio::time::sleep(Duration::from_millis(100)).await;

        registry.observe(announcement(2));
        monitor.on_device_found(&announcement(2));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(player.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn only_the_last_departure_stops_the_player() {
        let player = Arc::new(SlowPlayer::default());
        let registry = Arc::new(DeviceRegistry::new());
        for n in 1..=3 {
            registry.observe(announcement(n));
        }

        let monitor = monitor(Arc::clone(&player), Arc::clone(&registry));
        monitor.on_device_found(&announcement(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(player.is_running());

        for n in 1..=2 {
            registry.remove(n);
            monitor.on_device_lost(&announcement(n));
        }
        assert!(player.is_running());
        assert_eq!(player.stop_calls.load(Ordering::SeqCst), 0);

        registry.remove(3);
        monitor.on_device_lost(&announcement(3));
        assert!(!player.is_running());
        assert_eq!(player.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn startup_losing_the_race_converges_to_stopped() {
        let player = Arc::new(SlowPlayer {
            start_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let registry = Arc::new(DeviceRegistry::new());
        registry.observe(announcement(1));

        let monitor = monitor(Arc::clone(&player), Arc::clone(&registry));
        monitor.on_device_found(&announcement(1));

        // The device disappears while the start is still in flight.
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.remove(1);
        monitor.on_device_lost(&announcement(1));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!player.is_running());
    }
}
