/// The virtual player — our own presence on the player network.
///
/// Owns the full lifecycle of the impersonated device: claiming a device
/// number, announcing presence, optionally broadcasting status as a
/// standard player, and the tempo-master / synced transitions. All state
/// changes go through this controller; everyone else sees snapshots.
///
/// `PlayerControl` is the seam the orchestrator (and its tests) work
/// against; `VirtualPlayer` is the real network-backed implementation.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use beat_protocol::announce::DeviceAnnouncement;
use beat_protocol::status::StatusPacket;
use beat_protocol::{
    ANNOUNCE_INTERVAL_MS, ANNOUNCE_PORT, LAST_STANDARD_PLAYER, MAX_DEVICE_NUMBER, STATUS_PORT,
};

use crate::discovery::DeviceRegistry;
use crate::error::PlayerError;

/// How often a status-sending player repeats its status broadcast.
const STATUS_INTERVAL: Duration = Duration::from_millis(200);

/// Tempo announced before anything has pushed one.
const DEFAULT_TEMPO: f64 = 120.0;

/// Control surface of the local impersonated device.
pub trait PlayerControl: Send + Sync {
    /// Bring the device online, claiming `preferred` if nonzero or an
    /// available number otherwise. Already running is not an error.
    fn start(&self, preferred: u8) -> anyhow::Result<()>;

    /// Take the device offline. Idempotent, never fails.
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Device number claimed by the last successful start (0 if never
    /// started).
    fn device_number(&self) -> u8;

    /// Switch between full player (broadcasting status) and passive
    /// listener.
    fn set_sending_status(&self, send: bool) -> anyhow::Result<()>;

    fn is_sending_status(&self) -> bool;

    /// Claim authority to broadcast tempo to the player network.
    fn become_tempo_master(&self) -> Result<(), PlayerError>;

    /// Push a tempo into the network broadcast. Only the tempo master
    /// may do this.
    fn set_tempo(&self, bpm: f64) -> Result<(), PlayerError>;

    /// Configure whether this device defers its tempo to an external
    /// source.
    fn set_synced(&self, synced: bool) -> Result<(), PlayerError>;

    /// Whether the device holds a standard player number, which grants
    /// status-broadcasting privileges.
    fn is_real_player(&self) -> bool {
        (1..=LAST_STANDARD_PLAYER).contains(&self.device_number())
    }
}

#[derive(Debug, Clone)]
struct PlayerState {
    running: bool,
    device_number: u8,
    sending_status: bool,
    synced: bool,
    master: bool,
    tempo: Option<f64>,
    name: String,
    mac: [u8; 6],
    address: Ipv4Addr,
}

impl PlayerState {
    fn announcement(&self) -> DeviceAnnouncement {
        DeviceAnnouncement {
            device_number: self.device_number,
            name: self.name.clone(),
            mac: self.mac,
            address: self.address,
        }
    }

    fn status(&self) -> StatusPacket {
        StatusPacket::from_bpm(
            self.device_number,
            self.master,
            self.synced,
            self.tempo.unwrap_or(DEFAULT_TEMPO),
        )
    }
}

pub struct VirtualPlayer {
    registry: Arc<DeviceRegistry>,
    use_standard_player_number: AtomicBool,
    state: Arc<Mutex<PlayerState>>,
    announce_task: Mutex<Option<JoinHandle<()>>>,
    status_task: Mutex<Option<JoinHandle<()>>>,
}

impl VirtualPlayer {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            use_standard_player_number: AtomicBool::new(false),
            state: Arc::new(Mutex::new(PlayerState {
                running: false,
                device_number: 0,
                sending_status: false,
                synced: false,
                master: false,
                tempo: None,
                name: "beat-bridge".to_string(),
                mac: local_mac(),
                address: Ipv4Addr::UNSPECIFIED,
            })),
            announce_task: Mutex::new(None),
            status_task: Mutex::new(None),
        }
    }

    /// Name announced on the player network. Takes effect on next start.
    pub fn set_device_name(&self, name: &str) {
        self.state.lock().unwrap().name = name.to_string();
    }

    /// Prefer a standard player number (1-4) when no fixed number is
    /// given to `start`.
    pub fn set_use_standard_player_number(&self, use_standard: bool) {
        self.use_standard_player_number
            .store(use_standard, Ordering::SeqCst);
    }

    fn claim_number(&self, preferred: u8) -> Result<u8, PlayerError> {
        let in_use = self.registry.numbers_in_use();
        if preferred > 0 {
            if in_use.contains(&preferred) {
                return Err(PlayerError::NumberInUse(preferred));
            }
            return Ok(preferred);
        }

        let (first, last) = if self.use_standard_player_number.load(Ordering::SeqCst) {
            (1, LAST_STANDARD_PLAYER)
        } else {
            (LAST_STANDARD_PLAYER + 1, MAX_DEVICE_NUMBER)
        };
        (first..=last)
            .find(|n| !in_use.contains(n))
            .ok_or(PlayerError::NoFreeNumber(first, last))
    }

    fn abort_task(slot: &Mutex<Option<JoinHandle<()>>>) {
        if let Some(handle) = slot.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn create_broadcast_socket() -> std::io::Result<UdpSocket> {
    let s = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    s.set_reuse_address(true)?;
    s.set_broadcast(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    s.bind(&addr.into())?;
    s.set_nonblocking(true)?;
    UdpSocket::from_std(s.into())
}

/// Best-effort detection of the address we announce. Connecting a UDP
/// socket sends nothing; it just resolves the route.
fn local_ipv4() -> Ipv4Addr {
    let probe = || -> std::io::Result<Ipv4Addr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("198.51.100.1:9")?;
        match socket.local_addr()? {
            std::net::SocketAddr::V4(addr) => Ok(*addr.ip()),
            _ => Ok(Ipv4Addr::UNSPECIFIED),
        }
    };
    probe().unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// Locally-administered MAC derived from the process id; the network
/// only needs it to be stable for the lifetime of this virtual device.
fn local_mac() -> [u8; 6] {
    let pid = std::process::id();
    [
        0x02,
        0x42,
        (pid >> 24) as u8,
        (pid >> 16) as u8,
        (pid >> 8) as u8,
        pid as u8,
    ]
}

impl PlayerControl for VirtualPlayer {
    fn start(&self, preferred: u8) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Ok(());
        }

        let number = self.claim_number(preferred)?;
        let socket = create_broadcast_socket()?;

        state.running = true;
        state.device_number = number;
        state.sending_status = false;
        state.synced = false;
        state.master = false;
        state.tempo = None;
        state.address = local_ipv4();

        info!(
            device = number,
            name = %state.name,
            "Virtual player online"
        );

        let shared = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(ANNOUNCE_INTERVAL_MS));
            let dest = SocketAddrV4::new(Ipv4Addr::BROADCAST, ANNOUNCE_PORT);
            let mut buf = [0u8; beat_protocol::announce::KEEPALIVE_SIZE];
            loop {
                interval.tick().await;
                let announcement = {
                    let state = shared.lock().unwrap();
                    if !state.running {
                        return;
                    }
                    state.announcement()
                };
                announcement.serialize(&mut buf);
                if let Err(e) = socket.send_to(&buf, dest).await {
                    debug!("Failed to send presence announcement: {}", e);
                }
            }
        });
        *self.announce_task.lock().unwrap() = Some(handle);

        Ok(())
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return;
            }
            state.running = false;
            state.sending_status = false;
            state.master = false;
            state.synced = false;
            info!(device = state.device_number, "Virtual player offline");
        }
        Self::abort_task(&self.announce_task);
        Self::abort_task(&self.status_task);
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    fn device_number(&self) -> u8 {
        self.state.lock().unwrap().device_number
    }

    fn set_sending_status(&self, send: bool) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return Err(PlayerError::NotRunning.into());
            }
            if state.sending_status == send {
                return Ok(());
            }
            state.sending_status = send;
        }

        if !send {
            Self::abort_task(&self.status_task);
            return Ok(());
        }

        let socket = create_broadcast_socket()?;
        let shared = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATUS_INTERVAL);
            let dest = SocketAddrV4::new(Ipv4Addr::BROADCAST, STATUS_PORT);
            let mut buf = [0u8; StatusPacket::SIZE];
            loop {
                interval.tick().await;
                let status = {
                    let state = shared.lock().unwrap();
                    if !state.running || !state.sending_status {
                        return;
                    }
                    state.status()
                };
                status.serialize(&mut buf);
                if let Err(e) = socket.send_to(&buf, dest).await {
                    debug!("Failed to send status broadcast: {}", e);
                }
            }
        });
        *self.status_task.lock().unwrap() = Some(handle);
        info!("Virtual player now sending status");
        Ok(())
    }

    fn is_sending_status(&self) -> bool {
        self.state.lock().unwrap().sending_status
    }

    fn become_tempo_master(&self) -> Result<(), PlayerError> {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return Err(PlayerError::NotRunning);
        }
        if !state.sending_status {
            return Err(PlayerError::NotSendingStatus);
        }
        if !state.master {
            state.master = true;
            state.synced = false;
            info!(device = state.device_number, "Claimed tempo-master role");
        }
        Ok(())
    }

    fn set_tempo(&self, bpm: f64) -> Result<(), PlayerError> {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return Err(PlayerError::NotRunning);
        }
        if !state.master {
            return Err(PlayerError::NotMaster);
        }
        state.tempo = Some(bpm);
        info!(bpm = bpm, "Broadcasting tempo to the player network");
        Ok(())
    }

    fn set_synced(&self, synced: bool) -> Result<(), PlayerError> {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return Err(PlayerError::NotRunning);
        }
        if state.synced != synced {
            state.synced = synced;
            if synced && state.master {
                warn!("Dropping tempo-master role to follow an external tempo");
                state.master = false;
            }
            info!(synced = synced, "Virtual player sync flag changed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beat_protocol::announce::DeviceAnnouncement;

    fn player() -> VirtualPlayer {
        VirtualPlayer::new(Arc::new(DeviceRegistry::new()))
    }

    fn seen(registry: &DeviceRegistry, number: u8) {
        registry.observe(DeviceAnnouncement {
            device_number: number,
            name: format!("player-{number}"),
            mac: [0; 6],
            address: Ipv4Addr::new(192, 168, 1, number),
        });
    }

    #[test]
    fn stop_when_never_started_is_a_no_op() {
        let player = player();
        player.stop();
        player.stop();
        assert!(!player.is_running());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_converges() {
        let player = player();
        player.start(7).expect("first start");
        player.start(7).expect("second start is a no-op");
        assert!(player.is_running());
        assert_eq!(player.device_number(), 7);

        player.stop();
        player.stop();
        assert!(!player.is_running());
    }

    #[tokio::test]
    async fn claims_first_free_standard_number() {
        let registry = Arc::new(DeviceRegistry::new());
        seen(&registry, 1);
        seen(&registry, 2);

        let player = VirtualPlayer::new(Arc::clone(&registry));
        player.set_use_standard_player_number(true);
        player.start(0).expect("start");

        assert_eq!(player.device_number(), 3);
        assert!(player.is_real_player());
        player.stop();
    }

    #[tokio::test]
    async fn preferred_number_in_use_fails_start() {
        let registry = Arc::new(DeviceRegistry::new());
        seen(&registry, 2);

        let player = VirtualPlayer::new(registry);
        assert!(player.start(2).is_err());
        assert!(!player.is_running());
    }

    #[tokio::test]
    async fn anonymous_numbers_avoid_the_standard_range() {
        let player = player();
        player.start(0).expect("start");
        assert!(player.device_number() > LAST_STANDARD_PLAYER);
        assert!(!player.is_real_player());
        player.stop();
    }

    #[tokio::test]
    async fn master_claim_requires_running_and_status() {
        let player = player();
        assert!(matches!(
            player.become_tempo_master(),
            Err(PlayerError::NotRunning)
        ));

        player.start(1).expect("start");
        assert!(matches!(
            player.become_tempo_master(),
            Err(PlayerError::NotSendingStatus)
        ));

        player.set_sending_status(true).expect("enable status");
        player.become_tempo_master().expect("claim master");
        player.stop();
    }

    #[tokio::test]
    async fn tempo_push_requires_master_role() {
        let player = player();
        player.start(1).expect("start");
        assert!(matches!(player.set_tempo(128.0), Err(PlayerError::NotMaster)));

        player.set_sending_status(true).expect("enable status");
        player.become_tempo_master().expect("claim master");
        player.set_tempo(128.0).expect("push tempo");
        player.stop();
    }

    #[tokio::test]
    async fn syncing_drops_the_master_role() {
        let player = player();
        player.start(1).expect("start");
        player.set_sending_status(true).expect("enable status");
        player.become_tempo_master().expect("claim master");

        player.set_synced(true).expect("sync");
        assert!(matches!(player.set_tempo(140.0), Err(PlayerError::NotMaster)));
        player.stop();
    }
}
