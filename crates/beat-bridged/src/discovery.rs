/// Device discovery on the player network.
///
/// Listens for presence keepalives on the announce port, tracks which
/// devices are currently on the network, and reports arrivals and
/// departures over an mpsc channel. A device that has not announced for
/// 10 seconds is considered lost.
///
/// Events are emitted from a single task, so consumers see them strictly
/// one at a time, in order.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use beat_protocol::announce::{DeviceAnnouncement, KEEPALIVE_SIZE};
use beat_protocol::{ANNOUNCE_PORT, DEVICE_MAX_AGE_MS};

/// Arrival or departure of a device on the player network.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Found(DeviceAnnouncement),
    Lost(DeviceAnnouncement),
}

struct TrackedDevice {
    announcement: DeviceAnnouncement,
    last_seen: Instant,
}

/// The set of devices currently known on the player network.
///
/// Shared between the discovery task (which writes) and anyone needing a
/// presence snapshot: the presence monitor's last-device check and the
/// virtual player's device-number claim.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<u8, TrackedDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no devices are currently known.
    pub fn is_empty(&self) -> bool {
        self.devices.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    /// Device numbers currently claimed on the network.
    pub fn numbers_in_use(&self) -> Vec<u8> {
        self.devices.lock().unwrap().keys().copied().collect()
    }

    /// Record an announcement. Returns `true` if this device was not
    /// previously known.
    pub fn observe(&self, announcement: DeviceAnnouncement) -> bool {
        let mut devices = self.devices.lock().unwrap();
        let number = announcement.device_number;
        let is_new = !devices.contains_key(&number);
        devices.insert(
            number,
            TrackedDevice {
                announcement,
                last_seen: Instant::now(),
            },
        );
        is_new
    }

    /// Drop the given device, returning its last announcement if it was
    /// known.
    pub fn remove(&self, device_number: u8) -> Option<DeviceAnnouncement> {
        self.devices
            .lock()
            .unwrap()
            .remove(&device_number)
            .map(|d| d.announcement)
    }

    /// Remove and return every device whose last announcement is older
    /// than `max_age`.
    fn sweep_expired(&self, max_age: Duration) -> Vec<DeviceAnnouncement> {
        let mut devices = self.devices.lock().unwrap();
        let expired: Vec<u8> = devices
            .iter()
            .filter(|(_, d)| d.last_seen.elapsed() > max_age)
            .map(|(&n, _)| n)
            .collect();
        expired
            .into_iter()
            .filter_map(|n| devices.remove(&n).map(|d| d.announcement))
            .collect()
    }
}

fn create_announce_socket() -> std::io::Result<UdpSocket> {
    let s = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    s.set_reuse_address(true)?;

    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    s.set_reuse_port(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, ANNOUNCE_PORT);
    s.bind(&addr.into())?;
    s.set_nonblocking(true)?;
    UdpSocket::from_std(s.into())
}

/// Listen for keepalives and drive the registry. Our own announcements
/// come back to us over broadcast and are filtered out by name.
pub async fn run(
    registry: Arc<DeviceRegistry>,
    events: mpsc::Sender<DeviceEvent>,
    local_name: String,
) -> anyhow::Result<()> {
    let socket = create_announce_socket()?;
    info!(port = ANNOUNCE_PORT, "Listening for player announcements");

    let mut buf = [0u8; KEEPALIVE_SIZE + 16];
    let max_age = Duration::from_millis(DEVICE_MAX_AGE_MS);
    let mut sweep_interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let Some(announcement) = DeviceAnnouncement::deserialize(&buf[..len]) else {
                            debug!(from = %src, len = len, "Ignoring non-keepalive announce traffic");
                            continue;
                        };
                        if announcement.name == local_name {
                            continue;
                        }
                        if registry.observe(announcement.clone()) {
                            info!(device = %announcement, "Device found");
                            if events.send(DeviceEvent::Found(announcement)).await.is_err() {
                                return Ok(()); // consumer gone, we are shutting down
                            }
                        }
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::WouldBlock {
                            error!("Announce receive error: {}", e);
                        }
                    }
                }
            }
            _ = sweep_interval.tick() => {
                for announcement in registry.sweep_expired(max_age) {
                    info!(device = %announcement, "Device lost");
                    if events.send(DeviceEvent::Lost(announcement)).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(number: u8) -> DeviceAnnouncement {
        DeviceAnnouncement {
            device_number: number,
            name: format!("player-{number}"),
            mac: [0, 0, 0, 0, 0, number],
            address: Ipv4Addr::new(192, 168, 1, number),
        }
    }

    #[test]
    fn observe_reports_new_devices_once() {
        let registry = DeviceRegistry::new();
        assert!(registry.observe(announcement(2)));
        assert!(!registry.observe(announcement(2)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn numbers_in_use_tracks_known_devices() {
        let registry = DeviceRegistry::new();
        registry.observe(announcement(1));
        registry.observe(announcement(3));

        let mut numbers = registry.numbers_in_use();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[test]
    fn sweep_removes_only_stale_devices() {
        let registry = DeviceRegistry::new();
        registry.observe(announcement(1));

        // Nothing is older than an hour yet.
        assert!(registry.sweep_expired(Duration::from_secs(3600)).is_empty());

        // Everything is older than zero.
        let expired = registry.sweep_expired(Duration::ZERO);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].device_number, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_returns_last_announcement() {
        let registry = DeviceRegistry::new();
        registry.observe(announcement(4));

        let removed = registry.remove(4).expect("device was known");
        assert_eq!(removed.name, "player-4");
        assert!(registry.remove(4).is_none());
    }
}
