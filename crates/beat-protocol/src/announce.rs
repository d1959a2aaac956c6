/// Presence announcements on the player network.
///
/// Every device repeats a small keepalive datagram on the announce port
/// (port 50000) roughly every 1.5 seconds. Seeing one means the device is
/// there; not seeing one for 10 seconds means it is gone. This is the only
/// announce-port packet BeatBridge reads or writes — the rest of the
/// player-network protocol is out of scope.
///
/// Layout (54 bytes, big-endian):
///   [0..10]  magic
///   [10]     packet type (0x06 = keepalive)
///   [11]     reserved
///   [12..32] device name, UTF-8, zero-padded
///   [32..34] fixed 0x01 0x02
///   [34..36] packet length (0x0036)
///   [36]     device number
///   [37]     device kind (0x01 = player)
///   [38..44] MAC address
///   [44..48] IPv4 address
///   [48..54] fixed tail

use std::net::Ipv4Addr;

/// Magic bytes opening every announce-port datagram.
pub const MAGIC: [u8; 10] = [0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c];

/// Packet type byte identifying a presence keepalive.
pub const KEEPALIVE_TYPE: u8 = 0x06;

/// Total size of a keepalive datagram.
pub const KEEPALIVE_SIZE: usize = 54;

/// Maximum length of a device name on the wire.
pub const DEVICE_NAME_LEN: usize = 20;

const FIXED_TAIL: [u8; 6] = [0x01, 0x00, 0x00, 0x00, 0x01, 0x00];

/// Identity of a device observed on (or announced to) the player network.
/// Instances are created per received datagram and discarded after the
/// presence handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAnnouncement {
    pub device_number: u8,
    pub name: String,
    pub mac: [u8; 6],
    pub address: Ipv4Addr,
}

impl DeviceAnnouncement {
    pub fn serialize(&self, buf: &mut [u8; KEEPALIVE_SIZE]) {
        buf.fill(0);
        buf[0..10].copy_from_slice(&MAGIC);
        buf[10] = KEEPALIVE_TYPE;

        let name_bytes = self.name.as_bytes();
        let len = name_bytes.len().min(DEVICE_NAME_LEN);
        buf[12..12 + len].copy_from_slice(&name_bytes[..len]);

        buf[32] = 0x01;
        buf[33] = 0x02;
        buf[34..36].copy_from_slice(&(KEEPALIVE_SIZE as u16).to_be_bytes());
        buf[36] = self.device_number;
        buf[37] = 0x01;
        buf[38..44].copy_from_slice(&self.mac);
        buf[44..48].copy_from_slice(&self.address.octets());
        buf[48..54].copy_from_slice(&FIXED_TAIL);
    }

    /// Parse a keepalive datagram. Returns `None` for anything that is not
    /// a well-formed keepalive — other announce-port traffic is ignored,
    /// not an error.
    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < KEEPALIVE_SIZE {
            return None;
        }
        if data[0..10] != MAGIC {
            return None;
        }
        if data[10] != KEEPALIVE_TYPE {
            return None;
        }

        let claimed_len = u16::from_be_bytes([data[34], data[35]]) as usize;
        if claimed_len != KEEPALIVE_SIZE {
            return None;
        }

        let raw_name = &data[12..12 + DEVICE_NAME_LEN];
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(DEVICE_NAME_LEN);
        let name = String::from_utf8_lossy(&raw_name[..end]).into_owned();

        let mut mac = [0u8; 6];
        mac.copy_from_slice(&data[38..44]);

        let address = Ipv4Addr::new(data[44], data[45], data[46], data[47]);

        Some(Self {
            device_number: data[36],
            name,
            mac,
            address,
        })
    }
}

impl std::fmt::Display for DeviceAnnouncement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (device #{}) at {}",
            self.name, self.device_number, self.address
        )
    }
}
