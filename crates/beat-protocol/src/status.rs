/// Status broadcasts from a status-sending player.
///
/// A player that holds a standard device number (1-4) periodically
/// broadcasts its tempo and sync flags on the status port so other
/// devices can follow it. BeatBridge emits these while it is posing as a
/// real player; it never needs to read them back except in tests.

/// Magic bytes opening a status datagram.
pub const MAGIC: [u8; 4] = *b"BBST";

/// Flag bits.
pub const FLAG_MASTER: u8 = 0x01;
pub const FLAG_SYNCED: u8 = 0x02;

/// Fixed-size status datagram.
///
/// Layout: magic(4) + device_number(1) + flags(1) + tempo_centi(4) = 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPacket {
    pub device_number: u8,
    /// Whether this player currently claims the tempo-master role.
    pub master: bool,
    /// Whether this player defers its tempo to an external source.
    pub synced: bool,
    /// Tempo in hundredths of a BPM (12800 = 128.00 BPM).
    pub tempo_centi: u32,
}

impl StatusPacket {
    pub const SIZE: usize = 10;

    pub fn serialize(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.device_number;

        let mut flags = 0u8;
        if self.master {
            flags |= FLAG_MASTER;
        }
        if self.synced {
            flags |= FLAG_SYNCED;
        }
        buf[5] = flags;

        buf[6..10].copy_from_slice(&self.tempo_centi.to_be_bytes());
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        if data[0..4] != MAGIC {
            return None;
        }

        let flags = data[5];
        Some(Self {
            device_number: data[4],
            master: flags & FLAG_MASTER != 0,
            synced: flags & FLAG_SYNCED != 0,
            tempo_centi: u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
        })
    }

    pub fn tempo_bpm(&self) -> f64 {
        f64::from(self.tempo_centi) / 100.0
    }

    pub fn from_bpm(device_number: u8, master: bool, synced: bool, bpm: f64) -> Self {
        Self {
            device_number,
            master,
            synced,
            tempo_centi: (bpm * 100.0).round() as u32,
        }
    }
}
