pub mod announce;
pub mod daemon;
pub mod status;

/// UDP port on which players announce their presence.
pub const ANNOUNCE_PORT: u16 = 50000;

/// UDP port on which status-sending players broadcast their state.
pub const STATUS_PORT: u16 = 50002;

/// TCP port of the tempo-sync daemon, unless overridden.
pub const DEFAULT_DAEMON_PORT: u16 = 17000;

/// How often a player repeats its presence announcement.
pub const ANNOUNCE_INTERVAL_MS: u64 = 1500;

/// A device that has not announced for this long is considered gone.
pub const DEVICE_MAX_AGE_MS: u64 = 10_000;

/// Highest device number a standard player can hold. Numbers 1 through 4
/// carry status-broadcasting privileges on the player network.
pub const LAST_STANDARD_PLAYER: u8 = 4;

/// Maximum assignable device number.
pub const MAX_DEVICE_NUMBER: u8 = 127;
