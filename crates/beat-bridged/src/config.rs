//! Validated, immutable runtime settings.
//!
//! Built once from the command line at startup and shared read-only with
//! every task. Individual value ranges are enforced by the argument
//! parser; cross-option consistency is enforced here.

use beat_protocol::LAST_STANDARD_PLAYER;

#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed device number to claim, or 0 to let the player pick one.
    pub device_number: u8,
    /// Pose as a standard player (device #1-4) when no fixed number is set.
    pub use_standard_player_number: bool,
    /// Bridge tempo to the external sync daemon.
    pub bridge_enabled: bool,
    /// When bridging, the daemon's timeline is the tempo master.
    pub ableton_is_master: bool,
    /// Align whole bars across the bridge rather than individual beats.
    pub sync_to_bars: bool,
    /// TCP port of the tempo-sync daemon.
    pub daemon_port: u16,
    /// How many milliseconds we run behind the real players.
    pub latency_ms: i32,
    /// Name announced on the player network.
    pub device_name: String,
}

impl Config {
    /// Check cross-option consistency. Acting as tempo master on the
    /// player network requires status-sending privileges, which only a
    /// standard player number (1-4) grants.
    pub fn validate(&self) -> Result<(), String> {
        if self.ableton_is_master {
            let eligible = (1..=LAST_STANDARD_PLAYER).contains(&self.device_number)
                || (self.device_number == 0 && self.use_standard_player_number);
            if !eligible {
                return Err(
                    "ableton-master requires a standard player number (1-4), either fixed \
                     via --device-number or requested via --real-player"
                        .to_string(),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            device_number: 0,
            use_standard_player_number: false,
            bridge_enabled: true,
            ableton_is_master: false,
            sync_to_bars: true,
            daemon_port: 17000,
            latency_ms: 20,
            device_name: "beat-bridge".to_string(),
        }
    }

    #[test]
    fn ableton_master_with_high_device_number_is_rejected() {
        let config = Config {
            ableton_is_master: true,
            device_number: 5,
            use_standard_player_number: false,
            ..base()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn ableton_master_with_real_player_pose_is_accepted() {
        let config = Config {
            ableton_is_master: true,
            device_number: 0,
            use_standard_player_number: true,
            ..base()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ableton_master_with_standard_number_is_accepted() {
        let config = Config {
            ableton_is_master: true,
            device_number: 3,
            ..base()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ableton_master_without_eligible_number_is_rejected() {
        let config = Config {
            ableton_is_master: true,
            ..base()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn fixed_number_overrides_real_player_pose() {
        // A fixed number outside 1-4 is ineligible even with --real-player.
        let config = Config {
            ableton_is_master: true,
            device_number: 7,
            use_standard_player_number: true,
            ..base()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_validate_without_master_flag() {
        assert!(base().validate().is_ok());
    }
}
