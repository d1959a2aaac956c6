//! Error taxonomies for the two connection-owning managers.

use thiserror::Error;

/// Failures talking to the external tempo-sync daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("could not reach the tempo-sync daemon: {0}")]
    Connect(#[source] std::io::Error),

    #[error("no daemon session established")]
    NotConnected,

    #[error("daemon session failed: {0}")]
    Session(#[source] std::io::Error),
}

/// Failures driving the virtual player.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("virtual player is not running")]
    NotRunning,

    #[error("virtual player is not sending status")]
    NotSendingStatus,

    #[error("virtual player does not hold the tempo-master role")]
    NotMaster,

    #[error("device number {0} is already in use on the network")]
    NumberInUse(u8),

    #[error("no free device number between {0} and {1}")]
    NoFreeNumber(u8, u8),
}
