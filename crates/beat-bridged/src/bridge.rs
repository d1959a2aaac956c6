/// Bridge mode establishment.
///
/// Once both sides might be ready — after the virtual player comes
/// online, and again after every fresh daemon connection — decide which
/// side follows which and push the outcome to both. Safe to invoke
/// redundantly; it re-applies the already-correct mode.

use tracing::{debug, error};

use beat_protocol::daemon::SyncMode;

use crate::config::Config;
use crate::daemon_link::TempoSync;
use crate::virtual_player::PlayerControl;

/// Pick and apply the bridge direction.
///
/// FULL coupling only makes sense when the virtual player can itself
/// broadcast tempo authoritatively, which requires active status
/// sending; in every other case the player defers to the daemon's
/// timeline and the daemon follows passively. Failures of the individual
/// pushes are logged and do not undo pushes that already landed; the
/// next establishment trigger re-applies everything.
pub fn establish_bridge_mode(config: &Config, player: &dyn PlayerControl, daemon: &dyn TempoSync) {
    if !config.bridge_enabled {
        return;
    }
    if !daemon.state().connected {
        debug!("Skipping bridge establishment: no daemon session yet");
        return;
    }

    if config.ableton_is_master && player.is_sending_status() {
        // The daemon's timeline wins: claim mastership of the player
        // network and couple fully.
        let claimed = match player.become_tempo_master() {
            Ok(()) => true,
            Err(e) => {
                error!("Problem claiming the tempo-master role to bridge timelines: {}", e);
                false
            }
        };
        if claimed {
            if let Some(tempo) = daemon.state().link_tempo {
                if let Err(e) = player.set_tempo(tempo) {
                    error!("Problem pushing the daemon tempo to the player network: {}", e);
                }
            }
        }
        if let Err(e) = daemon.set_sync_mode(SyncMode::Full) {
            error!("Problem putting the daemon into full sync: {}", e);
        }
    } else {
        // The player network wins: follow it passively.
        if let Err(e) = player.set_synced(true) {
            error!("Problem configuring the virtual player to follow the daemon: {}", e);
        }
        if let Err(e) = daemon.set_sync_mode(SyncMode::Passive) {
            error!("Problem putting the daemon into passive sync: {}", e);
        }
    }
}
