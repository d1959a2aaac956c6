/// Session protocol for the external tempo-sync daemon.
///
/// The daemon speaks a newline-delimited text protocol over TCP:
///
///   Client → Daemon: `status`, `bpm <f64>`, `sync-mode <mode>`,
///                    `latency <ms>`, `sync-bars <on|off>`
///   Daemon → Client: `status <json>` (and lines we don't recognize,
///                    which are ignored)
///
/// The status payload is a JSON object; `bpm` is absent until the daemon
/// has a tempo to report.

use serde::{Deserialize, Serialize};

/// The daemon's coupling behavior.
///
/// PASSIVE means the daemon follows the player network's tempo without
/// controlling it; FULL means tempo changes flow in both directions; OFF
/// means no coupling. Changing the mode is a wire call to the daemon, not
/// a local flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    Off,
    Passive,
    Full,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Passive => "passive",
            Self::Full => "full",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "passive" => Some(Self::Passive),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command sent to the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonCommand {
    /// Ask the daemon to report its current status.
    Status,
    /// Push a tempo into the daemon's timeline.
    Bpm(f64),
    /// Change the daemon's coupling behavior.
    SyncMode(SyncMode),
    /// Tell the daemon how far behind the player network we run.
    Latency(i32),
    /// Align to bars rather than individual beats.
    SyncBars(bool),
}

impl DaemonCommand {
    /// Encode as a single protocol line, newline included.
    pub fn encode(&self) -> String {
        match self {
            Self::Status => "status\n".to_string(),
            Self::Bpm(bpm) => format!("bpm {bpm}\n"),
            Self::SyncMode(mode) => format!("sync-mode {mode}\n"),
            Self::Latency(ms) => format!("latency {ms}\n"),
            Self::SyncBars(on) => format!("sync-bars {}\n", if *on { "on" } else { "off" }),
        }
    }
}

/// Body of a `status` response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Current session tempo; absent until the daemon has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    /// Number of peers on the daemon's side of the bridge.
    #[serde(default)]
    pub peers: u32,
    /// Current beat within the session timeline, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beat: Option<f64>,
}

/// A message received from the daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    Status(StatusReport),
}

impl DaemonEvent {
    /// Parse one received line. Returns `None` for lines this client does
    /// not understand; callers log and move on.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        match word {
            "status" => {
                let report: StatusReport = serde_json::from_str(rest).ok()?;
                Some(Self::Status(report))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_encode_as_lines() {
        assert_eq!(DaemonCommand::Status.encode(), "status\n");
        assert_eq!(DaemonCommand::Bpm(128.5).encode(), "bpm 128.5\n");
        assert_eq!(
            DaemonCommand::SyncMode(SyncMode::Passive).encode(),
            "sync-mode passive\n"
        );
        assert_eq!(DaemonCommand::Latency(20).encode(), "latency 20\n");
        assert_eq!(DaemonCommand::SyncBars(false).encode(), "sync-bars off\n");
    }

    #[test]
    fn status_with_tempo_parses() {
        let event = DaemonEvent::parse(r#"status {"bpm":126.0,"peers":2,"beat":14.5}"#)
            .expect("valid status line");
        let DaemonEvent::Status(report) = event;
        assert_eq!(report.bpm, Some(126.0));
        assert_eq!(report.peers, 2);
        assert_eq!(report.beat, Some(14.5));
    }

    #[test]
    fn status_without_tempo_parses() {
        let event = DaemonEvent::parse(r#"status {"peers":0}"#).expect("valid status line");
        let DaemonEvent::Status(report) = event;
        assert_eq!(report.bpm, None);
        assert_eq!(report.peers, 0);
    }

    #[test]
    fn unknown_lines_are_ignored() {
        assert!(DaemonEvent::parse("version 1.2.0").is_none());
        assert!(DaemonEvent::parse("").is_none());
    }

    #[test]
    fn malformed_status_body_is_ignored() {
        assert!(DaemonEvent::parse("status not-json").is_none());
    }

    #[test]
    fn sync_mode_names_roundtrip() {
        for mode in [SyncMode::Off, SyncMode::Passive, SyncMode::Full] {
            assert_eq!(SyncMode::from_str(mode.as_str()), Some(mode));
        }
        assert_eq!(SyncMode::from_str("sideways"), None);
    }
}
