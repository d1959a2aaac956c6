/// Connection manager for the external tempo-sync daemon.
///
/// Owns the TCP session: a single connect attempt, an infinite
/// retry-with-backoff loop for callers that can block, a poll task that
/// reads status lines and detects unexpected drops, and an observer list
/// notified on those drops so the orchestrator can self-heal.
///
/// The session is a std stream guarded by a mutex, non-blocking for
/// reads; the poll task services it every 100 ms. Disconnection
/// listeners run on the poll task and must not block — the orchestrator's
/// listener just spawns the reconnect task.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use beat_protocol::daemon::{DaemonCommand, DaemonEvent, SyncMode};
use beat_protocol::DEFAULT_DAEMON_PORT;

use crate::error::DaemonError;

/// Fixed delay between connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// How long a single connect attempt may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How often the poll task services the session.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read-only view of the daemon session, exposed to the bridge decision
/// logic and tests.
pub trait TempoSync: Send + Sync {
    /// Snapshot of the session state.
    fn state(&self) -> DaemonState;

    /// Push a coupling mode to the daemon.
    fn set_sync_mode(&self, mode: SyncMode) -> Result<(), DaemonError>;
}

#[derive(Debug, Clone)]
pub struct DaemonState {
    pub port: u16,
    pub latency_ms: i32,
    pub sync_to_bars: bool,
    pub sync_mode: SyncMode,
    /// Tempo last reported by the daemon; absent until it reports one.
    pub link_tempo: Option<f64>,
    pub connected: bool,
}

struct Connection {
    stream: TcpStream,
    /// Bytes received but not yet terminated by a newline.
    pending: Vec<u8>,
}

impl Connection {
    fn open(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            pending: Vec::new(),
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        // Command lines are tiny; switch to blocking for the write so a
        // momentarily full send buffer doesn't surface as WouldBlock.
        self.stream.set_nonblocking(false)?;
        let result = self.stream.write_all(line.as_bytes());
        self.stream.set_nonblocking(true)?;
        result
    }

    /// Drain whatever the daemon has sent, appending complete lines to
    /// `lines`. An orderly or abrupt close surfaces as an error.
    fn read_lines(&mut self, lines: &mut Vec<String>) -> std::io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "daemon closed the session",
                    ))
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = self.pending.drain(..=pos).collect();
                        lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct DaemonLink {
    state: Mutex<DaemonState>,
    conn: Mutex<Option<Connection>>,
    listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    retry_interval: Duration,
}

impl DaemonLink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DaemonState {
                port: DEFAULT_DAEMON_PORT,
                latency_ms: 20,
                sync_to_bars: true,
                sync_mode: SyncMode::Off,
                link_tempo: None,
                connected: false,
            }),
            conn: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Shorten the retry backoff; tests use this to bound waiting.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn set_daemon_port(&self, port: u16) {
        let mut state = self.state.lock().unwrap();
        if state.connected {
            warn!(port = port, "Daemon port change takes effect on next connect");
        }
        state.port = port;
    }

    pub fn set_latency(&self, latency_ms: i32) {
        self.state.lock().unwrap().latency_ms = latency_ms;
        if let Some(conn) = self.conn.lock().unwrap().as_mut() {
            if let Err(e) = conn.write_line(&DaemonCommand::Latency(latency_ms).encode()) {
                warn!("Failed to push latency to the daemon: {}", e);
            }
        }
    }

    pub fn set_sync_to_bars(&self, sync_to_bars: bool) {
        self.state.lock().unwrap().sync_to_bars = sync_to_bars;
        if let Some(conn) = self.conn.lock().unwrap().as_mut() {
            if let Err(e) = conn.write_line(&DaemonCommand::SyncBars(sync_to_bars).encode()) {
                warn!("Failed to push bar alignment to the daemon: {}", e);
            }
        }
    }

    /// Register a callback invoked whenever an established session drops
    /// unexpectedly. Callbacks run on the poll task and must not block.
    pub fn add_disconnection_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    /// Single connection attempt. Already connected is not an error.
    pub fn connect(&self) -> Result<(), DaemonError> {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }

        let (port, latency_ms, sync_to_bars) = {
            let state = self.state.lock().unwrap();
            (state.port, state.latency_ms, state.sync_to_bars)
        };

        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let mut conn = Connection::open(addr).map_err(DaemonError::Connect)?;

        // Configure the session, then ask for an initial status report so
        // link_tempo fills in as soon as the daemon has a tempo.
        for command in [
            DaemonCommand::Latency(latency_ms),
            DaemonCommand::SyncBars(sync_to_bars),
            DaemonCommand::Status,
        ] {
            conn.write_line(&command.encode())
                .map_err(DaemonError::Connect)?;
        }

        *guard = Some(conn);
        drop(guard);

        self.state.lock().unwrap().connected = true;
        info!(port = port, latency_ms = latency_ms, "Connected to the tempo-sync daemon");
        Ok(())
    }

    /// Keep attempting to connect until success or shutdown, blocking the
    /// calling task for the retry interval between attempts. Run this on
    /// a dedicated task: against a down daemon it waits indefinitely.
    /// Returns `true` once connected, `false` if shut down first.
    pub async fn connect_with_retry(&self, mut shutdown: watch::Receiver<bool>) -> bool {
        loop {
            {
                let state = self.state.lock().unwrap();
                info!(
                    port = state.port,
                    latency_ms = state.latency_ms,
                    "Trying to connect to the tempo-sync daemon"
                );
            }
            match self.connect() {
                Ok(()) => return true,
                Err(e) => error!(
                    "Problem connecting to the tempo-sync daemon, retrying in {:?}: {}",
                    self.retry_interval, e
                ),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    fn set_sync_mode_inner(&self, mode: SyncMode) -> Result<(), DaemonError> {
        let mut guard = self.conn.lock().unwrap();
        let conn = guard.as_mut().ok_or(DaemonError::NotConnected)?;
        match conn.write_line(&DaemonCommand::SyncMode(mode).encode()) {
            Ok(()) => {
                drop(guard);
                self.state.lock().unwrap().sync_mode = mode;
                info!(mode = %mode, "Pushed sync mode to the daemon");
                Ok(())
            }
            Err(e) => {
                *guard = None;
                drop(guard);
                self.drop_session();
                Err(DaemonError::Session(e))
            }
        }
    }

    /// Mark the session gone and tell the observers.
    fn drop_session(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.connected = false;
            state.sync_mode = SyncMode::Off;
            state.link_tempo = None;
        }
        warn!("Lost the session to the tempo-sync daemon");
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener();
        }
    }

    /// Service the session once: drain received lines and apply them.
    /// Returns `true` if the session was found dropped.
    fn poll_once(&self) -> bool {
        let mut lines = Vec::new();
        let dropped = {
            let mut guard = self.conn.lock().unwrap();
            let Some(conn) = guard.as_mut() else {
                return false;
            };
            match conn.read_lines(&mut lines) {
                Ok(()) => false,
                Err(e) => {
                    debug!("Daemon session read failed: {}", e);
                    *guard = None;
                    true
                }
            }
        };

        for line in &lines {
            match DaemonEvent::parse(line) {
                Some(DaemonEvent::Status(report)) => {
                    let mut state = self.state.lock().unwrap();
                    state.link_tempo = report.bpm;
                    debug!(bpm = ?report.bpm, peers = report.peers, "Daemon status");
                }
                None => debug!(line = %line, "Ignoring unrecognized daemon line"),
            }
        }

        if dropped {
            self.drop_session();
        }
        dropped
    }

    /// Drive the session until shutdown. The disconnection observers fire
    /// from here when an established session drops.
    pub async fn run_poll(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_once();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

impl Default for DaemonLink {
    fn default() -> Self {
        Self::new()
    }
}

impl TempoSync for DaemonLink {
    fn state(&self) -> DaemonState {
        self.state.lock().unwrap().clone()
    }

    fn set_sync_mode(&self, mode: SyncMode) -> Result<(), DaemonError> {
        self.set_sync_mode_inner(mode)
    }
}
