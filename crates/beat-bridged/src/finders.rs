/// Lifecycle shells for the dependent lookup subsystems.
///
/// Metadata, catalog, signature, and timing lookup are pre-built
/// collaborators the orchestrator only starts, stops, and (for metadata)
/// switches between passive and active querying. Their internals live
/// behind these handles; the orchestrator cares solely about the
/// start/stop contract and the fixed startup order.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};

pub struct Finder {
    name: &'static str,
    running: AtomicBool,
}

impl Finder {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(finder = self.name, "Finder started");
        }
        Ok(())
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(finder = self.name, "Finder stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The metadata finder additionally distinguishes passive operation
/// (answer only from caches) from active querying of the players.
pub struct MetadataFinder {
    inner: Finder,
    passive: AtomicBool,
}

impl MetadataFinder {
    fn new() -> Self {
        Self {
            inner: Finder::new("metadata"),
            passive: AtomicBool::new(true),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        self.inner.start()
    }

    pub fn stop(&self) {
        self.inner.stop()
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn set_passive(&self, passive: bool) {
        if self.passive.swap(passive, Ordering::SeqCst) != passive {
            info!(passive = passive, "Metadata finder passive mode changed");
        }
    }

    pub fn is_passive(&self) -> bool {
        self.passive.load(Ordering::SeqCst)
    }
}

/// The full complement, started in a fixed order once the virtual player
/// is online. One subsystem failing to start is logged and does not keep
/// the others down.
pub struct Finders {
    pub metadata: MetadataFinder,
    pub catalog: Finder,
    pub signature: Finder,
    pub timing: Finder,
}

impl Finders {
    pub fn new() -> Self {
        Self {
            metadata: MetadataFinder::new(),
            catalog: Finder::new("catalog"),
            signature: Finder::new("signature"),
            timing: Finder::new("timing"),
        }
    }

    pub fn start_all(&self) {
        if let Err(e) = self.metadata.start() {
            error!("Failed to start the metadata finder: {:#}", e);
        }
        for finder in [&self.catalog, &self.signature, &self.timing] {
            if let Err(e) = finder.start() {
                error!(finder = finder.name, "Failed to start finder: {:#}", e);
            }
        }
    }

    pub fn stop_all(&self) {
        self.timing.stop();
        self.signature.stop();
        self.catalog.stop();
        self.metadata.stop();
    }
}

impl Default for Finders {
    fn default() -> Self {
        Self::new()
    }
}
