//! Background task keeping the published registry in line with Docker and
//! the manual declarations.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::{self, MissedTickBehavior};

use crate::discovery::{propose, DiscoverySettings};
use crate::error::{Error, Result};
use crate::overrides::ManualSource;
use crate::reconcile::{reconcile, Conflict};
use crate::registry::RegistryHandle;
use crate::runtime::ContainerRuntime;
use crate::types::Trigger;

/// Result of one successful cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Version current after the cycle.
    pub version: u64,
    /// Whether a new snapshot was published.
    pub published: bool,
    pub endpoints: usize,
    pub conflicts: Vec<Conflict>,
}

pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    manual_sources: Vec<Arc<dyn ManualSource>>,
    registry: RegistryHandle,
    discovery: DiscoverySettings,
    fetch_timeout: Duration,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: RegistryHandle,
        discovery: DiscoverySettings,
    ) -> Self {
        Self {
            runtime,
            manual_sources: Vec::new(),
            registry,
            discovery,
            fetch_timeout: Duration::from_secs(5),
            interval: Duration::from_secs(10),
        }
    }

    /// Add a source of manual declarations. Earlier sources win name
    /// collisions.
    pub fn with_manual_source(mut self, source: impl ManualSource + 'static) -> Self {
        self.manual_sources.push(Arc::new(source));
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one cycle. On error the published snapshot is left untouched.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let inventory = time::timeout(self.fetch_timeout, self.runtime.inventory())
            .await
            .map_err(|_| Error::InventoryTimeout(self.fetch_timeout))??;

        let mut declarations = Vec::new();
        for source in &self.manual_sources {
            let source = Arc::clone(source);
            declarations.extend(task::spawn_blocking(move || source.declarations()).await??);
        }

        let proposals = propose(&inventory, &self.discovery);
        let current = self.registry.current();
        let outcome = reconcile(&current, &proposals, &declarations);

        if outcome.registry.same_content(&current) {
            debug!("Registry v{} unchanged", current.version());
            return Ok(CycleReport {
                version: current.version(),
                published: false,
                endpoints: current.len(),
                conflicts: outcome.conflicts,
            });
        }

        let version = outcome.registry.version();
        let endpoints = outcome.registry.len();
        let published = self.registry.publish(outcome.registry);
        if published {
            info!(
                "Published registry v{} with {} endpoints ({} added, {} removed)",
                version,
                endpoints,
                outcome.added.len(),
                outcome.removed.len()
            );
        }
        Ok(CycleReport {
            version: self.registry.current().version(),
            published,
            endpoints,
            conflicts: outcome.conflicts,
        })
    }

    /// Reconcile on every tick and every trigger until the task is aborted.
    pub async fn run(self, mut triggers: mpsc::Receiver<Trigger>) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut triggers_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                trigger = triggers.recv(), if triggers_open => match trigger {
                    Some(trigger) => {
                        debug!("Reconciling after {:?}", trigger);
                        // Coalesce bursts, e.g. `compose up` starting many containers.
                        let mut coalesced = 0;
                        while triggers.try_recv().is_ok() {
                            coalesced += 1;
                        }
                        if coalesced > 0 {
                            debug!("Coalesced {} more triggers", coalesced);
                        }
                    }
                    None => {
                        warn!("Trigger channel closed, reconciling on interval only");
                        triggers_open = false;
                        continue;
                    }
                },
            }

            if let Err(e) = self.run_once().await {
                error!(
                    "Reconciliation failed, keeping registry v{}: {}",
                    self.registry.current().version(),
                    e
                );
            }
        }
    }
}
