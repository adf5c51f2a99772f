// ABOUTME: Sandbox teardown guarantee: synchronous path plus a backstop reaper
// ABOUTME: Sweeps expired handles and orphaned containers on an interval

use drydock_sandbox::{Provider, ProviderError, SandboxStorage, StorageError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Teardown failed: {0}")]
    TeardownFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Tear down a sandbox exactly once.
///
/// Container removal runs first; only a successful (or already-done)
/// removal marks the handle terminated, so a failed removal stays
/// visible to the reaper for retry. Returns false when another path
/// already completed the teardown.
pub async fn teardown_sandbox(
    provider: &dyn Provider,
    storage: &SandboxStorage,
    sandbox_id: &str,
) -> Result<bool> {
    let handle = storage.get_sandbox(sandbox_id).await?;
    if handle.is_terminated() {
        return Ok(false);
    }

    if let Some(container_id) = &handle.container_id {
        match provider.remove_container(container_id, true).await {
            Ok(()) => {}
            Err(ProviderError::ContainerNotFound(_)) => {}
            Err(e) => return Err(LifecycleError::TeardownFailed(e.to_string())),
        }
    }

    Ok(storage.mark_terminated(&handle.id).await?)
}

/// Background sweeper guaranteeing every provisioned sandbox is
/// eventually torn down, even if the process issuing the synchronous
/// teardown crashed.
pub struct SandboxReaper {
    provider: Arc<dyn Provider>,
    storage: Arc<SandboxStorage>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl SandboxReaper {
    pub fn new(provider: Arc<dyn Provider>, storage: Arc<SandboxStorage>, interval: Duration) -> Self {
        Self {
            provider,
            storage,
            interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the periodic sweep task
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return; // Already running
        }
        *running = true;
        drop(running);

        let provider = self.provider.clone();
        let storage = self.storage.clone();
        let running_flag = self.running.clone();
        let sweep_interval = self.interval;

        tokio::spawn(async move {
            info!("Sandbox reaper started (interval: {:?})", sweep_interval);

            let mut interval = time::interval(sweep_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                if !*running_flag.read().await {
                    info!("Sandbox reaper stopped");
                    break;
                }

                if let Err(e) = Self::sweep_expired(&provider, &storage).await {
                    error!("Reaper expiry sweep failed: {}", e);
                }
                if let Err(e) = Self::sweep_orphans(&provider, &storage).await {
                    error!("Reaper orphan sweep failed: {}", e);
                }
            }
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// Tear down every sandbox whose durable deadline has passed.
    ///
    /// A failed teardown is logged and left in place; the handle stays
    /// expired and the next sweep retries it.
    pub async fn sweep_expired(
        provider: &Arc<dyn Provider>,
        storage: &Arc<SandboxStorage>,
    ) -> Result<usize> {
        let expired = storage.list_expired(chrono::Utc::now()).await?;
        let mut reaped = 0;

        for handle in expired {
            match teardown_sandbox(provider.as_ref(), storage.as_ref(), &handle.id).await {
                Ok(true) => {
                    info!("Reaped expired sandbox {}", handle.id);
                    reaped += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to reap sandbox {}: {} (will retry)", handle.id, e);
                }
            }
        }

        Ok(reaped)
    }

    /// Remove provider containers that no live handle references.
    ///
    /// Covers crashes between container creation and handle updates, and
    /// manual manipulation outside drydock.
    pub async fn sweep_orphans(
        provider: &Arc<dyn Provider>,
        storage: &Arc<SandboxStorage>,
    ) -> Result<usize> {
        let containers = match provider.list_containers(true).await {
            Ok(containers) => containers,
            Err(e) => return Err(LifecycleError::TeardownFailed(e.to_string())),
        };

        let live = storage.list_live().await?;
        let tracked: std::collections::HashSet<&str> = live
            .iter()
            .filter_map(|h| h.container_id.as_deref())
            .collect();

        let mut removed = 0;
        for container in containers {
            if tracked.contains(container.id.as_str()) {
                continue;
            }
            warn!("Found orphaned container {}", container.id);
            match provider.remove_container(&container.id, true).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove orphaned container {}: {}", container.id, e),
            }
        }

        Ok(removed)
    }
}
