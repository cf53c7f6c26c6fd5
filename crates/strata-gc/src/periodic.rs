//! Background collection on a fixed interval.
//!
//! Releases never delete anything; reclamation happens here, in batches, on
//! the blocking thread pool so async callers are never stalled by a sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use strata_types::Digest;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::collector::{GarbageCollector, GcReport};
use crate::error::{GcError, GcResult};

/// Supplies the named roots for each run.
pub type RootsProvider = Arc<dyn Fn() -> Vec<Digest> + Send + Sync>;

#[derive(Default)]
struct Progress {
    runs: AtomicU64,
    last: Mutex<Option<GcReport>>,
}

/// Handle to a running periodic collector. Stop it with
/// [`shutdown`](Self::shutdown); dropping the handle stops it too.
pub struct PeriodicCollector {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    progress: Arc<Progress>,
}

impl PeriodicCollector {
    /// Spawn the collection loop on the current tokio runtime. The first
    /// run happens one `interval` after spawning.
    pub fn spawn(collector: GarbageCollector, interval: Duration, roots: RootsProvider) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let progress = Arc::new(Progress::default());
        let collector = Arc::new(collector);

        let handle = {
            let progress = Arc::clone(&progress);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;

                info!(interval_ms = interval.as_millis() as u64, "periodic collector started");
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match run_once(Arc::clone(&collector), (*roots)()).await {
                                Ok(report) => {
                                    let reclaimed = report.reclaimed_count();
                                    *progress.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
                                    let runs = progress.runs.fetch_add(1, Ordering::SeqCst) + 1;
                                    debug!(run = runs, reclaimed, "periodic collection");
                                }
                                Err(e) => warn!(error = %e, "periodic collection failed"),
                            }
                        }
                        _ = &mut shutdown_rx => {
                            info!("periodic collector stopping");
                            break;
                        }
                    }
                }
            })
        };

        Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            progress,
        }
    }

    /// Completed runs so far.
    pub fn runs(&self) -> u64 {
        self.progress.runs.load(Ordering::SeqCst)
    }

    /// Report of the most recent successful run.
    pub fn last_report(&self) -> Option<GcReport> {
        self.progress
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop the loop and wait for an in-flight run to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "periodic collector task ended abnormally");
            }
        }
    }
}

impl Drop for PeriodicCollector {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for PeriodicCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicCollector")
            .field("runs", &self.runs())
            .field("stopped", &self.shutdown.is_none())
            .finish()
    }
}

/// Run one collection on the blocking pool.
pub async fn run_once(collector: Arc<GarbageCollector>, roots: Vec<Digest>) -> GcResult<GcReport> {
    tokio::task::spawn_blocking(move || collector.collect(&roots))
        .await
        .map_err(|e| GcError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_layer::LayerRegistry;
    use strata_store::ContentStore;

    fn registry_with_stray() -> (Arc<LayerRegistry>, Digest, Digest) {
        let registry = Arc::new(LayerRegistry::new(Arc::new(ContentStore::in_memory())));
        let mut keep = registry.builder(None);
        keep.file("/keep", b"k").unwrap();
        let keep = keep.build().unwrap();
        let mut stray = registry.builder(None);
        stray.file("/stray", b"s").unwrap();
        let stray = stray.build().unwrap();
        (registry, keep, stray)
    }

    #[tokio::test]
    async fn run_once_collects_on_blocking_pool() {
        let (registry, keep, stray) = registry_with_stray();
        let collector = Arc::new(GarbageCollector::new(Arc::clone(&registry)));

        let report = run_once(collector, vec![keep]).await.unwrap();
        assert_eq!(report.unregistered, vec![stray]);
        assert!(registry.contains(&keep));
    }

    #[tokio::test]
    async fn periodic_collector_runs_until_shutdown() {
        let (registry, keep, stray) = registry_with_stray();
        let periodic = PeriodicCollector::spawn(
            GarbageCollector::new(Arc::clone(&registry)),
            Duration::from_millis(10),
            Arc::new(move || vec![keep]),
        );

        for _ in 0..500 {
            if periodic.runs() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(periodic.runs() > 0);
        assert!(!registry.contains(&stray));
        assert!(registry.contains(&keep));
        assert!(periodic.last_report().is_some());

        periodic.shutdown().await;
    }
}
