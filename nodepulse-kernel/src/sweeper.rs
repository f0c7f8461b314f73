/*!
Retention sweeper

Runs once at startup and then every local midnight (UTC when the local
offset can't be determined). Each run, in one transaction:
- deletes history of node ids no longer configured
- deletes all history of nodes whose `reset_day` is today

Orphaned ids are evicted from the live cache as well.
*/

use crate::config::NodeConfig;
use crate::state::LiveCache;
use crate::store::{run_blocking, MeasureStore, StoreError, SweepReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("retention transaction failed: {0}")]
    Store(#[from] StoreError),
}

pub struct RetentionSweeper {
    store: Arc<MeasureStore>,
    cache: Arc<LiveCache>,
    nodes: Arc<[NodeConfig]>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetentionSweeper {
    pub fn new(store: Arc<MeasureStore>, cache: Arc<LiveCache>, nodes: Vec<NodeConfig>) -> Self {
        Self { store, cache, nodes: nodes.into(), running: AtomicBool::new(false) }
    }

    /// Sweeps as if today were `day` of the month.
    ///
    /// Returns `Ok(None)` without touching the store when another sweep is
    /// still in progress.
    pub async fn sweep_on(&self, day: u8) -> Result<Option<SweepReport>, SweepError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("sweep still running, skipping this one");
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);

        let known: Vec<String> = self.nodes.iter().map(|n| n.id.clone()).collect();
        let reset: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.reset_day == Some(day))
            .map(|n| n.id.clone())
            .collect();
        debug!(day, ?reset, "sweeping history");

        let report = run_blocking(&self.store, move |store| store.sweep(&known, &reset)).await?;
        for node_id in &report.orphaned {
            self.cache.delete(node_id);
        }
        Ok(Some(report))
    }

    async fn sweep_logged(&self, day: u8) {
        match self.sweep_on(day).await {
            Ok(Some(report)) => info!(
                day,
                orphaned = ?report.orphaned,
                measures = report.measures_deleted,
                temperatures = report.temperatures_deleted,
                "retention sweep done"
            ),
            Ok(None) => {}
            Err(e) => error!(error = %e, "retention sweep failed, retrying next run"),
        }
    }

    /// Starts the schedule; the task ends when `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.sweep_logged(local_now().day()).await;
            while !*shutdown.borrow() {
                let (wait, day) = next_midnight(local_now());
                debug!(secs = wait.as_secs(), day, "next retention sweep scheduled");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => self.sweep_logged(day).await,
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("retention sweeper stopped");
        })
    }
}

fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Time left until the coming local midnight and the day of month it starts
fn next_midnight(now: OffsetDateTime) -> (Duration, u8) {
    match now.date().next_day() {
        Some(tomorrow) => {
            let next = tomorrow.midnight().assume_offset(now.offset());
            ((next - now).unsigned_abs(), tomorrow.day())
        }
        None => (Duration::from_secs(86_400), now.day()),
    }
}
