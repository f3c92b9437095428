use crate::modules::common::signal::SIGNAL_MANAGER;
use crate::modules::context::Initialize;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::routine::entity::Routine;
use crate::modules::scheduler::store::ScheduleEntry;
use crate::modules::scheduler::worker::{spawn_worker, WorkerHandle};
use crate::modules::settings::cli::SETTINGS;
use crate::raise_error;
use dashmap::DashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

pub mod runner;
pub mod store;
pub mod worker;
#[cfg(test)]
mod tests;

static SCHEDULER: OnceLock<RoutineScheduler> = OnceLock::new();

/// Owns the per-routine workers, keyed by routine uuid. All starts and
/// stops go through here; workers never share mutable state with each
/// other.
pub struct RoutineScheduler {
    workers: DashMap<String, WorkerHandle>,
}

impl Initialize for RoutineScheduler {
    async fn initialize() -> MailVaultResult<()> {
        let scheduler = RoutineScheduler {
            workers: DashMap::new(),
        };
        let _ = SCHEDULER.set(scheduler);
        RoutineScheduler::get().start_persisted_routines().await
    }
}

impl RoutineScheduler {
    pub fn get() -> &'static RoutineScheduler {
        SCHEDULER.get_or_init(|| RoutineScheduler {
            workers: DashMap::new(),
        })
    }

    /// On process start, resume the workers of every enabled scheduling
    /// record that still has a routine behind it.
    async fn start_persisted_routines(&self) -> MailVaultResult<()> {
        let entries = ScheduleEntry::list_all().await?;
        let mut started = 0;
        for entry in entries {
            if !entry.enabled {
                continue;
            }
            match Routine::find_by_uuid(&entry.uuid).await? {
                Some(routine) => {
                    self.start_routine(&routine);
                    started += 1;
                }
                None => {
                    warn!(
                        "Schedule entry '{}' has no routine, dropping it",
                        entry.uuid
                    );
                    ScheduleEntry::delete(&entry.uuid).await?;
                }
            }
        }
        info!("Scheduler resumed {} routine workers", started);
        Ok(())
    }

    /// Starts (or restarts) the worker of a routine. Idempotent: a live
    /// worker with the same uuid is left alone.
    pub fn start_routine(&self, routine: &Routine) {
        if let Some(existing) = self.workers.get(&routine.uuid) {
            if !existing.is_finished() {
                return;
            }
        }
        let handle = spawn_worker(routine.id, routine.uuid.clone(), routine.interval());
        self.workers.insert(routine.uuid.clone(), handle);
    }

    /// Stops the worker of a routine and waits for it to exit cleanly.
    pub async fn stop_routine(&self, routine_uuid: &str) {
        if let Some((_, handle)) = self.workers.remove(routine_uuid) {
            handle.cancel().await;
        }
    }

    /// Applies interval/enabled changes by bouncing the worker.
    pub async fn update_routine(&self, routine: &Routine) {
        self.stop_routine(&routine.uuid).await;
        if routine.enabled {
            self.start_routine(routine);
        }
    }

    /// Whether a routine's worker is currently executing or queued.
    pub fn is_running(&self, routine_uuid: &str) -> bool {
        self.workers
            .get(routine_uuid)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Control-plane check: the in-memory running state matches the enabled
    /// flag of every persisted scheduling record.
    pub async fn healthcheck(&self) -> MailVaultResult<bool> {
        for entry in ScheduleEntry::list_all().await? {
            if entry.enabled != self.is_running(&entry.uuid) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Blocks until the shutdown signal, then joins all workers within the
    /// configured grace period. Cycles in flight finish; they are never
    /// interrupted mid-archive.
    pub async fn run_until_shutdown(&self) {
        let mut shutdown = SIGNAL_MANAGER.subscribe();
        let _ = shutdown.recv().await;
        info!("Scheduler shutting down, joining workers");
        if let Err(error) = self.join_all_workers().await {
            warn!("Worker join timed out: {}", error.message());
        }
    }

    async fn join_all_workers(&self) -> MailVaultResult<()> {
        let uuids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        let grace = Duration::from_secs(SETTINGS.mailvault_shutdown_grace_secs);
        tokio::time::timeout(grace, async {
            for uuid in uuids {
                if let Some((_, handle)) = self.workers.remove(&uuid) {
                    handle.join().await;
                }
            }
        })
        .await
        .map_err(|_| {
            raise_error!(
                "Some routine workers did not stop within the grace period".into(),
                ErrorCode::InternalError
            )
        })
    }
}
