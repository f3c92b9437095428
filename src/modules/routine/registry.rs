use crate::modules::error::MailVaultResult;
use crate::modules::routine::entity::Routine;
use crate::modules::scheduler::store::ScheduleEntry;
use crate::modules::scheduler::RoutineScheduler;
use tracing::debug;

/// Bridges routine rows to their scheduling records and workers: the
/// durable `ScheduleEntry` is the declaration, the scheduler worker is the
/// runtime counterpart.
pub struct RoutineRegistry;

impl RoutineRegistry {
    /// Idempotently associates the routine's uuid with a scheduling entry
    /// and, when enabled, a running worker.
    pub async fn register(routine: &Routine) -> MailVaultResult<()> {
        ScheduleEntry::for_routine(routine).upsert().await?;
        if routine.enabled {
            RoutineScheduler::get().start_routine(routine);
        }
        debug!("Registered routine '{}'", routine.uuid);
        Ok(())
    }

    /// Pushes interval/enabled changes to the store and the scheduler.
    pub async fn update(routine: &Routine) -> MailVaultResult<()> {
        ScheduleEntry::for_routine(routine).upsert().await?;
        RoutineScheduler::get().update_routine(routine).await;
        Ok(())
    }

    /// Removes the scheduling entry and stops the worker; called on routine
    /// delete.
    pub async fn unregister(routine: &Routine) -> MailVaultResult<()> {
        RoutineScheduler::get().stop_routine(&routine.uuid).await;
        ScheduleEntry::delete(&routine.uuid).await?;
        debug!("Unregistered routine '{}'", routine.uuid);
        Ok(())
    }

    pub fn is_running(routine: &Routine) -> bool {
        RoutineScheduler::get().is_running(&routine.uuid)
    }

    /// Whether every persisted routine's running state matches its enabled
    /// flag.
    pub async fn healthcheck() -> MailVaultResult<bool> {
        RoutineScheduler::get().healthcheck().await
    }
}
