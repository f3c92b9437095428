use crate::modules::common::signal::SIGNAL_MANAGER;
use crate::modules::error::code::ErrorCode;
use crate::modules::routine::entity::Routine;
use crate::modules::scheduler::runner::run_routine_cycle;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

const RESTART_BASE_DELAY: Duration = Duration::from_secs(60);
const MAX_RESTART_ATTEMPTS: u32 = 10;

pub struct WorkerHandle {
    cancel_sender: Option<oneshot::Sender<()>>,
    join_handle: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Requests a stop and waits for the worker to exit. A cycle already in
    /// flight runs to completion; interrupting it mid-archive would leave
    /// half-written state.
    pub async fn cancel(mut self) {
        if let Some(sender) = self.cancel_sender.take() {
            let _ = sender.send(());
        }
        let _ = self.join_handle.await;
    }

    /// Waits for the worker without cancelling it first (shutdown path,
    /// where the stop flag arrives via the shutdown broadcast).
    pub async fn join(self) {
        let _ = self.join_handle.await;
    }
}

/// Starts the periodic worker of one routine, identified by the routine
/// uuid. Ticks that fire while a cycle is still running are dropped, not
/// queued; unexpected cycle errors restart the loop with bounded
/// exponential backoff.
pub fn spawn_worker(routine_id: u64, routine_uuid: String, interval: Duration) -> WorkerHandle {
    info!("Worker for routine '{}' started", routine_uuid);
    let (cancel_sender, mut cancel_receiver) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Coalesce overlapping ticks instead of bursting after a long cycle.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = SIGNAL_MANAGER.subscribe();
        // Discard the immediate first tick; the first cycle runs after one
        // full interval.
        ticker.tick().await;

        let mut consecutive_crashes: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut cancel_receiver => {
                    info!("Worker for routine '{}' received stop request", routine_uuid);
                    break;
                }
                _ = shutdown.recv() => {
                    info!("Worker for routine '{}' shutting down", routine_uuid);
                    break;
                }
            }

            let routine = match Routine::find(routine_id).await {
                Ok(Some(routine)) => routine,
                Ok(None) => {
                    info!("Routine '{}' is gone, worker exits", routine_uuid);
                    break;
                }
                Err(fetch_error) => {
                    error!(
                        "Worker for routine '{}' cannot load its routine: {}",
                        routine_uuid,
                        fetch_error.message()
                    );
                    break;
                }
            };
            if !routine.enabled {
                info!("Routine '{}' is disabled, worker exits", routine_uuid);
                break;
            }

            match run_routine_cycle(&routine).await {
                Ok(_) => {
                    consecutive_crashes = 0;
                }
                Err(cycle_error)
                    if matches!(
                        cycle_error.code(),
                        ErrorCode::MailAccount | ErrorCode::Mailbox
                    ) =>
                {
                    // Expected failure states; health is already recorded
                    // and the next tick retries normally.
                    warn!(
                        "Cycle of routine '{}' failed: {}",
                        routine_uuid,
                        cycle_error.message()
                    );
                    consecutive_crashes = 0;
                }
                Err(cycle_error) => {
                    consecutive_crashes += 1;
                    error!(
                        "Cycle of routine '{}' crashed ({}/{}): {}",
                        routine_uuid,
                        consecutive_crashes,
                        MAX_RESTART_ATTEMPTS,
                        cycle_error.message()
                    );
                    if consecutive_crashes >= MAX_RESTART_ATTEMPTS {
                        error!(
                            "Routine '{}' crashed {} times in a row, worker stops",
                            routine_uuid, MAX_RESTART_ATTEMPTS
                        );
                        break;
                    }
                    let delay = RESTART_BASE_DELAY * 2u32.pow(consecutive_crashes - 1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut cancel_receiver => break,
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }

        info!("Worker for routine '{}' stopped", routine_uuid);
    });

    WorkerHandle {
        cancel_sender: Some(cancel_sender),
        join_handle,
    }
}
