use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{async_find_impl, delete_impl, list_all_impl, upsert_impl};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::routine::entity::{IntervalUnit, Routine};
use crate::{raise_error, utc_now};
use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

/// Task name recorded in every scheduling entry. Existing entries reference
/// it; it must not be renamed.
pub const FETCH_EMAILS_TASK: &str = "fetch_emails";

/// The durable scheduling record of one routine: the task envelope
/// `{task, args: [uuid], interval, enabled}` persisted in the tasks
/// database. The in-memory worker is its runtime counterpart.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[native_model(id = 20, version = 1)]
#[native_db]
pub struct ScheduleEntry {
    #[primary_key]
    pub uuid: String,
    pub task: String,
    pub args: Vec<String>,
    pub every: u64,
    pub period: IntervalUnit,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ScheduleEntry {
    pub fn for_routine(routine: &Routine) -> Self {
        ScheduleEntry {
            uuid: routine.uuid.clone(),
            task: FETCH_EMAILS_TASK.to_string(),
            args: vec![routine.uuid.clone()],
            every: routine.every,
            period: routine.period,
            enabled: routine.enabled,
            created_at: utc_now!(),
            updated_at: utc_now!(),
        }
    }

    /// Idempotent write of the scheduling record.
    pub async fn upsert(&self) -> MailVaultResult<()> {
        upsert_impl(DB_MANAGER.tasks_db(), self.clone()).await
    }

    pub async fn find(uuid: &str) -> MailVaultResult<Option<ScheduleEntry>> {
        async_find_impl(DB_MANAGER.tasks_db(), uuid.to_string()).await
    }

    pub async fn list_all() -> MailVaultResult<Vec<ScheduleEntry>> {
        list_all_impl(DB_MANAGER.tasks_db()).await
    }

    pub async fn delete(uuid: &str) -> MailVaultResult<()> {
        if Self::find(uuid).await?.is_none() {
            return Ok(());
        }
        let uuid = uuid.to_string();
        delete_impl(DB_MANAGER.tasks_db(), move |rw| {
            rw.get()
                .primary::<ScheduleEntry>(uuid.clone())
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .ok_or_else(|| {
                    raise_error!(
                        format!("Schedule entry '{}' not found during deletion.", uuid),
                        ErrorCode::ResourceNotFound
                    )
                })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schedule_entry_round_trip() {
        let entry = ScheduleEntry {
            uuid: "test-entry-1".into(),
            task: FETCH_EMAILS_TASK.into(),
            args: vec!["test-entry-1".into()],
            every: 60,
            period: IntervalUnit::Seconds,
            enabled: true,
            created_at: utc_now!(),
            updated_at: utc_now!(),
        };
        entry.upsert().await.unwrap();
        let found = ScheduleEntry::find("test-entry-1").await.unwrap().unwrap();
        assert_eq!(found.task, FETCH_EMAILS_TASK);
        assert_eq!(found.args, vec!["test-entry-1".to_string()]);

        ScheduleEntry::delete("test-entry-1").await.unwrap();
        assert!(ScheduleEntry::find("test-entry-1").await.unwrap().is_none());
        // Deleting again is a no-op.
        ScheduleEntry::delete("test-entry-1").await.unwrap();
    }
}
