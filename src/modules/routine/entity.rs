use crate::id;
use crate::modules::account::entity::Account;
use crate::modules::database::manager::DB_MANAGER;
use crate::modules::database::{
    delete_impl, filter_by_secondary_key_impl, insert_impl, list_all_impl, secondary_find_impl,
    update_impl,
};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::fetcher::criteria::FetchCriterion;
use crate::modules::health::Health;
use crate::modules::mailbox::entity::Mailbox;
use crate::{raise_error, utc_now};
use native_db::*;
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Period unit of a routine interval. Matches the persisted task envelope,
/// which existing scheduling records use.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum IntervalUnit {
    Microseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    pub fn to_duration(&self, every: u64) -> Duration {
        match self {
            IntervalUnit::Microseconds => Duration::from_micros(every),
            IntervalUnit::Seconds => Duration::from_secs(every),
            IntervalUnit::Minutes => Duration::from_secs(every * 60),
            IntervalUnit::Hours => Duration::from_secs(every * 3600),
            IntervalUnit::Days => Duration::from_secs(every * 86_400),
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            IntervalUnit::Microseconds => "microseconds",
            IntervalUnit::Seconds => "seconds",
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
        };
        write!(f, "{}", tag)
    }
}

/// A user-defined periodic fetching job: one mailbox, one criterion, one
/// interval. The uuid is its external identity and names its log file and
/// scheduling record; it must never be renamed.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[native_model(id = 3, version = 1)]
#[native_db]
pub struct Routine {
    #[primary_key]
    pub id: u64,
    #[secondary_key(unique)]
    pub uuid: String,
    #[secondary_key]
    pub mailbox_id: u64,
    /// (mailbox, criterion, criterion_arg) uniqueness.
    #[secondary_key(unique)]
    pub dedup_key: String,
    pub criterion: FetchCriterion,
    pub criterion_arg: Option<String>,
    pub every: u64,
    pub period: IntervalUnit,
    pub enabled: bool,
    pub health: Health,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn routine_dedup_key(
    mailbox_id: u64,
    criterion: FetchCriterion,
    criterion_arg: Option<&str>,
) -> String {
    format!("{}:{}:{}", mailbox_id, criterion, criterion_arg.unwrap_or(""))
}

#[derive(Clone, Debug)]
pub struct RoutineCreateRequest {
    pub mailbox_id: u64,
    pub criterion: FetchCriterion,
    pub criterion_arg: Option<String>,
    pub every: u64,
    pub period: IntervalUnit,
    pub enabled: bool,
}

impl Routine {
    /// Validates and persists a new routine. The criterion must be served by
    /// the mailbox's account protocol, and (mailbox, criterion, arg) must be
    /// unique.
    pub async fn create(request: RoutineCreateRequest) -> MailVaultResult<Routine> {
        let mailbox = Mailbox::get(request.mailbox_id).await?;
        let account = Account::get(mailbox.account_id).await?;
        request
            .criterion
            .validate(account.protocol, request.criterion_arg.as_deref())?;
        if request.every == 0 {
            return Err(raise_error!(
                "Routine interval must be greater than 0".into(),
                ErrorCode::InvalidParameter
            ));
        }
        let dedup_key = routine_dedup_key(
            request.mailbox_id,
            request.criterion,
            request.criterion_arg.as_deref(),
        );
        if secondary_find_impl::<Routine>(
            DB_MANAGER.meta_db(),
            RoutineKey::dedup_key,
            dedup_key.clone(),
        )
        .await?
        .is_some()
        {
            return Err(raise_error!(
                format!(
                    "A routine with criterion {} already exists for this mailbox",
                    request.criterion
                ),
                ErrorCode::AlreadyExists
            ));
        }
        let routine = Routine {
            id: id!(64),
            uuid: uuid::Uuid::new_v4().to_string(),
            mailbox_id: request.mailbox_id,
            dedup_key,
            criterion: request.criterion,
            criterion_arg: request.criterion_arg,
            every: request.every,
            period: request.period,
            enabled: request.enabled,
            health: Health::Unknown,
            last_error: None,
            created_at: utc_now!(),
            updated_at: utc_now!(),
        };
        insert_impl(DB_MANAGER.meta_db(), routine.clone()).await?;
        Ok(routine)
    }

    pub async fn get(routine_id: u64) -> MailVaultResult<Routine> {
        Self::find(routine_id).await?.ok_or_else(|| {
            raise_error!(
                format!("Routine with ID '{routine_id}' not found"),
                ErrorCode::ResourceNotFound
            )
        })
    }

    pub async fn find(routine_id: u64) -> MailVaultResult<Option<Routine>> {
        crate::modules::database::async_find_impl(DB_MANAGER.meta_db(), routine_id).await
    }

    pub async fn find_by_uuid(uuid: &str) -> MailVaultResult<Option<Routine>> {
        secondary_find_impl::<Routine>(DB_MANAGER.meta_db(), RoutineKey::uuid, uuid.to_string())
            .await
    }

    pub async fn get_by_uuid(uuid: &str) -> MailVaultResult<Routine> {
        Self::find_by_uuid(uuid).await?.ok_or_else(|| {
            raise_error!(
                format!("Routine with uuid '{uuid}' not found"),
                ErrorCode::ResourceNotFound
            )
        })
    }

    pub async fn list_all() -> MailVaultResult<Vec<Routine>> {
        list_all_impl(DB_MANAGER.meta_db()).await
    }

    pub async fn list_for_mailbox(mailbox_id: u64) -> MailVaultResult<Vec<Routine>> {
        filter_by_secondary_key_impl(DB_MANAGER.meta_db(), RoutineKey::mailbox_id, mailbox_id)
            .await
    }

    pub fn interval(&self) -> Duration {
        self.period.to_duration(self.every)
    }

    pub async fn set_enabled(routine_id: u64, enabled: bool) -> MailVaultResult<Routine> {
        update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Routine>(routine_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Routine with ID '{routine_id}' not found"),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                updated.enabled = enabled;
                updated.updated_at = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Self::get(routine_id).await
    }

    pub async fn set_interval(
        routine_id: u64,
        every: u64,
        period: IntervalUnit,
    ) -> MailVaultResult<Routine> {
        if every == 0 {
            return Err(raise_error!(
                "Routine interval must be greater than 0".into(),
                ErrorCode::InvalidParameter
            ));
        }
        update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Routine>(routine_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Routine with ID '{routine_id}' not found"),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                updated.every = every;
                updated.period = period;
                updated.updated_at = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Self::get(routine_id).await
    }

    /// Sets the health flag; `Ok(true)` means the flag transitioned.
    pub async fn set_health(
        routine_id: u64,
        health: Health,
        last_error: Option<String>,
    ) -> MailVaultResult<bool> {
        let previous = update_impl(
            DB_MANAGER.meta_db(),
            move |rw| {
                rw.get()
                    .primary::<Routine>(routine_id)
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                    .ok_or_else(|| {
                        raise_error!(
                            format!("Routine with ID '{routine_id}' not found"),
                            ErrorCode::ResourceNotFound
                        )
                    })
            },
            move |current| {
                let mut updated = current.clone();
                updated.health = health;
                updated.last_error = last_error;
                updated.updated_at = utc_now!();
                Ok(updated)
            },
        )
        .await?;
        Ok(previous.health != health)
    }

    /// Deletes the routine, its scheduling record, and its worker.
    pub async fn delete(routine_id: u64) -> MailVaultResult<()> {
        let routine = Self::get(routine_id).await?;
        crate::modules::routine::registry::RoutineRegistry::unregister(&routine).await?;
        delete_impl(DB_MANAGER.meta_db(), move |rw| {
            rw.get()
                .primary::<Routine>(routine_id)
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::InternalError))?
                .ok_or_else(|| {
                    raise_error!(
                        format!("Routine '{}' not found during deletion.", routine_id),
                        ErrorCode::ResourceNotFound
                    )
                })
        })
        .await
    }
}
