use crate::modules::account::entity::Account;
use crate::modules::error::{code::ErrorCode, MailVaultError, MailVaultResult};
use crate::modules::mailbox::entity::Mailbox;
use crate::modules::routine::entity::Routine;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Tri-state health flag shared by accounts, mailboxes and routines.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Health {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Health::Unknown => "unknown",
            Health::Healthy => "healthy",
            Health::Unhealthy => "unhealthy",
        };
        write!(f, "{}", tag)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
enum Level {
    Account,
    Mailbox,
    Routine,
}

// Flag writes for one entity are serialized; locks are taken in the fixed
// order account -> mailbox -> routine to keep concurrent cycles deadlock
// free.
static HEALTH_LOCKS: LazyLock<DashMap<(Level, u64), Arc<Mutex<()>>>> = LazyLock::new(DashMap::new);

fn entity_lock(level: Level, id: u64) -> Arc<Mutex<()>> {
    HEALTH_LOCKS
        .entry((level, id))
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// A successful cycle proves the whole chain works: routine, mailbox and
/// account all flip healthy.
pub async fn record_cycle_success(routine: &Routine) -> MailVaultResult<()> {
    let mailbox = Mailbox::get(routine.mailbox_id).await?;

    let account_lock = entity_lock(Level::Account, mailbox.account_id);
    let mailbox_lock = entity_lock(Level::Mailbox, mailbox.id);
    let routine_lock = entity_lock(Level::Routine, routine.id);
    let _account_guard = account_lock.lock().await;
    let _mailbox_guard = mailbox_lock.lock().await;
    let _routine_guard = routine_lock.lock().await;

    if Routine::set_health(routine.id, Health::Healthy, None).await? {
        debug!("Routine {} flipped to healthy", routine.uuid);
    }
    let mailbox_flipped = Mailbox::set_health(mailbox.id, Health::Healthy, None).await?;
    if mailbox_flipped {
        debug!("Mailbox '{}' flipped to healthy", mailbox.name);
    }
    // A working mailbox proves the account works.
    if Account::set_health(mailbox.account_id, Health::Healthy, None).await? {
        info!("Account {} recovered to healthy", mailbox.account_id);
    }
    Ok(())
}

/// Applies the failure rules of the three-level hierarchy for one failed
/// cycle. Which levels downgrade depends on the error code.
pub async fn record_cycle_failure(
    routine: &Routine,
    error: &MailVaultError,
) -> MailVaultResult<()> {
    let message = error.message().to_string();
    match error.code() {
        ErrorCode::MailAccount => {
            let mailbox = Mailbox::get(routine.mailbox_id).await?;
            mark_account_unhealthy(mailbox.account_id, &message).await
        }
        ErrorCode::Mailbox => {
            let mailbox = Mailbox::get(routine.mailbox_id).await?;
            let mailbox_lock = entity_lock(Level::Mailbox, mailbox.id);
            let routine_lock = entity_lock(Level::Routine, routine.id);
            let _mailbox_guard = mailbox_lock.lock().await;
            let _routine_guard = routine_lock.lock().await;
            Mailbox::set_health(mailbox.id, Health::Unhealthy, Some(message.clone())).await?;
            Routine::set_health(routine.id, Health::Unhealthy, Some(message)).await?;
            Ok(())
        }
        _ => {
            let routine_lock = entity_lock(Level::Routine, routine.id);
            let _routine_guard = routine_lock.lock().await;
            Routine::set_health(routine.id, Health::Unhealthy, Some(message)).await?;
            Ok(())
        }
    }
}

/// Downgrades an account; on the unhealthy transition every mailbox and
/// routine below it cascades in the same step. The cascade runs once per
/// transition, never on repeated failures.
pub async fn mark_account_unhealthy(account_id: u64, message: &str) -> MailVaultResult<()> {
    let account_lock = entity_lock(Level::Account, account_id);
    let _account_guard = account_lock.lock().await;

    let flipped =
        Account::set_health(account_id, Health::Unhealthy, Some(message.to_string())).await?;
    if !flipped {
        return Ok(());
    }
    info!("Account {} flipped to unhealthy, cascading", account_id);
    for mailbox in Mailbox::list_for_account(account_id).await? {
        let mailbox_lock = entity_lock(Level::Mailbox, mailbox.id);
        let _mailbox_guard = mailbox_lock.lock().await;
        Mailbox::set_health(mailbox.id, Health::Unhealthy, Some(message.to_string())).await?;
        for routine in Routine::list_for_mailbox(mailbox.id).await? {
            let routine_lock = entity_lock(Level::Routine, routine.id);
            let _routine_guard = routine_lock.lock().await;
            Routine::set_health(routine.id, Health::Unhealthy, Some(message.to_string())).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::account::entity::{AccountCreateRequest, MailProtocol};
    use crate::modules::fetcher::criteria::FetchCriterion;
    use crate::modules::mailbox::entity::MailboxKind;
    use crate::modules::routine::entity::{IntervalUnit, RoutineCreateRequest};
    use crate::raise_error;

    async fn build_fixture(owner_id: u64, email: &str) -> (Account, Mailbox, Routine) {
        let account = Account::create(AccountCreateRequest {
            owner_id,
            email: email.into(),
            secret: "pw".into(),
            host: "imap.example.test".into(),
            protocol: MailProtocol::ImapTls,
            ..Default::default()
        })
        .await
        .unwrap();
        let mailbox = Mailbox::new(account.id, "INBOX", MailboxKind::Inbox);
        mailbox.save().await.unwrap();
        let routine = Routine::create(RoutineCreateRequest {
            mailbox_id: mailbox.id,
            criterion: FetchCriterion::All,
            criterion_arg: None,
            every: 60,
            period: IntervalUnit::Seconds,
            enabled: true,
        })
        .await
        .unwrap();
        (account, mailbox, routine)
    }

    #[tokio::test]
    async fn test_success_heals_all_three_levels() {
        let (account, mailbox, routine) = build_fixture(21, "heal@example.test").await;
        mark_account_unhealthy(account.id, "login refused").await.unwrap();

        record_cycle_success(&routine).await.unwrap();

        assert_eq!(Account::get(account.id).await.unwrap().health, Health::Healthy);
        assert_eq!(Mailbox::get(mailbox.id).await.unwrap().health, Health::Healthy);
        assert_eq!(Routine::get(routine.id).await.unwrap().health, Health::Healthy);
    }

    #[tokio::test]
    async fn test_mailbox_failure_leaves_account_untouched() {
        let (account, mailbox, routine) = build_fixture(22, "mbfail@example.test").await;
        record_cycle_success(&routine).await.unwrap();

        let error = raise_error!("SELECT INBOX: NO no such folder".into(), ErrorCode::Mailbox);
        record_cycle_failure(&routine, &error).await.unwrap();

        assert_eq!(Account::get(account.id).await.unwrap().health, Health::Healthy);
        let mailbox = Mailbox::get(mailbox.id).await.unwrap();
        assert_eq!(mailbox.health, Health::Unhealthy);
        assert!(mailbox.last_error.unwrap().contains("NO no such folder"));
        let routine = Routine::get(routine.id).await.unwrap();
        assert_eq!(routine.health, Health::Unhealthy);
        assert!(routine.last_error.unwrap().contains("NO no such folder"));
    }

    #[tokio::test]
    async fn test_account_failure_cascades_down_once() {
        let (account, mailbox, routine) = build_fixture(23, "acfail@example.test").await;
        record_cycle_success(&routine).await.unwrap();

        let error = raise_error!("login refused".into(), ErrorCode::MailAccount);
        record_cycle_failure(&routine, &error).await.unwrap();

        assert_eq!(
            Account::get(account.id).await.unwrap().health,
            Health::Unhealthy
        );
        assert_eq!(
            Mailbox::get(mailbox.id).await.unwrap().health,
            Health::Unhealthy
        );
        assert_eq!(
            Routine::get(routine.id).await.unwrap().health,
            Health::Unhealthy
        );

        // Heal only the routine, then fail the account again: the account
        // flag does not transition, so no cascade runs and the routine keeps
        // its healthy flag.
        Routine::set_health(routine.id, Health::Healthy, None).await.unwrap();
        record_cycle_failure(&routine, &error).await.unwrap();
        assert_eq!(
            Routine::get(routine.id).await.unwrap().health,
            Health::Healthy
        );
    }

    #[tokio::test]
    async fn test_unexpected_failure_downgrades_routine_only() {
        let (account, mailbox, routine) = build_fixture(24, "oops@example.test").await;
        record_cycle_success(&routine).await.unwrap();

        let error = raise_error!("blob storage full".into(), ErrorCode::InternalError);
        record_cycle_failure(&routine, &error).await.unwrap();

        assert_eq!(Account::get(account.id).await.unwrap().health, Health::Healthy);
        assert_eq!(Mailbox::get(mailbox.id).await.unwrap().health, Health::Healthy);
        assert_eq!(
            Routine::get(routine.id).await.unwrap().health,
            Health::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_account_recovery_does_not_heal_mailboxes() {
        let (account, mailbox, routine) = build_fixture(25, "partial@example.test").await;
        mark_account_unhealthy(account.id, "down").await.unwrap();

        // Direct account heal (e.g. after an account-level test) must not
        // flip the mailbox or routine back.
        Account::set_health(account.id, Health::Healthy, None).await.unwrap();
        assert_eq!(
            Mailbox::get(mailbox.id).await.unwrap().health,
            Health::Unhealthy
        );
        assert_eq!(
            Routine::get(routine.id).await.unwrap().health,
            Health::Unhealthy
        );
    }
}
