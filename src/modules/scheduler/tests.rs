use crate::modules::account::entity::{Account, AccountCreateRequest, MailProtocol};
use crate::modules::fetcher::criteria::FetchCriterion;
use crate::modules::mailbox::entity::{Mailbox, MailboxKind};
use crate::modules::routine::entity::{IntervalUnit, Routine, RoutineCreateRequest};
use crate::modules::routine::registry::RoutineRegistry;
use crate::modules::scheduler::store::{ScheduleEntry, FETCH_EMAILS_TASK};
use crate::modules::scheduler::RoutineScheduler;
use std::time::Duration;

async fn routine_fixture(owner_id: u64, email: &str, enabled: bool) -> Routine {
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
    Routine::create(RoutineCreateRequest {
        mailbox_id: mailbox.id,
        criterion: FetchCriterion::All,
        criterion_arg: None,
        every: 1,
        period: IntervalUnit::Hours,
        enabled,
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_register_persists_task_envelope() {
    let routine = routine_fixture(91, "envelope@example.test", false).await;
    RoutineRegistry::register(&routine).await.unwrap();

    let entry = ScheduleEntry::find(&routine.uuid).await.unwrap().unwrap();
    assert_eq!(entry.task, FETCH_EMAILS_TASK);
    // The routine uuid rides in args; existing records reference it.
    assert_eq!(entry.args, vec![routine.uuid.clone()]);
    assert_eq!(entry.every, 1);
    assert_eq!(entry.period, IntervalUnit::Hours);
    assert!(!entry.enabled);

    // Registering twice is idempotent.
    RoutineRegistry::register(&routine).await.unwrap();
    assert!(ScheduleEntry::find(&routine.uuid).await.unwrap().is_some());

    RoutineRegistry::unregister(&routine).await.unwrap();
    assert!(ScheduleEntry::find(&routine.uuid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_disabled_routine_is_not_running() {
    let routine = routine_fixture(92, "disabled@example.test", false).await;
    RoutineRegistry::register(&routine).await.unwrap();
    assert!(!RoutineRegistry::is_running(&routine));
    RoutineRegistry::unregister(&routine).await.unwrap();
}

#[tokio::test]
async fn test_worker_for_disabled_routine_exits_on_first_tick() {
    let routine = routine_fixture(93, "exits@example.test", false).await;
    // Force-start a worker even though the routine is disabled; the first
    // tick notices and the worker leaves.
    let handle = super::worker::spawn_worker(
        routine.id,
        routine.uuid.clone(),
        Duration::from_millis(10),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(handle.is_finished());
    RoutineScheduler::get().stop_routine(&routine.uuid).await;
}

#[tokio::test]
async fn test_stop_routine_cancels_worker() {
    let routine = routine_fixture(94, "stoppable@example.test", true).await;
    RoutineRegistry::register(&routine).await.unwrap();
    assert!(RoutineRegistry::is_running(&routine));

    RoutineScheduler::get().stop_routine(&routine.uuid).await;
    assert!(!RoutineRegistry::is_running(&routine));
    RoutineRegistry::unregister(&routine).await.unwrap();
}

#[tokio::test]
async fn test_healthcheck_flags_enabled_routine_without_worker() {
    let routine = routine_fixture(95, "drifted@example.test", true).await;
    // Persist the enabled envelope but never start the worker.
    ScheduleEntry::for_routine(&routine).upsert().await.unwrap();
    assert!(!RoutineScheduler::get().healthcheck().await.unwrap());
    ScheduleEntry::delete(&routine.uuid).await.unwrap();
}

#[tokio::test]
async fn test_update_routine_bounces_worker_on_disable() {
    let mut routine = routine_fixture(96, "bounce@example.test", true).await;
    RoutineRegistry::register(&routine).await.unwrap();
    assert!(RoutineRegistry::is_running(&routine));

    routine = Routine::set_enabled(routine.id, false).await.unwrap();
    RoutineRegistry::update(&routine).await.unwrap();
    assert!(!RoutineRegistry::is_running(&routine));
    RoutineRegistry::unregister(&routine).await.unwrap();
}
