use crate::modules::account::entity::Account;
use crate::modules::archive::writer::{archive_email, ArchiveOutcome};
use crate::modules::error::code::ErrorCode;
use crate::modules::error::{MailVaultError, MailVaultResult};
use crate::modules::fetcher::open_fetcher;
use crate::modules::health;
use crate::modules::logger::routine::RoutineLogWriter;
use crate::modules::mailbox::entity::Mailbox;
use crate::modules::message::parser::parse_email;
use crate::modules::routine::entity::Routine;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const TRANSIENT_RETRY_ATTEMPTS: u32 = 3;

/// What one cycle did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CycleReport {
    pub fetched: usize,
    pub archived: usize,
    pub duplicates: usize,
    pub discarded_spam: usize,
    pub failed: usize,
    pub duration_ms: u128,
}

/// Runs one full cycle of a routine — connect, fetch, parse, archive,
/// close — and applies the health rules for its outcome. This is the same
/// entry point for scheduled ticks and for the synchronous "test routine"
/// control.
pub async fn run_routine_cycle(routine: &Routine) -> MailVaultResult<CycleReport> {
    let mut log = RoutineLogWriter::open(&routine.uuid)?;
    log.log(&format!(
        "cycle start: criterion={} arg={}",
        routine.criterion,
        routine.criterion_arg.as_deref().unwrap_or("-")
    ));
    let started = Instant::now();

    let result = fetch_and_archive(routine).await;
    match &result {
        Ok(report) => {
            health::record_cycle_success(routine).await?;
            log.log(&format!(
                "cycle ok in {}ms: {} fetched, {} archived, {} duplicates, {} discarded, {} failed",
                started.elapsed().as_millis(),
                report.fetched,
                report.archived,
                report.duplicates,
                report.discarded_spam,
                report.failed
            ));
        }
        Err(error) => {
            health::record_cycle_failure(routine, error).await?;
            log.log(&format!(
                "cycle failed in {}ms: {}",
                started.elapsed().as_millis(),
                error.message()
            ));
        }
    }
    log.finish();

    result.map(|mut report| {
        report.duration_ms = started.elapsed().as_millis();
        report
    })
}

/// One-shot synchronous test of a routine on the caller's context, health
/// flags included. Returns (success, detail) like the control plane shows.
pub async fn test_routine(routine_uuid: &str) -> MailVaultResult<(bool, String)> {
    let routine = Routine::get_by_uuid(routine_uuid).await?;
    info!("Testing routine {} ...", routine.uuid);
    match run_routine_cycle(&routine).await {
        Ok(report) => Ok((
            true,
            format!(
                "{} fetched, {} archived, {} duplicates",
                report.fetched, report.archived, report.duplicates
            ),
        )),
        Err(error) => Ok((false, error.message().to_string())),
    }
}

async fn fetch_and_archive(routine: &Routine) -> MailVaultResult<CycleReport> {
    let mailbox = Mailbox::get(routine.mailbox_id).await?;
    let account = Account::get(mailbox.account_id).await?;
    info!(
        "Fetching emails with criterion {} from mailbox '{}' of '{}'",
        routine.criterion, mailbox.name, account.email
    );

    let mut fetcher = connect_with_transient_retry(&account).await?;
    let fetched = fetcher
        .fetch(&mailbox, routine.criterion, routine.criterion_arg.as_deref())
        .await;
    fetcher.close().await;
    let fetched = fetched?;

    let mut report = CycleReport {
        fetched: fetched.len(),
        ..Default::default()
    };
    // Messages are archived in the order the server returned them.
    for raw in &fetched {
        let parsed = match parse_email(raw) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!("Skipping unparsable fetched message: {}", error.message());
                report.failed += 1;
                continue;
            }
        };
        match archive_email(&mailbox, &parsed, raw).await? {
            ArchiveOutcome::Archived(_) => report.archived += 1,
            ArchiveOutcome::Duplicate(_) => report.duplicates += 1,
            ArchiveOutcome::DiscardedSpam => report.discarded_spam += 1,
        }
    }
    info!(
        "Successfully fetched emails: {} archived, {} duplicates",
        report.archived, report.duplicates
    );
    Ok(report)
}

/// Network hiccups on connect retry with backoff before they surface as
/// account failures.
async fn connect_with_transient_retry(
    account: &Account,
) -> MailVaultResult<crate::modules::fetcher::Fetcher> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match open_fetcher(account).await {
            Ok(fetcher) => return Ok(fetcher),
            Err(error) if is_transient(&error) && attempt < TRANSIENT_RETRY_ATTEMPTS => {
                warn!(
                    "Transient connect failure for '{}' (attempt {}): {}",
                    account.email,
                    attempt,
                    error.message()
                );
                tokio::time::sleep(Duration::from_millis(250 * 2u64.pow(attempt))).await;
            }
            Err(error) if is_transient(&error) => {
                return Err(error.upgrade(ErrorCode::MailAccount));
            }
            Err(error) => return Err(error),
        }
    }
}

fn is_transient(error: &MailVaultError) -> bool {
    matches!(
        error.code(),
        ErrorCode::Transient | ErrorCode::NetworkError | ErrorCode::ConnectionTimeout
    )
}
