use crate::modules::error::{code::ErrorCode, MailVaultError, MailVaultResult};
use std::future::Future;
use tracing::{debug, error};

/// Which error kind a failed protocol verb raises.
///
/// Teardown verbs use `Swallow`: a failed LOGOUT or QUIT must never throw
/// away the messages a completed fetch already produced.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VerbPolicy {
    /// Credential/connection-layer verbs: login, list, noop.
    Account,
    /// Folder-scoped verbs: select, fetch, append.
    Mailbox,
    /// Teardown verbs: logout, quit, unselect. Log and move on.
    Swallow,
}

/// Uniform wrapper around one protocol verb.
///
/// Protocol clients differ in whether faults surface as errors or as bad
/// status strings; the verbs passed in here normalize status mismatches
/// into `BadServerResponse` errors, and this wrapper flattens both paths:
/// log, then raise the declared kind or swallow. The fetcher bodies stay
/// straight-line.
pub async fn run_verb<T, F>(
    verb: &str,
    policy: VerbPolicy,
    action: F,
) -> MailVaultResult<Option<T>>
where
    F: Future<Output = MailVaultResult<T>>,
{
    match action.await {
        Ok(response) => {
            debug!("Server responded to {} as expected.", verb);
            Ok(Some(response))
        }
        Err(source) => {
            error!("Error during {}: {}", verb, source.message());
            match policy {
                VerbPolicy::Account => Err(tag_verb_error(verb, source, ErrorCode::MailAccount)),
                VerbPolicy::Mailbox => Err(tag_verb_error(verb, source, ErrorCode::Mailbox)),
                VerbPolicy::Swallow => Ok(None),
            }
        }
    }
}

/// `run_verb` for verbs whose response the caller needs: the swallow
/// sentinel is not an option here, so the result is unwrapped.
pub async fn run_required_verb<T, F>(
    verb: &str,
    policy: VerbPolicy,
    action: F,
) -> MailVaultResult<T>
where
    F: Future<Output = MailVaultResult<T>>,
{
    run_verb(verb, policy, action).await?.ok_or_else(|| {
        crate::raise_error!(
            format!("{} returned no result", verb),
            ErrorCode::InternalError
        )
    })
}

fn tag_verb_error(verb: &str, source: MailVaultError, code: ErrorCode) -> MailVaultError {
    // The original text (including any BadServerResponse status line) is
    // chained into the message; the code decides health propagation.
    crate::raise_error!(format!("{}: {}", verb, source.message()), code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raise_error;

    #[tokio::test]
    async fn test_success_returns_response_unchanged() {
        let result = run_verb("noop", VerbPolicy::Account, async { Ok(42u32) })
            .await
            .unwrap();
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_account_policy_tags_failures_as_account_errors() {
        let result: MailVaultResult<Option<()>> = run_verb("login", VerbPolicy::Account, async {
            Err(raise_error!(
                "BAD invalid credentials".into(),
                ErrorCode::BadServerResponse
            ))
        })
        .await;
        let error = result.unwrap_err();
        assert_eq!(error.code(), ErrorCode::MailAccount);
        assert!(error.message().contains("login"));
        assert!(error.message().contains("BAD invalid credentials"));
    }

    #[tokio::test]
    async fn test_mailbox_policy_tags_failures_as_mailbox_errors() {
        let result: MailVaultResult<Option<()>> = run_verb("select", VerbPolicy::Mailbox, async {
            Err(raise_error!(
                "NO no such mailbox".into(),
                ErrorCode::BadServerResponse
            ))
        })
        .await;
        let error = result.unwrap_err();
        assert_eq!(error.code(), ErrorCode::Mailbox);
        assert!(error.message().contains("NO no such mailbox"));
    }

    #[tokio::test]
    async fn test_swallow_policy_returns_no_result() {
        let result: MailVaultResult<Option<()>> = run_verb("logout", VerbPolicy::Swallow, async {
            Err(raise_error!(
                "connection reset".into(),
                ErrorCode::NetworkError
            ))
        })
        .await;
        assert_eq!(result.unwrap(), None);
    }
}
