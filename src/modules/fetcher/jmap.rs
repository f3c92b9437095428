use crate::modules::account::entity::Account;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::fetcher::criteria::FetchCriterion;
use crate::modules::fetcher::safe::{run_required_verb, VerbPolicy};
use crate::modules::mailbox::entity::{Mailbox, MailboxKind};
use crate::modules::settings::cli::SETTINGS;
use crate::{mailvault_version, raise_error};
use ahash::HashMap;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const JMAP_MAIL_CAPABILITY: &str = "urn:ietf:params:jmap:mail";

/// JMAP client: Email/query for enumeration, Email/get with a blobId
/// projection, direct blob downloads, and upload + Email/import for
/// restore. All requests run over one authenticated reqwest client.
pub struct JmapFetcher {
    account: Account,
    client: reqwest::Client,
    api_url: String,
    download_url: String,
    upload_url: String,
    jmap_account_id: String,
    /// Remote folder name -> JMAP mailbox id, filled by list_mailboxes.
    mailbox_ids: HashMap<String, String>,
}

impl JmapFetcher {
    pub async fn connect(account: &Account) -> MailVaultResult<Self> {
        let io_timeout = Duration::from_secs(account.timeout_secs);
        let accept_invalid_certs =
            SETTINGS.mailvault_allow_insecure_connections && account.allow_insecure_tls;
        let client = reqwest::ClientBuilder::new()
            .user_agent(format!("MailVault/{}", mailvault_version!()))
            .timeout(io_timeout)
            .connect_timeout(io_timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| {
                raise_error!(
                    format!("Failed to build HTTP client: {:#?}", e),
                    ErrorCode::InternalError
                )
            })?;

        let session_url = format!(
            "https://{}:{}/.well-known/jmap",
            account.host,
            account.effective_port()
        );
        debug!("Discovering JMAP session at {}", session_url);

        let secret = account.plain_secret()?;
        let session: Value = run_required_verb("session", VerbPolicy::Account, async {
            let response = client
                .get(&session_url)
                .basic_auth(&account.email, Some(&secret))
                .send()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))?;
            if !response.status().is_success() {
                return Err(raise_error!(
                    format!("JMAP session discovery returned {}", response.status()),
                    ErrorCode::BadServerResponse
                ));
            }
            response
                .json()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
        })
        .await?;

        let jmap_account_id = session["primaryAccounts"][JMAP_MAIL_CAPABILITY]
            .as_str()
            .ok_or_else(|| {
                raise_error!(
                    "JMAP session has no primary mail account".into(),
                    ErrorCode::MailAccount
                )
            })?
            .to_string();
        let api_url = required_session_url(&session, "apiUrl")?;
        let download_url = required_session_url(&session, "downloadUrl")?;
        let upload_url = required_session_url(&session, "uploadUrl")?;

        Ok(JmapFetcher {
            account: account.clone(),
            client,
            api_url,
            download_url,
            upload_url,
            jmap_account_id,
            mailbox_ids: HashMap::default(),
        })
    }

    /// One JMAP method call; returns the first method response arguments.
    async fn call(&self, method: &str, arguments: Value) -> MailVaultResult<Value> {
        let secret = self.account.plain_secret()?;
        let body = json!({
            "using": ["urn:ietf:params:jmap:core", JMAP_MAIL_CAPABILITY],
            "methodCalls": [[method, arguments, "0"]],
        });
        let response = self
            .client
            .post(&self.api_url)
            .basic_auth(&self.account.email, Some(&secret))
            .json(&body)
            .send()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))?;
        if !response.status().is_success() {
            return Err(raise_error!(
                format!("JMAP {} returned {}", method, response.status()),
                ErrorCode::BadServerResponse
            ));
        }
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))?;
        let (name, arguments) = parsed["methodResponses"][0]
            .as_array()
            .and_then(|call| Some((call.first()?.as_str()?, call.get(1)?.clone())))
            .ok_or_else(|| {
                raise_error!(
                    format!("Malformed JMAP response to {}", method),
                    ErrorCode::BadServerResponse
                )
            })?;
        if name == "error" {
            return Err(raise_error!(
                format!("JMAP {} failed: {}", method, arguments),
                ErrorCode::BadServerResponse
            ));
        }
        Ok(arguments)
    }

    pub async fn test(&mut self, mailbox: Option<&Mailbox>) -> MailVaultResult<()> {
        run_required_verb(
            "echo",
            VerbPolicy::Account,
            self.call("Core/echo", json!({"ping": true})),
        )
        .await?;
        if let Some(mailbox) = mailbox {
            if mailbox.account_id != self.account.id {
                return Err(raise_error!(
                    format!(
                        "Mailbox '{}' does not belong to account '{}'",
                        mailbox.name, self.account.email
                    ),
                    ErrorCode::InvalidParameter
                ));
            }
            self.remote_mailbox_id(&mailbox.name).await?;
        }
        Ok(())
    }

    pub async fn list_mailboxes(&mut self) -> MailVaultResult<Vec<(String, MailboxKind)>> {
        let response = run_required_verb(
            "mailbox_get",
            VerbPolicy::Account,
            self.call(
                "Mailbox/get",
                json!({
                    "accountId": self.jmap_account_id,
                    "ids": null,
                    "properties": ["id", "name", "role"],
                }),
            ),
        )
        .await?;

        let mut mailboxes = Vec::new();
        if let Some(list) = response["list"].as_array() {
            for entry in list {
                let Some(name) = entry["name"].as_str() else {
                    continue;
                };
                let Some(id) = entry["id"].as_str() else {
                    continue;
                };
                let kind = entry["role"]
                    .as_str()
                    .map(MailboxKind::parse)
                    .unwrap_or(MailboxKind::Custom);
                self.mailbox_ids.insert(name.to_string(), id.to_string());
                mailboxes.push((name.to_string(), kind));
            }
        }
        Ok(mailboxes)
    }

    async fn remote_mailbox_id(&mut self, name: &str) -> MailVaultResult<String> {
        if self.mailbox_ids.is_empty() {
            self.list_mailboxes().await?;
        }
        self.mailbox_ids.get(name).cloned().ok_or_else(|| {
            raise_error!(
                format!("Mailbox '{}' not found on the JMAP server", name),
                ErrorCode::Mailbox
            )
        })
    }

    pub async fn fetch(
        &mut self,
        mailbox: &Mailbox,
        criterion: FetchCriterion,
        criterion_arg: Option<&str>,
    ) -> MailVaultResult<Vec<Vec<u8>>> {
        if mailbox.account_id != self.account.id {
            return Err(raise_error!(
                format!(
                    "Mailbox '{}' does not belong to account '{}'",
                    mailbox.name, self.account.email
                ),
                ErrorCode::InvalidParameter
            ));
        }
        criterion.validate(self.account.protocol, criterion_arg)?;
        let remote_id = self.remote_mailbox_id(&mailbox.name).await?;
        let filter = to_jmap_filter(&remote_id, criterion, criterion_arg)?;

        let query = run_required_verb(
            "email_query",
            VerbPolicy::Mailbox,
            self.call(
                "Email/query",
                json!({
                    "accountId": self.jmap_account_id,
                    "filter": filter,
                    "sort": [{"property": "receivedAt", "isAscending": true}],
                }),
            ),
        )
        .await?;
        let ids: Vec<String> = query["ids"]
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        debug!(
            "Criterion {} matched {} messages in '{}'",
            criterion,
            ids.len(),
            mailbox.name
        );

        let mut messages = Vec::with_capacity(ids.len());
        for batch in ids.chunks(SETTINGS.mailvault_fetch_batch_size) {
            let got = run_required_verb(
                "email_get",
                VerbPolicy::Mailbox,
                self.call(
                    "Email/get",
                    json!({
                        "accountId": self.jmap_account_id,
                        "ids": batch,
                        "properties": ["id", "blobId"],
                    }),
                ),
            )
            .await?;
            let Some(list) = got["list"].as_array() else {
                continue;
            };
            for entry in list {
                let Some(blob_id) = entry["blobId"].as_str() else {
                    continue;
                };
                let raw = run_required_verb(
                    "blob_download",
                    VerbPolicy::Mailbox,
                    self.download_blob(blob_id),
                )
                .await?;
                messages.push(raw);
            }
        }
        Ok(messages)
    }

    async fn download_blob(&self, blob_id: &str) -> MailVaultResult<Vec<u8>> {
        let url = self
            .download_url
            .replace("{accountId}", &self.jmap_account_id)
            .replace("{blobId}", blob_id)
            .replace("{name}", "message.eml")
            .replace("{type}", "message/rfc822");
        let secret = self.account.plain_secret()?;
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.account.email, Some(&secret))
            .send()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))?;
        if !response.status().is_success() {
            return Err(raise_error!(
                format!("Blob download returned {}", response.status()),
                ErrorCode::BadServerResponse
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))?;
        Ok(bytes.to_vec())
    }

    /// Restore: upload the raw bytes as a blob, then Email/import into the
    /// target mailbox.
    pub async fn append(&mut self, mailbox: &Mailbox, raw: &[u8]) -> MailVaultResult<()> {
        let remote_id = self.remote_mailbox_id(&mailbox.name).await?;
        let upload_url = self
            .upload_url
            .replace("{accountId}", &self.jmap_account_id);
        let secret = self.account.plain_secret()?;
        let raw = raw.to_vec();

        let uploaded: Value = run_required_verb("blob_upload", VerbPolicy::Mailbox, async {
            let response = self
                .client
                .post(&upload_url)
                .basic_auth(&self.account.email, Some(&secret))
                .header("Content-Type", "message/rfc822")
                .body(raw)
                .send()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::NetworkError))?;
            if !response.status().is_success() {
                return Err(raise_error!(
                    format!("Blob upload returned {}", response.status()),
                    ErrorCode::BadServerResponse
                ));
            }
            response
                .json()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
        })
        .await?;

        let blob_id = uploaded["blobId"].as_str().ok_or_else(|| {
            raise_error!(
                "Blob upload response has no blobId".into(),
                ErrorCode::BadServerResponse
            )
        })?;

        let mut mailbox_ids = serde_json::Map::new();
        mailbox_ids.insert(remote_id, Value::Bool(true));
        run_required_verb(
            "email_import",
            VerbPolicy::Mailbox,
            self.call(
                "Email/import",
                json!({
                    "accountId": self.jmap_account_id,
                    "emails": {
                        "restored": {
                            "blobId": blob_id,
                            "mailboxIds": Value::Object(mailbox_ids),
                        }
                    },
                }),
            ),
        )
        .await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        // Stateless HTTP transport; nothing to tear down.
    }
}

fn required_session_url(session: &Value, key: &str) -> MailVaultResult<String> {
    session[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            raise_error!(
                format!("JMAP session object has no '{}'", key),
                ErrorCode::MailAccount
            )
        })
}

/// Compiles a criterion into a JMAP Email/query filter scoped to one
/// mailbox.
fn to_jmap_filter(
    remote_mailbox_id: &str,
    criterion: FetchCriterion,
    criterion_arg: Option<&str>,
) -> MailVaultResult<Value> {
    let mut filter = json!({"inMailbox": remote_mailbox_id});
    let condition = match criterion {
        FetchCriterion::All => None,
        FetchCriterion::Seen => Some(json!({"hasKeyword": "$seen"})),
        FetchCriterion::Unseen => Some(json!({"notKeyword": "$seen"})),
        FetchCriterion::Flagged => Some(json!({"hasKeyword": "$flagged"})),
        FetchCriterion::Unflagged => Some(json!({"notKeyword": "$flagged"})),
        FetchCriterion::Draft => Some(json!({"hasKeyword": "$draft"})),
        FetchCriterion::Undraft => Some(json!({"notKeyword": "$draft"})),
        FetchCriterion::Answered => Some(json!({"hasKeyword": "$answered"})),
        FetchCriterion::Unanswered => Some(json!({"notKeyword": "$answered"})),
        FetchCriterion::Subject => Some(json!({"subject": required(criterion, criterion_arg)?})),
        FetchCriterion::Body => Some(json!({"body": required(criterion, criterion_arg)?})),
        FetchCriterion::From => Some(json!({"from": required(criterion, criterion_arg)?})),
        FetchCriterion::Larger => Some(json!({"minSize": parse_size(criterion, criterion_arg)?})),
        FetchCriterion::Smaller => Some(json!({"maxSize": parse_size(criterion, criterion_arg)?})),
        FetchCriterion::Daily
        | FetchCriterion::Weekly
        | FetchCriterion::Monthly
        | FetchCriterion::Annually
        | FetchCriterion::SentSince => {
            let date = criterion.since_date(criterion_arg)?.ok_or_else(|| {
                raise_error!(
                    format!("Criterion {} has no reference date", criterion),
                    ErrorCode::InternalError
                )
            })?;
            Some(json!({"after": format!("{}T00:00:00Z", date)}))
        }
        other => {
            return Err(raise_error!(
                format!("Fetching criterion {} is not available for JMAP", other),
                ErrorCode::InvalidParameter
            ))
        }
    };
    if let Some(condition) = condition {
        for (key, value) in condition.as_object().into_iter().flatten() {
            filter[key] = value.clone();
        }
    }
    Ok(filter)
}

fn required<'a>(
    criterion: FetchCriterion,
    argument: Option<&'a str>,
) -> MailVaultResult<&'a str> {
    argument.filter(|a| !a.is_empty()).ok_or_else(|| {
        raise_error!(
            format!("Fetching criterion {} requires an argument", criterion),
            ErrorCode::InvalidParameter
        )
    })
}

fn parse_size(criterion: FetchCriterion, argument: Option<&str>) -> MailVaultResult<u64> {
    required(criterion, argument)?.parse().map_err(|_| {
        raise_error!(
            format!("Criterion {} requires a byte count argument", criterion),
            ErrorCode::InvalidParameter
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jmap_filter_scopes_to_mailbox() {
        let filter = to_jmap_filter("mb-1", FetchCriterion::All, None).unwrap();
        assert_eq!(filter, json!({"inMailbox": "mb-1"}));
    }

    #[test]
    fn test_jmap_flag_criteria_map_to_keywords() {
        let filter = to_jmap_filter("mb-1", FetchCriterion::Unseen, None).unwrap();
        assert_eq!(filter["notKeyword"], "$seen");
        let filter = to_jmap_filter("mb-1", FetchCriterion::Flagged, None).unwrap();
        assert_eq!(filter["hasKeyword"], "$flagged");
    }

    #[test]
    fn test_jmap_size_and_text_criteria() {
        let filter = to_jmap_filter("mb-1", FetchCriterion::Larger, Some("2048")).unwrap();
        assert_eq!(filter["minSize"], 2048);
        let filter = to_jmap_filter("mb-1", FetchCriterion::Subject, Some("hello")).unwrap();
        assert_eq!(filter["subject"], "hello");
    }

    #[test]
    fn test_jmap_rejects_unsupported_criteria() {
        assert!(to_jmap_filter("mb-1", FetchCriterion::Recent, None).is_err());
        assert!(to_jmap_filter("mb-1", FetchCriterion::Keyword, Some("x")).is_err());
    }

    #[test]
    fn test_jmap_date_windows_become_after_filters() {
        let filter = to_jmap_filter("mb-1", FetchCriterion::SentSince, Some("2024-03-05")).unwrap();
        assert_eq!(filter["after"], "2024-03-05T00:00:00Z");
    }
}
