use crate::modules::account::entity::Account;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::fetcher::criteria::FetchCriterion;
use crate::modules::fetcher::safe::{run_required_verb, run_verb, VerbPolicy};
use crate::modules::fetcher::session::SessionStream;
use crate::modules::mailbox::entity::{Mailbox, MailboxKind};
use crate::modules::settings::cli::SETTINGS;
use crate::modules::utils::net::{
    establish_tcp_connection_with_timeout, establish_tls_connection, resolve_to_socket_addr,
};
use crate::{decode_mailbox_name, encode_mailbox_name, raise_error};
use async_imap::types::{Name, NameAttribute};
use async_imap::Session;
use futures::TryStreamExt;
use itertools::Itertools;
use std::time::Duration;
use tokio::io::BufWriter;
use tracing::debug;

/// IMAP4 client session. Also serves the Exchange protocol tag, which runs
/// with IMAP semantics until it has a client of its own.
pub struct ImapFetcher {
    account: Account,
    session: Session<Box<dyn SessionStream>>,
    capabilities: Vec<String>,
}

/// SASL PLAIN fallback for credentials LOGIN cannot carry: IMAP LOGIN
/// rejects non-ASCII bytes.
struct PlainAuthenticator {
    user: String,
    secret: String,
}

impl async_imap::Authenticator for PlainAuthenticator {
    type Response = String;

    fn process(&mut self, _data: &[u8]) -> Self::Response {
        format!("\0{}\0{}", self.user, self.secret)
    }
}

impl ImapFetcher {
    pub async fn connect(account: &Account) -> MailVaultResult<Self> {
        let io_timeout = Duration::from_secs(account.timeout_secs);
        let address = resolve_to_socket_addr(&account.host, account.effective_port())
            .map_err(|e| e.upgrade(ErrorCode::MailAccount))?;
        debug!("Attempting IMAP connection to {} ({address})", account.host);

        let use_tls = account.protocol.uses_tls();
        let accept_invalid_certs =
            SETTINGS.mailvault_allow_insecure_connections && account.allow_insecure_tls;

        let session_stream: Box<dyn SessionStream> = if use_tls {
            let tls_stream = establish_tls_connection(
                address,
                &account.host,
                io_timeout,
                accept_invalid_certs,
            )
            .await
            .map_err(|e| e.upgrade(ErrorCode::MailAccount))?;
            Box::new(BufWriter::new(tls_stream))
        } else {
            let tcp_stream = establish_tcp_connection_with_timeout(address, io_timeout)
                .await
                .map_err(|e| e.upgrade(ErrorCode::MailAccount))?;
            Box::new(BufWriter::new(tcp_stream))
        };

        let mut client = async_imap::Client::new(session_stream);
        client
            .read_response()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::MailAccount))?
            .ok_or_else(|| {
                raise_error!("failed to read greeting".into(), ErrorCode::MailAccount)
            })?;

        let secret = account.plain_secret()?;
        let email = account.email.clone();
        let session = run_required_verb("login", VerbPolicy::Account, async {
            if email.is_ascii() && secret.is_ascii() {
                client.login(&email, &secret).await.map_err(|(e, _)| {
                    raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse)
                })
            } else {
                client
                    .authenticate(
                        "PLAIN",
                        PlainAuthenticator {
                            user: email.clone(),
                            secret: secret.clone(),
                        },
                    )
                    .await
                    .map_err(|(e, _)| {
                        raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse)
                    })
            }
        })
        .await?;

        let mut fetcher = ImapFetcher {
            account: account.clone(),
            session,
            capabilities: Vec::new(),
        };
        fetcher.capabilities = fetcher.fetch_capabilities().await?;
        Ok(fetcher)
    }

    async fn fetch_capabilities(&mut self) -> MailVaultResult<Vec<String>> {
        let capabilities = run_required_verb("capability", VerbPolicy::Account, async {
            self.session
                .capabilities()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
        })
        .await?;
        Ok(capabilities
            .iter()
            .map(|capability| match capability {
                async_imap::types::Capability::Imap4rev1 => "IMAP4rev1".into(),
                async_imap::types::Capability::Auth(v) => format!("AUTH={}", v),
                async_imap::types::Capability::Atom(v) => v.to_string(),
            })
            .collect())
    }

    fn supports_sort(&self) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case("SORT"))
    }

    fn check_ownership(&self, mailbox: &Mailbox) -> MailVaultResult<()> {
        if mailbox.account_id != self.account.id {
            // A caller handed us a foreign mailbox; this is a programming
            // error, not a remote one.
            return Err(raise_error!(
                format!(
                    "Mailbox '{}' does not belong to account '{}'",
                    mailbox.name, self.account.email
                ),
                ErrorCode::InvalidParameter
            ));
        }
        Ok(())
    }

    pub async fn test(&mut self, mailbox: Option<&Mailbox>) -> MailVaultResult<()> {
        run_required_verb("noop", VerbPolicy::Account, async {
            self.session
                .noop()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
        })
        .await?;

        if let Some(mailbox) = mailbox {
            self.check_ownership(mailbox)?;
            let encoded = encode_mailbox_name!(&mailbox.name);
            run_required_verb("examine", VerbPolicy::Mailbox, async {
                self.session
                    .examine(&encoded)
                    .await
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
            })
            .await?;
            run_required_verb("check", VerbPolicy::Mailbox, async {
                self.session
                    .check()
                    .await
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
            })
            .await?;
            self.unselect().await;
        }
        Ok(())
    }

    pub async fn list_mailboxes(&mut self) -> MailVaultResult<Vec<(String, MailboxKind)>> {
        let names = run_required_verb("list", VerbPolicy::Account, async {
            let stream = self
                .session
                .list(Some(""), Some("*"))
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))?;
            stream
                .try_collect::<Vec<Name>>()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
        })
        .await?;

        let mut mailboxes = Vec::with_capacity(names.len());
        for name in &names {
            if name
                .attributes()
                .iter()
                .any(|attr| matches!(attr, NameAttribute::NoSelect))
            {
                continue;
            }
            let decoded = decode_mailbox_name!(name.name());
            let kind = mailbox_kind_from_name(name);
            mailboxes.push((decoded, kind));
        }
        Ok(mailboxes)
    }

    pub async fn fetch(
        &mut self,
        mailbox: &Mailbox,
        criterion: FetchCriterion,
        criterion_arg: Option<&str>,
    ) -> MailVaultResult<Vec<Vec<u8>>> {
        self.check_ownership(mailbox)?;
        criterion.validate(self.account.protocol, criterion_arg)?;
        let query = criterion.to_imap_query(criterion_arg)?;
        let encoded = encode_mailbox_name!(&mailbox.name);

        run_required_verb("examine", VerbPolicy::Mailbox, async {
            self.session
                .examine(&encoded)
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
        })
        .await?;

        let uids = self.enumerate_uids(&query).await?;
        debug!(
            "Criterion {} matched {} messages in '{}'",
            criterion,
            uids.len(),
            mailbox.name
        );

        let mut messages = Vec::with_capacity(uids.len());
        for batch in uids.chunks(SETTINGS.mailvault_fetch_batch_size) {
            let uid_set = batch.iter().map(u32::to_string).join(",");
            let fetches = run_required_verb("uid_fetch", VerbPolicy::Mailbox, async {
                let stream = self
                    .session
                    .uid_fetch(&uid_set, "(UID BODY.PEEK[])")
                    .await
                    .map_err(|e| {
                        raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse)
                    })?;
                stream.try_collect::<Vec<_>>().await.map_err(|e| {
                    raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse)
                })
            })
            .await?;
            for fetch in &fetches {
                if let Some(body) = fetch.body() {
                    messages.push(body.to_vec());
                }
            }
        }

        self.unselect().await;
        Ok(messages)
    }

    /// UIDs matching the query. Servers advertising SORT return them
    /// oldest-first by sent date; otherwise SEARCH results are sorted by
    /// UID, which approximates arrival order.
    async fn enumerate_uids(&mut self, query: &str) -> MailVaultResult<Vec<u32>> {
        if self.supports_sort() {
            let command = format!("UID SORT (DATE) UTF-8 {}", query);
            let uids = run_required_verb("uid_sort", VerbPolicy::Mailbox, async {
                let id = self
                    .session
                    .run_command(&command)
                    .await
                    .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))?;
                read_sort_response(&mut self.session, &id).await
            })
            .await?;
            return Ok(parse_sort_response(
                format!("* SORT {}", uids.iter().join(" ")).as_bytes(),
            ));
        }
        let uids = run_required_verb("uid_search", VerbPolicy::Mailbox, async {
            self.session
                .uid_search(query)
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
        })
        .await?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    pub async fn append(&mut self, mailbox: &Mailbox, raw: &[u8]) -> MailVaultResult<()> {
        self.check_ownership(mailbox)?;
        let encoded = encode_mailbox_name!(&mailbox.name);
        run_required_verb("append", VerbPolicy::Mailbox, async {
            self.session
                .append(&encoded, None, None, raw)
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
        })
        .await?;
        Ok(())
    }

    async fn unselect(&mut self) {
        let _ = run_verb("unselect", VerbPolicy::Swallow, async {
            self.session
                .run_command_and_check_ok("UNSELECT")
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
        })
        .await;
    }

    pub async fn close(&mut self) {
        let _ = run_verb("logout", VerbPolicy::Swallow, async {
            self.session
                .logout()
                .await
                .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))
        })
        .await;
    }
}

fn mailbox_kind_from_name(name: &Name) -> MailboxKind {
    for attribute in name.attributes() {
        let kind = match attribute {
            NameAttribute::Junk => MailboxKind::Junk,
            NameAttribute::Sent => MailboxKind::Sent,
            NameAttribute::Drafts => MailboxKind::Drafts,
            NameAttribute::Trash => MailboxKind::Trash,
            NameAttribute::All | NameAttribute::Archive => MailboxKind::Archive,
            NameAttribute::Extension(extension) => MailboxKind::parse(extension.as_ref()),
            _ => MailboxKind::Custom,
        };
        if kind != MailboxKind::Custom {
            return kind;
        }
    }
    MailboxKind::parse(name.name())
}

/// Drains untagged `SORT` data from the connection until the tagged
/// response for `id` arrives, preserving server order.
async fn read_sort_response(
    session: &mut Session<Box<dyn SessionStream>>,
    id: &async_imap::imap_proto::RequestId,
) -> MailVaultResult<Vec<u32>> {
    use async_imap::imap_proto::{MailboxDatum, Response};
    let mut uids = Vec::new();
    loop {
        let resp = session
            .read_response()
            .await
            .map_err(|e| raise_error!(format!("{:#?}", e), ErrorCode::BadServerResponse))?
            .ok_or_else(|| {
                raise_error!(
                    "connection closed while waiting for SORT response".into(),
                    ErrorCode::BadServerResponse
                )
            })?;
        match resp.parsed() {
            Response::MailboxData(MailboxDatum::Sort(ids)) => uids.extend(ids.iter().copied()),
            Response::Done { tag, .. } if tag == id => break,
            _ => {}
        }
    }
    Ok(uids)
}

/// Extracts UIDs from the untagged `* SORT ...` response lines, preserving
/// server order.
fn parse_sort_response(response: &[u8]) -> Vec<u32> {
    let text = String::from_utf8_lossy(response);
    let mut uids = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start_matches('*').trim_start();
        if let Some(rest) = trimmed.strip_prefix("SORT") {
            uids.extend(
                rest.split_whitespace()
                    .filter_map(|token| token.parse::<u32>().ok()),
            );
        }
    }
    uids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sort_response_preserves_server_order() {
        let response = b"* SORT 7 3 42 5\r\nA2 OK SORT completed\r\n";
        assert_eq!(parse_sort_response(response), vec![7, 3, 42, 5]);
    }

    #[test]
    fn test_parse_sort_response_handles_empty_result() {
        let response = b"* SORT\r\nA2 OK SORT completed\r\n";
        assert!(parse_sort_response(response).is_empty());
    }
}
