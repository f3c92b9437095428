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
use crate::raise_error;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// POP3 name of the single folder the protocol exposes.
pub const POP3_INBOX: &str = "INBOX";

/// POP3 client session: USER/PASS, STAT, LIST, RETR, QUIT.
///
/// POP3 has neither folders nor flags: the whole account is one inbox and
/// every cycle retrieves all messages, leaving duplicate suppression to the
/// archive writer's (mailbox, message-id) uniqueness.
pub struct Pop3Fetcher {
    account: Account,
    stream: Box<dyn SessionStream>,
    read_buf: Vec<u8>,
}

impl Pop3Fetcher {
    pub async fn connect(account: &Account) -> MailVaultResult<Self> {
        let io_timeout = Duration::from_secs(account.timeout_secs);
        let address = resolve_to_socket_addr(&account.host, account.effective_port())
            .map_err(|e| e.upgrade(ErrorCode::MailAccount))?;
        debug!("Attempting POP3 connection to {} ({address})", account.host);

        let use_tls = account.protocol.uses_tls();
        let accept_invalid_certs =
            SETTINGS.mailvault_allow_insecure_connections && account.allow_insecure_tls;

        let stream: Box<dyn SessionStream> = if use_tls {
            Box::new(
                establish_tls_connection(address, &account.host, io_timeout, accept_invalid_certs)
                    .await
                    .map_err(|e| e.upgrade(ErrorCode::MailAccount))?,
            )
        } else {
            Box::new(
                establish_tcp_connection_with_timeout(address, io_timeout)
                    .await
                    .map_err(|e| e.upgrade(ErrorCode::MailAccount))?,
            )
        };

        let mut fetcher = Pop3Fetcher {
            account: account.clone(),
            stream,
            read_buf: Vec::with_capacity(4096),
        };

        // Greeting, then USER/PASS; all failures here are account-level.
        let greeting = fetcher.read_line().await?;
        check_ok(&greeting).map_err(|e| e.upgrade(ErrorCode::MailAccount))?;

        let secret = fetcher.account.plain_secret()?;
        let user_command = format!("USER {}", fetcher.account.email);
        run_required_verb("user", VerbPolicy::Account, fetcher.command(&user_command)).await?;
        let pass_command = format!("PASS {}", secret);
        run_required_verb("pass", VerbPolicy::Account, fetcher.command(&pass_command)).await?;
        Ok(fetcher)
    }

    pub async fn test(&mut self, mailbox: Option<&Mailbox>) -> MailVaultResult<()> {
        run_required_verb("noop", VerbPolicy::Account, self.command("NOOP")).await?;
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
            // STAT is the closest thing POP3 has to opening the mailbox.
            run_required_verb("stat", VerbPolicy::Mailbox, self.command("STAT")).await?;
        }
        Ok(())
    }

    pub async fn list_mailboxes(&mut self) -> MailVaultResult<Vec<(String, MailboxKind)>> {
        Ok(vec![(POP3_INBOX.to_string(), MailboxKind::Inbox)])
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

        let stat_line = run_required_verb("stat", VerbPolicy::Mailbox, self.command("STAT")).await?;
        let count = parse_stat_count(&stat_line)?;
        debug!("POP3 mailbox holds {} messages", count);

        let mut messages = Vec::with_capacity(count as usize);
        for msg_no in 1..=count {
            let retr = format!("RETR {}", msg_no);
            run_required_verb("retr", VerbPolicy::Mailbox, self.command(&retr)).await?;
            let raw = self
                .read_multiline()
                .await
                .map_err(|e| e.upgrade(ErrorCode::Mailbox))?;
            messages.push(raw);
        }
        Ok(messages)
    }

    pub async fn append(&mut self, _mailbox: &Mailbox, _raw: &[u8]) -> MailVaultResult<()> {
        Err(raise_error!(
            "POP3 cannot restore messages to the server".into(),
            ErrorCode::InvalidParameter
        ))
    }

    pub async fn close(&mut self) {
        let _ = run_verb("quit", VerbPolicy::Swallow, self.command("QUIT")).await;
        let _ = self.stream.shutdown().await;
    }

    /// Sends one command and validates the `+OK` status line, returning it.
    async fn command(&mut self, line: &str) -> MailVaultResult<String> {
        self.write_line(line).await?;
        let response = self.read_line().await?;
        check_ok(&response)?;
        Ok(response)
    }

    async fn write_line(&mut self, line: &str) -> MailVaultResult<()> {
        self.stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| raise_error!(e.to_string(), ErrorCode::NetworkError))?;
        self.stream
            .write_all(b"\r\n")
            .await
            .map_err(|e| raise_error!(e.to_string(), ErrorCode::NetworkError))?;
        self.stream
            .flush()
            .await
            .map_err(|e| raise_error!(e.to_string(), ErrorCode::NetworkError))?;
        Ok(())
    }

    async fn read_line(&mut self) -> MailVaultResult<String> {
        self.read_buf.clear();
        loop {
            let mut byte = [0u8; 1];
            let n = self
                .stream
                .read(&mut byte)
                .await
                .map_err(|e| raise_error!(e.to_string(), ErrorCode::NetworkError))?;
            if n == 0 {
                return Err(raise_error!(
                    "connection closed by server".into(),
                    ErrorCode::NetworkError
                ));
            }
            self.read_buf.push(byte[0]);
            if self.read_buf.len() >= 2 && self.read_buf[self.read_buf.len() - 2..] == *b"\r\n" {
                break;
            }
        }
        Ok(
            String::from_utf8_lossy(&self.read_buf[..self.read_buf.len() - 2])
                .trim_end()
                .to_string(),
        )
    }

    /// Reads lines until the `.` terminator, undoing POP3 dot-stuffing.
    async fn read_multiline(&mut self) -> MailVaultResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                break;
            }
            let content = if let Some(stripped) = line.strip_prefix("..") {
                let mut restored = String::with_capacity(line.len() - 1);
                restored.push('.');
                restored.push_str(stripped);
                restored
            } else {
                line
            };
            out.extend_from_slice(content.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Ok(out)
    }
}

fn check_ok(line: &str) -> MailVaultResult<()> {
    if line.starts_with("+OK") {
        Ok(())
    } else {
        Err(raise_error!(
            line.to_string(),
            ErrorCode::BadServerResponse
        ))
    }
}

/// `+OK count size` -> count.
fn parse_stat_count(line: &str) -> MailVaultResult<u32> {
    let rest = line.strip_prefix("+OK").map(str::trim).unwrap_or("");
    rest.split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| {
            raise_error!(
                format!("Cannot parse STAT response '{}'", line),
                ErrorCode::BadServerResponse
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_count() {
        assert_eq!(parse_stat_count("+OK 3 1024").unwrap(), 3);
        assert_eq!(parse_stat_count("+OK 0 0").unwrap(), 0);
        assert!(parse_stat_count("-ERR nope").is_err());
    }

    #[test]
    fn test_check_ok_rejects_err_status() {
        assert!(check_ok("+OK ready").is_ok());
        let error = check_ok("-ERR invalid credentials").unwrap_err();
        assert_eq!(error.code(), ErrorCode::BadServerResponse);
        assert!(error.message().contains("invalid credentials"));
    }
}
