use crate::modules::account::entity::{Account, MailProtocol};
use crate::modules::error::MailVaultResult;
use crate::modules::fetcher::criteria::FetchCriterion;
use crate::modules::fetcher::imap::ImapFetcher;
use crate::modules::fetcher::jmap::JmapFetcher;
use crate::modules::fetcher::pop3::Pop3Fetcher;
use crate::modules::mailbox::entity::{Mailbox, MailboxKind};

pub mod criteria;
pub mod imap;
pub mod jmap;
pub mod pop3;
pub mod safe;
pub mod session;

/// A protocol client bound to one account for the duration of one cycle.
///
/// Sessions are never shared or pooled: every cycle opens its own fetcher
/// and closes it before the cycle ends.
pub enum Fetcher {
    Imap(ImapFetcher),
    Pop3(Pop3Fetcher),
    Jmap(JmapFetcher),
}

/// Connects and authenticates a fetcher for the account's protocol.
/// The Exchange variant runs with IMAP semantics until it grows its own
/// client.
pub async fn open_fetcher(account: &Account) -> MailVaultResult<Fetcher> {
    let fetcher = match account.protocol {
        MailProtocol::Imap | MailProtocol::ImapTls | MailProtocol::Exchange => {
            Fetcher::Imap(ImapFetcher::connect(account).await?)
        }
        MailProtocol::Pop3 | MailProtocol::Pop3Tls => {
            Fetcher::Pop3(Pop3Fetcher::connect(account).await?)
        }
        MailProtocol::Jmap => Fetcher::Jmap(JmapFetcher::connect(account).await?),
    };
    Ok(fetcher)
}

impl Fetcher {
    /// No-op plus an optional read-only open of the given mailbox. With a
    /// mailbox argument the mailbox must belong to the connected account.
    pub async fn test(&mut self, mailbox: Option<&Mailbox>) -> MailVaultResult<()> {
        match self {
            Fetcher::Imap(fetcher) => fetcher.test(mailbox).await,
            Fetcher::Pop3(fetcher) => fetcher.test(mailbox).await,
            Fetcher::Jmap(fetcher) => fetcher.test(mailbox).await,
        }
    }

    /// (name, role) of every folder on the remote account.
    pub async fn list_mailboxes(&mut self) -> MailVaultResult<Vec<(String, MailboxKind)>> {
        match self {
            Fetcher::Imap(fetcher) => fetcher.list_mailboxes().await,
            Fetcher::Pop3(fetcher) => fetcher.list_mailboxes().await,
            Fetcher::Jmap(fetcher) => fetcher.list_mailboxes().await,
        }
    }

    /// Raw message bytes matching the criterion, in server return order.
    pub async fn fetch(
        &mut self,
        mailbox: &Mailbox,
        criterion: FetchCriterion,
        criterion_arg: Option<&str>,
    ) -> MailVaultResult<Vec<Vec<u8>>> {
        match self {
            Fetcher::Imap(fetcher) => fetcher.fetch(mailbox, criterion, criterion_arg).await,
            Fetcher::Pop3(fetcher) => fetcher.fetch(mailbox, criterion, criterion_arg).await,
            Fetcher::Jmap(fetcher) => fetcher.fetch(mailbox, criterion, criterion_arg).await,
        }
    }

    /// Appends one raw message to the remote mailbox (restore path).
    pub async fn append(&mut self, mailbox: &Mailbox, raw: &[u8]) -> MailVaultResult<()> {
        match self {
            Fetcher::Imap(fetcher) => fetcher.append(mailbox, raw).await,
            Fetcher::Pop3(fetcher) => fetcher.append(mailbox, raw).await,
            Fetcher::Jmap(fetcher) => fetcher.append(mailbox, raw).await,
        }
    }

    /// Logout/quit. Errors on this path are swallowed.
    pub async fn close(&mut self) {
        match self {
            Fetcher::Imap(fetcher) => fetcher.close().await,
            Fetcher::Pop3(fetcher) => fetcher.close().await,
            Fetcher::Jmap(fetcher) => fetcher.close().await,
        }
    }
}

/// Live connection test used when accounts are created or their connection
/// fields change.
pub async fn test_account(account: &Account) -> MailVaultResult<()> {
    let mut fetcher = open_fetcher(account).await?;
    let result = fetcher.test(None).await;
    fetcher.close().await;
    result
}
