use serde::{Deserialize, Serialize};

/// Classification of every failure the engine can surface.
///
/// The two codes the scheduler cares about are `MailAccount` and `Mailbox`:
/// they decide which level of the health hierarchy a failed cycle downgrades.
/// Everything else is either caller error, archive bookkeeping, or internal.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    // Caller-side errors (10000–10999)
    InvalidParameter = 10000,
    EmlFileParseError = 10010,
    UnsupportedFileFormat = 10020,
    MissingConfiguration = 10030,

    // Authorization errors (20000–20999)
    PermissionDenied = 20000,

    // Resource errors (30000–30999)
    ResourceNotFound = 30000,
    AlreadyExists = 30010,
    FileNotFound = 30020,

    // Network errors (40000–40999)
    NetworkError = 40000,
    ConnectionTimeout = 40010,
    Transient = 40020,
    HttpResponseError = 40030,

    // Mail service errors (50000–50999)
    MailAccount = 50000,
    Mailbox = 50010,
    BadServerResponse = 50020,

    // Internal system errors (70000–70999)
    InternalError = 70000,
}

impl ErrorCode {
    /// Whether a cycle failing with this code downgrades the whole account.
    pub fn is_account_level(&self) -> bool {
        matches!(self, ErrorCode::MailAccount)
    }

    /// Whether a cycle failing with this code downgrades only the mailbox.
    pub fn is_mailbox_level(&self) -> bool {
        matches!(self, ErrorCode::Mailbox)
    }

    /// Network hiccups worth retrying before they are upgraded to
    /// `MailAccount`.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCode::Transient)
    }
}
