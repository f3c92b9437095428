use code::ErrorCode;
use snafu::{Location, Snafu};

pub mod code;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MailVaultError {
    #[snafu(display("{message}"))]
    Generic {
        message: String,
        #[snafu(implicit)]
        location: Location,
        code: ErrorCode,
    },
}

pub type MailVaultResult<T, E = MailVaultError> = std::result::Result<T, E>;

impl MailVaultError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MailVaultError::Generic { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            MailVaultError::Generic { message, .. } => message,
        }
    }

    /// Re-tag an error with a new code, keeping the original message chained.
    pub fn upgrade(self, code: ErrorCode) -> Self {
        match self {
            MailVaultError::Generic {
                message, location, ..
            } => MailVaultError::Generic {
                message,
                location,
                code,
            },
        }
    }
}
