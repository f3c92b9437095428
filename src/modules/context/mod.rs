use crate::modules::error::MailVaultResult;

pub trait Initialize {
    async fn initialize() -> MailVaultResult<()>;
}
