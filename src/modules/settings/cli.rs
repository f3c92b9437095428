use crate::modules::error::{code::ErrorCode, MailVaultResult};
use crate::raise_error;
use clap::Parser;
use std::sync::LazyLock;

#[cfg(not(test))]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(Settings::parse);

#[cfg(test)]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(Settings::new_for_test);

#[derive(Debug, Parser)]
#[clap(
    name = "mailvault",
    about = "A self-hostable, multi-tenant email archiving server: periodically fetches \
    messages from remote IMAP/POP3/JMAP accounts, parses them and archives them for \
    search, download and restoration.",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Settings {
    /// mailvault log level (default: "info")
    #[clap(
        long,
        default_value = "info",
        env,
        help = "Set the log level for mailvault"
    )]
    pub mailvault_log_level: String,

    /// Enable ANSI formatted logs
    #[clap(long, default_value = "true", env, help = "Enable ANSI formatted logs")]
    pub mailvault_ansi_logs: bool,

    /// Enable log file output (otherwise logs go to stdout)
    #[clap(
        long,
        default_value = "false",
        env,
        help = "Enable log file output (otherwise logs go to stdout)"
    )]
    pub mailvault_log_to_file: bool,

    /// Maximum number of server log files (default: 5)
    #[clap(
        long,
        default_value = "5",
        env,
        help = "Set the maximum number of server log files"
    )]
    pub mailvault_max_server_log_files: usize,

    /// Root data directory
    #[clap(
        long,
        default_value = "./mailvault-data",
        env,
        help = "Set the root data directory for mailvault"
    )]
    pub mailvault_root_dir: String,

    /// mailvault encryption password
    #[clap(
        long,
        default_value = "change-this-default-password-now",
        env,
        help = "Set the encryption password for stored account credentials. ⚠️ Change this default in production!"
    )]
    pub mailvault_encrypt_password: String,

    /// Discard messages flagged as spam during archiving
    #[clap(
        long,
        default_value = "false",
        env,
        help = "Discard messages carrying 'X-Spam-Flag: YES' instead of archiving them (junk mailboxes are exempt)"
    )]
    pub mailvault_throw_out_spam: bool,

    /// Initial save-attachments flag for new mailboxes
    #[clap(
        long,
        default_value = "true",
        env,
        help = "Whether newly scanned mailboxes save attachments to blob storage"
    )]
    pub mailvault_default_save_attachments: bool,

    /// Initial save-to-eml flag for new mailboxes
    #[clap(
        long,
        default_value = "true",
        env,
        help = "Whether newly scanned mailboxes keep the full .eml blob of each message"
    )]
    pub mailvault_default_save_to_eml: bool,

    /// Mailboxes matching this regex are skipped during account scans
    #[clap(
        long,
        default_value = "",
        env,
        help = "Case-insensitive regex of remote mailbox names to ignore during account scans"
    )]
    pub mailvault_ignored_mailboxes_regex: String,

    /// Relax TLS verification for accounts that opt in
    #[clap(
        long,
        default_value = "false",
        env,
        help = "When enabled AND an account sets allow-insecure-tls, server certificates are not validated"
    )]
    pub mailvault_allow_insecure_connections: bool,

    /// Default page size for the web collaborator
    #[clap(
        long,
        default_value = "25",
        env,
        help = "Default page size handed to the web frontend (not used by the core)"
    )]
    pub mailvault_web_default_page_size: u32,

    /// Number of rotated backups kept per routine log
    #[clap(
        long,
        default_value = "5",
        env,
        help = "Set the number of rotated backups kept for each routine log file"
    )]
    pub mailvault_routine_log_backups: usize,

    /// Size limit of a routine log file before rotation, in bytes
    #[clap(
        long,
        default_value = "10485760",
        env,
        help = "Set the size in bytes at which a routine log file is rotated"
    )]
    pub mailvault_routine_log_max_bytes: u64,

    /// Number of UIDs fetched per batch during a cycle
    #[clap(
        long,
        default_value = "50",
        env,
        help = "Set the number of message UIDs fetched per batch during a cycle"
    )]
    pub mailvault_fetch_batch_size: usize,

    /// Bounded wait when joining workers on shutdown, in seconds
    #[clap(
        long,
        default_value = "60",
        env,
        help = "Set how long shutdown waits for in-flight cycles to finish"
    )]
    pub mailvault_shutdown_grace_secs: u64,
}

impl Settings {
    pub fn validate(&self) -> MailVaultResult<()> {
        if !self.mailvault_ignored_mailboxes_regex.is_empty() {
            regex::RegexBuilder::new(&self.mailvault_ignored_mailboxes_regex)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    raise_error!(
                        format!("Invalid MAILVAULT_IGNORED_MAILBOXES_REGEX: {}", e),
                        ErrorCode::InvalidParameter
                    )
                })?;
        }
        if self.mailvault_fetch_batch_size == 0 {
            return Err(raise_error!(
                "MAILVAULT_FETCH_BATCH_SIZE must be greater than 0".into(),
                ErrorCode::InvalidParameter
            ));
        }
        if self.mailvault_routine_log_max_bytes == 0 {
            return Err(raise_error!(
                "MAILVAULT_ROUTINE_LOG_MAX_BYTES must be greater than 0".into(),
                ErrorCode::InvalidParameter
            ));
        }
        Ok(())
    }

    /// Compiled form of the ignore list, `None` when unset.
    pub fn ignored_mailboxes_regex(&self) -> Option<regex::Regex> {
        if self.mailvault_ignored_mailboxes_regex.is_empty() {
            return None;
        }
        regex::RegexBuilder::new(&self.mailvault_ignored_mailboxes_regex)
            .case_insensitive(true)
            .build()
            .ok()
    }

    #[cfg(test)]
    pub fn new_for_test() -> Settings {
        let dir = std::env::temp_dir().join(format!("mailvault-test-{}", std::process::id()));
        Settings {
            mailvault_log_level: "debug".into(),
            mailvault_ansi_logs: false,
            mailvault_log_to_file: false,
            mailvault_max_server_log_files: 2,
            mailvault_root_dir: dir.to_string_lossy().into_owned(),
            mailvault_encrypt_password: "test-password".into(),
            mailvault_throw_out_spam: false,
            mailvault_default_save_attachments: true,
            mailvault_default_save_to_eml: true,
            mailvault_ignored_mailboxes_regex: String::new(),
            mailvault_allow_insecure_connections: false,
            mailvault_web_default_page_size: 25,
            mailvault_routine_log_backups: 2,
            mailvault_routine_log_max_bytes: 64 * 1024,
            mailvault_fetch_batch_size: 50,
            mailvault_shutdown_grace_secs: 5,
        }
    }
}
