use crate::modules::error::{code::ErrorCode, MailVaultResult};
use crate::raise_error;
use std::fmt;

/// On-disk mailbox formats the codec can read and write.
///
/// Directory-tree formats (Maildir, MH) always travel zipped; the bare and
/// `zip_` spellings are accepted interchangeably for them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FileFormat {
    Eml,
    ZipEml,
    Mbox,
    Mmdf,
    Babyl,
    Maildir,
    ZipMaildir,
    Mh,
    ZipMh,
}

impl FileFormat {
    /// Case-insensitive parse of a user-supplied format name.
    pub fn parse(value: &str) -> MailVaultResult<Self> {
        let format = match value.to_ascii_lowercase().as_str() {
            "eml" => FileFormat::Eml,
            "zip_eml" => FileFormat::ZipEml,
            "mbox" => FileFormat::Mbox,
            "mmdf" => FileFormat::Mmdf,
            "babyl" => FileFormat::Babyl,
            "maildir" => FileFormat::Maildir,
            "zip_maildir" => FileFormat::ZipMaildir,
            "mh" => FileFormat::Mh,
            "zip_mh" => FileFormat::ZipMh,
            other => {
                return Err(raise_error!(
                    format!("The file format '{}' is not supported.", other),
                    ErrorCode::UnsupportedFileFormat
                ))
            }
        };
        Ok(format)
    }

    /// File extension used when exporting a container of this format.
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Eml => "eml",
            FileFormat::ZipEml | FileFormat::ZipMaildir | FileFormat::ZipMh => "zip",
            FileFormat::Mbox => "mbox",
            FileFormat::Mmdf => "mmdf",
            FileFormat::Babyl => "babyl",
            FileFormat::Maildir => "maildir",
            FileFormat::Mh => "mh",
        }
    }

    /// Whether the payload is a zip archive (of messages or of a tree).
    pub fn is_zipped(&self) -> bool {
        matches!(
            self,
            FileFormat::ZipEml
                | FileFormat::Maildir
                | FileFormat::ZipMaildir
                | FileFormat::Mh
                | FileFormat::ZipMh
        )
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            FileFormat::Eml => "eml",
            FileFormat::ZipEml => "zip_eml",
            FileFormat::Mbox => "mbox",
            FileFormat::Mmdf => "mmdf",
            FileFormat::Babyl => "babyl",
            FileFormat::Maildir => "maildir",
            FileFormat::ZipMaildir => "zip_maildir",
            FileFormat::Mh => "mh",
            FileFormat::ZipMh => "zip_mh",
        };
        write!(f, "{}", tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(FileFormat::parse("MBOX").unwrap(), FileFormat::Mbox);
        assert_eq!(FileFormat::parse("Maildir").unwrap(), FileFormat::Maildir);
        assert_eq!(FileFormat::parse("ZIP_EML").unwrap(), FileFormat::ZipEml);
    }

    #[test]
    fn test_parse_rejects_unknown_formats() {
        let error = FileFormat::parse("pst").unwrap_err();
        assert_eq!(
            error.code(),
            crate::modules::error::code::ErrorCode::UnsupportedFileFormat
        );
    }
}
