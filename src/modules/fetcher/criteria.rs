use crate::modules::account::entity::MailProtocol;
use crate::modules::error::{code::ErrorCode, MailVaultResult};
use crate::raise_error;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Selection criterion of a fetching routine.
///
/// The tag set is closed; tags marked as argument-taking require a
/// non-empty `criterion_arg` on the routine.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum FetchCriterion {
    #[default]
    All,
    Unseen,
    Seen,
    Recent,
    New,
    Old,
    Flagged,
    Unflagged,
    Draft,
    Undraft,
    Deleted,
    Undeleted,
    Answered,
    Unanswered,
    Subject,
    Body,
    From,
    Keyword,
    Unkeyword,
    Larger,
    Smaller,
    Daily,
    Weekly,
    Monthly,
    Annually,
    SentSince,
}

impl fmt::Display for FetchCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FetchCriterion {
    pub fn tag(&self) -> &'static str {
        match self {
            FetchCriterion::All => "ALL",
            FetchCriterion::Unseen => "UNSEEN",
            FetchCriterion::Seen => "SEEN",
            FetchCriterion::Recent => "RECENT",
            FetchCriterion::New => "NEW",
            FetchCriterion::Old => "OLD",
            FetchCriterion::Flagged => "FLAGGED",
            FetchCriterion::Unflagged => "UNFLAGGED",
            FetchCriterion::Draft => "DRAFT",
            FetchCriterion::Undraft => "UNDRAFT",
            FetchCriterion::Deleted => "DELETED",
            FetchCriterion::Undeleted => "UNDELETED",
            FetchCriterion::Answered => "ANSWERED",
            FetchCriterion::Unanswered => "UNANSWERED",
            FetchCriterion::Subject => "SUBJECT",
            FetchCriterion::Body => "BODY",
            FetchCriterion::From => "FROM",
            FetchCriterion::Keyword => "KEYWORD",
            FetchCriterion::Unkeyword => "UNKEYWORD",
            FetchCriterion::Larger => "LARGER",
            FetchCriterion::Smaller => "SMALLER",
            FetchCriterion::Daily => "DAILY",
            FetchCriterion::Weekly => "WEEKLY",
            FetchCriterion::Monthly => "MONTHLY",
            FetchCriterion::Annually => "ANNUALLY",
            FetchCriterion::SentSince => "SENTSINCE",
        }
    }

    pub fn parse(tag: &str) -> MailVaultResult<Self> {
        let criterion = match tag.to_ascii_uppercase().as_str() {
            "ALL" => FetchCriterion::All,
            "UNSEEN" => FetchCriterion::Unseen,
            "SEEN" => FetchCriterion::Seen,
            "RECENT" => FetchCriterion::Recent,
            "NEW" => FetchCriterion::New,
            "OLD" => FetchCriterion::Old,
            "FLAGGED" => FetchCriterion::Flagged,
            "UNFLAGGED" => FetchCriterion::Unflagged,
            "DRAFT" => FetchCriterion::Draft,
            "UNDRAFT" => FetchCriterion::Undraft,
            "DELETED" => FetchCriterion::Deleted,
            "UNDELETED" => FetchCriterion::Undeleted,
            "ANSWERED" => FetchCriterion::Answered,
            "UNANSWERED" => FetchCriterion::Unanswered,
            "SUBJECT" => FetchCriterion::Subject,
            "BODY" => FetchCriterion::Body,
            "FROM" => FetchCriterion::From,
            "KEYWORD" => FetchCriterion::Keyword,
            "UNKEYWORD" => FetchCriterion::Unkeyword,
            "LARGER" => FetchCriterion::Larger,
            "SMALLER" => FetchCriterion::Smaller,
            "DAILY" => FetchCriterion::Daily,
            "WEEKLY" => FetchCriterion::Weekly,
            "MONTHLY" => FetchCriterion::Monthly,
            "ANNUALLY" => FetchCriterion::Annually,
            "SENTSINCE" => FetchCriterion::SentSince,
            other => {
                return Err(raise_error!(
                    format!("Unknown fetching criterion '{}'", other),
                    ErrorCode::InvalidParameter
                ))
            }
        };
        Ok(criterion)
    }

    /// Whether the criterion requires a non-empty argument.
    pub fn takes_argument(&self) -> bool {
        matches!(
            self,
            FetchCriterion::Subject
                | FetchCriterion::Body
                | FetchCriterion::From
                | FetchCriterion::Keyword
                | FetchCriterion::Unkeyword
                | FetchCriterion::Larger
                | FetchCriterion::Smaller
                | FetchCriterion::SentSince
        )
    }

    const FLAG_CRITERIA: &'static [FetchCriterion] = &[
        FetchCriterion::Unseen,
        FetchCriterion::Seen,
        FetchCriterion::Recent,
        FetchCriterion::New,
        FetchCriterion::Old,
        FetchCriterion::Flagged,
        FetchCriterion::Unflagged,
        FetchCriterion::Draft,
        FetchCriterion::Undraft,
        FetchCriterion::Deleted,
        FetchCriterion::Undeleted,
        FetchCriterion::Answered,
        FetchCriterion::Unanswered,
    ];

    const TEXT_CRITERIA: &'static [FetchCriterion] = &[
        FetchCriterion::Subject,
        FetchCriterion::Body,
        FetchCriterion::From,
        FetchCriterion::Keyword,
        FetchCriterion::Unkeyword,
    ];

    const SIZE_CRITERIA: &'static [FetchCriterion] =
        &[FetchCriterion::Larger, FetchCriterion::Smaller];

    const DATE_CRITERIA: &'static [FetchCriterion] = &[
        FetchCriterion::Daily,
        FetchCriterion::Weekly,
        FetchCriterion::Monthly,
        FetchCriterion::Annually,
        FetchCriterion::SentSince,
    ];

    /// The subset of criteria each protocol can serve. Routine creation
    /// must check against this list; the fetchers fail fast otherwise.
    pub fn available_for(protocol: MailProtocol) -> Vec<FetchCriterion> {
        let mut criteria = vec![FetchCriterion::All];
        match protocol {
            // POP3 has neither flags nor server-side search.
            MailProtocol::Pop3 | MailProtocol::Pop3Tls => {}
            MailProtocol::Imap | MailProtocol::ImapTls | MailProtocol::Exchange => {
                criteria.extend_from_slice(Self::FLAG_CRITERIA);
                criteria.extend_from_slice(Self::TEXT_CRITERIA);
                criteria.extend_from_slice(Self::SIZE_CRITERIA);
                criteria.extend_from_slice(Self::DATE_CRITERIA);
            }
            MailProtocol::Jmap => {
                // JMAP has no RECENT/NEW/OLD and no custom keyword filters.
                criteria.extend_from_slice(&[
                    FetchCriterion::Unseen,
                    FetchCriterion::Seen,
                    FetchCriterion::Flagged,
                    FetchCriterion::Unflagged,
                    FetchCriterion::Draft,
                    FetchCriterion::Undraft,
                    FetchCriterion::Answered,
                    FetchCriterion::Unanswered,
                    FetchCriterion::Subject,
                    FetchCriterion::Body,
                    FetchCriterion::From,
                ]);
                criteria.extend_from_slice(Self::SIZE_CRITERIA);
                criteria.extend_from_slice(Self::DATE_CRITERIA);
            }
        }
        criteria
    }

    /// Validates a (criterion, argument) pair for a protocol.
    pub fn validate(
        &self,
        protocol: MailProtocol,
        argument: Option<&str>,
    ) -> MailVaultResult<()> {
        if !Self::available_for(protocol).contains(self) {
            return Err(raise_error!(
                format!(
                    "Fetching criterion {} is not available for protocol {}",
                    self, protocol
                ),
                ErrorCode::InvalidParameter
            ));
        }
        if self.takes_argument() && argument.map_or(true, |a| a.is_empty()) {
            return Err(raise_error!(
                format!("Fetching criterion {} requires an argument", self),
                ErrorCode::InvalidParameter
            ));
        }
        Ok(())
    }

    /// Compiles the criterion into an IMAP SEARCH query.
    pub fn to_imap_query(&self, argument: Option<&str>) -> MailVaultResult<String> {
        let today = Utc::now().date_naive();
        let query = match self {
            FetchCriterion::All => "ALL".to_string(),
            FetchCriterion::Unseen
            | FetchCriterion::Seen
            | FetchCriterion::Recent
            | FetchCriterion::New
            | FetchCriterion::Old
            | FetchCriterion::Flagged
            | FetchCriterion::Unflagged
            | FetchCriterion::Draft
            | FetchCriterion::Undraft
            | FetchCriterion::Deleted
            | FetchCriterion::Undeleted
            | FetchCriterion::Answered
            | FetchCriterion::Unanswered => self.tag().to_string(),
            FetchCriterion::Subject
            | FetchCriterion::Body
            | FetchCriterion::From
            | FetchCriterion::Keyword
            | FetchCriterion::Unkeyword => {
                format!("{} {}", self.tag(), required_arg(self, argument)?)
            }
            FetchCriterion::Larger | FetchCriterion::Smaller => {
                let size: u64 = required_arg(self, argument)?.parse().map_err(|_| {
                    raise_error!(
                        format!("Criterion {} requires a byte count argument", self),
                        ErrorCode::InvalidParameter
                    )
                })?;
                format!("{} {}", self.tag(), size)
            }
            FetchCriterion::Daily => sentsince_query(today - Duration::days(1)),
            FetchCriterion::Weekly => sentsince_query(today - Duration::weeks(1)),
            FetchCriterion::Monthly => sentsince_query(today - Duration::days(30)),
            FetchCriterion::Annually => sentsince_query(today - Duration::days(365)),
            FetchCriterion::SentSince => {
                let date = parse_date_argument(required_arg(self, argument)?)?;
                sentsince_query(date)
            }
        };
        Ok(query)
    }

    /// The reference date for date-window criteria, today minus the period.
    pub fn since_date(&self, argument: Option<&str>) -> MailVaultResult<Option<NaiveDate>> {
        let today = Utc::now().date_naive();
        let date = match self {
            FetchCriterion::Daily => Some(today - Duration::days(1)),
            FetchCriterion::Weekly => Some(today - Duration::weeks(1)),
            FetchCriterion::Monthly => Some(today - Duration::days(30)),
            FetchCriterion::Annually => Some(today - Duration::days(365)),
            FetchCriterion::SentSince => {
                Some(parse_date_argument(required_arg(self, argument)?)?)
            }
            _ => None,
        };
        Ok(date)
    }
}

fn required_arg<'a>(
    criterion: &FetchCriterion,
    argument: Option<&'a str>,
) -> MailVaultResult<&'a str> {
    match argument {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(raise_error!(
            format!("Fetching criterion {} requires an argument", criterion),
            ErrorCode::InvalidParameter
        )),
    }
}

/// IMAP date syntax: dd-Mon-yyyy.
fn sentsince_query(date: NaiveDate) -> String {
    format!("SENTSINCE {}", date.format("%d-%b-%Y"))
}

fn parse_date_argument(argument: &str) -> MailVaultResult<NaiveDate> {
    NaiveDate::parse_from_str(argument, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(argument, "%d-%b-%Y"))
        .map_err(|_| {
            raise_error!(
                format!(
                    "Cannot parse '{}' as a date (expected YYYY-MM-DD or dd-Mon-yyyy)",
                    argument
                ),
                ErrorCode::InvalidParameter
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_available_pair_compiles_to_nonempty_imap_query() {
        for protocol in [MailProtocol::Imap, MailProtocol::ImapTls, MailProtocol::Exchange] {
            for criterion in FetchCriterion::available_for(protocol) {
                let arg = if criterion.takes_argument() {
                    match criterion {
                        FetchCriterion::Larger | FetchCriterion::Smaller => Some("1024"),
                        FetchCriterion::SentSince => Some("2024-03-01"),
                        _ => Some("needle"),
                    }
                } else {
                    None
                };
                criterion.validate(protocol, arg).unwrap();
                let query = criterion.to_imap_query(arg).unwrap();
                assert!(!query.is_empty(), "{criterion} compiled to empty query");
            }
        }
    }

    #[test]
    fn test_pop3_only_supports_all() {
        assert_eq!(
            FetchCriterion::available_for(MailProtocol::Pop3),
            vec![FetchCriterion::All]
        );
        let err = FetchCriterion::Subject
            .validate(MailProtocol::Pop3, Some("x"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
    }

    #[test]
    fn test_argument_taking_criteria_reject_missing_argument() {
        for criterion in [
            FetchCriterion::Subject,
            FetchCriterion::Larger,
            FetchCriterion::SentSince,
        ] {
            assert!(criterion.validate(MailProtocol::Imap, None).is_err());
            assert!(criterion.validate(MailProtocol::Imap, Some("")).is_err());
        }
    }

    #[test]
    fn test_sentsince_uses_imap_date_format() {
        let query = FetchCriterion::SentSince
            .to_imap_query(Some("2024-03-05"))
            .unwrap();
        assert_eq!(query, "SENTSINCE 05-Mar-2024");
    }

    #[test]
    fn test_size_criteria_require_numeric_argument() {
        assert!(FetchCriterion::Larger.to_imap_query(Some("10k")).is_err());
        assert_eq!(
            FetchCriterion::Larger.to_imap_query(Some("2048")).unwrap(),
            "LARGER 2048"
        );
    }

    #[test]
    fn test_parse_round_trips_every_tag() {
        for protocol in [MailProtocol::Imap, MailProtocol::Jmap] {
            for criterion in FetchCriterion::available_for(protocol) {
                assert_eq!(FetchCriterion::parse(criterion.tag()).unwrap(), criterion);
            }
        }
        assert!(FetchCriterion::parse("NONSENSE").is_err());
    }
}
