//! Adds support for the IMAP SORT extension specificed in [RFC
//! 5256](https://tools.ietf.org/html/rfc5256#section-3), and for the extended `SEARCH RETURN`
//! form of [RFC 4731](https://tools.ietf.org/html/rfc4731).
//!
//! The SORT command is a variant of SEARCH with sorting semantics for
//! the results. There are two arguments before the searching
//! criteria argument: a parenthesized list of sort criteria, and the
//! searching charset.

use std::{borrow::Cow, fmt, ops::RangeInclusive};

use lazy_static::lazy_static;
use regex::Regex;

use crate::types::ServerResponse;

pub(crate) struct SortCriteria<'c>(pub(crate) &'c [SortCriterion<'c>]);

impl<'c> fmt::Display for SortCriteria<'c> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "")
        } else {
            let criteria: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
            write!(f, "({})", criteria.join(" "))
        }
    }
}

/// The defined sort criteria are as follows. Refer to the Formal
/// Syntax section for the precise syntactic definitions of the
/// arguments. If the associated [RFC-822](https://tools.ietf.org/html/rfc822)
/// header for a particular criterion is absent, it is treated as the empty string.
/// The empty string always collates before non-empty strings.
pub enum SortCriterion<'c> {
    /// Internal date and time of the message. This differs from the
    /// ON criteria in SEARCH, which uses just the internal date.
    Arrival,

    /// [IMAP](https://tools.ietf.org/html/rfc5256#ref-IMAP) addr-mailbox
    /// of the first "cc" address.
    Cc,

    /// Sent date and time, as described in
    /// [section 2.2](https://tools.ietf.org/html/rfc5256#section-2.20).
    Date,

    /// [IMAP](https://tools.ietf.org/html/rfc5256#ref-IMAP) addr-mailbox
    /// of the first "From" address.
    From,

    /// Followed by another sort criterion, has the effect of that
    /// criterion but in reverse (descending) order.
    Reverse(&'c SortCriterion<'c>),

    /// Size of the message in octets.
    Size,

    /// Base subject text.
    Subject,

    /// [IMAP](https://tools.ietf.org/html/rfc5256#ref-IMAP) addr-mailbox
    /// of the first "To" address.
    To,
}

impl<'c> fmt::Display for SortCriterion<'c> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SortCriterion::*;

        match self {
            Arrival => write!(f, "ARRIVAL"),
            Cc => write!(f, "CC"),
            Date => write!(f, "DATE"),
            From => write!(f, "FROM"),
            Reverse(c) => write!(f, "REVERSE {}", c),
            Size => write!(f, "SIZE"),
            Subject => write!(f, "SUBJECT"),
            To => write!(f, "TO"),
        }
    }
}

/// The charset argument is mandatory (unlike SEARCH) and indicates
/// the CHARSET of the strings that appear in the searching
/// criteria. The US-ASCII and UTF-8 charsets MUST be implemented.
/// All other charsets are optional.
pub enum SortCharset<'c> {
    /// Mandatory UTF-8
    Utf8,

    /// Mandatory US-ASCII
    UsAscii,

    /// Optional custom
    Custom(Cow<'c, str>),
}

impl<'c> fmt::Display for SortCharset<'c> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SortCharset::*;

        match self {
            Utf8 => write!(f, "UTF-8"),
            UsAscii => write!(f, "US-ASCII"),
            Custom(c) => write!(f, "{}", c),
        }
    }
}

/// A result option of `SEARCH RETURN (...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchReturn {
    /// The lowest matching number.
    Min,
    /// The highest matching number.
    Max,
    /// Every match, as a sequence set.
    All,
    /// The number of matches.
    Count,
}

impl fmt::Display for SearchReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SearchReturn::Min => "MIN",
            SearchReturn::Max => "MAX",
            SearchReturn::All => "ALL",
            SearchReturn::Count => "COUNT",
        })
    }
}

/// The data of an `* ESEARCH` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Esearch {
    /// The tag of the command the response answers.
    pub tag: Option<String>,
    /// Whether the numbers are UIDs.
    pub uid: bool,
    pub min: Option<u32>,
    pub max: Option<u32>,
    pub count: Option<u32>,
    /// Every match as the server's sequence set, e.g. `1:3,7`.
    pub all: Option<String>,
}

impl Esearch {
    /// The ranges of [`all`](Self::all), in server order. Malformed parts are skipped.
    pub fn all_ranges(&self) -> Vec<RangeInclusive<u32>> {
        self.all
            .iter()
            .flat_map(|s| s.split(','))
            .filter_map(|part| match part.split_once(':') {
                Some((a, b)) => {
                    let (a, b) = (a.parse::<u32>().ok()?, b.parse::<u32>().ok()?);
                    Some(a.min(b)..=a.max(b))
                }
                None => part.parse::<u32>().ok().map(|n| n..=n),
            })
            .collect()
    }

    /// Every number in [`all`](Self::all), expanded lazily.
    pub fn all_numbers(&self) -> impl Iterator<Item = u32> {
        self.all_ranges().into_iter().flatten()
    }
}

lazy_static! {
    static ref ESEARCH_TAG: Regex = Regex::new(r#"^\(TAG "([^"]*)"\)\s*"#).unwrap();
}

/// Read an `* ESEARCH` line, which arrives as an unmodelled response.
pub(crate) fn parse_esearch(response: &ServerResponse) -> Option<Esearch> {
    let line = match response {
        ServerResponse::Other(line) => line,
        _ => return None,
    };
    let rest = line.strip_prefix("* ")?;
    let (keyword, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
    if !keyword.eq_ignore_ascii_case("ESEARCH") {
        return None;
    }
    let mut result = Esearch::default();
    if let Some(caps) = ESEARCH_TAG.captures(rest) {
        result.tag = Some(caps[1].to_string());
        rest = &rest[caps[0].len()..];
    }
    let mut tokens = rest.split_whitespace();
    while let Some(token) = tokens.next() {
        match token.to_ascii_uppercase().as_str() {
            "UID" => result.uid = true,
            "MIN" => result.min = tokens.next().and_then(|t| t.parse().ok()),
            "MAX" => result.max = tokens.next().and_then(|t| t.parse().ok()),
            "COUNT" => result.count = tokens.next().and_then(|t| t.parse().ok()),
            "ALL" => result.all = tokens.next().map(str::to_string),
            _ => {
                tokens.next();
            }
        }
    }
    Some(result)
}
