use std::fmt;
use std::ops::RangeInclusive;

use imap_proto::UidSetMember;

use super::{Fetch, Flag, Name, Seq};
use crate::extensions::metadata::Metadata;

/// The status word of a status response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// `OK`
    Ok,
    /// `NO`
    No,
    /// `BAD`
    Bad,
    /// `PREAUTH`, only seen in a greeting.
    PreAuth,
    /// `BYE`
    Bye,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
            Status::PreAuth => "PREAUTH",
            Status::Bye => "BYE",
        })
    }
}

/// Response code that may be sent with OK/NO/BAD/BYE responses.
/// See [RFC 3501](https://tools.ietf.org/html/rfc3501#section-3.1).
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseCode {
    /// Human-readable text the client must present to the user.
    Alert,
    /// The server's capabilities, sent unsolicited.
    Capabilities(Vec<String>),
    /// See [RFC 4551](https://tools.ietf.org/html/rfc4551#section-3.1.1).
    HighestModSeq(u64),
    /// Flags that can be changed permanently.
    PermanentFlags(Vec<Flag>),
    /// The mailbox status has changed to read-only.
    ReadOnly,
    /// The mailbox status has changed to read-write.
    ReadWrite,
    /// Indicates that the mailbox must be created first.
    TryCreate,
    /// Next unique identifier value.
    UidNext(u32),
    /// The unique identifier validity value.
    UidValidity(u32),
    /// First message without the \Seen flag set.
    Unseen(Seq),
    /// UIDPLUS: validity and UIDs assigned to appended messages.
    AppendUid(u32, Vec<UidSetMember>),
    /// UIDPLUS: validity, source UIDs and destination UIDs of copied messages.
    CopyUid(u32, Vec<UidSetMember>, Vec<UidSetMember>),
    /// UIDPLUS: the mailbox does not support persistent UIDs.
    UidNotSticky,
    /// METADATA: the size of the biggest entry that exceeded `MAXSIZE`.
    MetadataLongEntries(u64),
    /// METADATA: the largest value the server accepts.
    MetadataMaxSize(u64),
    /// METADATA: no more annotations can be added.
    MetadataTooMany,
    /// METADATA: private annotations are unsupported on the mailbox.
    MetadataNoPrivate,
    /// [RFC 2221](https://tools.ietf.org/html/rfc2221)/[RFC
    /// 2193](https://tools.ietf.org/html/rfc2193) referral to other server URIs.
    Referral(Vec<String>),
    /// Any other bracketed code, e.g. `ALREADYEXISTS` or `NONEXISTENT`, with its argument.
    Other(String, Option<String>),
}

impl ResponseCode {
    /// The referral URIs, if this is a referral.
    pub fn referrals(&self) -> Option<&[String]> {
        match self {
            ResponseCode::Referral(uris) => Some(uris),
            _ => None,
        }
    }
}

fn join_uid_set(f: &mut fmt::Formatter<'_>, set: &[UidSetMember]) -> fmt::Result {
    let mut first = true;
    for member in set {
        if !first {
            f.write_str(",")?;
        }
        first = false;
        match member {
            UidSetMember::UidRange(r) => write!(f, "{}:{}", r.start(), r.end())?,
            UidSetMember::Uid(u) => write!(f, "{}", u)?,
        }
    }
    Ok(())
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use crate::utils::iter_join;
        match self {
            ResponseCode::Alert => f.write_str("ALERT"),
            ResponseCode::Capabilities(c) => write!(f, "CAPABILITY {}", iter_join(c, " ")),
            ResponseCode::HighestModSeq(n) => write!(f, "HIGHESTMODSEQ {}", n),
            ResponseCode::PermanentFlags(fl) => write!(f, "PERMANENTFLAGS ({})", iter_join(fl, " ")),
            ResponseCode::ReadOnly => f.write_str("READ-ONLY"),
            ResponseCode::ReadWrite => f.write_str("READ-WRITE"),
            ResponseCode::TryCreate => f.write_str("TRYCREATE"),
            ResponseCode::UidNext(n) => write!(f, "UIDNEXT {}", n),
            ResponseCode::UidValidity(n) => write!(f, "UIDVALIDITY {}", n),
            ResponseCode::Unseen(n) => write!(f, "UNSEEN {}", n),
            ResponseCode::AppendUid(v, uids) => {
                write!(f, "APPENDUID {} ", v)?;
                join_uid_set(f, uids)
            }
            ResponseCode::CopyUid(v, src, dst) => {
                write!(f, "COPYUID {} ", v)?;
                join_uid_set(f, src)?;
                f.write_str(" ")?;
                join_uid_set(f, dst)
            }
            ResponseCode::UidNotSticky => f.write_str("UIDNOTSTICKY"),
            ResponseCode::MetadataLongEntries(n) => write!(f, "METADATA LONGENTRIES {}", n),
            ResponseCode::MetadataMaxSize(n) => write!(f, "METADATA MAXSIZE {}", n),
            ResponseCode::MetadataTooMany => f.write_str("METADATA TOOMANY"),
            ResponseCode::MetadataNoPrivate => f.write_str("METADATA NOPRIVATE"),
            ResponseCode::Referral(uris) => write!(f, "REFERRAL {}", iter_join(uris, " ")),
            ResponseCode::Other(name, Some(arg)) => write!(f, "{} {}", name, arg),
            ResponseCode::Other(name, None) => f.write_str(name),
        }
    }
}

/// The tagged status line that closes a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    /// The tag the client chose for the command.
    pub tag: String,
    /// `OK`, `NO` or `BAD`.
    pub status: Status,
    /// Bracketed response code, if any.
    pub code: Option<ResponseCode>,
    /// Human-readable text.
    pub text: String,
}

/// One data item of a [`STATUS`](https://tools.ietf.org/html/rfc3501#section-7.2.4) response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum StatusItem {
    /// Number of messages in the mailbox.
    Messages(u32),
    /// Number of messages with the `\Recent` flag.
    Recent(u32),
    /// Next UID value.
    UidNext(u32),
    /// UID validity value.
    UidValidity(u32),
    /// Number of messages without `\Seen`.
    Unseen(u32),
    /// CONDSTORE highest modification sequence.
    HighestModSeq(u64),
}

/// A single server response, owned and detached from the receive buffer.
///
/// [RFC 3501](https://tools.ietf.org/html/rfc3501#section-7) states that clients need to be able
/// to accept any response at any time, so every transaction collects these in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServerResponse {
    /// The tagged completion of a command.
    Tagged(Completion),
    /// An untagged `OK`/`NO`/`BAD`/`PREAUTH`/`BYE`.
    Untagged {
        /// The status word.
        status: Status,
        /// Bracketed response code, if any.
        code: Option<ResponseCode>,
        /// Human-readable text.
        text: String,
    },
    /// A `+` continuation request.
    Continue {
        /// Bracketed response code, if any.
        code: Option<ResponseCode>,
        /// The text following the `+`, e.g. a base64 SASL challenge.
        text: String,
    },
    /// `* CAPABILITY ...`
    Capabilities(Vec<String>),
    /// `* n EXISTS`
    Exists(u32),
    /// `* n RECENT`
    Recent(u32),
    /// `* n EXPUNGE`
    Expunge(Seq),
    /// QRESYNC `* VANISHED [(EARLIER)] uid-set`
    Vanished {
        /// Whether the `EARLIER` tag was present.
        earlier: bool,
        /// UIDs that have been removed.
        uids: Vec<RangeInclusive<u32>>,
    },
    /// `* FLAGS (...)`, the flags applicable in the selected mailbox.
    Flags(Vec<Flag>),
    /// `* LIST` or `* LSUB`
    List(Name),
    /// `* STATUS mailbox (...)`
    Status {
        /// The mailbox the status applies to.
        mailbox: String,
        /// The reported items.
        items: Vec<StatusItem>,
    },
    /// `* SEARCH ...`
    Search(Vec<u32>),
    /// `* SORT ...`
    Sort(Vec<u32>),
    /// `* n FETCH (...)`
    Fetch(Fetch),
    /// `* METADATA mailbox (...)`
    Metadata {
        /// The mailbox, empty for server annotations.
        mailbox: String,
        /// Entries and values.
        entries: Vec<Metadata>,
    },
    /// A line this crate does not model, without its trailing CRLF.
    Other(String),
}

impl ServerResponse {
    /// The response code of a status response, if any.
    pub fn code(&self) -> Option<&ResponseCode> {
        match self {
            ServerResponse::Tagged(Completion { code, .. })
            | ServerResponse::Untagged { code, .. }
            | ServerResponse::Continue { code, .. } => code.as_ref(),
            _ => None,
        }
    }

    /// Whether this is an untagged `BYE`.
    pub fn is_bye(&self) -> bool {
        matches!(
            self,
            ServerResponse::Untagged {
                status: Status::Bye,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_display() {
        assert_eq!(ResponseCode::TryCreate.to_string(), "TRYCREATE");
        assert_eq!(
            ResponseCode::Referral(vec!["imap://a/b".into()]).to_string(),
            "REFERRAL imap://a/b"
        );
        assert_eq!(
            ResponseCode::AppendUid(38505, vec![UidSetMember::Uid(3955)]).to_string(),
            "APPENDUID 38505 3955"
        );
        assert_eq!(
            ResponseCode::Other("ALREADYEXISTS".into(), None).to_string(),
            "ALREADYEXISTS"
        );
    }
}
