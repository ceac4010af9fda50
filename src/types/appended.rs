use imap_proto::UidSetMember;
use std::fmt;

use super::{Completion, ResponseCode};

/// Meta-information about a message, as returned by
/// [`APPEND`](https://tools.ietf.org/html/rfc3501#section-6.3.11).
/// Note that `APPEND` only returns any data if certain extensions are enabled,
/// for example [`UIDPLUS`](https://tools.ietf.org/html/rfc4315).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct Appended {
    /// The unique identifier validity value of the mailbox that the message was appended to.
    /// Only present if server supports [`UIDPLUS`](https://tools.ietf.org/html/rfc4315).
    pub uid_validity: Option<u32>,

    /// The unique identifier value of the messages that were appended.
    /// Contains only a single value unless the [`MULTIAPPEND`](https://tools.ietf.org/html/rfc3502) extension
    /// was used to upload multiple messages.
    pub uids: Option<Vec<UidSetMember>>,
}

impl Appended {
    pub(crate) fn from_completion(completion: &Completion) -> Self {
        match completion.code {
            Some(ResponseCode::AppendUid(validity, ref uids)) => Appended {
                uid_validity: Some(validity),
                uids: Some(uids.clone()),
            },
            _ => Appended::default(),
        }
    }
}

impl fmt::Display for Appended {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uid_validity: {:?}, uids: {:?}",
            self.uid_validity, self.uids,
        )
    }
}

/// UIDPLUS data about messages placed by `COPY` or `UID COPY`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct Copied {
    /// Validity value of the destination mailbox.
    pub uid_validity: Option<u32>,
    /// UIDs of the copied messages in the source mailbox.
    pub source: Vec<UidSetMember>,
    /// UIDs the copies received in the destination mailbox, in the same order.
    pub destination: Vec<UidSetMember>,
}

impl Copied {
    pub(crate) fn from_completion(completion: &Completion) -> Self {
        match completion.code {
            Some(ResponseCode::CopyUid(validity, ref source, ref destination)) => Copied {
                uid_validity: Some(validity),
                source: source.clone(),
                destination: destination.clone(),
            },
            _ => Copied::default(),
        }
    }
}
