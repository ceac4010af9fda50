use chrono::{DateTime, FixedOffset};

use super::{Flag, Seq, Uid};

/// One `BODY[...]` item of a fetch response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BodySection {
    /// The `<origin>` octet the server echoed for a partial fetch.
    pub origin: Option<u32>,
    /// The section content. `None` when the server sent `NIL`.
    pub data: Option<Vec<u8>>,
}

/// An IMAP [`FETCH` response](https://tools.ietf.org/html/rfc3501#section-7.4.2) that contains
/// data about a particular message. This response occurs as the result of a `FETCH` or `STORE`
/// command, as well as by unilateral server decision (e.g., flag updates).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Fetch {
    /// The ordinal number of this message in its containing mailbox.
    pub message: Seq,

    /// A number expressing the unique identifier of the message.
    pub uid: Option<Uid>,

    /// A number expressing the [RFC-2822](https://tools.ietf.org/html/rfc2822) size of the message.
    pub size: Option<u32>,

    /// The CONDSTORE modification sequence of the message.
    pub modseq: Option<u64>,

    pub(crate) flags: Vec<Flag>,
    pub(crate) internal_date: Option<String>,
    pub(crate) rfc822_header: Option<Vec<u8>>,
    pub(crate) rfc822: Option<Vec<u8>>,
    pub(crate) rfc822_text: Option<Vec<u8>>,
    pub(crate) sections: Vec<BodySection>,
}

impl Fetch {
    /// A list of flags that are set for this message.
    pub fn flags(&self) -> &[Flag] {
        &self.flags[..]
    }

    /// The bytes that make up the header of this message, if `BODY[HEADER]`, `BODY.PEEK[HEADER]`,
    /// or `RFC822.HEADER` was included in the `query` argument to `FETCH`.
    pub fn header(&self) -> Option<&[u8]> {
        self.rfc822_header.as_deref()
    }

    /// The entire body of this message, if `RFC822` was included in the `query` argument to
    /// `FETCH`.
    pub fn rfc822(&self) -> Option<&[u8]> {
        self.rfc822.as_deref()
    }

    /// The bytes that make up the text of this message, if `RFC822.TEXT` was requested.
    pub fn text(&self) -> Option<&[u8]> {
        self.rfc822_text.as_deref()
    }

    /// The content of the first `BODY[...]` section in this response.
    pub fn body(&self) -> Option<&[u8]> {
        self.sections.first().and_then(|s| s.data.as_deref())
    }

    /// All `BODY[...]` sections in this response, in the order received.
    pub fn sections(&self) -> &[BodySection] {
        &self.sections[..]
    }

    /// The internal date of the message, if `INTERNALDATE` was requested.
    pub fn internal_date(&self) -> Option<DateTime<FixedOffset>> {
        self.internal_date.as_deref().and_then(|s| {
            DateTime::parse_from_str(s.trim_start(), "%d-%b-%Y %H:%M:%S %z").ok()
        })
    }
}
