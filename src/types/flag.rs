use std::fmt;

/// With the exception of [`Flag::Custom`], these flags are system flags that are pre-defined in
/// [RFC 3501 section 2.3.2](https://tools.ietf.org/html/rfc3501#section-2.3.2). All system flags
/// begin with `\` in the IMAP protocol.  Certain system flags (`\Deleted` and `\Seen`) have
/// special semantics described elsewhere.
///
/// A flag can be permanent or session-only on a per-flag basis. Permanent flags are those which
/// the client can add or remove from the message flags permanently; that is, concurrent and
/// subsequent sessions will see any change in permanent flags.  Changes to session flags are valid
/// only in that session.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[non_exhaustive]
pub enum Flag {
    /// Message has been read
    Seen,

    /// Message has been answered
    Answered,

    /// Message is "flagged" for urgent/special attention
    Flagged,

    /// Message is "deleted" for removal by later EXPUNGE
    Deleted,

    /// Message has not completed composition (marked as a draft).
    Draft,

    /// Message is "recently" arrived in this mailbox. This flag can not be altered by the client,
    /// and so it is never sent in an `APPEND` or `STORE`.
    Recent,

    /// Only seen in a mailbox's permanent flags: new keywords may be created by storing them.
    MayCreate,

    /// A keyword or another non-standard flag.
    Custom(String),
}

impl Flag {
    fn system(s: &str) -> Option<Self> {
        // system flags are case-insensitive atoms
        let f = match s.to_ascii_lowercase().as_str() {
            "\\seen" => Flag::Seen,
            "\\answered" => Flag::Answered,
            "\\flagged" => Flag::Flagged,
            "\\deleted" => Flag::Deleted,
            "\\draft" => Flag::Draft,
            "\\recent" => Flag::Recent,
            "\\*" => Flag::MayCreate,
            _ => return None,
        };
        Some(f)
    }

    /// Transform anything string-like into owned flags.
    pub fn from_strs<S: AsRef<str>>(v: impl IntoIterator<Item = S>) -> Vec<Flag> {
        v.into_iter().map(|s| Flag::from(s.as_ref())).collect()
    }

    /// Whether a client may send this flag with `APPEND` or `STORE`.
    pub fn is_storable(&self) -> bool {
        !matches!(self, Flag::Recent | Flag::MayCreate)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::MayCreate => write!(f, "\\*"),
            Flag::Custom(ref s) => write!(f, "{}", s),
        }
    }
}

impl From<String> for Flag {
    fn from(s: String) -> Self {
        Flag::system(&s).unwrap_or(Flag::Custom(s))
    }
}

impl<'a> From<&'a str> for Flag {
    fn from(s: &'a str) -> Self {
        Flag::system(s).unwrap_or_else(|| Flag::Custom(s.to_string()))
    }
}
