use std::fmt;

/// A name that matches a `LIST` or `LSUB` command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Name {
    pub(crate) attributes: Vec<NameAttribute>,
    pub(crate) delimiter: Option<String>,
    pub(crate) name: String,
}

/// An attribute set for an IMAP name.
///
/// Besides the four attributes of RFC 3501, the child-mailbox attributes of
/// [RFC 3348](https://tools.ietf.org/html/rfc3348) and the LIST-EXTENDED attributes of
/// [RFC 5258](https://tools.ietf.org/html/rfc5258) are recognised, since the mailbox directory
/// relies on them.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[non_exhaustive]
pub enum NameAttribute {
    /// It is not possible for any child levels of hierarchy to exist
    /// under this name; no child levels exist now and none can be
    /// created in the future.
    NoInferiors,

    /// It is not possible to use this name as a selectable mailbox.
    NoSelect,

    /// The mailbox has been marked "interesting" by the server; the
    /// mailbox probably contains messages that have been added since
    /// the last time the mailbox was selected.
    Marked,

    /// The mailbox does not contain any additional messages since the
    /// last time the mailbox was selected.
    Unmarked,

    /// The mailbox has child mailboxes.
    HasChildren,

    /// The mailbox has no child mailboxes.
    HasNoChildren,

    /// The mailbox name refers to a mailbox that does not exist.
    NonExistent,

    /// The mailbox is subscribed.
    Subscribed,

    /// The mailbox lives on a remote server.
    Remote,

    /// A non-standard user- or server-defined name attribute, or a special-use attribute.
    Custom(String),
}

impl NameAttribute {
    fn system(s: &str) -> Option<Self> {
        let a = match s.to_ascii_lowercase().as_str() {
            "\\noinferiors" => NameAttribute::NoInferiors,
            "\\noselect" => NameAttribute::NoSelect,
            "\\marked" => NameAttribute::Marked,
            "\\unmarked" => NameAttribute::Unmarked,
            "\\haschildren" => NameAttribute::HasChildren,
            "\\hasnochildren" => NameAttribute::HasNoChildren,
            "\\nonexistent" => NameAttribute::NonExistent,
            "\\subscribed" => NameAttribute::Subscribed,
            "\\remote" => NameAttribute::Remote,
            _ => return None,
        };
        Some(a)
    }
}

impl From<String> for NameAttribute {
    fn from(s: String) -> Self {
        NameAttribute::system(&s).unwrap_or(NameAttribute::Custom(s))
    }
}

impl<'a> From<&'a str> for NameAttribute {
    fn from(s: &'a str) -> Self {
        NameAttribute::system(s).unwrap_or_else(|| NameAttribute::Custom(s.to_string()))
    }
}

impl<'a> From<imap_proto::NameAttribute<'a>> for NameAttribute {
    fn from(a: imap_proto::NameAttribute<'a>) -> Self {
        use imap_proto::NameAttribute as Proto;
        match a {
            Proto::NoInferiors => NameAttribute::NoInferiors,
            Proto::NoSelect => NameAttribute::NoSelect,
            Proto::Marked => NameAttribute::Marked,
            Proto::Unmarked => NameAttribute::Unmarked,
            Proto::Extension(s) => NameAttribute::from(&*s),
            // special-use attributes are kept by their wire name
            other => NameAttribute::Custom(format!("\\{:?}", other)),
        }
    }
}

impl fmt::Display for NameAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NameAttribute::NoInferiors => write!(f, "\\Noinferiors"),
            NameAttribute::NoSelect => write!(f, "\\Noselect"),
            NameAttribute::Marked => write!(f, "\\Marked"),
            NameAttribute::Unmarked => write!(f, "\\Unmarked"),
            NameAttribute::HasChildren => write!(f, "\\HasChildren"),
            NameAttribute::HasNoChildren => write!(f, "\\HasNoChildren"),
            NameAttribute::NonExistent => write!(f, "\\NonExistent"),
            NameAttribute::Subscribed => write!(f, "\\Subscribed"),
            NameAttribute::Remote => write!(f, "\\Remote"),
            NameAttribute::Custom(ref s) => write!(f, "{}", s),
        }
    }
}

impl Name {
    /// Attributes of this name.
    pub fn attributes(&self) -> &[NameAttribute] {
        &self.attributes[..]
    }

    /// The hierarchy delimiter is a character used to delimit levels of hierarchy in a mailbox
    /// name.  A client can use it to create child mailboxes, and to search higher or lower levels
    /// of naming hierarchy.  All children of a top-level hierarchy node use the same
    /// separator character.  `None` means that no hierarchy exists; the name is a "flat" name.
    pub fn delimiter(&self) -> Option<&str> {
        self.delimiter.as_deref()
    }

    /// The name represents an unambiguous left-to-right hierarchy, and are valid for use as a
    /// reference in `LIST` and `LSUB` commands. Unless [`NameAttribute::NoSelect`] is indicated,
    /// the name is also valid as an argument for commands, such as `SELECT`, that accept mailbox
    /// names.
    pub fn name(&self) -> &str {
        &self.name
    }
}
