use std::collections::BTreeMap;
use std::fmt;

/// From [section 7.2.1 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-7.2.1).
///
/// A list of capabilities that the server supports.
/// The capability list will include the atom "IMAP4rev1".
///
/// A capability name which begins with `AUTH=` indicates that the server supports that particular
/// authentication mechanism. Names beginning with `CONTEXT=` announce
/// [RFC 5267](https://tools.ietf.org/html/rfc5267) contexts.
///
/// The `LOGINDISABLED` capability indicates that the `LOGIN` command is disabled, and that the
/// server will respond with a `NO` response to any attempt to use the `LOGIN` command even if the
/// user name and password are valid.  An IMAP client MUST NOT issue the `LOGIN` command if the
/// server advertises the `LOGINDISABLED` capability.
///
/// Tokens compare case-insensitively. The set is replaced wholesale whenever the server
/// re-advertises its capabilities.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Capabilities(
    // upper-cased token -> token as advertised
    BTreeMap<String, String>,
);

impl Capabilities {
    /// An empty capability set.
    pub fn new() -> Self {
        Capabilities::default()
    }

    /// Check if the server has the given capability.
    pub fn has(&self, s: &str) -> bool {
        self.0.contains_key(&s.to_ascii_uppercase())
    }

    /// Add a single token.
    pub fn insert(&mut self, token: impl Into<String>) {
        let token = token.into();
        self.0.insert(token.to_ascii_uppercase(), token);
    }

    /// Iterate over all the server's capabilities, as advertised.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    /// The SASL mechanisms named by `AUTH=` tokens.
    pub fn auth_mechanisms(&self) -> impl Iterator<Item = &str> {
        self.with_prefix("AUTH=")
    }

    /// The contexts named by `CONTEXT=` tokens, e.g. `SEARCH` and `SORT`.
    pub fn contexts(&self) -> impl Iterator<Item = &str> {
        self.with_prefix("CONTEXT=")
    }

    fn with_prefix<'a>(&'a self, prefix: &'static str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.starts_with(prefix))
            .map(move |(_, v)| &v[prefix.len()..])
    }

    /// Whether the server supports the given SASL mechanism.
    pub fn has_auth(&self, mechanism: &str) -> bool {
        self.has(&format!("AUTH={}", mechanism))
    }

    /// Returns how many capabilities the server has.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the server purports to have no capabilities.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }
}

impl<S: Into<String>> FromIterator<S> for Capabilities {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut caps = Capabilities::new();
        for token in iter {
            caps.insert(token);
        }
        caps
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
