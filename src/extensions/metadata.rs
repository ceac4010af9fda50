//! Adds support for the IMAP METADATA extension specificed in [RFC
//! 5464](https://tools.ietf.org/html/rfc5464).
//!
//! Mailboxes or the server as a whole may have zero or more annotations associated with them. An
//! annotation contains a uniquely named entry, which has a value. Annotations can be added to
//! mailboxes when a mailbox name is provided as the first argument to
//! [`set_metadata`](Session::set_metadata), or to the server as a whole when the first argument is
//! `None`.
//!
//! For example, a general comment being added to a mailbox may have an entry name of "/comment"
//! and a value of "Really useful mailbox".

use crate::error::Result;
use crate::session::{Session, State};
use crate::transaction::{Argument, Command, TransactionResult};
use crate::types::{Completion, ResponseCode, ServerResponse};
use crate::Literal;

/// One annotation: an entry name and its value. A `None` value removes the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub entry: String,
    pub value: Option<String>,
}

/// Represents variants of the `DEPTH` parameter for the `GETMETADATA` command.
///
/// When a non-zero depth is specified with the `GETMETADATA` command, it extends the list of entry
/// values returned by the server. For each entry name specified in the `GETMETADATA` command, the
/// server returns the value of the specified entry name (if it exists), plus all entries below the
/// entry name up to the specified `DEPTH`.
///
/// See also [RFC 5464, section 4.2.2](https://tools.ietf.org/html/rfc5464#section-4.2.2).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum MetadataDepth {
    /// No entries below the specified entry are returned.
    #[default]
    Zero,
    /// Only entries immediately below the specified entry are returned.
    ///
    /// Thus, a depth of one for an entry `/a` will match `/a` as well as its children entries
    /// (e.g., `/a/b`), but will not match grandchildren entries (e.g., `/a/b/c`).
    One,
    /// All entries below the specified entry are returned
    Infinity,
}

impl MetadataDepth {
    fn depth_str(self) -> &'static str {
        match self {
            MetadataDepth::Zero => "0",
            MetadataDepth::One => "1",
            MetadataDepth::Infinity => "infinity",
        }
    }
}

/// The entries a `GETMETADATA` returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataResult {
    pub entries: Vec<Metadata>,
    /// With `MAXSIZE`, the size of the biggest entry that was left out.
    pub long_entries: Option<u64>,
}

fn collect_metadata(responses: &[ServerResponse], completion: &Completion) -> MetadataResult {
    let entries = responses
        .iter()
        .filter_map(|r| match r {
            ServerResponse::Metadata { entries, .. } => Some(entries.iter().cloned()),
            _ => None,
        })
        .flatten()
        .collect();
    let long_entries = match completion.code {
        Some(ResponseCode::MetadataLongEntries(n)) => Some(n),
        _ => None,
    };
    MetadataResult {
        entries,
        long_entries,
    }
}

fn mailbox_argument(mailbox: Option<&str>) -> Argument {
    Argument::quoted(mailbox.unwrap_or_default())
}

fn value_argument(value: &Option<String>) -> Argument {
    match value {
        None => Argument::Nil,
        Some(v) if v.contains(['\r', '\n']) => Argument::literal(Literal::new(v.as_bytes())),
        Some(v) => Argument::quoted(v.as_str()),
    }
}

impl Session {
    /// Retrieve server or mailbox annotations.
    ///
    /// This uses the `GETMETADATA` command defined in the METADATA extension of the IMAP protocol.
    /// See [RFC 5464, section 4.2](https://tools.ietf.org/html/rfc5464#section-4.2) for more
    /// details. Server support for the extension is indicated by the `METADATA` capability.
    ///
    /// When the mailbox name is `None`, this command retrieves server annotations. Otherwise,
    /// this command retrieves annotations on the specified mailbox. If the `METADATA-SERVER`
    /// capability is present, server metadata is supported, but not mailbox metadata.
    ///
    /// The `depth` argument dictates whether metadata on children of the requested entity are
    /// returned. See [`MetadataDepth`] for details.
    ///
    /// When `maxsize` is specified, it restricts which entry values are returned by the server.
    /// Only entries that are less than or equal in octet size to the specified `maxsize` are
    /// returned. If there are any entries with values larger than `maxsize`, the result also
    /// carries the size of the biggest entry requested by the client that exceeded `maxsize`.
    pub fn get_metadata(
        &mut self,
        mailbox: Option<&str>,
        entries: &[impl AsRef<str>],
        depth: MetadataDepth,
        maxsize: Option<usize>,
    ) -> Result<TransactionResult<MetadataResult>> {
        self.require_state(State::Authenticated)?;
        let mut options = vec![Argument::atom("DEPTH"), Argument::atom(depth.depth_str())];
        if let Some(size) = maxsize {
            options.push(Argument::atom("MAXSIZE"));
            options.push(Argument::atom(size));
        }
        let mut command = Command::new("GETMETADATA", collect_metadata)
            .arg("options", Argument::List(options))
            .arg("mailbox", mailbox_argument(mailbox))
            .arg(
                "entries",
                Argument::List(
                    entries
                        .iter()
                        .map(|e| Argument::quoted(e.as_ref()))
                        .collect(),
                ),
            );
        if mailbox.is_some() {
            command = command.require("METADATA");
        }
        self.execute(command)
    }

    /// Set annotations.
    ///
    /// This command sets the specified list of entries by adding or replacing the specified values
    /// provided, on the specified existing mailboxes or on the server (if the mailbox argument is
    /// `None`). Clients can use `None` for the value of entries it wants to remove.
    ///
    /// If the server is unable to set an annotation because the size of its value is too large,
    /// the result fails with [`ResponseCode::MetadataMaxSize`]. A server at its annotation limit
    /// answers [`ResponseCode::MetadataTooMany`], one without private annotations on the mailbox
    /// [`ResponseCode::MetadataNoPrivate`].
    ///
    /// When any one annotation fails to be set, the server will not change the values for other
    /// annotations specified.
    ///
    /// See [RFC 5464, section 4.3](https://tools.ietf.org/html/rfc5464#section-4.3)
    pub fn set_metadata(
        &mut self,
        mailbox: Option<&str>,
        annotations: &[Metadata],
    ) -> Result<TransactionResult<()>> {
        self.require_state(State::Authenticated)?;
        let mut items = Vec::with_capacity(annotations.len() * 2);
        for annotation in annotations {
            items.push(Argument::quoted(annotation.entry.as_str()));
            items.push(value_argument(&annotation.value));
        }
        let mut command = Command::simple("SETMETADATA")
            .arg("mailbox", mailbox_argument(mailbox))
            .arg("annotations", Argument::List(items));
        if mailbox.is_some() {
            command = command.require("METADATA");
        }
        self.execute(command)
    }
}
