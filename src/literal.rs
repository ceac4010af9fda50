//! Literal values and their negotiation against server capabilities.
//!
//! A literal is sent as `{N}` followed by CRLF and `N` octets. A synchronizing literal waits for
//! the server's `+` continuation before the octets go out; a non-synchronizing one (`{N+}`,
//! [RFC 7888](https://tools.ietf.org/html/rfc7888)) does not. An 8-bit literal (`~{N}`,
//! [RFC 3516](https://tools.ietf.org/html/rfc3516)) may carry NUL and arbitrary binary octets.

use std::fmt;
use std::io::{self, Read, Write};

use crate::error::{Error, Result};
use crate::types::Capabilities;

/// Largest literal `LITERAL-` allows to be sent without synchronizing.
pub const LITERAL_MINUS_MAX: u64 = 4096;

/// A readable source whose total length may only become known later.
pub trait LiteralStream: Read + Send {
    /// The total number of octets this stream will produce.
    ///
    /// May block until the length is known.
    fn length(&mut self) -> io::Result<u64>;
}

/// Whether the sender waits for a continuation before the literal's octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// `{N}`: always wait for `+`.
    Synchronizing,
    /// `{N+}`: never wait, even if the server did not advertise `LITERAL+`/`LITERAL-`.
    NonSynchronizing,
    /// Use `{N+}` when the server allows it for this length, `{N}` otherwise.
    #[default]
    NonSynchronizingIfCapable,
}

/// Whether the literal is sent as 7-bit text or as 8-bit binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiteralMode {
    /// Plain `{N}` literal.
    #[default]
    Literal,
    /// `~{N}` literal, requires `BINARY`.
    Literal8,
    /// `~{N}` when the server advertises `BINARY`, `{N}` otherwise.
    Literal8IfCapable,
}

enum Source {
    Bytes(Vec<u8>),
    Stream(Box<dyn LiteralStream>),
}

/// The server abilities that decide how a literal goes on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub(crate) literal_plus: bool,
    pub(crate) literal_minus: bool,
    pub(crate) binary: bool,
    pub(crate) strict: bool,
}

impl Negotiated {
    pub(crate) fn new(capabilities: &Capabilities, strict: bool) -> Self {
        Negotiated {
            literal_plus: capabilities.has("LITERAL+"),
            literal_minus: capabilities.has("LITERAL-"),
            binary: capabilities.has("BINARY"),
            strict,
        }
    }
}

/// How a literal was finally encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resolved {
    pub(crate) length: u64,
    pub(crate) synchronizing: bool,
    pub(crate) binary: bool,
}

impl Resolved {
    /// The `{N}`, `{N+}` or `~{N}` prefix that announces the literal.
    pub(crate) fn prefix(&self) -> String {
        format!(
            "{}{{{}{}}}",
            if self.binary { "~" } else { "" },
            self.length,
            if self.synchronizing { "" } else { "+" }
        )
    }
}

/// A string or binary payload sent as an IMAP literal.
pub struct Literal {
    source: Source,
    sync: SyncMode,
    mode: LiteralMode,
    negotiated: Option<Negotiated>,
}

impl fmt::Debug for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            Source::Bytes(ref b) => format!("{} octets", b.len()),
            Source::Stream(_) => "stream".to_string(),
        };
        f.debug_struct("Literal")
            .field("source", &source)
            .field("sync", &self.sync)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Literal {
    /// A literal with in-memory content.
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Literal {
            source: Source::Bytes(content.into()),
            sync: SyncMode::default(),
            mode: LiteralMode::default(),
            negotiated: None,
        }
    }

    /// A literal read from `stream` while the command is being sent.
    pub fn from_stream(stream: impl LiteralStream + 'static) -> Self {
        Literal {
            source: Source::Stream(Box::new(stream)),
            sync: SyncMode::default(),
            mode: LiteralMode::default(),
            negotiated: None,
        }
    }

    /// Set the synchronization mode.
    pub fn sync_mode(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    /// Set the literal mode.
    pub fn literal_mode(mut self, mode: LiteralMode) -> Self {
        self.mode = mode;
        self
    }

    /// The in-memory content, if this literal is not streamed.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self.source {
            Source::Bytes(ref b) => Some(b),
            Source::Stream(_) => None,
        }
    }

    /// Record the server's abilities ahead of sending.
    ///
    /// In-memory literals are resolved right away, so an incapable server is reported before any
    /// byte is written. Streamed literals finish resolving once their length is known.
    pub(crate) fn negotiate(&mut self, negotiated: Negotiated) -> Result<()> {
        self.negotiated = Some(negotiated);
        if negotiated.strict && self.mode == LiteralMode::Literal8 && !negotiated.binary {
            return Err(Error::Incapable("BINARY".to_string()));
        }
        if let Source::Bytes(ref b) = self.source {
            let length = b.len() as u64;
            self.resolve(length)?;
        }
        Ok(())
    }

    /// Settle the wire form for a payload of `length` octets.
    pub(crate) fn resolve(&self, length: u64) -> Result<Resolved> {
        let n = self.negotiated.unwrap_or_default();
        let non_sync_allowed = n.literal_plus || (n.literal_minus && length <= LITERAL_MINUS_MAX);
        let synchronizing = match self.sync {
            SyncMode::Synchronizing => true,
            SyncMode::NonSynchronizingIfCapable => !non_sync_allowed,
            SyncMode::NonSynchronizing => {
                if n.strict && !non_sync_allowed {
                    let missing = if length <= LITERAL_MINUS_MAX {
                        "LITERAL-"
                    } else {
                        "LITERAL+"
                    };
                    return Err(Error::Incapable(missing.to_string()));
                }
                false
            }
        };
        let binary = match self.mode {
            LiteralMode::Literal => false,
            LiteralMode::Literal8 => true,
            LiteralMode::Literal8IfCapable => n.binary,
        };
        Ok(Resolved {
            length,
            synchronizing,
            binary,
        })
    }

    /// Find the length, blocking on a stream if needed, and resolve the wire form.
    pub(crate) fn open(&mut self) -> Result<Resolved> {
        let length = match self.source {
            Source::Bytes(ref b) => b.len() as u64,
            Source::Stream(ref mut s) => s.length()?,
        };
        self.resolve(length)
    }

    /// Copy exactly `length` octets of payload into `w`.
    pub(crate) fn write_payload(&mut self, w: &mut dyn Write, length: u64) -> Result<()> {
        match self.source {
            Source::Bytes(ref b) => w.write_all(b)?,
            Source::Stream(ref mut s) => {
                let copied = io::copy(&mut s.take(length), w)?;
                if copied != length {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("literal stream ended after {} of {} octets", copied, length),
                    )));
                }
            }
        }
        Ok(())
    }
}

impl From<Vec<u8>> for Literal {
    fn from(content: Vec<u8>) -> Self {
        Literal::new(content)
    }
}

impl<'a> From<&'a [u8]> for Literal {
    fn from(content: &'a [u8]) -> Self {
        Literal::new(content)
    }
}
