//! A blocking IMAP4rev1 client transaction engine.
//!
//! A [`Session`] owns one connection to an IMAP server. Every request is a [`Transaction`]: the
//! engine admits one at a time, writes it (literals included), collects every response up to
//! the tagged completion and folds the untagged data back into the session's view of the
//! server before handing the caller a [`TransactionResult`]. The session tracks the protocol
//! state, the capabilities and a [`MailboxDirectory`] of the mailboxes it has seen, including
//! the sequence-to-UID map of the selected one.
//!
//! Tagged `NO` and `BAD` are ordinary results. Errors are reserved for misuse of the session,
//! for missing capabilities and for transport failures, which also close the connection.
//!
//! # Usage
//!
//! ```no_run
//! use imap_engine::SessionBuilder;
//!
//! fn main() -> imap_engine::Result<()> {
//!     let mut session = SessionBuilder::new("imap.example.com", 993)
//!         .login("me@example.com", "password")?;
//!
//!     let inbox = session.select("INBOX")?.into_value()?;
//!     println!("{} messages", session.mailbox(inbox)?.exists);
//!
//!     let fetches = session.fetch("1:*", "(UID FLAGS)")?.into_value()?;
//!     for fetch in &fetches {
//!         println!("{:?} {:?}", fetch.uid, fetch.flags());
//!     }
//!
//!     session.disconnect(true)
//! }
//! ```
//!
//! Uploads and downloads can stream instead of buffering whole messages, see
//! [`Session::prepare_append`] and [`Session::fetch_body_stream`]. Waiting for new mail with
//! `IDLE`, or by polling where the server lacks it, is [`Session::watch`].

mod body_stream;
mod client;
mod client_builder;
mod conn;
mod engine;
mod literal;
mod mailbox;
mod parse;
mod session;
mod transaction;
mod utils;

pub mod authenticator;
pub mod error;
pub mod extensions;
pub mod types;

pub use crate::authenticator::Authenticator;
pub use crate::body_stream::{
    channel, BodyReader, BodyWriter, ChannelOptions, FailureMapper, FetchBodyStream,
};
pub use crate::client::AppendUpload;
pub use crate::client_builder::{ConnectionMode, SessionBuilder, TlsKind};
pub use crate::conn::{BoxedConnection, ImapConnection, ShutdownHandle, Transport};
pub use crate::engine::Pending;
pub use crate::error::{Error, Result};
pub use crate::extensions::idle::{
    KeepAlive, MessageArrival, Watch, WatchGoal, WatchMode, WatchOptions, WatchReport,
};
pub use crate::literal::{Literal, LiteralMode, LiteralStream, SyncMode};
pub use crate::mailbox::{Mailbox, MailboxDirectory, MailboxId};
pub use crate::session::{Authority, ReferralPolicy, Session, SessionOptions, State};
pub use crate::transaction::{
    Argument, Command, RequestArguments, ResultCode, Transaction, TransactionResult,
};
pub use crate::types::*;

#[cfg(feature = "test_helpers")]
pub mod testing;
#[cfg(all(test, not(feature = "test_helpers")))]
mod testing;

#[cfg(test)]
mod mock_stream;
