//! The session state machine.
//!
//! A [`Session`] owns one connection and follows it through the states of [RFC 3501 section
//! 3](https://tools.ietf.org/html/rfc3501#section-3): not authenticated, authenticated and
//! selected, until the connection is gone.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::body_stream::ChannelOptions;
use crate::conn::{BoxedConnection, Connection, ImapConnection};
use crate::error::{Error, ParseError, Rejection, Result};
use crate::mailbox::{Mailbox, MailboxDirectory, MailboxId};
use crate::types::{Capabilities, ResponseCode, ServerResponse, Status};

/// Default size of a block fetched by a body download.
pub const DEFAULT_FETCH_BLOCK_SIZE: usize = 10 * 1024;

/// Where a session stands in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    /// The connection is gone. Only a new session can continue.
    NotConnected,
    /// Greeted, waiting for `LOGIN` or `AUTHENTICATE`.
    NotAuthenticated,
    /// Logged in, no mailbox selected.
    Authenticated,
    /// A mailbox is selected.
    Selected,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::NotConnected => "not connected",
            State::NotAuthenticated => "not authenticated",
            State::Authenticated => "authenticated",
            State::Selected => "selected",
        })
    }
}

/// What to do with a `[REFERRAL ...]` code. Referrals are never followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferralPolicy {
    /// Log the candidate URIs and hand back the ordinary result.
    #[default]
    Log,
    /// Raise [`Error::MailboxReferral`] or [`Error::LoginReferral`].
    Raise,
}

/// Tunables of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bound on a whole transaction. On expiry the connection is torn down.
    pub transaction_timeout: Option<Duration>,
    /// Transport write timeout.
    pub send_timeout: Option<Duration>,
    /// Transport read timeout.
    pub receive_timeout: Option<Duration>,
    pub referral_policy: ReferralPolicy,
    /// Refuse, before sending, requests that need a capability the server did not advertise.
    pub strict_capabilities: bool,
    /// Apply unsolicited `EXISTS`/`RECENT`/`EXPUNGE`/`FETCH` data to the selected mailbox.
    pub track_mailbox_updates: bool,
    /// Flow control of upload channels.
    pub body_channel: ChannelOptions,
    /// Octets requested per partial `FETCH` of a body download.
    pub fetch_block_size: usize,
    /// Permit `LOGIN` over a transport that is not encrypted.
    pub allow_insecure_login: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            transaction_timeout: None,
            send_timeout: None,
            receive_timeout: None,
            referral_policy: ReferralPolicy::default(),
            strict_capabilities: false,
            track_mailbox_updates: true,
            body_channel: ChannelOptions::default(),
            fetch_block_size: DEFAULT_FETCH_BLOCK_SIZE,
            allow_insecure_login: false,
        }
    }
}

/// Who the session talks to, and as whom.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authority {
    /// `imap` or `imaps`.
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Set once authentication succeeded.
    pub user: Option<String>,
    /// `LOGIN` or the SASL mechanism name.
    pub mechanism: Option<String>,
}

/// An IMAP session over one connection.
///
/// All methods take `&mut self`: the session admits one transaction at a time and refuses a
/// second one with [`Error::ProtocolViolation`] instead of queueing it. Transactions started
/// with [`start`](Session::start) and watches started with [`watch`](Session::watch) run on a
/// background thread; the session's own fields are only changed on the caller's thread once
/// their results are collected.
pub struct Session {
    pub(crate) wire: Arc<Mutex<Option<Connection>>>,
    pub(crate) busy: Arc<AtomicBool>,
    pub(crate) idling: Arc<AtomicBool>,
    pub(crate) state: State,
    pub(crate) capabilities: Capabilities,
    pub(crate) directory: Option<MailboxDirectory>,
    pub(crate) selected: Option<MailboxId>,
    /// The mailbox a `SELECT`/`EXAMINE` in flight is about to select.
    pub(crate) pending_selection: Option<MailboxId>,
    pub(crate) authority: Authority,
    pub(crate) options: SessionOptions,
    pub(crate) secure: bool,
    pub(crate) greeting: Option<String>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("capabilities", &self.capabilities)
            .field("selected", &self.selected)
            .field("authority", &self.authority)
            .field("secure", &self.secure)
            .finish()
    }
}

impl Session {
    /// Start a session over a plaintext transport and process the server greeting.
    pub fn open<S: ImapConnection + 'static>(stream: S, options: SessionOptions) -> Result<Self> {
        Session::open_boxed(Box::new(stream), false, options, Authority::default())
    }

    /// Start a session over a transport that is already encrypted.
    pub fn open_secure<S: ImapConnection + 'static>(
        stream: S,
        options: SessionOptions,
    ) -> Result<Self> {
        Session::open_boxed(Box::new(stream), true, options, Authority::default())
    }

    pub(crate) fn open_boxed(
        stream: BoxedConnection,
        secure: bool,
        options: SessionOptions,
        authority: Authority,
    ) -> Result<Self> {
        let mut conn = Connection::new(stream, secure);
        conn.set_timeouts(options.send_timeout, options.receive_timeout)?;
        let greeting = conn.read_response()?;

        let mut session = Session {
            wire: Arc::new(Mutex::new(None)),
            busy: Arc::new(AtomicBool::new(false)),
            idling: Arc::new(AtomicBool::new(false)),
            state: State::NotConnected,
            capabilities: Capabilities::new(),
            directory: None,
            selected: None,
            pending_selection: None,
            authority,
            options,
            secure,
            greeting: None,
        };

        let (status, code, text) = match greeting {
            ServerResponse::Untagged { status, code, text } => (status, code, text),
            other => {
                conn.close();
                return Err(Error::Parse(ParseError::Invalid(
                    format!("{:?}", other).into_bytes(),
                )));
            }
        };

        let next = match status {
            Status::Ok => State::NotAuthenticated,
            Status::PreAuth => State::Authenticated,
            Status::Bye => {
                conn.close();
                if let Some(ResponseCode::Referral(referrals)) = code {
                    if session.options.referral_policy == ReferralPolicy::Raise {
                        return Err(Error::LoginReferral { referrals, text });
                    }
                    warn!(?referrals, "login referral in greeting: {}", text);
                    return Err(Error::ConnectionRefused(Rejection {
                        code: Some(ResponseCode::Referral(referrals)),
                        information: text,
                    }));
                }
                return Err(Error::ConnectionRefused(Rejection {
                    code,
                    information: text,
                }));
            }
            Status::No | Status::Bad => {
                conn.close();
                return Err(Error::Parse(ParseError::Invalid(text.into_bytes())));
            }
        };

        session.capabilities = match code {
            Some(ResponseCode::Capabilities(ref tokens)) => tokens.iter().cloned().collect(),
            _ => std::iter::once("IMAP4rev1").collect(),
        };
        if let Some(ResponseCode::Alert) = code {
            warn!(connection = conn.id(), "ALERT: {}", text);
        }
        session.greeting = Some(text);
        session.wire = Arc::new(Mutex::new(Some(conn)));
        session.set_state(State::NotAuthenticated);
        if next == State::Authenticated {
            session.set_state(State::Authenticated);
        }
        Ok(session)
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The capabilities last advertised by the server.
    ///
    /// Empty between a successful `STARTTLS` and the next `CAPABILITY`.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Whether the transport is encrypted.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The text of the server greeting.
    pub fn greeting(&self) -> Option<&str> {
        self.greeting.as_deref()
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Look up a mailbox by handle.
    pub fn mailbox(&self, id: MailboxId) -> Result<&Mailbox> {
        self.directory
            .as_ref()
            .and_then(|d| d.get(id))
            .ok_or(Error::MailboxClosed)
    }

    /// The selected mailbox, if any.
    pub fn selected_mailbox(&self) -> Option<&Mailbox> {
        self.selected.and_then(|id| self.mailbox(id).ok())
    }

    /// The mailboxes known to this session, present while authenticated.
    pub fn directory(&self) -> Option<&MailboxDirectory> {
        self.directory.as_ref()
    }

    pub(crate) fn directory_mut(&mut self) -> Result<&mut MailboxDirectory> {
        match self.directory {
            Some(ref mut d) => Ok(d),
            None => Err(Error::ProtocolViolation(format!(
                "no mailbox directory while {}",
                self.state
            ))),
        }
    }

    /// Fail unless the session is at least in `required`.
    pub(crate) fn require_state(&self, required: State) -> Result<()> {
        if self.state < required {
            return Err(Error::ProtocolViolation(format!(
                "operation requires the {} state, session is {}",
                required, self.state
            )));
        }
        Ok(())
    }

    /// Fail unless the session is exactly in `required`.
    pub(crate) fn require_exact_state(&self, required: State) -> Result<()> {
        if self.state != required {
            return Err(Error::ProtocolViolation(format!(
                "operation requires the {} state, session is {}",
                required, self.state
            )));
        }
        Ok(())
    }

    /// Move to `next`, keeping the directory and selection consistent with it.
    pub(crate) fn set_state(&mut self, next: State) {
        let previous = self.state;
        if previous == next {
            return;
        }
        match next {
            State::NotConnected => {
                self.detach_directory();
                self.authority.user = None;
                self.authority.mechanism = None;
            }
            State::NotAuthenticated => self.detach_directory(),
            State::Authenticated => {
                self.selected = None;
                if previous < State::Authenticated {
                    self.directory = Some(MailboxDirectory::new());
                }
            }
            State::Selected => {}
        }
        self.state = next;
        debug!(from = %previous, to = %next, "session state changed");
    }

    fn detach_directory(&mut self) {
        if let Some(mut directory) = self.directory.take() {
            directory.detach_all();
        }
        self.selected = None;
        self.pending_selection = None;
    }

    /// Close the session. With `logout`, the selected mailbox is closed and `LOGOUT` sent first.
    ///
    /// The session ends up not connected either way.
    pub fn disconnect(&mut self, logout: bool) -> Result<()> {
        self.refuse_while_watching()?;
        if self.state == State::NotConnected {
            return Ok(());
        }
        let mut outcome = Ok(());
        if logout {
            if self.state == State::Selected {
                if let Err(e) = self.close() {
                    outcome = Err(e);
                }
            }
            if self.state != State::NotConnected {
                if let Err(e) = self.logout() {
                    outcome = outcome.and(Err(e));
                }
            }
        }
        self.close_connection();
        outcome
    }
}
