//! The command surface: one method per IMAP verb on [`Session`].
//!
//! Every method builds a [`Command`] (or, for `AUTHENTICATE`, a dedicated [`Transaction`]) and
//! hands it to the engine. Preconditions that can be decided locally, such as the state a verb
//! needs or whether a mailbox name is already taken, are checked before anything is sent and
//! reported as [`Error::ProtocolViolation`].
//!
//! Tagged `NO` and `BAD` completions are not errors: they come back as failed
//! [`TransactionResult`]s.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::Ordering;

use base64::Engine as _;
use chrono::{DateTime, FixedOffset};
use tracing::{debug, error};

use crate::authenticator::Authenticator;
use crate::body_stream::{channel, BodyWriter, FetchBodyStream};
use crate::conn::BoxedConnection;
use crate::engine::{lock_wire, Pending};
use crate::error::{Error, Result};
use crate::extensions::sort::{
    parse_esearch, Esearch, SearchReturn, SortCharset, SortCriteria, SortCriterion,
};
use crate::literal::Literal;
use crate::mailbox::MailboxId;
use crate::parse::parse_authenticate_response;
use crate::session::{Session, State};
use crate::transaction::{Argument, Command, RequestArguments, Transaction, TransactionResult};
use crate::types::{
    Appended, Capabilities, Completion, Copied, Fetch, Flag, Name, NameAttribute, ResponseCode,
    Seq, ServerResponse, StatusItem, Uid,
};
use crate::utils::{is_inbox, iter_join, validate_str};

/// `date-time` as used by `APPEND`.
const DATE_TIME_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

pub(crate) fn collect_fetches(responses: &[ServerResponse], _: &Completion) -> Vec<Fetch> {
    responses
        .iter()
        .filter_map(|r| match r {
            ServerResponse::Fetch(f) => Some(f.clone()),
            _ => None,
        })
        .collect()
}

fn collect_numbers(responses: &[ServerResponse], _: &Completion) -> Vec<u32> {
    responses
        .iter()
        .filter_map(|r| match r {
            ServerResponse::Search(ids) | ServerResponse::Sort(ids) => Some(ids.iter().copied()),
            _ => None,
        })
        .flatten()
        .collect()
}

fn collect_expunged(responses: &[ServerResponse], _: &Completion) -> Vec<Seq> {
    responses
        .iter()
        .filter_map(|r| match *r {
            ServerResponse::Expunge(seq) => Some(seq),
            _ => None,
        })
        .collect()
}

fn collect_capabilities(responses: &[ServerResponse], completion: &Completion) -> Capabilities {
    let advertised = responses.iter().rev().find_map(|r| match r {
        ServerResponse::Capabilities(tokens) => Some(tokens),
        _ => None,
    });
    match (advertised, &completion.code) {
        (Some(tokens), _) | (None, Some(ResponseCode::Capabilities(tokens))) => {
            tokens.iter().cloned().collect()
        }
        _ => Capabilities::new(),
    }
}

fn collect_names(responses: &[ServerResponse], _: &Completion) -> Vec<Name> {
    responses
        .iter()
        .filter_map(|r| match r {
            ServerResponse::List(name) => Some(name.clone()),
            _ => None,
        })
        .collect()
}

fn collect_status(responses: &[ServerResponse], _: &Completion) -> Vec<StatusItem> {
    responses
        .iter()
        .filter_map(|r| match r {
            ServerResponse::Status { items, .. } => Some(items.iter().copied()),
            _ => None,
        })
        .flatten()
        .collect()
}

fn collect_enabled(responses: &[ServerResponse], _: &Completion) -> Vec<String> {
    responses
        .iter()
        .filter_map(|r| match r {
            ServerResponse::Other(line) => line.strip_prefix("* ENABLED"),
            _ => None,
        })
        .flat_map(|rest| rest.split_whitespace().map(str::to_string))
        .collect()
}

/// The `ESEARCH` answer to this command, or one computed from a plain `SEARCH` answer when
/// the server ignored `RETURN`.
fn collect_esearch(responses: &[ServerResponse], completion: &Completion) -> Esearch {
    let answer = responses
        .iter()
        .filter_map(parse_esearch)
        .find(|e| e.tag.as_deref().map_or(true, |t| t == completion.tag));
    if let Some(answer) = answer {
        return answer;
    }
    let numbers = collect_numbers(responses, completion);
    Esearch {
        min: numbers.iter().min().copied(),
        max: numbers.iter().max().copied(),
        count: Some(numbers.len() as u32),
        all: if numbers.is_empty() {
            None
        } else {
            Some(iter_join(&numbers, ","))
        },
        ..Esearch::default()
    }
}

fn appended(_: &[ServerResponse], completion: &Completion) -> Appended {
    Appended::from_completion(completion)
}

fn copied(_: &[ServerResponse], completion: &Completion) -> Copied {
    Copied::from_completion(completion)
}

fn append_command(
    mailbox: &str,
    flags: &[Flag],
    date: Option<DateTime<FixedOffset>>,
    messages: Vec<Literal>,
) -> Command<Appended> {
    let mut command = Command::new("APPEND", appended).arg("mailbox", Argument::quoted(mailbox));
    if !flags.is_empty() {
        command = command.arg(
            "flags",
            Argument::List(flags.iter().map(Argument::atom).collect()),
        );
    }
    if let Some(date) = date {
        command = command.arg(
            "date",
            Argument::quoted(date.format(DATE_TIME_FORMAT).to_string()),
        );
    }
    for (i, message) in messages.into_iter().enumerate() {
        command = command.arg(&format!("message{}", i), Argument::Literal(message));
    }
    command
}

fn login_referral(e: Error) -> Error {
    match e {
        Error::MailboxReferral { referrals, text } => Error::LoginReferral { referrals, text },
        e => e,
    }
}

/// `AUTHENTICATE`: every continuation is a base64 challenge for the [`Authenticator`].
struct Authenticate<A> {
    authenticator: A,
    arguments: RequestArguments,
}

impl<A: Authenticator + Send> Transaction for Authenticate<A> {
    type Output = ();

    fn command(&self) -> &str {
        "AUTHENTICATE"
    }

    fn arguments(&self) -> &RequestArguments {
        &self.arguments
    }

    fn arguments_mut(&mut self) -> &mut RequestArguments {
        &mut self.arguments
    }

    fn on_continuation(&mut self, text: &str) -> Result<Option<Vec<u8>>> {
        let challenge = parse_authenticate_response(text)?;
        let response = self.authenticator.process(&challenge);
        let encoded = base64::engine::general_purpose::STANDARD.encode(response.as_ref());
        Ok(Some(encoded.into_bytes()))
    }

    fn build_result(&mut self, _: &[ServerResponse], _: &Completion) -> Self::Output {}
}

/// An `APPEND` whose message is written while it is being sent.
///
/// Obtained from [`Session::prepare_append`]. Write the message into it, then call
/// [`finish`](Self::finish); the session refuses other transactions until then.
#[derive(Debug)]
#[must_use = "an upload must be finished for its result to reach the session"]
pub struct AppendUpload {
    writer: BodyWriter,
    pending: Pending<Command<Appended>>,
}

impl AppendUpload {
    /// Octets written so far.
    pub fn written(&self) -> u64 {
        self.writer.written()
    }

    /// End the message and wait for the server's verdict.
    pub fn finish(self, session: &mut Session) -> Result<TransactionResult<Appended>> {
        let AppendUpload {
            mut writer,
            pending,
        } = self;
        writer.close();
        session.await_result(pending)
    }
}

impl Write for AppendUpload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl fmt::Display for AppendUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "APPEND upload, {} octets written", self.written())
    }
}

impl Session {
    fn require_capability(&self, capability: &str) -> Result<()> {
        if self.capabilities.has(capability) {
            Ok(())
        } else {
            Err(Error::Incapable(capability.to_string()))
        }
    }

    /// Refuse early, before local state is touched, when the engine would refuse anyway.
    fn require_free_wire(&self) -> Result<()> {
        self.refuse_while_watching()?;
        if self.busy.load(Ordering::Acquire) {
            return Err(Error::ProtocolViolation(
                "another transaction proceeding".to_string(),
            ));
        }
        Ok(())
    }

    fn selected_command<O: Send + 'static>(
        &mut self,
        command: Command<O>,
    ) -> Result<TransactionResult<O>> {
        self.require_exact_state(State::Selected)?;
        self.execute(command)
    }

    /// Ask the server for its capabilities. The session's own set is replaced by the answer.
    pub fn capability(&mut self) -> Result<TransactionResult<Capabilities>> {
        self.execute(Command::new("CAPABILITY", collect_capabilities))
    }

    /// Noop does nothing, but gives the server a chance to report mailbox changes.
    pub fn noop(&mut self) -> Result<TransactionResult<()>> {
        self.execute(Command::simple("NOOP"))
    }

    /// Log out. The connection is closed afterwards, whatever the server answered.
    pub fn logout(&mut self) -> Result<TransactionResult<()>> {
        let result = self.execute(Command::simple("LOGOUT"))?;
        if self.state != State::NotConnected {
            self.set_state(State::NotAuthenticated);
            self.close_connection();
        }
        Ok(result)
    }

    /// Run any command, given without its tag. The raw responses are in the result.
    pub fn run_command(&mut self, command: &str) -> Result<TransactionResult<()>> {
        self.execute(Command::simple(command.to_string()))
    }

    /// Issue `STARTTLS` and encrypt the transport with `handshake`.
    ///
    /// The capability set is cleared as soon as the server agrees and refreshed with a new
    /// `CAPABILITY` over the encrypted transport. A failed handshake closes the connection.
    pub fn starttls<F>(&mut self, handshake: F) -> Result<TransactionResult<()>>
    where
        F: FnOnce(BoxedConnection) -> Result<BoxedConnection>,
    {
        self.require_exact_state(State::NotAuthenticated)?;
        if self.secure {
            return Err(Error::ProtocolViolation(
                "connection is already encrypted".to_string(),
            ));
        }
        let result = self.execute(Command::simple("STARTTLS").require("STARTTLS"))?;
        if result.failed() {
            return Ok(result);
        }
        self.capabilities.clear();
        let upgraded = match lock_wire(&self.wire).as_mut() {
            Some(conn) => conn.upgrade(handshake),
            None => Err(Error::ConnectionLost),
        };
        if let Err(e) = upgraded {
            error!("TLS upgrade failed, closing connection: {}", e);
            self.close_connection();
            return Err(e);
        }
        self.secure = true;
        self.capability()?;
        Ok(result)
    }

    fn authenticated(&mut self, user: Option<&str>, mechanism: &str) {
        if self.state != State::NotAuthenticated {
            return;
        }
        self.set_state(State::Authenticated);
        self.authority.user = user.map(str::to_string);
        self.authority.mechanism = Some(mechanism.to_string());
    }

    /// Log in to the IMAP server.
    ///
    /// Refused locally if the server advertises `LOGINDISABLED`, or if the transport is not
    /// encrypted and [`allow_insecure_login`](crate::SessionOptions::allow_insecure_login) is
    /// off.
    pub fn login(&mut self, username: &str, password: &str) -> Result<TransactionResult<()>> {
        self.require_exact_state(State::NotAuthenticated)?;
        if self.capabilities.has("LOGINDISABLED") {
            return Err(Error::ProtocolViolation(
                "server has disabled LOGIN".to_string(),
            ));
        }
        if !self.secure && !self.options.allow_insecure_login {
            return Err(Error::ProtocolViolation(
                "refusing LOGIN over an unencrypted connection".to_string(),
            ));
        }
        let command = Command::simple("LOGIN")
            .arg("username", Argument::quoted(username))
            .arg("password", Argument::quoted(password));
        let result = self.execute(command).map_err(login_referral)?;
        if result.succeeded() {
            self.authenticated(Some(username), "LOGIN");
        }
        Ok(result)
    }

    /// Authenticate with the SASL `mechanism`, answering challenges with `authenticator`.
    pub fn authenticate<A>(
        &mut self,
        mechanism: &str,
        authenticator: A,
    ) -> Result<TransactionResult<()>>
    where
        A: Authenticator + Send + 'static,
    {
        self.require_exact_state(State::NotAuthenticated)?;
        if self.options.strict_capabilities && !self.capabilities.has_auth(mechanism) {
            return Err(Error::Incapable(format!("AUTH={}", mechanism)));
        }
        let mut arguments = RequestArguments::new();
        arguments.push("mechanism", Argument::atom(mechanism));
        let tx = Authenticate {
            authenticator,
            arguments,
        };
        let result = self.execute(tx).map_err(login_referral)?;
        if result.succeeded() {
            self.authenticated(None, mechanism);
        }
        Ok(result)
    }

    /// Selects a mailbox
    ///
    /// Selecting the mailbox that is already selected sends nothing. Any other selection ends
    /// the current one as soon as the command goes out, so a failed `SELECT` leaves the session
    /// authenticated without a selected mailbox.
    pub fn select(&mut self, mailbox: &str) -> Result<TransactionResult<MailboxId>> {
        self.open_mailbox(mailbox, false, false)
    }

    /// Examine is identical to Select, but the selected mailbox is identified as read-only
    pub fn examine(&mut self, mailbox: &str) -> Result<TransactionResult<MailboxId>> {
        self.open_mailbox(mailbox, true, false)
    }

    /// `SELECT mailbox (CONDSTORE)`, which also reports `HIGHESTMODSEQ`.
    pub fn select_condstore(&mut self, mailbox: &str) -> Result<TransactionResult<MailboxId>> {
        self.open_mailbox(mailbox, false, true)
    }

    /// `EXAMINE mailbox (CONDSTORE)`.
    pub fn examine_condstore(&mut self, mailbox: &str) -> Result<TransactionResult<MailboxId>> {
        self.open_mailbox(mailbox, true, true)
    }

    fn open_mailbox(
        &mut self,
        name: &str,
        read_only: bool,
        condstore: bool,
    ) -> Result<TransactionResult<MailboxId>> {
        self.require_state(State::Authenticated)?;
        self.require_free_wire()?;
        validate_str(name)?;
        if let Some(known) = self.directory.as_ref().and_then(|d| d.get_existing(name)) {
            if Some(known.id()) == self.selected && known.read_only == read_only && !condstore {
                return Ok(TransactionResult::request_done(
                    "already selected",
                    known.id(),
                ));
            }
            if !known.is_selectable() {
                return Err(Error::ProtocolViolation(format!(
                    "mailbox {} cannot be selected",
                    name
                )));
            }
        }

        let verb = if read_only { "EXAMINE" } else { "SELECT" };
        let mut command = Command::simple(verb).arg("mailbox", Argument::quoted(name));
        if condstore {
            command = command
                .arg(
                    "parameters",
                    Argument::List(vec![Argument::atom("CONDSTORE")]),
                )
                .require("CONDSTORE");
        }
        self.preflight(&mut command)?;

        if self.state == State::Selected {
            // the server deselects as soon as it sees the command, whatever it answers
            self.set_state(State::Authenticated);
        }
        let directory = self.directory_mut()?;
        let fresh = directory.get_existing(name).is_none();
        let id = directory.get_or_create(name);
        if let Some(mailbox) = directory.get_mut(id) {
            mailbox.reset_selection();
        }

        self.pending_selection = Some(id);
        let outcome = self.execute(command);
        self.pending_selection = None;
        let succeeded = matches!(outcome, Ok(ref result) if result.succeeded());
        if fresh && !succeeded {
            if let Some(directory) = self.directory.as_mut() {
                directory.delete(name);
            }
        }
        let result = outcome?;

        if result.succeeded() && self.state == State::Authenticated {
            if read_only && !result.has_code(&ResponseCode::ReadWrite) {
                if let Some(mailbox) = self.directory.as_mut().and_then(|d| d.get_mut(id)) {
                    mailbox.read_only = true;
                }
            }
            self.selected = Some(id);
            self.set_state(State::Selected);
            debug!(mailbox = name, read_only, "mailbox selected");
        }
        Ok(result.with_value(id))
    }

    fn deselect<T>(&mut self, result: &TransactionResult<T>) {
        if result.succeeded() && self.state == State::Selected {
            self.set_state(State::Authenticated);
        }
    }

    /// Close the selected mailbox, expunging messages flagged `\Deleted`.
    ///
    /// Without a selected mailbox this is a no-op that sends nothing.
    pub fn close(&mut self) -> Result<TransactionResult<()>> {
        if self.state == State::NotConnected {
            return Err(Error::ProtocolViolation("not connected".to_string()));
        }
        if self.state != State::Selected {
            return Ok(TransactionResult::request_done("no mailbox selected", ()));
        }
        let result = self.execute(Command::simple("CLOSE"))?;
        self.deselect(&result);
        Ok(result)
    }

    /// Close the selected mailbox without expunging. Needs `UNSELECT`.
    pub fn unselect(&mut self) -> Result<TransactionResult<()>> {
        self.require_exact_state(State::Selected)?;
        self.require_capability("UNSELECT")?;
        let result = self.execute(Command::simple("UNSELECT").require("UNSELECT"))?;
        self.deselect(&result);
        Ok(result)
    }

    /// Create a mailbox.
    pub fn create(&mut self, mailbox: &str) -> Result<TransactionResult<()>> {
        self.require_state(State::Authenticated)?;
        if is_inbox(mailbox) {
            return Err(Error::ProtocolViolation(
                "INBOX always exists and cannot be created".to_string(),
            ));
        }
        if let Some(existing) = self.directory.as_ref().and_then(|d| d.get_existing(mailbox)) {
            if !existing.is_nonexistent() {
                return Err(Error::ProtocolViolation(format!(
                    "mailbox {} already exists",
                    mailbox
                )));
            }
        }
        self.create_unchecked(mailbox)
    }

    fn create_unchecked(&mut self, mailbox: &str) -> Result<TransactionResult<()>> {
        let command = Command::simple("CREATE").arg("mailbox", Argument::quoted(mailbox));
        let result = self.execute(command)?;
        if result.succeeded() {
            if let Some(directory) = self.directory.as_mut() {
                let id = directory.get_or_create(mailbox);
                if let Some(created) = directory.get_mut(id) {
                    created.remove_attribute(&NameAttribute::NonExistent);
                }
            }
        }
        Ok(result)
    }

    /// The server answered `[TRYCREATE]`: create the mailbox once. Returns whether it worked.
    fn try_create(&mut self, mailbox: &str) -> Result<bool> {
        debug!(mailbox, "server suggested TRYCREATE");
        Ok(self.create_unchecked(mailbox)?.succeeded())
    }

    /// Delete a mailbox. Deleting the selected mailbox ends the selection.
    pub fn delete(&mut self, mailbox: &str) -> Result<TransactionResult<()>> {
        self.require_state(State::Authenticated)?;
        if is_inbox(mailbox) {
            return Err(Error::ProtocolViolation(
                "INBOX cannot be deleted".to_string(),
            ));
        }
        if let Some(directory) = self.directory.as_ref() {
            if let Some(existing) = directory.get_existing(mailbox) {
                if existing.has_attribute(&NameAttribute::NoSelect)
                    && directory.has_children(mailbox)
                {
                    return Err(Error::ProtocolViolation(format!(
                        "mailbox {} is \\Noselect and has children",
                        mailbox
                    )));
                }
            }
        }
        let result =
            self.execute(Command::simple("DELETE").arg("mailbox", Argument::quoted(mailbox)))?;
        if result.succeeded() {
            let id = self.directory.as_ref().and_then(|d| d.id_of(mailbox));
            if id.is_some() && id == self.selected {
                self.set_state(State::Authenticated);
            }
            if let Some(directory) = self.directory.as_mut() {
                directory.delete(mailbox);
            }
        }
        Ok(result)
    }

    /// Rename a mailbox, along with every mailbox below it.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<TransactionResult<()>> {
        self.require_state(State::Authenticated)?;
        if from == to {
            return Err(Error::ProtocolViolation(
                "cannot rename a mailbox to its own name".to_string(),
            ));
        }
        if is_inbox(to) {
            return Err(Error::ProtocolViolation(
                "cannot rename a mailbox to INBOX".to_string(),
            ));
        }
        if let Some(existing) = self.directory.as_ref().and_then(|d| d.get_existing(to)) {
            if !existing.is_nonexistent() {
                return Err(Error::ProtocolViolation(format!(
                    "mailbox {} already exists",
                    to
                )));
            }
        }
        let command = Command::simple("RENAME")
            .arg("existing", Argument::quoted(from))
            .arg("new", Argument::quoted(to));
        let result = self.execute(command)?;
        if result.succeeded() {
            if let Some(directory) = self.directory.as_mut() {
                if directory.rename(from, to).is_none() {
                    directory.get_or_create(to);
                }
            }
        }
        Ok(result)
    }

    /// Add `mailbox` to the set of "active" or "subscribed" mailboxes.
    pub fn subscribe(&mut self, mailbox: &str) -> Result<TransactionResult<()>> {
        self.require_state(State::Authenticated)?;
        self.execute(Command::simple("SUBSCRIBE").arg("mailbox", Argument::quoted(mailbox)))
    }

    /// Remove `mailbox` from the set of subscribed mailboxes.
    pub fn unsubscribe(&mut self, mailbox: &str) -> Result<TransactionResult<()>> {
        self.require_state(State::Authenticated)?;
        self.execute(Command::simple("UNSUBSCRIBE").arg("mailbox", Argument::quoted(mailbox)))
    }

    /// List mailbox names. Every name returned is recorded in the directory.
    pub fn list(
        &mut self,
        reference_name: Option<&str>,
        mailbox_pattern: Option<&str>,
    ) -> Result<TransactionResult<Vec<Name>>> {
        self.list_like("LIST", reference_name, mailbox_pattern)
    }

    /// List subscribed mailbox names.
    pub fn lsub(
        &mut self,
        reference_name: Option<&str>,
        mailbox_pattern: Option<&str>,
    ) -> Result<TransactionResult<Vec<Name>>> {
        self.list_like("LSUB", reference_name, mailbox_pattern)
    }

    fn list_like(
        &mut self,
        verb: &'static str,
        reference_name: Option<&str>,
        mailbox_pattern: Option<&str>,
    ) -> Result<TransactionResult<Vec<Name>>> {
        self.require_state(State::Authenticated)?;
        let command = Command::new(verb, collect_names)
            .arg("reference", Argument::quoted(reference_name.unwrap_or("")))
            .arg("pattern", Argument::quoted(mailbox_pattern.unwrap_or("")));
        self.execute(command)
    }

    /// The status of a mailbox, e.g. `data_items` of `(MESSAGES UNSEEN)`.
    ///
    /// The counters are also stored on the mailbox's directory entry.
    pub fn status(
        &mut self,
        mailbox: &str,
        data_items: &str,
    ) -> Result<TransactionResult<Vec<StatusItem>>> {
        self.require_state(State::Authenticated)?;
        let command = Command::new("STATUS", collect_status)
            .arg("mailbox", Argument::quoted(mailbox))
            .arg("items", Argument::atom(data_items));
        self.execute(command)
    }

    /// Enable server extensions (RFC 5161). Returns those the server reports as enabled.
    pub fn enable(&mut self, capabilities: &[&str]) -> Result<TransactionResult<Vec<String>>> {
        self.require_exact_state(State::Authenticated)?;
        let command = Command::new("ENABLE", collect_enabled)
            .arg("capabilities", Argument::atom(capabilities.join(" ")))
            .require("ENABLE");
        self.execute(command)
    }

    /// Append a message to `mailbox`.
    ///
    /// If the server answers `[TRYCREATE]`, the mailbox is created and the append retried once.
    pub fn append(
        &mut self,
        mailbox: &str,
        content: impl AsRef<[u8]>,
    ) -> Result<TransactionResult<Appended>> {
        self.append_with(mailbox, content, &[], None)
    }

    /// Append a message with initial flags and an internal date.
    pub fn append_with(
        &mut self,
        mailbox: &str,
        content: impl AsRef<[u8]>,
        flags: &[Flag],
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<TransactionResult<Appended>> {
        self.require_state(State::Authenticated)?;
        let content = content.as_ref();
        let build = || append_command(mailbox, flags, date, vec![Literal::new(content)]);
        let result = self.execute(build())?;
        if result.has_code(&ResponseCode::TryCreate) && self.try_create(mailbox)? {
            return self.execute(build());
        }
        Ok(result)
    }

    /// Append several messages in one command. Needs `MULTIAPPEND` for more than one message.
    pub fn multiappend<M: AsRef<[u8]>>(
        &mut self,
        mailbox: &str,
        messages: &[M],
    ) -> Result<TransactionResult<Appended>> {
        self.require_state(State::Authenticated)?;
        match messages {
            [] => {
                return Err(Error::ProtocolViolation(
                    "no messages to append".to_string(),
                ))
            }
            [single] => return self.append(mailbox, single),
            _ => {}
        }
        self.require_capability("MULTIAPPEND")?;
        let build = || {
            let literals = messages.iter().map(|m| Literal::new(m.as_ref())).collect();
            append_command(mailbox, &[], None, literals).require("MULTIAPPEND")
        };
        let result = self.execute(build())?;
        if result.has_code(&ResponseCode::TryCreate) && self.try_create(mailbox)? {
            return self.execute(build());
        }
        Ok(result)
    }

    /// Start an `APPEND` whose message is written afterwards through the returned upload.
    ///
    /// With `length` unknown, the literal is announced once the upload is finished. The message
    /// is consumed as it is sent, so there is no `[TRYCREATE]` retry.
    pub fn prepare_append(
        &mut self,
        mailbox: &str,
        flags: &[Flag],
        length: Option<u64>,
    ) -> Result<AppendUpload> {
        self.require_state(State::Authenticated)?;
        let (writer, reader) = channel(length, self.options.body_channel);
        let command = append_command(mailbox, flags, None, vec![Literal::from_stream(reader)]);
        let pending = self.start(command)?;
        Ok(AppendUpload { writer, pending })
    }

    /// Request a checkpoint of the selected mailbox.
    pub fn check(&mut self) -> Result<TransactionResult<()>> {
        self.selected_command(Command::simple("CHECK"))
    }

    /// Permanently remove messages flagged `\Deleted`. Returns the expunged sequence numbers in
    /// the order the server reported them.
    pub fn expunge(&mut self) -> Result<TransactionResult<Vec<Seq>>> {
        self.selected_command(Command::new("EXPUNGE", collect_expunged))
    }

    /// Expunge only the `\Deleted` messages among `uid_set`. Needs `UIDPLUS`.
    pub fn uid_expunge(&mut self, uid_set: &str) -> Result<TransactionResult<Vec<Seq>>> {
        let command = Command::new("UID EXPUNGE", collect_expunged)
            .arg("set", Argument::atom(uid_set))
            .require("UIDPLUS");
        self.selected_command(command)
    }

    /// Search the selected mailbox. `query` is a caller-formatted search key list.
    pub fn search(&mut self, query: &str) -> Result<TransactionResult<Vec<Seq>>> {
        self.selected_command(
            Command::new("SEARCH", collect_numbers).arg("criteria", Argument::atom(query)),
        )
    }

    /// Like [`search`](Self::search), returning UIDs.
    pub fn uid_search(&mut self, query: &str) -> Result<TransactionResult<Vec<Uid>>> {
        self.selected_command(
            Command::new("UID SEARCH", collect_numbers).arg("criteria", Argument::atom(query)),
        )
    }

    /// `SEARCH RETURN (...)`, the ESEARCH form of RFC 4731.
    pub fn search_return(
        &mut self,
        returns: &[SearchReturn],
        query: &str,
    ) -> Result<TransactionResult<Esearch>> {
        self.esearch("SEARCH", returns, query)
    }

    /// `UID SEARCH RETURN (...)`.
    pub fn uid_search_return(
        &mut self,
        returns: &[SearchReturn],
        query: &str,
    ) -> Result<TransactionResult<Esearch>> {
        self.esearch("UID SEARCH", returns, query)
    }

    fn esearch(
        &mut self,
        verb: &'static str,
        returns: &[SearchReturn],
        query: &str,
    ) -> Result<TransactionResult<Esearch>> {
        let command = Command::new(verb, collect_esearch)
            .arg("return", Argument::atom("RETURN"))
            .arg(
                "options",
                Argument::List(returns.iter().map(Argument::atom).collect()),
            )
            .arg("criteria", Argument::atom(query))
            .require("ESEARCH");
        self.selected_command(command)
    }

    /// Search and sort (RFC 5256). Needs `SORT`.
    pub fn sort(
        &mut self,
        criteria: &[SortCriterion<'_>],
        charset: SortCharset<'_>,
        query: &str,
    ) -> Result<TransactionResult<Vec<Seq>>> {
        self.sort_like("SORT", criteria, charset, query)
    }

    /// Like [`sort`](Self::sort), returning UIDs.
    pub fn uid_sort(
        &mut self,
        criteria: &[SortCriterion<'_>],
        charset: SortCharset<'_>,
        query: &str,
    ) -> Result<TransactionResult<Vec<Uid>>> {
        self.sort_like("UID SORT", criteria, charset, query)
    }

    fn sort_like(
        &mut self,
        verb: &'static str,
        criteria: &[SortCriterion<'_>],
        charset: SortCharset<'_>,
        query: &str,
    ) -> Result<TransactionResult<Vec<u32>>> {
        let command = Command::new(verb, collect_numbers)
            .arg("criteria", Argument::atom(SortCriteria(criteria)))
            .arg("charset", Argument::atom(charset))
            .arg("query", Argument::atom(query))
            .require("SORT");
        self.selected_command(command)
    }

    /// Fetch retreives data associated with a set of messages in the mailbox.
    ///
    /// `query` is a caller-formatted data item list such as `(FLAGS BODY.PEEK[HEADER])`.
    pub fn fetch(
        &mut self,
        sequence_set: &str,
        query: &str,
    ) -> Result<TransactionResult<Vec<Fetch>>> {
        self.fetch_like("FETCH", sequence_set, query)
    }

    /// Equivalent to [`fetch`](Self::fetch), except that `uid_set` holds UIDs.
    pub fn uid_fetch(
        &mut self,
        uid_set: &str,
        query: &str,
    ) -> Result<TransactionResult<Vec<Fetch>>> {
        self.fetch_like("UID FETCH", uid_set, query)
    }

    /// Alter message data, e.g. `query` of `+FLAGS (\Deleted)`.
    pub fn store(
        &mut self,
        sequence_set: &str,
        query: &str,
    ) -> Result<TransactionResult<Vec<Fetch>>> {
        self.fetch_like("STORE", sequence_set, query)
    }

    /// Equivalent to [`store`](Self::store), except that `uid_set` holds UIDs.
    pub fn uid_store(
        &mut self,
        uid_set: &str,
        query: &str,
    ) -> Result<TransactionResult<Vec<Fetch>>> {
        self.fetch_like("UID STORE", uid_set, query)
    }

    fn fetch_like(
        &mut self,
        verb: &'static str,
        set: &str,
        query: &str,
    ) -> Result<TransactionResult<Vec<Fetch>>> {
        let command = Command::new(verb, collect_fetches)
            .arg("set", Argument::atom(set))
            .arg("items", Argument::atom(query));
        self.selected_command(command)
    }

    /// Copy messages to the end of `mailbox`, creating it once on `[TRYCREATE]`.
    pub fn copy(&mut self, sequence_set: &str, mailbox: &str) -> Result<TransactionResult<Copied>> {
        self.copy_like("COPY", sequence_set, mailbox)
    }

    /// Equivalent to [`copy`](Self::copy), except that `uid_set` holds UIDs.
    pub fn uid_copy(&mut self, uid_set: &str, mailbox: &str) -> Result<TransactionResult<Copied>> {
        self.copy_like("UID COPY", uid_set, mailbox)
    }

    fn copy_like(
        &mut self,
        verb: &'static str,
        set: &str,
        mailbox: &str,
    ) -> Result<TransactionResult<Copied>> {
        self.require_exact_state(State::Selected)?;
        let build = || {
            Command::new(verb, copied)
                .arg("set", Argument::atom(set))
                .arg("mailbox", Argument::quoted(mailbox))
        };
        let result = self.execute(build())?;
        if result.has_code(&ResponseCode::TryCreate) && self.try_create(mailbox)? {
            return self.execute(build());
        }
        Ok(result)
    }

    /// Read the body of message `uid` in blocks instead of all at once.
    pub fn fetch_body_stream(&mut self, uid: Uid) -> Result<FetchBodyStream<'_>> {
        self.require_exact_state(State::Selected)?;
        Ok(FetchBodyStream::new(self, uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_stream::{MockProbe, MockStream};
    use crate::session::{ReferralPolicy, SessionOptions};
    use crate::transaction::ResultCode;

    fn options() -> SessionOptions {
        SessionOptions {
            allow_insecure_login: true,
            ..SessionOptions::default()
        }
    }

    fn open(script: String, options: SessionOptions) -> (Session, MockProbe) {
        let stream = MockStream::new(script.into_bytes());
        let probe = stream.probe();
        (Session::open(stream, options).unwrap(), probe)
    }

    fn session(script: &str) -> (Session, MockProbe) {
        open(
            format!("* OK [CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN] ready\r\n{}", script),
            options(),
        )
    }

    fn authenticated(script: &str) -> (Session, MockProbe) {
        open(
            format!(
                "* PREAUTH [CAPABILITY IMAP4rev1 UIDPLUS MULTIAPPEND UNSELECT ENABLE] ready\r\n{}",
                script
            ),
            options(),
        )
    }

    fn select_locally(session: &mut Session, name: &str, exists: u32) -> MailboxId {
        let directory = session.directory_mut().unwrap();
        let id = directory.get_or_create(name);
        directory.get_mut(id).unwrap().exists = exists;
        session.selected = Some(id);
        session.set_state(State::Selected);
        id
    }

    fn selected(script: &str) -> (Session, MockProbe) {
        let (mut session, probe) = authenticated(script);
        select_locally(&mut session, "INBOX", 42);
        (session, probe)
    }

    fn written(probe: &MockProbe) -> String {
        String::from_utf8(probe.written()).unwrap()
    }

    #[test]
    fn login() {
        let (mut session, probe) =
            session("a1 OK [CAPABILITY IMAP4rev1 IDLE] Logged in\r\n");
        assert!(session.login("username", "password").unwrap().succeeded());
        assert_eq!(
            written(&probe),
            "a1 LOGIN \"username\" \"password\"\r\n",
            "Invalid login command"
        );
        assert_eq!(session.state(), State::Authenticated);
        assert!(session.capabilities().has("IDLE"));
        assert_eq!(session.authority().user.as_deref(), Some("username"));
        assert_eq!(session.authority().mechanism.as_deref(), Some("LOGIN"));
        assert!(session.directory().is_some());
    }

    #[test]
    fn failed_login_keeps_state() {
        let (mut session, _) = session("a1 NO [AUTHENTICATIONFAILED] nope\r\n");
        let result = session.login("username", "wrong").unwrap();
        assert_eq!(result.code, ResultCode::No);
        assert_eq!(session.state(), State::NotAuthenticated);
    }

    #[test]
    fn login_refused_locally() {
        let (mut session, probe) = open(
            "* OK [CAPABILITY IMAP4rev1] ready\r\n".to_string(),
            SessionOptions::default(),
        );
        assert!(matches!(
            session.login("u", "p"),
            Err(Error::ProtocolViolation(_))
        ));

        let (mut disabled, _) = open(
            "* OK [CAPABILITY IMAP4rev1 LOGINDISABLED] ready\r\n".to_string(),
            options(),
        );
        assert!(matches!(
            disabled.login("u", "p"),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(probe.written().is_empty());
    }

    #[test]
    fn login_referral() {
        let raise = SessionOptions {
            referral_policy: ReferralPolicy::Raise,
            ..options()
        };
        let (mut session, _) = open(
            "* OK ready\r\na1 NO [REFERRAL imap://user@other/] try elsewhere\r\n".to_string(),
            raise,
        );
        match session.login("user", "pass") {
            Err(Error::LoginReferral { referrals, .. }) => {
                assert_eq!(referrals, vec!["imap://user@other/".to_string()])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    struct Plain;

    impl Authenticator for Plain {
        type Response = Vec<u8>;
        fn process(&self, challenge: &[u8]) -> Self::Response {
            assert_eq!(challenge, b"abc");
            b"\0user\0pass".to_vec()
        }
    }

    #[test]
    fn authenticate() {
        let (mut session, probe) = session("+ YWJj\r\na1 OK authenticated\r\n");
        assert!(session.authenticate("PLAIN", Plain).unwrap().succeeded());
        assert_eq!(
            written(&probe),
            "a1 AUTHENTICATE PLAIN\r\nAHVzZXIAcGFzcw==\r\n"
        );
        assert_eq!(session.state(), State::Authenticated);
        assert_eq!(session.authority().mechanism.as_deref(), Some("PLAIN"));
    }

    #[test]
    fn select() {
        let response = "* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n\
            * OK [PERMANENTFLAGS (\\* \\Answered \\Flagged \\Deleted \\Draft \\Seen)] \
              Limited\r\n\
            * 1 EXISTS\r\n\
            * 1 RECENT\r\n\
            * OK [UNSEEN 1] First unseen.\r\n\
            * OK [UIDVALIDITY 1257842737] UIDs valid\r\n\
            * OK [UIDNEXT 2] Predicted next UID\r\n\
            a1 OK [READ-WRITE] Select completed.\r\n";
        let (mut session, probe) = authenticated(response);
        let id = session.select("INBOX").unwrap().into_value().unwrap();
        assert_eq!(written(&probe), "a1 SELECT \"INBOX\"\r\n", "Invalid select command");
        assert_eq!(session.state(), State::Selected);

        let mailbox = session.mailbox(id).unwrap();
        assert_eq!(mailbox.exists, 1);
        assert_eq!(mailbox.recent, 1);
        assert_eq!(mailbox.unseen, Some(1));
        assert_eq!(mailbox.uid_validity, Some(1257842737));
        assert_eq!(mailbox.uid_next, Some(2));
        assert_eq!(mailbox.applicable_flags.len(), 5);
        assert_eq!(mailbox.permanent_flags.len(), 6);
        assert!(mailbox.permanent_flags.contains(&Flag::MayCreate));
        assert!(!mailbox.read_only);

        let again = session.select("inbox").unwrap();
        assert_eq!(again.code, ResultCode::RequestDone);
        assert_eq!(again.into_value().unwrap(), id);
        assert_eq!(written(&probe), "a1 SELECT \"INBOX\"\r\n");
    }

    #[test]
    fn examine() {
        let response = "* 3 EXISTS\r\n\
            * OK [UIDVALIDITY 7] UIDs valid\r\n\
            a1 OK [READ-ONLY] Examine completed.\r\n";
        let (mut session, probe) = authenticated(response);
        let id = session.examine("Archive").unwrap().into_value().unwrap();
        assert_eq!(written(&probe), "a1 EXAMINE \"Archive\"\r\n", "Invalid examine command");
        let mailbox = session.selected_mailbox().unwrap();
        assert_eq!(mailbox.id(), id);
        assert_eq!(mailbox.exists, 3);
        assert!(mailbox.read_only);
    }

    #[test]
    fn failed_select_drops_selection() {
        let (mut session, probe) = selected("a1 NO [NONEXISTENT] no such mailbox\r\n");
        let result = session.select("Missing").unwrap();
        assert!(result.failed());
        assert!(result.value().is_none());
        assert_eq!(written(&probe), "a1 SELECT \"Missing\"\r\n");
        assert_eq!(session.state(), State::Authenticated);
        assert!(session.selected_mailbox().is_none());
        let directory = session.directory().unwrap();
        assert!(directory.get_existing("Missing").is_none());
        assert!(directory.get_existing("INBOX").is_some());
    }

    #[test]
    fn failed_examine_keeps_known_mailbox() {
        let (mut session, _) = authenticated("a1 NO try later\r\n");
        let id = session.directory_mut().unwrap().get_or_create("Work");
        assert!(session.examine("Work").unwrap().failed());
        assert_eq!(session.mailbox(id).unwrap().name(), "Work");
        assert_eq!(session.state(), State::Authenticated);
    }

    #[test]
    fn refused_select_keeps_selection() {
        let strict = SessionOptions {
            strict_capabilities: true,
            ..options()
        };
        let (mut session, probe) =
            open("* PREAUTH [CAPABILITY IMAP4rev1] ready\r\n".to_string(), strict);
        let inbox = select_locally(&mut session, "INBOX", 7);
        match session.select_condstore("INBOX") {
            Err(Error::Incapable(cap)) => assert_eq!(cap, "CONDSTORE"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            session.select_condstore("Elsewhere"),
            Err(Error::Incapable(_))
        ));
        assert!(probe.written().is_empty());
        assert_eq!(session.state(), State::Selected);
        assert_eq!(session.selected_mailbox().unwrap().id(), inbox);
        assert_eq!(session.mailbox(inbox).unwrap().exists, 7);
        assert!(session.directory().unwrap().get_existing("Elsewhere").is_none());
    }

    #[test]
    fn select_condstore() {
        let response = "* OK [HIGHESTMODSEQ 715194045007] Highest\r\n\
            a1 OK [READ-WRITE] done\r\n";
        let (mut session, probe) = authenticated(response);
        session.select_condstore("INBOX").unwrap();
        assert_eq!(written(&probe), "a1 SELECT \"INBOX\" (CONDSTORE)\r\n");
        assert_eq!(
            session.selected_mailbox().unwrap().highest_modseq,
            Some(715194045007)
        );
    }

    #[test]
    fn noselect_cannot_be_selected() {
        let (mut session, probe) = authenticated("");
        session.directory_mut().unwrap().add(&Name {
            attributes: vec![NameAttribute::NoSelect],
            delimiter: Some("/".into()),
            name: "Archive".into(),
        });
        assert!(matches!(
            session.select("Archive"),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(probe.written().is_empty());
    }

    #[test]
    fn close() {
        let (mut session, probe) = authenticated("a1 OK CLOSE completed\r\n");
        assert_eq!(session.close().unwrap().code, ResultCode::RequestDone);
        assert!(probe.written().is_empty());

        select_locally(&mut session, "INBOX", 1);
        assert!(session.close().unwrap().succeeded());
        assert_eq!(written(&probe), "a1 CLOSE\r\n", "Invalid close command");
        assert_eq!(session.state(), State::Authenticated);
        assert!(session.selected_mailbox().is_none());
    }

    #[test]
    fn unselect() {
        let (mut session, probe) = selected("a1 OK done\r\n");
        assert!(session.unselect().unwrap().succeeded());
        assert_eq!(written(&probe), "a1 UNSELECT\r\n");
        assert_eq!(session.state(), State::Authenticated);

        select_locally(&mut session, "INBOX", 1);
        session.capabilities = ["IMAP4rev1"].into_iter().collect();
        assert!(matches!(session.unselect(), Err(Error::Incapable(ref c)) if c == "UNSELECT"));
    }

    #[test]
    fn create_preconditions() {
        let (mut session, probe) = authenticated("a1 OK CREATE completed\r\n");
        assert!(matches!(session.create("inbox"), Err(Error::ProtocolViolation(_))));
        assert!(session.create("Work").unwrap().succeeded());
        assert_eq!(written(&probe), "a1 CREATE \"Work\"\r\n", "Invalid create command");
        assert!(session.directory().unwrap().get_existing("Work").is_some());
        assert!(matches!(session.create("Work"), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn create_over_nonexistent_placeholder() {
        let (mut session, _) = authenticated("a1 OK CREATE completed\r\n");
        session.directory_mut().unwrap().add(&Name {
            attributes: vec![NameAttribute::NonExistent],
            delimiter: Some("/".into()),
            name: "Gone".into(),
        });
        assert!(session.create("Gone").unwrap().succeeded());
        assert!(!session
            .directory()
            .unwrap()
            .get_existing("Gone")
            .unwrap()
            .is_nonexistent());
    }

    #[test]
    fn delete() {
        let (mut session, probe) = authenticated("a1 OK DELETE completed\r\n");
        assert!(matches!(session.delete("INBOX"), Err(Error::ProtocolViolation(_))));
        let id = select_locally(&mut session, "Trash", 0);
        assert!(session.delete("Trash").unwrap().succeeded());
        assert_eq!(written(&probe), "a1 DELETE \"Trash\"\r\n", "Invalid delete command");
        assert_eq!(session.state(), State::Authenticated);
        assert!(matches!(session.mailbox(id), Err(Error::MailboxClosed)));
    }

    #[test]
    fn delete_noselect_parent() {
        let (mut session, probe) = authenticated("");
        let directory = session.directory_mut().unwrap();
        directory.add(&Name {
            attributes: vec![NameAttribute::NoSelect],
            delimiter: Some("/".into()),
            name: "Projects".into(),
        });
        directory.add(&Name {
            attributes: vec![],
            delimiter: Some("/".into()),
            name: "Projects/Rust".into(),
        });
        assert!(matches!(
            session.delete("Projects"),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(probe.written().is_empty());
    }

    #[test]
    fn rename() {
        let (mut session, probe) = authenticated("a1 OK RENAME completed\r\n");
        for name in ["Work", "Work/A", "Work/A/B", "Workshop"] {
            session.directory_mut().unwrap().add(&Name {
                attributes: vec![],
                delimiter: Some("/".into()),
                name: name.into(),
            });
        }
        assert!(matches!(session.rename("Work", "Work"), Err(Error::ProtocolViolation(_))));
        assert!(matches!(session.rename("Work", "INBOX"), Err(Error::ProtocolViolation(_))));
        assert!(matches!(
            session.rename("Work", "Workshop"),
            Err(Error::ProtocolViolation(_))
        ));

        assert!(session.rename("Work", "Play").unwrap().succeeded());
        assert_eq!(
            written(&probe),
            "a1 RENAME \"Work\" \"Play\"\r\n",
            "Invalid rename command"
        );
        let mut names: Vec<&str> = session.directory().unwrap().names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["Play", "Play/A", "Play/A/B", "Workshop"]);
    }

    #[test]
    fn subscribe() {
        let (mut session, probe) =
            authenticated("a1 OK SUBSCRIBE completed\r\na2 OK UNSUBSCRIBE completed\r\n");
        session.subscribe("INBOX").unwrap();
        session.unsubscribe("INBOX").unwrap();
        assert_eq!(
            written(&probe),
            "a1 SUBSCRIBE \"INBOX\"\r\na2 UNSUBSCRIBE \"INBOX\"\r\n"
        );
    }

    #[test]
    fn list() {
        let (mut session, probe) = authenticated(
            "* LIST (\\HasNoChildren) \"/\" Sent\r\n\
             * LIST (\\Noselect \\HasChildren) \"/\" Projects\r\n\
             a1 OK LIST completed\r\n",
        );
        let names = session.list(None, Some("*")).unwrap().into_value().unwrap();
        assert_eq!(written(&probe), "a1 LIST \"\" \"*\"\r\n");
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].name(), "Sent");
        assert_eq!(names[1].delimiter(), Some("/"));
        let projects = session.directory().unwrap().get_existing("Projects").unwrap();
        assert!(!projects.is_selectable());
    }

    #[test]
    fn status() {
        let (mut session, probe) = authenticated(
            "* STATUS blurdybloop (MESSAGES 231 UIDNEXT 44292)\r\n\
             a1 OK STATUS completed\r\n",
        );
        let items = session
            .status("blurdybloop", "(MESSAGES UIDNEXT)")
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(
            written(&probe),
            "a1 STATUS \"blurdybloop\" (MESSAGES UIDNEXT)\r\n"
        );
        assert_eq!(
            items,
            vec![StatusItem::Messages(231), StatusItem::UidNext(44292)]
        );
        let mailbox = session.directory().unwrap().get_existing("blurdybloop").unwrap();
        assert_eq!(mailbox.exists, 231);
        assert_eq!(mailbox.uid_next, Some(44292));
    }

    #[test]
    fn enable() {
        let (mut session, probe) = authenticated("* ENABLED CONDSTORE\r\na1 OK done\r\n");
        let enabled = session
            .enable(&["CONDSTORE", "X-GOOD-IDEA"])
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(written(&probe), "a1 ENABLE CONDSTORE X-GOOD-IDEA\r\n");
        assert_eq!(enabled, vec!["CONDSTORE".to_string()]);
    }

    #[test]
    fn append_retries_after_trycreate() {
        let (mut session, probe) = authenticated(
            "a1 NO [TRYCREATE] no such mailbox\r\n\
             a2 OK CREATE completed\r\n\
             + go ahead\r\n\
             a3 OK [APPENDUID 7 12] APPEND completed\r\n",
        );
        let appended = session.append("Drafts", b"hello").unwrap().into_value().unwrap();
        assert_eq!(
            written(&probe),
            "a1 APPEND \"Drafts\" {5}\r\n\
             a2 CREATE \"Drafts\"\r\n\
             a3 APPEND \"Drafts\" {5}\r\nhello\r\n"
        );
        assert_eq!(appended.uid_validity, Some(7));
    }

    #[test]
    fn append_with_flags_and_date() {
        let (mut session, probe) = authenticated("+ go ahead\r\na1 OK APPEND completed\r\n");
        let date = DateTime::parse_from_rfc3339("2020-01-02T03:04:05+01:00").unwrap();
        session
            .append_with("Drafts", "hello", &[Flag::Seen, Flag::Draft], Some(date))
            .unwrap();
        assert_eq!(
            written(&probe),
            "a1 APPEND \"Drafts\" (\\Seen \\Draft) \"02-Jan-2020 03:04:05 +0100\" {5}\r\nhello\r\n"
        );
    }

    #[test]
    fn multiappend() {
        let (mut session, probe) = authenticated(
            "+ go ahead\r\n\
             + go ahead\r\n\
             a1 OK [APPENDUID 3 4:5] APPEND completed\r\n",
        );
        let appended = session
            .multiappend("INBOX", &["a", "b"])
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(
            written(&probe),
            "a1 APPEND \"INBOX\" {1}\r\na {1}\r\nb\r\n"
        );
        assert_eq!(appended.uid_validity, Some(3));

        session.capabilities = ["IMAP4rev1"].into_iter().collect();
        assert!(matches!(
            session.multiappend("INBOX", &["a", "b"]),
            Err(Error::Incapable(ref c)) if c == "MULTIAPPEND"
        ));
    }

    #[test]
    fn streamed_append_of_unknown_length() {
        let (mut session, probe) =
            authenticated("+ go ahead\r\na1 OK [APPENDUID 1 9] APPEND completed\r\n");
        let mut upload = session.prepare_append("INBOX", &[], None).unwrap();
        for chunk in [2000, 2000, 1000] {
            upload.write_all(&vec![b'x'; chunk]).unwrap();
        }
        assert_eq!(upload.written(), 5000);
        assert!(matches!(
            session.noop(),
            Err(Error::ProtocolViolation(_))
        ));
        let result = upload.finish(&mut session).unwrap();
        assert!(result.succeeded());
        let expected = format!("a1 APPEND \"INBOX\" {{5000}}\r\n{}\r\n", "x".repeat(5000));
        assert_eq!(written(&probe), expected);
    }

    #[test]
    fn expunge_during_fetch_renumbers() {
        let (mut session, probe) = selected(
            "* 11 FETCH (UID 111)\r\n\
             * 12 FETCH (UID 112)\r\n\
             a1 OK FETCH completed\r\n\
             * 10 EXPUNGE\r\n\
             * 11 FETCH (FLAGS (\\Seen))\r\n\
             a2 OK FETCH completed\r\n",
        );
        let fetches = session.fetch("11:12", "UID").unwrap().into_value().unwrap();
        assert_eq!(fetches.len(), 2);
        let fetches = session.fetch("11", "FLAGS").unwrap().into_value().unwrap();
        assert_eq!(fetches[0].flags(), &[Flag::Seen]);
        assert_eq!(
            written(&probe),
            "a1 FETCH 11:12 UID\r\na2 FETCH 11 FLAGS\r\n"
        );

        let inbox = session.selected_mailbox().unwrap();
        assert_eq!(inbox.exists, 41);
        assert_eq!(inbox.uid(10), Some(111));
        assert_eq!(inbox.uid(11), Some(112));
        assert_eq!(inbox.uid(12), None);
    }

    #[test]
    fn mailbox_commands_need_selection() {
        let (mut session, probe) = authenticated("");
        assert!(matches!(session.fetch("1", "FLAGS"), Err(Error::ProtocolViolation(_))));
        assert!(matches!(session.expunge(), Err(Error::ProtocolViolation(_))));
        assert!(matches!(session.search("ALL"), Err(Error::ProtocolViolation(_))));
        assert!(probe.written().is_empty());
    }

    #[test]
    fn expunge() {
        let (mut session, probe) =
            selected("* 3 EXPUNGE\r\n* 3 EXPUNGE\r\na1 OK EXPUNGE completed\r\n");
        let expunged = session.expunge().unwrap().into_value().unwrap();
        assert_eq!(written(&probe), "a1 EXPUNGE\r\n", "Invalid expunge command");
        assert_eq!(expunged, vec![3, 3]);
        assert_eq!(session.selected_mailbox().unwrap().exists, 40);
    }

    #[test]
    fn check() {
        let (mut session, probe) = selected("a1 OK CHECK completed\r\n");
        session.check().unwrap();
        assert_eq!(written(&probe), "a1 CHECK\r\n", "Invalid check command");
    }

    #[test]
    fn search() {
        let (mut session, probe) = selected("* SEARCH 2 3 6\r\na1 OK SEARCH completed\r\n");
        let ids = session.search("FLAGGED SINCE 1-Feb-1994").unwrap();
        assert_eq!(ids.into_value().unwrap(), vec![2, 3, 6]);
        assert_eq!(written(&probe), "a1 SEARCH FLAGGED SINCE 1-Feb-1994\r\n");
    }

    #[test]
    fn uid_search_return() {
        let (mut session, probe) = selected(
            "* ESEARCH (TAG \"a1\") UID COUNT 2 ALL 4:5\r\n\
             a1 OK SEARCH completed\r\n",
        );
        let esearch = session
            .uid_search_return(&[SearchReturn::Count, SearchReturn::All], "UNSEEN")
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(
            written(&probe),
            "a1 UID SEARCH RETURN (COUNT ALL) UNSEEN\r\n"
        );
        assert!(esearch.uid);
        assert_eq!(esearch.count, Some(2));
        assert_eq!(esearch.all_numbers().collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn search_return_without_esearch_answer() {
        let (mut session, _) = selected("* SEARCH 7 2 9\r\na1 OK SEARCH completed\r\n");
        let esearch = session
            .search_return(&[SearchReturn::Min, SearchReturn::Max], "ALL")
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(esearch.min, Some(2));
        assert_eq!(esearch.max, Some(9));
        assert_eq!(esearch.count, Some(3));
    }

    #[test]
    fn sort() {
        let (mut session, probe) = selected("* SORT 2 3 1\r\na1 OK SORT completed\r\n");
        let ids = session
            .sort(&[SortCriterion::Arrival], SortCharset::Utf8, "ALL")
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(ids, vec![2, 3, 1]);
        assert_eq!(written(&probe), "a1 SORT (ARRIVAL) UTF-8 ALL\r\n");
    }

    #[test]
    fn store() {
        generic_store(" ", |c, set, query| c.store(set, query));
    }

    #[test]
    fn uid_store() {
        generic_store(" UID ", |c, set, query| c.uid_store(set, query));
    }

    fn generic_store<F, T>(prefix: &str, op: F)
    where
        F: FnOnce(&mut Session, &str, &str) -> Result<T>,
    {
        let res = "* 2 FETCH (FLAGS (\\Deleted \\Seen))\r\n\
                   * 3 FETCH (FLAGS (\\Deleted))\r\n\
                   * 4 FETCH (FLAGS (\\Deleted \\Flagged \\Seen))\r\n\
                   a1 OK STORE completed\r\n";

        generic_with_uid(res, "STORE", "2.4", "+FLAGS (\\Deleted)", prefix, op);
    }

    #[test]
    fn fetch() {
        generic_fetch(" ", |c, seq, query| c.fetch(seq, query))
    }

    #[test]
    fn uid_fetch() {
        generic_fetch(" UID ", |c, seq, query| c.uid_fetch(seq, query))
    }

    fn generic_fetch<F, T>(prefix: &str, op: F)
    where
        F: FnOnce(&mut Session, &str, &str) -> Result<T>,
    {
        generic_with_uid("a1 OK FETCH completed\r\n", "FETCH", "1", "BODY[]", prefix, op);
    }

    fn generic_with_uid<F, T>(res: &str, cmd: &str, seq: &str, query: &str, prefix: &str, op: F)
    where
        F: FnOnce(&mut Session, &str, &str) -> Result<T>,
    {
        let line = format!("a1{}{} {} {}\r\n", prefix, cmd, seq, query);
        let (mut session, probe) = selected(res);
        let _ = op(&mut session, seq, query);
        assert_eq!(written(&probe), line, "Invalid command");
    }

    #[test]
    fn uid_copy_retries_after_trycreate() {
        let (mut session, probe) = selected(
            "a1 NO [TRYCREATE] no such mailbox\r\n\
             a2 OK CREATE completed\r\n\
             a3 OK [COPYUID 38505 304,319:320 3956:3958] Done\r\n",
        );
        let copied = session
            .uid_copy("304,319:320", "Archive")
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(
            written(&probe),
            "a1 UID COPY 304,319:320 \"Archive\"\r\n\
             a2 CREATE \"Archive\"\r\n\
             a3 UID COPY 304,319:320 \"Archive\"\r\n"
        );
        assert_eq!(copied.uid_validity, Some(38505));
        assert!(!copied.destination.is_empty());
    }

    #[test]
    fn copy_failure_without_trycreate() {
        let (mut session, probe) = selected("a1 NO [OVERQUOTA] over quota\r\n");
        let result = session.copy("1:3", "Archive").unwrap();
        assert_eq!(result.code, ResultCode::No);
        assert_eq!(written(&probe), "a1 COPY 1:3 \"Archive\"\r\n");
    }

    #[test]
    fn logout() {
        let (mut session, probe) = session("* BYE Logging out\r\na1 OK Logout completed.\r\n");
        session.logout().unwrap();
        assert_eq!(written(&probe), "a1 LOGOUT\r\n", "Invalid logout command");
        assert_eq!(session.state(), State::NotConnected);
        assert_eq!(probe.shutdowns(), 1);
    }

    #[test]
    fn disconnect_closes_selection_first() {
        let (mut session, probe) =
            selected("a1 OK CLOSE completed\r\n* BYE bye\r\na2 OK LOGOUT completed\r\n");
        session.disconnect(true).unwrap();
        assert_eq!(written(&probe), "a1 CLOSE\r\na2 LOGOUT\r\n");
        assert_eq!(session.state(), State::NotConnected);
        assert!(session.directory().is_none());
        assert_eq!(probe.shutdowns(), 1);
    }

    #[test]
    fn starttls() {
        let (mut session, probe) = session("a1 OK Begin TLS negotiation now\r\n");
        let secure = MockStream::new(
            b"* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\na2 OK CAPABILITY completed\r\n".to_vec(),
        );
        let secure_probe = secure.probe();
        session
            .starttls(move |_plain| Ok(Box::new(secure) as BoxedConnection))
            .unwrap();
        assert_eq!(written(&probe), "a1 STARTTLS\r\n");
        assert_eq!(written(&secure_probe), "a2 CAPABILITY\r\n");
        assert!(session.is_secure());
        assert!(session.capabilities().has("AUTH=PLAIN"));
        assert!(!session.capabilities().has("STARTTLS"));
    }

    #[test]
    fn failed_tls_handshake_is_fatal() {
        let (mut session, _) = session("a1 OK Begin TLS negotiation now\r\n");
        let result = session.starttls(|_plain| Err(Error::TlsUpgrade("bad certificate".into())));
        assert!(matches!(result, Err(Error::TlsUpgrade(_))));
        assert_eq!(session.state(), State::NotConnected);
    }

    #[test]
    fn run_command() {
        let (mut session, probe) = session("* XYZZY ok\r\na1 OK done\r\n");
        let result = session.run_command("XYZZY").unwrap();
        assert_eq!(written(&probe), "a1 XYZZY\r\n");
        assert_eq!(
            result.responses,
            vec![ServerResponse::Other("* XYZZY ok".to_string())]
        );
    }

    #[test]
    fn capability() {
        let response = "* CAPABILITY IMAP4rev1 STARTTLS AUTH=GSSAPI LOGINDISABLED\r\n\
            a1 OK CAPABILITY completed\r\n";
        let expected_capabilities = vec!["IMAP4rev1", "STARTTLS", "AUTH=GSSAPI", "LOGINDISABLED"];
        let (mut session, probe) = session(response);
        let capabilities = session.capability().unwrap().into_value().unwrap();
        assert_eq!(written(&probe), "a1 CAPABILITY\r\n", "Invalid capability command");
        assert_eq!(capabilities.len(), 4);
        for e in expected_capabilities {
            assert!(capabilities.has(e));
            assert!(session.capabilities().has(e));
        }
    }

    mod state_walk {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone, Copy)]
        enum Step {
            SelectOk,
            SelectNo,
            ExamineOk,
            ExamineNo,
            Close,
            Noop,
            Bye,
            Drop,
        }

        fn step() -> impl Strategy<Value = Step> {
            prop_oneof![
                Just(Step::SelectOk),
                Just(Step::SelectNo),
                Just(Step::ExamineOk),
                Just(Step::ExamineNo),
                Just(Step::Close),
                Just(Step::Noop),
                Just(Step::Bye),
                Just(Step::Drop),
            ]
        }

        /// The server's side of `steps` and the state expected after each one.
        fn script(steps: &[Step]) -> (String, Vec<State>) {
            let mut script = String::new();
            let mut states = Vec::new();
            let mut state = State::Authenticated;
            let mut tag = 0;
            for step in steps {
                if state != State::NotConnected {
                    let mut send = |line: &str| {
                        tag += 1;
                        script.push_str(&line.replace("{tag}", &format!("a{}", tag)));
                    };
                    state = match step {
                        Step::SelectOk => {
                            send("* 2 EXISTS\r\n{tag} OK [READ-WRITE] done\r\n");
                            State::Selected
                        }
                        Step::ExamineOk => {
                            send("* 2 EXISTS\r\n{tag} OK [READ-ONLY] done\r\n");
                            State::Selected
                        }
                        Step::SelectNo | Step::ExamineNo => {
                            send("{tag} NO no such mailbox\r\n");
                            State::Authenticated
                        }
                        Step::Close if state == State::Selected => {
                            send("{tag} OK closed\r\n");
                            State::Authenticated
                        }
                        Step::Close => state,
                        Step::Noop => {
                            send("{tag} OK\r\n");
                            state
                        }
                        Step::Bye => {
                            send("* BYE going away\r\n");
                            State::NotConnected
                        }
                        Step::Drop => State::NotConnected,
                    };
                }
                states.push(state);
            }
            (script, states)
        }

        proptest! {
            #[test]
            fn selection_follows_state(steps in proptest::collection::vec(step(), 1..16)) {
                let (script, states) = script(&steps);
                let (mut session, _) = authenticated(&script);
                let mut last_selected = None;
                for (i, (step, expected)) in steps.iter().zip(states).enumerate() {
                    let was_connected = session.state() != State::NotConnected;
                    let name = format!("Box{}", i);
                    let outcome = match step {
                        Step::SelectOk | Step::SelectNo => session.select(&name).map(|_| ()),
                        Step::ExamineOk | Step::ExamineNo => session.examine(&name).map(|_| ()),
                        Step::Close => session.close().map(|_| ()),
                        Step::Noop | Step::Bye | Step::Drop => session.noop().map(|_| ()),
                    };
                    if !was_connected {
                        prop_assert!(outcome.is_err());
                    }
                    if matches!(step, Step::SelectOk | Step::ExamineOk) && was_connected {
                        last_selected = Some(name);
                    }

                    prop_assert_eq!(session.state(), expected);
                    prop_assert_eq!(
                        session.selected_mailbox().is_some(),
                        expected == State::Selected
                    );
                    if expected == State::Selected {
                        prop_assert_eq!(
                            session.selected_mailbox().map(|m| m.name().to_string()),
                            last_selected.clone()
                        );
                    }
                    if expected == State::NotConnected {
                        prop_assert!(session.directory().is_none());
                    }
                }
            }
        }
    }
}
