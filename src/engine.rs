//! The transaction engine: admission, timeouts, teardown and state updates.
//!
//! Every command of a [`Session`] funnels through [`Session::execute`] or the
//! [`start`](Session::start)/[`await_result`](Session::await_result) pair. The engine admits one
//! transaction at a time, settles literal encodings against the server's capabilities, runs the
//! exchange, and folds the responses it collected back into the session before the caller sees
//! the result.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::conn::{Connection, ShutdownHandle};
use crate::error::{Error, Result};
use crate::literal::Negotiated;
use crate::mailbox::MailboxId;
use crate::session::{ReferralPolicy, Session, State};
use crate::transaction::{exchange, Exchange, Transaction, TransactionResult};
use crate::types::{Completion, ResponseCode, ServerResponse, Status};

/// The single-transaction slot. Released when dropped.
pub(crate) struct Admission(Arc<AtomicBool>);

impl Admission {
    pub(crate) fn acquire(busy: &Arc<AtomicBool>) -> Option<Admission> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Admission(Arc::clone(busy)))
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type Outcome<T> = (T, Result<Exchange>, Admission);

/// A transaction running in the background. Collect it with [`Session::await_result`].
#[must_use = "a started transaction must be awaited for its result to reach the session"]
pub struct Pending<T: Transaction> {
    receiver: Receiver<Outcome<T>>,
    kill: Option<ShutdownHandle>,
    deadline: Option<Instant>,
}

impl<T: Transaction> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Lock the wire, recovering it from a thread that panicked mid-exchange.
pub(crate) fn lock_wire(
    wire: &Mutex<Option<Connection>>,
) -> std::sync::MutexGuard<'_, Option<Connection>> {
    match wire.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn run_locked<T: Transaction + ?Sized>(
    wire: &Mutex<Option<Connection>>,
    tx: &mut T,
) -> Result<Exchange> {
    let mut guard = lock_wire(wire);
    match guard.as_mut() {
        Some(conn) => exchange(conn, tx),
        None => Err(Error::ConnectionLost),
    }
}

impl Session {
    /// Run `tx` to completion and return its result.
    ///
    /// Tagged `NO` and `BAD` come back as failed results. Errors are raised for misuse (the
    /// session remains usable), for missing capabilities in strict mode (nothing was sent) and
    /// for transport failures (the connection is gone).
    pub fn execute<T>(&mut self, mut tx: T) -> Result<TransactionResult<T::Output>>
    where
        T: Transaction + 'static,
    {
        if self.options.transaction_timeout.is_some() {
            let pending = self.start(tx)?;
            return self.await_result(pending);
        }
        let admission = self.pre_process(&mut tx)?;
        let outcome = run_locked(&self.wire, &mut tx);
        drop(admission);
        self.post_process(&mut tx, outcome)
    }

    /// Send `tx` from a background thread and return at once.
    ///
    /// The session refuses other transactions until the result is collected with
    /// [`await_result`](Self::await_result). The transaction timeout, if any, counts from now.
    pub fn start<T>(&mut self, mut tx: T) -> Result<Pending<T>>
    where
        T: Transaction + 'static,
    {
        let admission = self.pre_process(&mut tx)?;
        let kill = lock_wire(&self.wire)
            .as_ref()
            .and_then(Connection::shutdown_handle);
        let deadline = self
            .options
            .transaction_timeout
            .map(|timeout| Instant::now() + timeout);
        let (sender, receiver) = mpsc::channel();
        let wire = Arc::clone(&self.wire);
        thread::Builder::new()
            .name(format!("imap-{}", tx.command().to_ascii_lowercase()))
            .spawn(move || {
                let outcome = run_locked(&wire, &mut tx);
                if sender.send((tx, outcome, admission)).is_err() {
                    // the caller gave up on us; the connection state is unknown
                    if let Some(mut conn) = lock_wire(&wire).take() {
                        conn.close();
                    }
                }
            })?;
        Ok(Pending {
            receiver,
            kill,
            deadline,
        })
    }

    /// Wait for a transaction started with [`start`](Self::start).
    ///
    /// If the transaction timeout expires first, the connection is torn down and
    /// [`Error::Timeout`] is returned.
    pub fn await_result<T>(&mut self, pending: Pending<T>) -> Result<TransactionResult<T::Output>>
    where
        T: Transaction,
    {
        let received = match pending.deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                pending.receiver.recv_timeout(left)
            }
            None => pending
                .receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok((mut tx, outcome, admission)) => {
                drop(admission);
                self.post_process(&mut tx, outcome)
            }
            Err(RecvTimeoutError::Timeout) => {
                error!("transaction timed out, tearing down the connection");
                if let Some(kill) = pending.kill {
                    kill.shutdown();
                }
                self.close_connection();
                Err(Error::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("transaction thread vanished, tearing down the connection");
                self.close_connection();
                Err(Error::ConnectionLost)
            }
        }
    }

    pub(crate) fn refuse_while_watching(&self) -> Result<()> {
        if self.idling.load(Ordering::Acquire) {
            return Err(Error::ProtocolViolation(
                "a watch operation is in progress".to_string(),
            ));
        }
        Ok(())
    }

    /// Every check [`execute`](Self::execute) makes before writing, without taking the slot.
    ///
    /// Commands that change local state ahead of sending run this first, so a refused command
    /// leaves the session as it was.
    pub(crate) fn preflight<T: Transaction + ?Sized>(&self, tx: &mut T) -> Result<()> {
        if self.state == State::NotConnected {
            return Err(Error::ProtocolViolation("not connected".to_string()));
        }
        self.refuse_while_watching()?;
        if self.busy.load(Ordering::Acquire) {
            return Err(Error::ProtocolViolation(
                "another transaction proceeding".to_string(),
            ));
        }

        tx.arguments().validate()?;
        let strict = self.options.strict_capabilities;
        if strict {
            if !tx.command().eq_ignore_ascii_case("CAPABILITY")
                && !self.capabilities.has("IMAP4rev1")
            {
                return Err(Error::Incapable("IMAP4rev1".to_string()));
            }
            if let Some(missing) = tx
                .required_capabilities()
                .iter()
                .find(|c| !self.capabilities.has(c))
            {
                return Err(Error::Incapable(missing.to_string()));
            }
        }
        let negotiated = Negotiated::new(&self.capabilities, strict);
        tx.arguments_mut()
            .for_each_literal_mut(|literal| literal.negotiate(negotiated))
    }

    /// Admission and literal negotiation. Nothing is written if this fails.
    fn pre_process<T: Transaction + ?Sized>(&mut self, tx: &mut T) -> Result<Admission> {
        self.preflight(tx)?;
        Admission::acquire(&self.busy).ok_or_else(|| {
            Error::ProtocolViolation("another transaction proceeding".to_string())
        })
    }

    /// Fold an exchange back into the session and build the caller's result.
    fn post_process<T: Transaction + ?Sized>(
        &mut self,
        tx: &mut T,
        outcome: Result<Exchange>,
    ) -> Result<TransactionResult<T::Output>> {
        let Exchange {
            completion,
            responses,
            failure,
        } = match outcome {
            Ok(exchange) => exchange,
            Err(e) if e.is_fatal() => {
                error!(command = tx.command(), "fatal error, closing connection: {}", e);
                self.close_connection();
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.apply_responses(&responses);
        self.apply_completion(&completion);

        let value = if completion.status == Status::Ok {
            Some(tx.build_result(&responses, &completion))
        } else {
            None
        };

        if completion.status == Status::Bye || responses.iter().any(ServerResponse::is_bye) {
            self.handle_bye();
        }

        if completion.status == Status::No {
            if let Some(ResponseCode::Referral(ref referrals)) = completion.code {
                match self.options.referral_policy {
                    ReferralPolicy::Raise => {
                        return Err(Error::MailboxReferral {
                            referrals: referrals.clone(),
                            text: completion.text,
                        })
                    }
                    ReferralPolicy::Log => warn!(
                        command = tx.command(),
                        ?referrals,
                        "mailbox referral: {}",
                        completion.text
                    ),
                }
            }
        }

        if let Some(failure) = failure {
            return Err(failure);
        }
        Ok(TransactionResult::new(completion, responses, value))
    }

    /// The mailbox unsolicited mailbox data applies to.
    fn update_target(&self) -> Option<MailboxId> {
        if !self.options.track_mailbox_updates {
            return None;
        }
        self.selected.or(self.pending_selection)
    }

    fn with_target<F: FnOnce(&mut crate::mailbox::Mailbox)>(&mut self, f: F) {
        let target = match self.update_target() {
            Some(id) => id,
            None => return,
        };
        if let Some(mailbox) = self.directory.as_mut().and_then(|d| d.get_mut(target)) {
            f(mailbox);
        }
    }

    /// Apply responses in arrival order.
    pub(crate) fn apply_responses(&mut self, responses: &[ServerResponse]) {
        for response in responses {
            match response {
                ServerResponse::Capabilities(tokens) => {
                    self.capabilities = tokens.iter().cloned().collect();
                }
                ServerResponse::Untagged { status, code, text } => {
                    match status {
                        Status::No | Status::Bad => warn!("server {}: {}", status, text),
                        _ => {}
                    }
                    if let Some(code) = code {
                        self.apply_code(code, text);
                    }
                }
                ServerResponse::Exists(n) => self.with_target(|m| m.exists = *n),
                ServerResponse::Recent(n) => self.with_target(|m| m.recent = *n),
                ServerResponse::Expunge(seq) => self.with_target(|m| m.expunge(*seq)),
                ServerResponse::Vanished { earlier, uids } if !earlier => {
                    self.with_target(|m| {
                        for uid in uids.iter().flat_map(|r| r.clone()) {
                            m.vanish(uid);
                        }
                    })
                }
                ServerResponse::Flags(flags) => {
                    self.with_target(|m| m.applicable_flags = flags.clone())
                }
                ServerResponse::Fetch(fetch) => {
                    if let Some(uid) = fetch.uid {
                        self.with_target(|m| m.record_uid(fetch.message, uid));
                    }
                }
                ServerResponse::Status { mailbox, items } => {
                    if let Some(directory) = self.directory.as_mut() {
                        let id = directory.get_or_create(mailbox);
                        if let Some(m) = directory.get_mut(id) {
                            m.apply_status(items);
                        }
                    }
                }
                ServerResponse::List(name) => {
                    if let Some(directory) = self.directory.as_mut() {
                        directory.add(name);
                    }
                }
                _ => {}
            }
        }
    }

    fn apply_code(&mut self, code: &ResponseCode, text: &str) {
        match code {
            ResponseCode::Alert => warn!("ALERT: {}", text),
            ResponseCode::Capabilities(tokens) => {
                self.capabilities = tokens.iter().cloned().collect();
            }
            ResponseCode::UidNext(n) => self.with_target(|m| m.uid_next = Some(*n)),
            ResponseCode::UidValidity(n) => self.with_target(|m| m.uid_validity = Some(*n)),
            ResponseCode::Unseen(n) => self.with_target(|m| m.unseen = Some(*n)),
            ResponseCode::HighestModSeq(n) => self.with_target(|m| m.highest_modseq = Some(*n)),
            ResponseCode::PermanentFlags(flags) => {
                self.with_target(|m| m.permanent_flags = flags.clone())
            }
            ResponseCode::ReadOnly => self.with_target(|m| m.read_only = true),
            ResponseCode::ReadWrite => self.with_target(|m| m.read_only = false),
            _ => {}
        }
    }

    fn apply_completion(&mut self, completion: &Completion) {
        if let Some(ref code) = completion.code {
            match code {
                ResponseCode::Referral(_) => {}
                code => self.apply_code(code, &completion.text),
            }
        }
    }

    /// The server said goodbye: log out locally and drop the connection. Safe to repeat.
    pub(crate) fn handle_bye(&mut self) {
        if self.state == State::NotConnected {
            return;
        }
        debug!("server closed the session");
        self.set_state(State::NotAuthenticated);
        self.close_connection();
    }

    /// Tear down the transport and forget everything tied to it.
    pub(crate) fn close_connection(&mut self) {
        let wire = mem::replace(&mut self.wire, Arc::new(Mutex::new(None)));
        self.busy = Arc::new(AtomicBool::new(false));
        let taken = match wire.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take(),
            // still held by a background exchange, which closes it once it notices
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some(mut conn) = taken {
            conn.close();
        }
        self.set_state(State::NotConnected);
    }

    /// Whether a connection is still attached.
    pub fn is_connected(&self) -> bool {
        self.state != State::NotConnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_stream::{MockProbe, MockStream};
    use crate::session::SessionOptions;
    use crate::transaction::{Argument, Command, ResultCode};
    use crate::Literal;

    fn session_with(script: &str, options: SessionOptions) -> (Session, MockProbe) {
        let stream = MockStream::new(script.as_bytes().to_vec());
        let probe = stream.probe();
        (Session::open(stream, options).unwrap(), probe)
    }

    fn session(script: &str) -> (Session, MockProbe) {
        session_with(script, SessionOptions::default())
    }

    fn written(probe: &MockProbe) -> String {
        String::from_utf8(probe.written()).unwrap()
    }

    #[test]
    fn single_flight() {
        let (mut s, probe) = session("* OK ready\r\n");
        let _held = Admission::acquire(&s.busy).unwrap();
        match s.execute(Command::simple("NOOP")) {
            Err(Error::ProtocolViolation(msg)) => assert!(msg.contains("another transaction")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(probe.written().is_empty());
    }

    #[test]
    fn admission_is_released() {
        let (mut s, _) = session("* OK ready\r\na1 OK done\r\na2 NO nope\r\n");
        assert!(s.execute(Command::simple("NOOP")).unwrap().succeeded());
        let r = s.execute(Command::simple("NOOP")).unwrap();
        assert_eq!(r.code, ResultCode::No);
        assert!(r.value().is_none());
    }

    #[test]
    fn not_connected_is_a_violation() {
        let (mut s, _) = session("* OK ready\r\n");
        s.close_connection();
        assert!(matches!(
            s.execute(Command::simple("NOOP")),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn strict_mode_checks_required_capabilities() {
        let strict = SessionOptions {
            strict_capabilities: true,
            ..SessionOptions::default()
        };
        let (mut s, probe) = session_with("* OK [CAPABILITY IMAP4rev1] ready\r\n", strict);
        let cmd = Command::simple("UNSELECT").require("UNSELECT");
        match s.execute(cmd) {
            Err(Error::Incapable(cap)) => assert_eq!(cap, "UNSELECT"),
            other => panic!("unexpected {:?}", other),
        }
        let cmd = Command::simple("APPEND").arg(
            "message",
            Argument::literal(
                Literal::new(&b"abc"[..]).sync_mode(crate::literal::SyncMode::NonSynchronizing),
            ),
        );
        assert!(matches!(s.execute(cmd), Err(Error::Incapable(_))));
        assert!(probe.written().is_empty());
        assert_eq!(s.state(), State::NotAuthenticated);
    }

    #[test]
    fn literal_plus_is_used_when_advertised() {
        let (mut s, probe) = session(
            "* OK [CAPABILITY IMAP4rev1 LITERAL+] ready\r\n\
             a1 OK done\r\n",
        );
        let cmd = Command::simple("X-PUT").arg("data", Argument::literal(&b"hello"[..]));
        assert!(s.execute(cmd).unwrap().succeeded());
        assert_eq!(written(&probe), "a1 X-PUT {5+}\r\nhello\r\n");
    }

    #[test]
    fn capability_response_replaces_set() {
        let (mut s, _) = session(
            "* OK [CAPABILITY IMAP4rev1 IDLE] ready\r\n\
             * CAPABILITY IMAP4rev1 UIDPLUS\r\n\
             a1 OK done\r\n",
        );
        s.execute(Command::simple("CAPABILITY")).unwrap();
        assert!(s.capabilities().has("UIDPLUS"));
        assert!(!s.capabilities().has("IDLE"));
    }

    #[test]
    fn bye_completion_tears_down_once() {
        let (mut s, probe) = session("* OK ready\r\n* BYE shutting down\r\n");
        let r = s.execute(Command::simple("NOOP")).unwrap();
        assert_eq!(r.code, ResultCode::Bye);
        assert_eq!(s.state(), State::NotConnected);
        s.handle_bye();
        s.close_connection();
        assert_eq!(s.state(), State::NotConnected);
        assert_eq!(probe.shutdowns(), 1);
    }

    #[test]
    fn lost_connection_is_fatal() {
        let (mut s, probe) = session("* OK ready\r\n");
        assert!(matches!(
            s.execute(Command::simple("NOOP")),
            Err(Error::ConnectionLost)
        ));
        assert_eq!(s.state(), State::NotConnected);
        assert!(s.directory().is_none());
        assert_eq!(probe.shutdowns(), 1);
    }

    #[test]
    fn referral_policy() {
        let script = "* OK ready\r\n\
                      a1 NO [REFERRAL imap://other/box] try elsewhere\r\n\
                      a2 NO [REFERRAL imap://other/box] try elsewhere\r\n";
        let (mut s, _) = session(script);
        let r = s.execute(Command::simple("NOOP")).unwrap();
        assert_eq!(r.code, ResultCode::No);

        s.options.referral_policy = ReferralPolicy::Raise;
        match s.execute(Command::simple("NOOP")) {
            Err(Error::MailboxReferral { referrals, .. }) => {
                assert_eq!(referrals, vec!["imap://other/box".to_string()])
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(s.state(), State::NotAuthenticated);
    }

    #[test]
    fn start_and_await() {
        let (mut s, _) = session("* OK ready\r\n* 3 EXISTS\r\na1 OK done\r\n");
        let pending = s.start(Command::simple("NOOP")).unwrap();
        assert!(matches!(
            s.execute(Command::simple("NOOP")),
            Err(Error::ProtocolViolation(_))
        ));
        let r = s.await_result(pending).unwrap();
        assert!(r.succeeded());
        assert_eq!(r.responses, vec![ServerResponse::Exists(3)]);
    }
}
