//! Adds support for the IMAP IDLE command specificed in [RFC
//! 2177](https://tools.ietf.org/html/rfc2177), and a `NOOP` polling fallback for servers
//! without it.
//!
//! A watch runs on a background thread and holds the connection for as long as it runs. While
//! it does, the session refuses every other transaction; [`Session::stop_watch`] ends it and
//! hands back what the server reported in the meantime.

use std::fmt;
use std::io;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::conn::Connection;
use crate::engine::lock_wire;
use crate::error::{Error, Rejection, Result};
use crate::mailbox::Mailbox;
use crate::session::{Session, State};
use crate::transaction::{exchange, Command};
use crate::types::{ServerResponse, Status};

/// Longest allowed polling interval.
pub const MAX_POLLING_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Decides when the server's news should end a watch.
pub trait WatchGoal: Send + 'static {
    /// Look at one unsolicited response. Returning `true` stops the watch.
    fn observe(&mut self, response: &ServerResponse) -> bool;
}

/// Keep the session alive and collect every update. Never stops on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAlive;

impl WatchGoal for KeepAlive {
    fn observe(&mut self, _: &ServerResponse) -> bool {
        false
    }
}

/// Wait until new messages arrive in the selected mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageArrival {
    exists: u32,
    arrived: Option<RangeInclusive<u32>>,
}

impl MessageArrival {
    /// Start from a known message count.
    pub fn new(exists: u32) -> Self {
        MessageArrival {
            exists,
            arrived: None,
        }
    }

    /// Start from the mailbox's current message count.
    pub fn for_mailbox(mailbox: &Mailbox) -> Self {
        MessageArrival::new(mailbox.exists)
    }

    /// Sequence numbers of the messages that arrived, once any did.
    pub fn arrived(&self) -> Option<&RangeInclusive<u32>> {
        self.arrived.as_ref()
    }
}

impl WatchGoal for MessageArrival {
    fn observe(&mut self, response: &ServerResponse) -> bool {
        match *response {
            ServerResponse::Expunge(_) => {
                self.exists = self.exists.saturating_sub(1);
                false
            }
            ServerResponse::Exists(n) if n > self.exists => {
                self.arrived = Some(self.exists + 1..=n);
                self.exists = n;
                true
            }
            ServerResponse::Exists(n) => {
                self.exists = n;
                false
            }
            _ => false,
        }
    }
}

/// How a watch talks to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchMode {
    /// `IDLE` when advertised, polling otherwise.
    #[default]
    Auto,
    /// Always `IDLE`. Fails with [`Error::Incapable`] if the server lacks it.
    Idle,
    /// Always `NOOP` polling.
    Polling,
}

/// Timing of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub mode: WatchMode,
    /// Pause between two `NOOP`s. Must be non-zero and at most [`MAX_POLLING_INTERVAL`].
    pub polling_interval: Duration,
    /// How long one `IDLE` may run before it is renewed.
    pub idle_refresh: Duration,
    /// How often the `IDLE` loop checks for a stop request.
    pub tick: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            mode: WatchMode::Auto,
            polling_interval: Duration::from_secs(10 * 60),
            // RFC 2177 advises renewing at least every 29 minutes
            idle_refresh: Duration::from_secs(29 * 60),
            tick: Duration::from_secs(1),
        }
    }
}

struct WatchOutcome<G> {
    goal: G,
    responses: Vec<ServerResponse>,
    result: Result<()>,
}

/// A watch running in the background.
///
/// Dropping it stops the watch and waits for the thread, but the responses it gathered are lost;
/// use [`Session::stop_watch`] to fold them into the session.
pub struct Watch<G: WatchGoal> {
    stop: Option<Sender<()>>,
    updates: Receiver<ServerResponse>,
    done: Receiver<WatchOutcome<G>>,
    handle: Option<JoinHandle<()>>,
    idling: Arc<AtomicBool>,
    finished: Option<WatchOutcome<G>>,
}

impl<G: WatchGoal> fmt::Debug for Watch<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl<G: WatchGoal> Watch<G> {
    /// Responses published as they arrive.
    pub fn updates(&self) -> &Receiver<ServerResponse> {
        &self.updates
    }

    /// Block up to `timeout` for the watch to end by itself. Returns whether it has.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if self.finished.is_some() {
            return true;
        }
        match self.done.recv_timeout(timeout) {
            Ok(outcome) => {
                self.finished = Some(outcome);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    /// Whether the watch ended, without blocking.
    pub fn is_finished(&mut self) -> bool {
        self.wait(Duration::ZERO)
    }

    fn finish(&mut self) -> Option<WatchOutcome<G>> {
        // dropping the sender is the stop signal
        self.stop.take();
        let outcome = match self.finished.take() {
            Some(outcome) => Some(outcome),
            None => self.done.recv().ok(),
        };
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.idling.store(false, Ordering::Release);
        outcome
    }
}

impl<G: WatchGoal> Drop for Watch<G> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// What a finished watch leaves behind.
#[derive(Debug)]
pub struct WatchReport<G> {
    /// The goal, in its final state.
    pub goal: G,
    /// Every unsolicited response received during the watch, in arrival order.
    pub responses: Vec<ServerResponse>,
}

fn stop_requested(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

fn is_timeout(e: &Error) -> bool {
    matches!(
        e,
        Error::Io(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
    )
}

struct Observer<'a, G> {
    goal: &'a mut G,
    updates: &'a Sender<ServerResponse>,
    responses: &'a mut Vec<ServerResponse>,
}

impl<G: WatchGoal> Observer<'_, G> {
    /// Record one response. Returns whether the watch should end.
    fn see(&mut self, response: ServerResponse) -> bool {
        let bye = response.is_bye();
        let reached = self.goal.observe(&response);
        let _ = self.updates.send(response.clone());
        self.responses.push(response);
        bye || reached
    }
}

fn idle_loop<G: WatchGoal>(
    conn: &mut Connection,
    observer: &mut Observer<'_, G>,
    stop: &Receiver<()>,
    options: &WatchOptions,
) -> Result<()> {
    loop {
        let tag = conn.next_tag();
        conn.write_line(format!("{} IDLE", tag).as_bytes())?;
        loop {
            match conn.read_response()? {
                ServerResponse::Continue { .. } => break,
                ServerResponse::Tagged(c) if c.tag == tag => {
                    let rejection = Rejection {
                        code: c.code,
                        information: c.text,
                    };
                    return Err(match c.status {
                        Status::Bad => Error::Bad(rejection),
                        _ => Error::No(rejection),
                    });
                }
                other => {
                    if observer.see(other) {
                        return Ok(());
                    }
                }
            }
        }
        debug!(connection = conn.id(), "idling");

        conn.set_read_timeout(Some(options.tick))?;
        let started = Instant::now();
        let mut finished = false;
        let mut bye = false;
        while !finished && started.elapsed() < options.idle_refresh {
            if stop_requested(stop) {
                finished = true;
                break;
            }
            match conn.read_response() {
                Ok(response) => {
                    bye = response.is_bye();
                    finished = observer.see(response);
                }
                Err(ref e) if is_timeout(e) => continue,
                Err(e) => {
                    let _ = conn.restore_read_timeout();
                    return Err(e);
                }
            }
        }
        conn.restore_read_timeout()?;
        if bye {
            return Ok(());
        }

        conn.write_line(b"DONE")?;
        loop {
            match conn.read_response()? {
                ServerResponse::Tagged(c) if c.tag == tag => break,
                other => {
                    if observer.see(other) {
                        finished = true;
                    }
                }
            }
        }
        if finished {
            return Ok(());
        }
        debug!(connection = conn.id(), "renewing IDLE");
    }
}

fn polling_loop<G: WatchGoal>(
    conn: &mut Connection,
    observer: &mut Observer<'_, G>,
    stop: &Receiver<()>,
    options: &WatchOptions,
) -> Result<()> {
    loop {
        let ex = exchange(conn, &mut Command::simple("NOOP"))?;
        let mut finished = ex.completion.status == Status::Bye;
        for response in ex.responses {
            finished |= observer.see(response);
        }
        if finished {
            return Ok(());
        }
        match stop.recv_timeout(options.polling_interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => {
                // one last look so nothing that arrived since the last poll is missed
                let ex = exchange(conn, &mut Command::simple("NOOP"))?;
                for response in ex.responses {
                    observer.see(response);
                }
                return Ok(());
            }
        }
    }
}

impl Session {
    /// Watch the selected mailbox in the background until `goal` is reached or the watch is
    /// stopped.
    ///
    /// No other transaction can run until the watch is handed to
    /// [`stop_watch`](Self::stop_watch).
    pub fn watch<G: WatchGoal>(&mut self, goal: G, options: WatchOptions) -> Result<Watch<G>> {
        self.require_exact_state(State::Selected)?;
        if options.polling_interval.is_zero() || options.polling_interval > MAX_POLLING_INTERVAL
        {
            return Err(Error::ProtocolViolation(format!(
                "polling interval must be non-zero and at most {:?}",
                MAX_POLLING_INTERVAL
            )));
        }
        let idle = match options.mode {
            WatchMode::Idle if !self.capabilities.has("IDLE") => {
                return Err(Error::Incapable("IDLE".to_string()))
            }
            WatchMode::Idle => true,
            WatchMode::Polling => false,
            WatchMode::Auto => self.capabilities.has("IDLE"),
        };
        if self.busy.load(Ordering::Acquire) {
            return Err(Error::ProtocolViolation(
                "another transaction proceeding".to_string(),
            ));
        }
        if self
            .idling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ProtocolViolation(
                "another watch operation proceeding".to_string(),
            ));
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let (updates_tx, updates_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let wire: Arc<Mutex<Option<Connection>>> = Arc::clone(&self.wire);
        let spawned = thread::Builder::new()
            .name("imap-watch".to_string())
            .spawn(move || {
                let mut goal = goal;
                let mut responses = Vec::new();
                let result = {
                    let mut guard = lock_wire(&wire);
                    let mut observer = Observer {
                        goal: &mut goal,
                        updates: &updates_tx,
                        responses: &mut responses,
                    };
                    match guard.as_mut() {
                        None => Err(Error::ConnectionLost),
                        Some(conn) if idle => idle_loop(conn, &mut observer, &stop_rx, &options),
                        Some(conn) => polling_loop(conn, &mut observer, &stop_rx, &options),
                    }
                };
                let _ = done_tx.send(WatchOutcome {
                    goal,
                    responses,
                    result,
                });
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.idling.store(false, Ordering::Release);
                return Err(Error::Io(e));
            }
        };
        debug!(idle, "watch started");
        Ok(Watch {
            stop: Some(stop_tx),
            updates: updates_rx,
            done: done_rx,
            handle: Some(handle),
            idling: Arc::clone(&self.idling),
            finished: None,
        })
    }

    /// Stop a watch, wait for it, and apply what it saw to the session.
    pub fn stop_watch<G: WatchGoal>(&mut self, mut watch: Watch<G>) -> Result<WatchReport<G>> {
        let outcome = watch.finish();
        drop(watch);
        let WatchOutcome {
            goal,
            responses,
            result,
        } = match outcome {
            Some(outcome) => outcome,
            None => {
                error!("watch thread vanished, tearing down the connection");
                self.close_connection();
                return Err(Error::ConnectionLost);
            }
        };
        self.apply_responses(&responses);
        if responses.iter().any(ServerResponse::is_bye) {
            self.handle_bye();
        }
        match result {
            Ok(()) => Ok(WatchReport { goal, responses }),
            Err(e) if e.is_fatal() => {
                error!("watch failed, closing connection: {}", e);
                self.close_connection();
                Err(e)
            }
            Err(e) => {
                warn!("watch ended: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_stream::{MockProbe, MockStream};
    use crate::session::SessionOptions;

    fn selected(script: &str) -> (Session, MockProbe) {
        let stream = MockStream::new(
            format!("* PREAUTH [CAPABILITY IMAP4rev1 IDLE] ready\r\n{}", script).into_bytes(),
        );
        let probe = stream.probe();
        let mut session = Session::open(stream, SessionOptions::default()).unwrap();
        let id = session.directory_mut().unwrap().get_or_create("INBOX");
        session.directory_mut().unwrap().get_mut(id).unwrap().exists = 3;
        session.selected = Some(id);
        session.set_state(State::Selected);
        (session, probe)
    }

    #[test]
    fn message_arrival_goal() {
        let mut goal = MessageArrival::new(5);
        assert!(!goal.observe(&ServerResponse::Expunge(2)));
        assert!(!goal.observe(&ServerResponse::Exists(4)));
        assert!(goal.observe(&ServerResponse::Exists(6)));
        assert_eq!(goal.arrived(), Some(&(5..=6)));
    }

    #[test]
    fn idle_until_arrival() {
        let script = "+ idling\r\n\
                      * 4 EXISTS\r\n\
                      a1 OK IDLE terminated\r\n";
        let (mut session, probe) = selected(script);
        let goal = MessageArrival::for_mailbox(session.selected_mailbox().unwrap());
        let mut watch = session.watch(goal, WatchOptions::default()).unwrap();
        assert!(watch.wait(Duration::from_secs(5)));
        assert_eq!(
            watch.updates().recv_timeout(Duration::from_secs(1)).unwrap(),
            ServerResponse::Exists(4)
        );
        assert!(matches!(
            session.noop(),
            Err(Error::ProtocolViolation(ref m)) if m.contains("watch")
        ));
        let report = session.stop_watch(watch).unwrap();
        assert_eq!(report.goal.arrived(), Some(&(4..=4)));
        assert_eq!(session.selected_mailbox().unwrap().exists, 4);
        assert_eq!(
            String::from_utf8(probe.written()).unwrap(),
            "a1 IDLE\r\nDONE\r\n"
        );
        assert!(!session.idling.load(Ordering::Acquire));
    }

    #[test]
    fn idle_required_but_missing() {
        let stream = MockStream::new(b"* PREAUTH ready\r\n".to_vec());
        let mut session = Session::open(stream, SessionOptions::default()).unwrap();
        let id = session.directory_mut().unwrap().get_or_create("INBOX");
        session.selected = Some(id);
        session.set_state(State::Selected);
        let options = WatchOptions {
            mode: WatchMode::Idle,
            ..WatchOptions::default()
        };
        assert!(matches!(
            session.watch(KeepAlive, options),
            Err(Error::Incapable(ref c)) if c == "IDLE"
        ));
    }

    #[test]
    fn polling_interval_is_bounded() {
        let (mut session, _) = selected("");
        for interval in [Duration::ZERO, Duration::from_secs(31 * 60)] {
            let options = WatchOptions {
                polling_interval: interval,
                ..WatchOptions::default()
            };
            assert!(session.watch(KeepAlive, options).is_err());
        }
    }

    #[test]
    fn polling_until_arrival() {
        let script = "a1 OK nothing new\r\n\
                      * 5 EXISTS\r\n\
                      a2 OK done\r\n";
        let (mut session, probe) = selected(script);
        let options = WatchOptions {
            mode: WatchMode::Polling,
            polling_interval: Duration::from_millis(10),
            ..WatchOptions::default()
        };
        let mut watch = session.watch(MessageArrival::new(3), options).unwrap();
        assert!(watch.wait(Duration::from_secs(5)));
        let report = session.stop_watch(watch).unwrap();
        assert_eq!(report.goal.arrived(), Some(&(4..=5)));
        assert_eq!(
            String::from_utf8(probe.written()).unwrap(),
            "a1 NOOP\r\na2 NOOP\r\n"
        );
    }

    #[test]
    fn only_one_watch() {
        let (mut session, _) = selected("+ idling\r\n");
        let watch = session.watch(KeepAlive, WatchOptions::default()).unwrap();
        assert!(matches!(
            session.watch(KeepAlive, WatchOptions::default()),
            Err(Error::ProtocolViolation(_))
        ));
        // the script ends while idling, so the watch fails with a lost connection
        assert!(session.stop_watch(watch).is_err());
        assert_eq!(session.state(), State::NotConnected);
    }
}
