//! Message bodies that are too large, or too slow, to hold in memory at once.
//!
//! Uploads go through a [`channel`]: the caller writes message octets into a [`BodyWriter`]
//! while the engine, on its own thread, reads the [`BodyReader`] end and puts the octets on the
//! wire as an `APPEND` literal. Downloads use a [`FetchBodyStream`], which pulls the message in
//! blocks with partial `FETCH` commands as the caller reads.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::client::collect_fetches;
use crate::error::Error;
use crate::literal::LiteralStream;
use crate::session::{Session, State};
use crate::transaction::{Argument, Command, TransactionResult};
use crate::types::{Fetch, ResponseCode, Uid};

/// Flow-control knobs of an upload channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// How long a read waits for the length or for data. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// How far the writer may run ahead of the reader before it backs off.
    pub backpressure_threshold: usize,
    /// How long the writer backs off.
    pub backoff: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            read_timeout: None,
            backpressure_threshold: 40 * 1024,
            backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    /// Octets written but not yet read. `buffer[0]` is at `read_offset`.
    buffer: Vec<u8>,
    write_offset: u64,
    read_offset: u64,
    length: Option<u64>,
    closed: bool,
    reader_alive: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ChannelState>,
    changed: Condvar,
    options: ChannelOptions,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Create an upload channel. `length`, if known, is announced to the reader right away.
pub fn channel(length: Option<u64>, options: ChannelOptions) -> (BodyWriter, BodyReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(ChannelState {
            length,
            reader_alive: true,
            ..ChannelState::default()
        }),
        changed: Condvar::new(),
        options,
    });
    (
        BodyWriter {
            shared: Arc::clone(&shared),
        },
        BodyReader { shared },
    )
}

/// The producing end of an upload channel.
///
/// Closing it, explicitly or by dropping it, fixes the length of the body if it was not given
/// up front.
#[derive(Debug)]
pub struct BodyWriter {
    shared: Arc<Shared>,
}

impl BodyWriter {
    /// Latch the length and wake the reader. Later calls do nothing.
    pub fn close(&mut self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if state.length.is_none() {
            state.length = Some(state.write_offset);
        }
        self.shared.changed.notify_all();
    }

    /// Octets written so far.
    pub fn written(&self) -> u64 {
        self.shared.lock().write_offset
    }
}

impl Write for BodyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.lock();
        if !state.reader_alive {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "body reader went away",
            ));
        }
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "body writer already closed",
            ));
        }
        if let Some(length) = state.length {
            if state.write_offset + buf.len() as u64 > length {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("body exceeds its declared length of {} octets", length),
                ));
            }
        }
        state.buffer.extend_from_slice(buf);
        state.write_offset += buf.len() as u64;
        shared.changed.notify_all();

        if state.length.is_some()
            && state.write_offset - state.read_offset > shared.options.backpressure_threshold as u64
        {
            let _ = shared.changed.wait_timeout(state, shared.options.backoff);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BodyWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// The consuming end of an upload channel.
#[derive(Debug)]
pub struct BodyReader {
    shared: Arc<Shared>,
}

impl BodyReader {
    /// Block until `ready` holds, honouring the read timeout.
    fn wait_until<'a, F>(
        &'a self,
        mut state: MutexGuard<'a, ChannelState>,
        ready: F,
    ) -> io::Result<MutexGuard<'a, ChannelState>>
    where
        F: Fn(&ChannelState) -> bool,
    {
        let deadline = self.shared.options.read_timeout.map(|t| Instant::now() + t);
        while !ready(&state) {
            state = match deadline {
                None => match self.shared.changed.wait(state) {
                    Ok(s) => s,
                    Err(poisoned) => poisoned.into_inner(),
                },
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "buffer underrun",
                        ));
                    }
                    match self.shared.changed.wait_timeout(state, left) {
                        Ok((s, _)) => s,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
        Ok(state)
    }
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.shared.lock();
        let state = self.wait_until(state, |s| s.length.is_some())?;
        let mut state = self.wait_until(state, |s| {
            s.read_offset < s.write_offset || Some(s.read_offset) == s.length || s.closed
        })?;

        let length = state.length.unwrap_or(state.write_offset);
        if state.read_offset == length {
            return Ok(0);
        }
        if state.read_offset == state.write_offset {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "body writer closed after {} of {} octets",
                    state.write_offset, length
                ),
            ));
        }
        let available = (state.write_offset - state.read_offset) as usize;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&state.buffer[..n]);
        state.buffer.drain(..n);
        state.read_offset += n as u64;
        self.shared.changed.notify_all();
        Ok(n)
    }
}

impl LiteralStream for BodyReader {
    fn length(&mut self) -> io::Result<u64> {
        let state = self.shared.lock();
        let state = self.wait_until(state, |s| s.length.is_some())?;
        Ok(state.length.unwrap_or(state.write_offset))
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.reader_alive = false;
        self.shared.changed.notify_all();
    }
}

/// Maps a failed block fetch onto the error the reader sees.
pub type FailureMapper = fn(Option<&ResponseCode>, &str) -> Error;

fn fetch_failure(code: Option<&ResponseCode>, text: &str) -> Error {
    match code {
        Some(code) => Error::FetchFailure(format!("[{}] {}", code, text)),
        None => Error::FetchFailure(text.to_string()),
    }
}

fn into_io(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        e => io::Error::new(io::ErrorKind::Other, e),
    }
}

/// Reads one message body from the selected mailbox in blocks.
///
/// Each block is a `UID FETCH uid BODY.PEEK[section]<start.count>` transaction. The first read
/// of a whole message with no known length asks for `RFC822.SIZE` first; otherwise the end of
/// the body is the first short block.
pub struct FetchBodyStream<'s> {
    session: &'s mut Session,
    uid: Uid,
    section: String,
    offset: u64,
    position: u64,
    length: Option<u64>,
    size_checked: bool,
    block_size: usize,
    peek: bool,
    block: Vec<u8>,
    block_pos: usize,
    eof: bool,
    on_failure: FailureMapper,
}

impl fmt::Debug for FetchBodyStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchBodyStream")
            .field("uid", &self.uid)
            .field("section", &self.section)
            .field("offset", &self.offset)
            .field("position", &self.position)
            .field("length", &self.length)
            .field("block_size", &self.block_size)
            .finish()
    }
}

impl<'s> FetchBodyStream<'s> {
    pub(crate) fn new(session: &'s mut Session, uid: Uid) -> Self {
        let block_size = session.options.fetch_block_size.max(1);
        FetchBodyStream {
            session,
            uid,
            section: String::new(),
            offset: 0,
            position: 0,
            length: None,
            size_checked: false,
            block_size,
            peek: true,
            block: Vec::new(),
            block_pos: 0,
            eof: false,
            on_failure: fetch_failure,
        }
    }

    /// Download a section such as `TEXT` or `1.2` instead of the whole message.
    pub fn section(mut self, section: impl Into<String>) -> Self {
        self.section = section.into();
        self
    }

    /// Download at most `length` octets starting at `offset` within the section.
    pub fn range(mut self, offset: u64, length: u64) -> Self {
        self.offset = offset;
        self.length = Some(length);
        self
    }

    /// The total length of the body, if the caller already knows it.
    pub fn length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Whether to leave `\Seen` untouched. On by default.
    pub fn peek(mut self, peek: bool) -> Self {
        self.peek = peek;
        self
    }

    /// Replace the mapping of a failed block fetch onto an error.
    pub fn on_failure(mut self, mapper: FailureMapper) -> Self {
        self.on_failure = mapper;
        self
    }

    /// Octets delivered so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn run(&mut self, items: String) -> crate::error::Result<Vec<Fetch>> {
        self.session.require_exact_state(State::Selected)?;
        let command = Command::new("UID FETCH", collect_fetches)
            .arg("set", Argument::atom(self.uid))
            .arg("items", Argument::atom(items));
        let result: TransactionResult<Vec<Fetch>> = self.session.execute(command)?;
        if result.failed() {
            return Err((self.on_failure)(result.response_code.as_ref(), &result.text));
        }
        let uid = self.uid;
        let fetches: Vec<Fetch> = result
            .into_value()?
            .into_iter()
            .filter(|f| f.uid == Some(uid))
            .collect();
        if fetches.is_empty() {
            return Err(Error::NoSuchMessage);
        }
        Ok(fetches)
    }

    fn check_size(&mut self) -> crate::error::Result<()> {
        self.size_checked = true;
        if self.length.is_some() || !self.section.is_empty() {
            return Ok(());
        }
        let fetches = self.run("RFC822.SIZE".to_string())?;
        self.length = fetches.iter().find_map(|f| f.size).map(u64::from);
        Ok(())
    }

    fn fill(&mut self) -> crate::error::Result<()> {
        if !self.size_checked {
            self.check_size()?;
        }
        let mut count = self.block_size as u64;
        if let Some(length) = self.length {
            count = count.min(length.saturating_sub(self.position));
        }
        if count == 0 {
            self.eof = true;
            return Ok(());
        }
        let start = self.offset + self.position;
        let items = format!(
            "{}[{}]<{}.{}>",
            if self.peek { "BODY.PEEK" } else { "BODY" },
            self.section,
            start,
            count
        );
        let fetches = self.run(items)?;
        if fetches.iter().all(|f| f.sections.is_empty()) {
            return Err(Error::NoSuchMessage);
        }
        let data = fetches
            .into_iter()
            .flat_map(|f| f.sections.into_iter())
            .find_map(|s| s.data);
        match data {
            None => {
                self.eof = true;
                self.block.clear();
            }
            Some(data) => {
                if (data.len() as u64) < count {
                    self.eof = true;
                }
                self.block = data;
            }
        }
        self.block_pos = 0;
        Ok(())
    }
}

impl Read for FetchBodyStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.block_pos >= self.block.len() {
            if self.eof {
                return Ok(0);
            }
            self.fill().map_err(into_io)?;
            if self.block.is_empty() {
                return Ok(0);
            }
        }
        let n = (self.block.len() - self.block_pos).min(buf.len());
        buf[..n].copy_from_slice(&self.block[self.block_pos..self.block_pos + n]);
        self.block_pos += n;
        self.position += n as u64;
        Ok(n)
    }
}
