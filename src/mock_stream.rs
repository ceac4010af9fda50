use std::cmp::min;
use std::io::{Error, ErrorKind, Read, Result, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::conn::Transport;

/// A scripted transport. Reads replay `read_buf`; writes are recorded for the [`MockProbe`].
#[derive(Default)]
pub struct MockStream {
    read_buf: Vec<u8>,
    read_pos: usize,
    written: Arc<Mutex<Vec<u8>>>,
    shutdowns: Arc<AtomicUsize>,
    err_on_read: bool,
    eof_on_read: bool,
    read_delay: usize,
}

/// Observes a [`MockStream`] after it has been moved into a connection.
#[derive(Clone)]
pub struct MockProbe {
    written: Arc<Mutex<Vec<u8>>>,
    shutdowns: Arc<AtomicUsize>,
}

impl MockProbe {
    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.written
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    /// How often the transport was shut down.
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl MockStream {
    pub fn new(read_buf: Vec<u8>) -> MockStream {
        MockStream::default().with_buf(read_buf)
    }

    pub fn with_buf(mut self, read_buf: Vec<u8>) -> MockStream {
        self.read_buf = read_buf;
        self
    }

    pub fn with_eof(mut self) -> MockStream {
        self.eof_on_read = true;
        self
    }

    pub fn with_err(mut self) -> MockStream {
        self.err_on_read = true;
        self
    }

    /// Deliver the first bytes one at a time.
    pub fn with_delay(mut self) -> MockStream {
        self.read_delay = 8;
        self
    }

    pub fn probe(&self) -> MockProbe {
        MockProbe {
            written: Arc::clone(&self.written),
            shutdowns: Arc::clone(&self.shutdowns),
        }
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.eof_on_read {
            return Ok(0);
        }
        if self.err_on_read {
            return Err(Error::new(ErrorKind::Other, "MockStream Error"));
        }
        if self.read_pos >= self.read_buf.len() {
            return Ok(0);
        }
        let mut write_len = min(buf.len(), self.read_buf.len() - self.read_pos);
        if self.read_delay > 0 {
            self.read_delay -= 1;
            write_len = min(write_len, 1);
        }
        let max_pos = self.read_pos + write_len;
        buf[..write_len].copy_from_slice(&self.read_buf[self.read_pos..max_pos]);
        self.read_pos = max_pos;
        Ok(write_len)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.written.lock() {
            Ok(mut w) => w.extend_from_slice(buf),
            Err(_) => return Err(Error::new(ErrorKind::Other, "probe poisoned")),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Transport for MockStream {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> crate::error::Result<()> {
        Ok(())
    }

    fn set_write_timeout(&mut self, _timeout: Option<Duration>) -> crate::error::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> crate::error::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
