//! The byte-stream side of a session: framing, tags, timeouts and TLS upgrade.

use std::fmt::{Debug, Formatter};
use std::io::{self, BufRead, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bufstream::BufStream;
#[cfg(feature = "native-tls")]
use native_tls::TlsStream;
#[cfg(feature = "rustls-tls")]
use rustls_connector::TlsStream as RustlsStream;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::literal::Literal;
use crate::parse::{parse_response, Parsed};
use crate::types::ServerResponse;

static TAG_PREFIX: &str = "a";
const INITIAL_TAG: u32 = 0;
const CR: u8 = 0x0d;
const LF: u8 = 0x0a;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Must be implemented for a transport in order for a [`Session`](crate::Session) to run over it.
///
/// Besides the timeouts, a transport may hand out a [`ShutdownHandle`] so that a transaction
/// blocked on the wire can be aborted from another thread when it times out.
pub trait Transport {
    /// Set the timeout for subsequent reads to the given one.
    ///
    /// If `timeout` is `None`, the read timeout should be removed.
    ///
    /// See also `std::net::TcpStream::set_read_timeout`.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Set the timeout for subsequent writes. `None` removes it.
    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// A handle that can abort blocking I/O on this transport from another thread.
    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        None
    }

    /// Close the transport for good.
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Give up the transport as a plain TCP stream, for a TLS handshake after `STARTTLS`.
    fn into_tcp(self: Box<Self>) -> Option<TcpStream> {
        None
    }
}

/// Imap connection trait of a read/write stream
pub trait ImapConnection: Read + Write + Send + Transport + private::Sealed {}

impl<T> ImapConnection for T where T: Read + Write + Send + Transport {}

impl Debug for dyn ImapConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Imap connection")
    }
}

mod private {
    use super::{Read, Transport, Write};

    pub trait Sealed {}

    impl<T> Sealed for T where T: Read + Write + Transport {}
}

/// Aborts blocking reads and writes on a TCP socket from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<TcpStream>);

impl ShutdownHandle {
    /// Wrap a clone of the socket.
    pub fn new(socket: TcpStream) -> Self {
        ShutdownHandle(Arc::new(socket))
    }

    /// Shut down both directions of the socket. Any blocked I/O returns with an error.
    pub fn shutdown(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

impl Transport for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        TcpStream::set_read_timeout(self, timeout).map_err(Error::Io)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        TcpStream::set_write_timeout(self, timeout).map_err(Error::Io)
    }

    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.try_clone().ok().map(ShutdownHandle::new)
    }

    fn shutdown(&mut self) -> Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }

    fn into_tcp(self: Box<Self>) -> Option<TcpStream> {
        Some(*self)
    }
}

#[cfg(feature = "native-tls")]
impl<S: Transport + Read + Write> Transport for TlsStream<S> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.get_mut().set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.get_mut().set_write_timeout(timeout)
    }

    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.get_ref().shutdown_handle()
    }

    fn shutdown(&mut self) -> Result<()> {
        let _ = TlsStream::shutdown(self);
        self.get_mut().shutdown()
    }
}

#[cfg(feature = "rustls-tls")]
impl<S: Transport + Read + Write> Transport for RustlsStream<S> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.sock.set_write_timeout(timeout)
    }

    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.sock.shutdown_handle()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.conn.send_close_notify();
        let _ = self.flush();
        self.sock.shutdown()
    }
}

/// A boxed transport.
pub type BoxedConnection = Box<dyn ImapConnection>;

/// One connection to an IMAP server.
///
/// Owns the transport, hands out command tags and turns incoming bytes into
/// [`ServerResponse`]s. Bytes that arrived ahead of a complete response are kept across calls,
/// so a read timeout in the middle of a response loses nothing.
pub struct Connection {
    id: u64,
    stream: Option<BufStream<BoxedConnection>>,
    pending: Vec<u8>,
    outgoing: String,
    tag: u32,
    secure: bool,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("open", &self.stream.is_some())
            .field("secure", &self.secure)
            .field("tag", &self.tag)
            .finish()
    }
}

impl Connection {
    /// Wrap a transport. `secure` records whether it is already encrypted.
    pub fn new(stream: BoxedConnection, secure: bool) -> Connection {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, secure, "connection opened");
        Connection {
            id,
            stream: Some(BufStream::new(stream)),
            pending: Vec::new(),
            outgoing: String::new(),
            tag: INITIAL_TAG,
            secure,
            send_timeout: None,
            receive_timeout: None,
        }
    }

    /// The per-process identity used in trace output.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the transport is encrypted.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether [`close`](Self::close) has not been called yet.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> Result<&mut BufStream<BoxedConnection>> {
        self.stream.as_mut().ok_or(Error::ConnectionLost)
    }

    /// Apply independent send and receive timeouts to the transport.
    pub fn set_timeouts(
        &mut self,
        send: Option<Duration>,
        receive: Option<Duration>,
    ) -> Result<()> {
        self.send_timeout = send;
        self.receive_timeout = receive;
        let stream = self.stream()?.get_mut();
        stream.set_write_timeout(send)?;
        stream.set_read_timeout(receive)
    }

    /// Temporarily override the read timeout. `restore_read_timeout` undoes it.
    pub(crate) fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream()?.get_mut().set_read_timeout(timeout)
    }

    pub(crate) fn restore_read_timeout(&mut self) -> Result<()> {
        let timeout = self.receive_timeout;
        self.set_read_timeout(timeout)
    }

    /// A handle that can abort blocking I/O from another thread, if the transport offers one.
    pub fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.stream
            .as_ref()
            .and_then(|s| s.get_ref().shutdown_handle())
    }

    /// Allocate the tag for the next command: `a1`, `a2`, ...
    pub(crate) fn next_tag(&mut self) -> String {
        self.tag += 1;
        format!("{}{}", TAG_PREFIX, self.tag)
    }

    /// Write part of a command line. The line is traced once it is ended.
    pub(crate) fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.stream()?.write_all(buf)?;
        self.outgoing.push_str(&String::from_utf8_lossy(buf));
        Ok(())
    }

    /// Terminate the current command line with CRLF.
    pub(crate) fn end_line(&mut self) -> Result<()> {
        self.stream()?.write_all(&[CR, LF])?;
        trace!(connection = self.id, "C: {}", self.outgoing);
        self.outgoing.clear();
        Ok(())
    }

    /// Write the payload of a literal whose prefix has already been sent.
    pub(crate) fn send_literal(&mut self, literal: &mut Literal, length: u64) -> Result<()> {
        let id = self.id;
        let stream = self.stream()?;
        literal.write_payload(stream, length)?;
        trace!(connection = id, "C: <literal, {} octets>", length);
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.stream()?.flush()?;
        Ok(())
    }

    /// Write a complete line and flush it.
    pub(crate) fn write_line(&mut self, buf: &[u8]) -> Result<()> {
        self.send(buf)?;
        self.end_line()?;
        self.flush()
    }

    /// Read the next complete response, blocking on the transport as needed.
    pub(crate) fn read_response(&mut self) -> Result<ServerResponse> {
        loop {
            if !self.pending.is_empty() {
                if let Parsed::Response(used, response) = parse_response(&self.pending) {
                    self.trace_incoming(used);
                    self.pending.drain(..used);
                    return Ok(response);
                }
            }
            self.fill()?;
        }
    }

    fn fill(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionLost)?;
        // read_until keeps whatever it consumed before an error, so a timeout loses nothing
        let read = stream.read_until(LF, &mut self.pending)?;
        if read == 0 {
            return Err(Error::ConnectionLost);
        }
        Ok(())
    }

    fn trace_incoming(&self, used: usize) {
        let bytes = &self.pending[..used];
        match bytes.iter().position(|&b| b == LF) {
            Some(end) if end + 1 < used => trace!(
                connection = self.id,
                "S: {} <+{} octets>",
                String::from_utf8_lossy(&bytes[..end]).trim_end(),
                used - end - 1
            ),
            _ => trace!(
                connection = self.id,
                "S: {}",
                String::from_utf8_lossy(bytes).trim_end()
            ),
        }
    }

    /// Replace the transport with the result of a TLS handshake over it.
    pub(crate) fn upgrade<F>(&mut self, handshake: F) -> Result<()>
    where
        F: FnOnce(BoxedConnection) -> Result<BoxedConnection>,
    {
        if !self.pending.is_empty() {
            return Err(Error::TlsUpgrade(
                "server sent data ahead of the TLS handshake".to_string(),
            ));
        }
        let stream = self.stream.take().ok_or(Error::ConnectionLost)?;
        let inner = stream
            .into_inner()
            .map_err(|e| Error::TlsUpgrade(e.to_string()))?;
        let upgraded = match handshake(inner) {
            Ok(s) => s,
            Err(e @ Error::TlsUpgrade(_)) => return Err(e),
            Err(e) => return Err(Error::TlsUpgrade(e.to_string())),
        };
        self.stream = Some(BufStream::new(upgraded));
        self.secure = true;
        debug!(connection = self.id, "connection upgraded to TLS");
        let (send, receive) = (self.send_timeout, self.receive_timeout);
        self.set_timeouts(send, receive)
    }

    /// Close the transport. Later calls do nothing.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.flush();
            let _ = stream.get_mut().shutdown();
            debug!(connection = self.id, "connection closed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
