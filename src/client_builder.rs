use std::net::TcpStream;
use std::time::Duration;

#[cfg(feature = "native-tls")]
use native_tls::TlsConnector;
#[cfg(feature = "rustls-tls")]
use rustls_connector::RustlsConnector;
use tracing::debug;

use crate::authenticator::Authenticator;
use crate::conn::BoxedConnection;
use crate::error::{Error, Result};
use crate::session::{Authority, Session, SessionOptions, State};

/// How the transport is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Upgrade with `STARTTLS` when the server advertises it, stay plaintext otherwise.
    #[default]
    Auto,
    /// TLS from the first byte, usually on port 993.
    Tls,
    /// Plaintext until `STARTTLS`, which the server must support.
    StartTls,
    /// Never encrypt.
    Plaintext,
}

/// The TLS library used for the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsKind {
    /// `native-tls`, needs the `native-tls` feature.
    Native,
    /// `rustls`, needs the `rustls-tls` feature.
    Rust,
}

impl Default for TlsKind {
    fn default() -> Self {
        if cfg!(feature = "native-tls") {
            TlsKind::Native
        } else {
            TlsKind::Rust
        }
    }
}

/// A connection profile that opens [`Session`]s.
///
/// Connecting over TLS with the default backend:
/// ```no_run
/// # use imap_engine::SessionBuilder;
/// # fn main() -> Result<(), imap_engine::Error> {
/// let session = SessionBuilder::new("imap.example.com", 993).connect()?;
/// # Ok(())
/// # }
/// ```
///
/// To use `STARTTLS` and log in right away:
/// ```no_run
/// # use imap_engine::{ConnectionMode, SessionBuilder};
/// # fn main() -> Result<(), imap_engine::Error> {
/// let session = SessionBuilder::new("imap.example.com", 143)
///     .mode(ConnectionMode::StartTls)
///     .login("me@example.com", "password")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    domain: String,
    port: u16,
    mode: Option<ConnectionMode>,
    tls: TlsKind,
    danger_skip_tls_verify: bool,
    options: SessionOptions,
}

impl SessionBuilder {
    /// Make a new `SessionBuilder` using the given domain and port.
    ///
    /// Unless [`mode`](Self::mode) says otherwise, port 993 means TLS and any other port
    /// [`ConnectionMode::Auto`].
    pub fn new(domain: impl Into<String>, port: u16) -> Self {
        SessionBuilder {
            domain: domain.into(),
            port,
            mode: None,
            tls: TlsKind::default(),
            danger_skip_tls_verify: false,
            options: SessionOptions::default(),
        }
    }

    pub fn mode(&mut self, mode: ConnectionMode) -> &mut Self {
        self.mode = Some(mode);
        self
    }

    pub fn tls_kind(&mut self, tls: TlsKind) -> &mut Self {
        self.tls = tls;
        self
    }

    /// Accept any server certificate. Only honoured by the `native-tls` backend.
    pub fn danger_skip_tls_verify(&mut self, skip: bool) -> &mut Self {
        self.danger_skip_tls_verify = skip;
        self
    }

    /// Replace every session option at once.
    pub fn options(&mut self, options: SessionOptions) -> &mut Self {
        self.options = options;
        self
    }

    pub fn transaction_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.options.transaction_timeout = timeout;
        self
    }

    pub fn send_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.options.send_timeout = timeout;
        self
    }

    pub fn receive_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.options.receive_timeout = timeout;
        self
    }

    /// Permit `LOGIN` over a connection that is not encrypted.
    pub fn allow_insecure_login(&mut self, allow: bool) -> &mut Self {
        self.options.allow_insecure_login = allow;
        self
    }

    fn effective_mode(&self) -> ConnectionMode {
        match self.mode {
            Some(mode) => mode,
            None if self.port == 993 => ConnectionMode::Tls,
            None => ConnectionMode::Auto,
        }
    }

    /// Connect, read the greeting and secure the transport as the mode asks.
    ///
    /// The returned session knows the server's capabilities, which must include `IMAP4rev1`.
    pub fn connect(&self) -> Result<Session> {
        let mode = self.effective_mode();
        let tcp = TcpStream::connect((self.domain.as_str(), self.port))?;
        let authority = Authority {
            scheme: if mode == ConnectionMode::Tls { "imaps" } else { "imap" }.to_string(),
            host: self.domain.clone(),
            port: self.port,
            ..Authority::default()
        };
        debug!(host = %self.domain, port = self.port, ?mode, "connecting");

        let mut session = match mode {
            ConnectionMode::Tls => {
                let stream = self.handshake(tcp)?;
                Session::open_boxed(stream, true, self.options.clone(), authority)?
            }
            _ => Session::open_boxed(Box::new(tcp), false, self.options.clone(), authority)?,
        };
        self.require_imap4rev1(&mut session)?;

        let upgrade = match mode {
            ConnectionMode::StartTls => {
                if !session.capabilities().has("STARTTLS") {
                    session.disconnect(false)?;
                    return Err(Error::Incapable("STARTTLS".to_string()));
                }
                true
            }
            ConnectionMode::Auto => session.capabilities().has("STARTTLS"),
            ConnectionMode::Tls | ConnectionMode::Plaintext => false,
        };
        if upgrade && session.state() == State::NotAuthenticated {
            let result = session.starttls(|plain| {
                let tcp = plain.into_tcp().ok_or_else(|| {
                    Error::TlsUpgrade("transport cannot be upgraded".to_string())
                })?;
                self.handshake(tcp)
            })?;
            if result.failed() {
                let text = result.text.clone();
                session.disconnect(false)?;
                return Err(Error::TlsUpgrade(text));
            }
            self.require_imap4rev1(&mut session)?;
        }
        Ok(session)
    }

    /// Connect and log in with a user name and password.
    pub fn login(&self, username: &str, password: &str) -> Result<Session> {
        let mut session = self.connect()?;
        if session.state() == State::NotAuthenticated {
            session.login(username, password)?.into_value()?;
        }
        Ok(session)
    }

    /// Connect and authenticate with a SASL mechanism.
    pub fn authenticate<A>(&self, mechanism: &str, authenticator: A) -> Result<Session>
    where
        A: Authenticator + Send + 'static,
    {
        let mut session = self.connect()?;
        if session.state() == State::NotAuthenticated {
            session.authenticate(mechanism, authenticator)?.into_value()?;
        }
        Ok(session)
    }

    /// Ask for capabilities if the greeting did not list them, then insist on `IMAP4rev1`.
    fn require_imap4rev1(&self, session: &mut Session) -> Result<()> {
        if session.capabilities().len() <= 1 {
            session.capability()?;
        }
        if !session.capabilities().has("IMAP4rev1") {
            session.disconnect(false)?;
            return Err(Error::Incapable("IMAP4rev1".to_string()));
        }
        Ok(())
    }

    fn handshake(&self, tcp: TcpStream) -> Result<BoxedConnection> {
        match self.tls {
            TlsKind::Native => self.native_handshake(tcp),
            TlsKind::Rust => self.rustls_handshake(tcp),
        }
    }

    #[cfg(feature = "native-tls")]
    fn native_handshake(&self, tcp: TcpStream) -> Result<BoxedConnection> {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(self.danger_skip_tls_verify)
            .build()?;
        let tls = connector
            .connect(&self.domain, tcp)
            .map_err(|e| Error::TlsUpgrade(e.to_string()))?;
        Ok(Box::new(tls))
    }

    #[cfg(not(feature = "native-tls"))]
    fn native_handshake(&self, _tcp: TcpStream) -> Result<BoxedConnection> {
        Err(Error::TlsUpgrade(
            "built without the native-tls feature".to_string(),
        ))
    }

    #[cfg(feature = "rustls-tls")]
    fn rustls_handshake(&self, tcp: TcpStream) -> Result<BoxedConnection> {
        if self.danger_skip_tls_verify {
            return Err(Error::TlsUpgrade(
                "certificate checks cannot be skipped with rustls".to_string(),
            ));
        }
        let connector = RustlsConnector::new_with_native_certs()
            .map_err(|e| Error::TlsUpgrade(e.to_string()))?;
        match connector.connect(&self.domain, tcp) {
            Ok(tls) => Ok(Box::new(tls)),
            Err(rustls_connector::HandshakeError::Failure(e)) => {
                Err(Error::TlsUpgrade(e.to_string()))
            }
            Err(_) => Err(Error::TlsUpgrade(
                "TLS handshake did not complete".to_string(),
            )),
        }
    }

    #[cfg(not(feature = "rustls-tls"))]
    fn rustls_handshake(&self, _tcp: TcpStream) -> Result<BoxedConnection> {
        Err(Error::TlsUpgrade(
            "built without the rustls-tls feature".to_string(),
        ))
    }
}
