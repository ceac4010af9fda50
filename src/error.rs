//! IMAP error types.

use std::io::Error as IoError;
use std::result;
use std::str::Utf8Error;
use std::string::FromUtf8Error;

use thiserror::Error;

use crate::types::ResponseCode;

/// A convenience wrapper around `Result` for `imap_engine::Error`.
pub type Result<T> = result::Result<T, Error>;

/// A tagged or untagged status response that the caller asked to see as an error.
///
/// Returned inside [`Error::No`], [`Error::Bad`] and [`Error::Bye`] by
/// [`TransactionResult::into_value`](crate::TransactionResult::into_value).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Rejection {
    /// The response code, if any, carried in brackets before the text.
    pub code: Option<ResponseCode>,
    /// Human-readable text from the server.
    pub information: String,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(ref code) => write!(f, "[{}] {}", code, self.information),
            None => f.write_str(&self.information),
        }
    }
}

/// A set of errors that can occur in the IMAP client
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    #[error(transparent)]
    Io(#[from] IoError),
    /// An error from the `native_tls` library while managing the socket.
    #[cfg(feature = "native-tls")]
    #[error(transparent)]
    Tls(#[from] native_tls::Error),
    /// Negotiating TLS over an established stream failed.
    #[error("TLS upgrade failed: {0}")]
    TlsUpgrade(String),
    /// The connection was terminated unexpectedly.
    #[error("connection lost")]
    ConnectionLost,
    /// The transaction did not complete within the configured transaction timeout.
    ///
    /// The connection has been torn down.
    #[error("transaction timeout")]
    Timeout,
    /// The server refused the connection in its greeting.
    #[error("connection refused by server: {0}")]
    ConnectionRefused(Rejection),
    /// The caller asked for something the current session cannot do, such as a mailbox operation
    /// outside of the selected state or a second transaction while one is in flight.
    ///
    /// The session remains usable.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The request needs a capability the server did not advertise. Nothing was sent.
    #[error("server is incapable of {0}")]
    Incapable(String),
    /// A tagged failure carried a `[REFERRAL]` code and referrals are configured to raise.
    #[error("mailbox referral ({text}): {referrals:?}")]
    MailboxReferral {
        /// Candidate server URIs.
        referrals: Vec<String>,
        /// Text of the failed completion.
        text: String,
    },
    /// The greeting or login completion carried a `[REFERRAL]` code and referrals are configured
    /// to raise.
    #[error("login referral ({text}): {referrals:?}")]
    LoginReferral {
        /// Candidate server URIs.
        referrals: Vec<String>,
        /// Text of the completion.
        text: String,
    },
    /// A message body download found that the message no longer exists.
    #[error("no such message or expunged")]
    NoSuchMessage,
    /// A message body download failed.
    #[error("fetch failure: {0}")]
    FetchFailure(String),
    /// A mailbox handle was used after the mailbox left the directory.
    #[error("mailbox has been closed")]
    MailboxClosed,
    /// A NO response from the IMAP server.
    #[error("NO response: {0}")]
    No(Rejection),
    /// A BAD response from the IMAP server.
    #[error("BAD response: {0}")]
    Bad(Rejection),
    /// The server said BYE before completing the command.
    #[error("BYE response: {0}")]
    Bye(Rejection),
    /// Error parsing a server response.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Command inputs were not valid [IMAP
    /// strings](https://tools.ietf.org/html/rfc3501#section-4.3).
    #[error(transparent)]
    Validate(#[from] ValidateError),
}

impl Error {
    /// Whether the error left the connection in an unknown framing state.
    ///
    /// The engine closes the connection whenever a fatal error surfaces.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Io(_) | Error::TlsUpgrade(_) | Error::ConnectionLost | Error::Timeout => true,
            #[cfg(feature = "native-tls")]
            Error::Tls(_) => true,
            Error::Parse(ParseError::Invalid(_)) => true,
            _ => false,
        }
    }
}

/// An error occured while trying to parse a server response.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Indicates an error parsing the status response. Such as OK, NO, and BAD.
    #[error("Unable to parse status response")]
    Invalid(Vec<u8>),
    /// The client could not find or decode the server's authentication challenge.
    #[error("Unable to parse authentication response")]
    Authentication(String, Option<base64::DecodeError>),
    /// The client received data that was not UTF-8 encoded.
    #[error("Unable to parse data ({0:?}) as UTF-8 text")]
    DataNotUtf8(Vec<u8>, #[source] Utf8Error),
}

impl From<FromUtf8Error> for ParseError {
    fn from(err: FromUtf8Error) -> Self {
        let e = err.utf8_error();
        ParseError::DataNotUtf8(err.into_bytes(), e)
    }
}

/// An [invalid character](https://tools.ietf.org/html/rfc3501#section-4.3) was found in a command
/// argument.
#[derive(Debug, Error)]
#[error("Invalid character in input: {0:?}")]
pub struct ValidateError(pub char);
