//! One request/response exchange with the server.
//!
//! A [`Transaction`] names its command, carries its [`RequestArguments`] and turns the responses
//! it received into a typed value. [`Command`] covers every verb whose result can be computed
//! by a plain function of the responses; transactions that need to answer continuation requests
//! (`AUTHENTICATE`) implement the trait themselves.

use std::borrow::Cow;
use std::fmt;

use tracing::warn;

use crate::conn::Connection;
use crate::error::{Error, Rejection, Result};
use crate::literal::Literal;
use crate::types::{Completion, ResponseCode, ServerResponse, Status};
use crate::utils::{quote, validate_str};

/// A single request argument.
#[derive(Debug)]
pub enum Argument {
    /// Sent verbatim, e.g. a sequence set or a fetch item list.
    Atom(String),
    /// Sent as a quoted string. Must not contain CR or LF.
    Quoted(String),
    /// Sent as a literal.
    Literal(Literal),
    /// A parenthesized list.
    List(Vec<Argument>),
    /// `NIL`
    Nil,
}

impl Argument {
    /// An atom argument.
    pub fn atom(value: impl fmt::Display) -> Self {
        Argument::Atom(value.to_string())
    }

    /// A quoted-string argument.
    pub fn quoted(value: impl Into<String>) -> Self {
        Argument::Quoted(value.into())
    }

    /// A literal argument.
    pub fn literal(literal: impl Into<Literal>) -> Self {
        Argument::Literal(literal.into())
    }

    fn validate(&self) -> Result<()> {
        match self {
            Argument::Quoted(s) => validate_str(s).map(|_| ()),
            Argument::List(items) => items.iter().try_for_each(Argument::validate),
            _ => Ok(()),
        }
    }

    fn for_each_literal_mut<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&mut Literal) -> Result<()>,
    {
        match self {
            Argument::Literal(l) => f(l),
            Argument::List(items) => items.iter_mut().try_for_each(|a| a.for_each_literal_mut(f)),
            _ => Ok(()),
        }
    }
}

/// The ordered, named arguments of a request.
#[derive(Debug, Default)]
pub struct RequestArguments(Vec<(String, Argument)>);

impl RequestArguments {
    /// No arguments.
    pub fn new() -> Self {
        RequestArguments(Vec::new())
    }

    /// Append an argument.
    pub fn push(&mut self, name: impl Into<String>, argument: Argument) {
        self.0.push((name.into(), argument));
    }

    /// Look up an argument by name.
    pub fn get(&self, name: &str) -> Option<&Argument> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    /// Arguments in the order they are sent.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Argument)> {
        self.0.iter().map(|(n, a)| (n.as_str(), a))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reject quoted strings that cannot go on the wire.
    pub(crate) fn validate(&self) -> Result<()> {
        self.0.iter().try_for_each(|(_, a)| a.validate())
    }

    /// Visit every literal, including those nested in lists.
    pub(crate) fn for_each_literal_mut<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Literal) -> Result<()>,
    {
        self.0
            .iter_mut()
            .try_for_each(|(_, a)| a.for_each_literal_mut(&mut f))
    }
}

/// A request/response exchange.
pub trait Transaction: Send {
    /// The value built from a successful exchange.
    type Output: Send + 'static;

    /// The command verb, e.g. `SELECT` or `UID FETCH`.
    fn command(&self) -> &str;

    fn arguments(&self) -> &RequestArguments;

    fn arguments_mut(&mut self) -> &mut RequestArguments;

    /// Capabilities the server must advertise for this command.
    ///
    /// Checked before sending when strict capability checking is enabled.
    fn required_capabilities(&self) -> &[&'static str] {
        &[]
    }

    /// Answer a continuation request that is not part of literal handling.
    ///
    /// `Ok(Some(line))` sends `line`; `Ok(None)` ignores the request. An error cancels the
    /// exchange with `*` and is returned once the server has completed it.
    fn on_continuation(&mut self, _text: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Build the value of a successful exchange.
    fn build_result(&mut self, responses: &[ServerResponse], completion: &Completion)
        -> Self::Output;
}

/// A transaction whose value is a plain function of the responses.
pub struct Command<O> {
    verb: Cow<'static, str>,
    arguments: RequestArguments,
    required: Vec<&'static str>,
    build: fn(&[ServerResponse], &Completion) -> O,
}

impl<O> fmt::Debug for Command<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("verb", &self.verb)
            .field("arguments", &self.arguments)
            .field("required", &self.required)
            .finish()
    }
}

impl<O: Send + 'static> Command<O> {
    /// A command whose value is computed by `build`.
    pub fn new(
        verb: impl Into<Cow<'static, str>>,
        build: fn(&[ServerResponse], &Completion) -> O,
    ) -> Self {
        Command {
            verb: verb.into(),
            arguments: RequestArguments::new(),
            required: Vec::new(),
            build,
        }
    }

    /// Append a named argument.
    pub fn arg(mut self, name: &str, argument: Argument) -> Self {
        self.arguments.push(name, argument);
        self
    }

    /// Declare a capability this command needs.
    pub fn require(mut self, capability: &'static str) -> Self {
        self.required.push(capability);
        self
    }
}

impl Command<()> {
    /// A command without a value.
    pub fn simple(verb: impl Into<Cow<'static, str>>) -> Self {
        Command::new(verb, |_, _| ())
    }
}

impl<O: Send + 'static> Transaction for Command<O> {
    type Output = O;

    fn command(&self) -> &str {
        &self.verb
    }

    fn arguments(&self) -> &RequestArguments {
        &self.arguments
    }

    fn arguments_mut(&mut self) -> &mut RequestArguments {
        &mut self.arguments
    }

    fn required_capabilities(&self) -> &[&'static str] {
        &self.required
    }

    fn build_result(&mut self, responses: &[ServerResponse], completion: &Completion) -> O {
        (self.build)(responses, completion)
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Tagged `OK`.
    Ok,
    /// Tagged `NO`.
    No,
    /// Tagged `BAD`.
    Bad,
    /// The server said `BYE` and closed the connection.
    Bye,
    /// The greeting was `PREAUTH`.
    PreAuth,
    /// Nothing needed to be sent, e.g. selecting the mailbox that is already selected.
    RequestDone,
}

/// The outcome of a transaction that reached the server, or did not need to.
///
/// Tagged `NO` and `BAD` are not errors here: they are ordinary results the caller can
/// inspect. [`into_value`](Self::into_value) converts them into errors when that is more
/// convenient.
#[derive(Debug)]
pub struct TransactionResult<T> {
    /// How the transaction ended.
    pub code: ResultCode,
    /// Text of the completion.
    pub text: String,
    /// Response code of the completion.
    pub response_code: Option<ResponseCode>,
    /// Every response received before the completion, in arrival order.
    pub responses: Vec<ServerResponse>,
    value: Option<T>,
}

impl<T> TransactionResult<T> {
    pub(crate) fn new(
        completion: Completion,
        responses: Vec<ServerResponse>,
        value: Option<T>,
    ) -> Self {
        let code = match completion.status {
            Status::Ok => ResultCode::Ok,
            Status::No => ResultCode::No,
            Status::Bad => ResultCode::Bad,
            Status::Bye => ResultCode::Bye,
            Status::PreAuth => ResultCode::PreAuth,
        };
        TransactionResult {
            code,
            text: completion.text,
            response_code: completion.code,
            responses,
            value,
        }
    }

    /// A result for a request that was satisfied without touching the wire.
    pub(crate) fn request_done(text: &str, value: T) -> Self {
        TransactionResult {
            code: ResultCode::RequestDone,
            text: text.to_string(),
            response_code: None,
            responses: Vec::new(),
            value: Some(value),
        }
    }

    /// Whether the server accepted the request.
    pub fn succeeded(&self) -> bool {
        matches!(
            self.code,
            ResultCode::Ok | ResultCode::PreAuth | ResultCode::RequestDone
        )
    }

    pub fn failed(&self) -> bool {
        !self.succeeded()
    }

    /// The value, present when the transaction succeeded.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Whether the completion carried `code`.
    pub fn has_code(&self, code: &ResponseCode) -> bool {
        self.response_code.as_ref() == Some(code)
    }

    /// The value, or the failure as an [`Error`].
    pub fn into_value(self) -> Result<T> {
        let rejection = Rejection {
            code: self.response_code,
            information: self.text,
        };
        match (self.code, self.value) {
            (ResultCode::Bad, _) => Err(Error::Bad(rejection)),
            (ResultCode::Bye, _) => Err(Error::Bye(rejection)),
            (_, Some(v)) => Ok(v),
            (_, None) => Err(Error::No(rejection)),
        }
    }

    /// Transform the value, keeping the rest of the result.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> TransactionResult<U> {
        TransactionResult {
            code: self.code,
            text: self.text,
            response_code: self.response_code,
            responses: self.responses,
            value: self.value.map(f),
        }
    }

    /// Replace the value of a successful result.
    pub(crate) fn with_value<U>(self, value: U) -> TransactionResult<U> {
        let value = self.value.as_ref().map(|_| value);
        TransactionResult {
            code: self.code,
            text: self.text,
            response_code: self.response_code,
            responses: self.responses,
            value,
        }
    }
}

/// What came back for one command.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) completion: Completion,
    pub(crate) responses: Vec<ServerResponse>,
    /// An error raised while answering a continuation.
    pub(crate) failure: Option<Error>,
}

enum Segment<'a> {
    Text(String),
    Literal(&'a mut Literal),
}

fn flatten<'a>(
    arguments: impl Iterator<Item = &'a mut Argument>,
    text: &mut String,
    out: &mut Vec<Segment<'a>>,
) {
    let mut first = true;
    for argument in arguments {
        if !first {
            text.push(' ');
        }
        first = false;
        match argument {
            Argument::Atom(a) => text.push_str(a),
            Argument::Quoted(q) => text.push_str(&quote(q)),
            Argument::Nil => text.push_str("NIL"),
            Argument::List(items) => {
                text.push('(');
                flatten(items.iter_mut(), text, out);
                text.push(')');
            }
            Argument::Literal(l) => {
                out.push(Segment::Text(std::mem::take(text)));
                out.push(Segment::Literal(l));
            }
        }
    }
}

/// Wait for the `+` that lets a synchronizing literal through.
///
/// Returns the completion instead if the server refused the command early.
fn await_continuation(
    conn: &mut Connection,
    tag: &str,
    responses: &mut Vec<ServerResponse>,
) -> Result<Option<Completion>> {
    loop {
        match conn.read_response()? {
            ServerResponse::Continue { .. } => return Ok(None),
            ServerResponse::Tagged(c) if c.tag == tag => return Ok(Some(c)),
            other => responses.push(other),
        }
    }
}

/// Run `tx` on `conn`: send the command, then read until its tagged completion.
pub(crate) fn exchange<T: Transaction + ?Sized>(
    conn: &mut Connection,
    tx: &mut T,
) -> Result<Exchange> {
    let tag = conn.next_tag();
    let mut responses = Vec::new();

    {
        let mut text = format!("{} {}", tag, tx.command());
        let arguments = tx.arguments_mut();
        if !arguments.is_empty() {
            text.push(' ');
        }
        let mut segments = Vec::new();
        flatten(arguments.0.iter_mut().map(|(_, a)| a), &mut text, &mut segments);
        segments.push(Segment::Text(text));

        // settle every literal before the first byte goes out
        let mut resolved = Vec::new();
        for segment in segments.iter_mut() {
            if let Segment::Literal(l) = segment {
                resolved.push(l.open()?);
            }
        }

        let mut resolved = resolved.into_iter();
        for segment in segments {
            match segment {
                Segment::Text(t) => conn.send(t.as_bytes())?,
                Segment::Literal(l) => {
                    let r = match resolved.next() {
                        Some(r) => r,
                        None => break,
                    };
                    conn.send(r.prefix().as_bytes())?;
                    conn.end_line()?;
                    if r.synchronizing {
                        conn.flush()?;
                        if let Some(completion) =
                            await_continuation(conn, &tag, &mut responses)?
                        {
                            return Ok(Exchange {
                                completion,
                                responses,
                                failure: None,
                            });
                        }
                    }
                    conn.send_literal(l, r.length)?;
                }
            }
        }
        conn.end_line()?;
        conn.flush()?;
    }

    let mut failure = None;
    let mut bye: Option<(Option<ResponseCode>, String)> = None;
    loop {
        let response = match conn.read_response() {
            Ok(r) => r,
            Err(Error::ConnectionLost) if bye.is_some() => {
                let (code, text) = bye.take().unwrap_or_default();
                return Ok(Exchange {
                    completion: Completion {
                        tag,
                        status: Status::Bye,
                        code,
                        text,
                    },
                    responses,
                    failure,
                });
            }
            Err(e) => return Err(e),
        };
        match response {
            ServerResponse::Tagged(completion) if completion.tag == tag => {
                return Ok(Exchange {
                    completion,
                    responses,
                    failure,
                });
            }
            ServerResponse::Continue { text, .. } => match tx.on_continuation(&text) {
                Ok(Some(line)) => conn.write_line(&line)?,
                Ok(None) => warn!(
                    connection = conn.id(),
                    "unexpected continuation request: {}", text
                ),
                Err(e) => {
                    conn.write_line(b"*")?;
                    failure.get_or_insert(e);
                }
            },
            ServerResponse::Tagged(ref stray) => {
                warn!(
                    connection = conn.id(),
                    "completion for unknown tag {}", stray.tag
                );
                responses.push(response);
            }
            other => {
                if let ServerResponse::Untagged {
                    status: Status::Bye,
                    ref code,
                    ref text,
                } = other
                {
                    bye = Some((code.clone(), text.clone()));
                }
                responses.push(other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literal::{Negotiated, SyncMode};
    use crate::mock_stream::MockStream;
    use crate::types::Capabilities;

    fn connection(response: &[u8]) -> (Connection, crate::mock_stream::MockProbe) {
        let stream = MockStream::new(response.to_vec());
        let probe = stream.probe();
        (Connection::new(Box::new(stream), false), probe)
    }

    fn written(probe: &crate::mock_stream::MockProbe) -> String {
        String::from_utf8(probe.written()).unwrap()
    }

    #[test]
    fn serializes_arguments() {
        let (mut conn, probe) = connection(b"a1 OK done\r\n");
        let mut cmd = Command::simple("STORE")
            .arg("set", Argument::atom("1:3"))
            .arg("item", Argument::atom("+FLAGS"))
            .arg(
                "flags",
                Argument::List(vec![Argument::atom("\\Seen"), Argument::atom("\\Deleted")]),
            )
            .arg("name", Argument::quoted("a \"b\""));
        let ex = exchange(&mut conn, &mut cmd).unwrap();
        assert_eq!(ex.completion.status, Status::Ok);
        assert_eq!(
            written(&probe),
            "a1 STORE 1:3 +FLAGS (\\Seen \\Deleted) \"a \\\"b\\\"\"\r\n"
        );
    }

    #[test]
    fn synchronizing_literal_waits_for_continuation() {
        let (mut conn, probe) = connection(b"+ Ready\r\na1 OK APPEND completed\r\n");
        let mut cmd = Command::simple("APPEND")
            .arg("mailbox", Argument::quoted("INBOX"))
            .arg("message", Argument::literal(&b"hello"[..]));
        let ex = exchange(&mut conn, &mut cmd).unwrap();
        assert_eq!(ex.completion.status, Status::Ok);
        assert_eq!(written(&probe), "a1 APPEND \"INBOX\" {5}\r\nhello\r\n");
    }

    #[test]
    fn refused_literal_stops_sending() {
        let (mut conn, probe) = connection(b"a1 NO [TRYCREATE] no such mailbox\r\n");
        let mut cmd = Command::simple("APPEND")
            .arg("mailbox", Argument::quoted("Nope"))
            .arg("message", Argument::literal(&b"hello"[..]));
        let ex = exchange(&mut conn, &mut cmd).unwrap();
        assert_eq!(ex.completion.status, Status::No);
        assert_eq!(ex.completion.code, Some(ResponseCode::TryCreate));
        assert_eq!(written(&probe), "a1 APPEND \"Nope\" {5}\r\n");
    }

    #[test]
    fn non_synchronizing_literal_inside_list() {
        let (mut conn, probe) = connection(b"a1 OK done\r\n");
        let caps: Capabilities = ["IMAP4rev1", "LITERAL+"].into_iter().collect();
        let mut cmd = Command::simple("X").arg(
            "list",
            Argument::List(vec![
                Argument::atom("A"),
                Argument::Literal(Literal::new(&b"xy"[..]).sync_mode(SyncMode::NonSynchronizingIfCapable)),
                Argument::atom("B"),
            ]),
        );
        cmd.arguments_mut()
            .for_each_literal_mut(|l| l.negotiate(Negotiated::new(&caps, false)))
            .unwrap();
        exchange(&mut conn, &mut cmd).unwrap();
        assert_eq!(written(&probe), "a1 X (A {2+}\r\nxy B)\r\n");
    }

    #[test]
    fn collects_untagged_and_ignores_other_tags() {
        let (mut conn, _) = connection(
            b"* 3 EXISTS\r\n\
              a0 OK stray\r\n\
              * 1 EXPUNGE\r\n\
              a1 OK NOOP completed\r\n",
        );
        let ex = exchange(&mut conn, &mut Command::simple("NOOP")).unwrap();
        assert_eq!(ex.responses.len(), 3);
        assert_eq!(ex.responses[0], ServerResponse::Exists(3));
        assert_eq!(ex.responses[2], ServerResponse::Expunge(1));
    }

    #[test]
    fn bye_then_eof_completes() {
        let (mut conn, _) = connection(b"* BYE shutting down\r\n");
        let ex = exchange(&mut conn, &mut Command::simple("NOOP")).unwrap();
        assert_eq!(ex.completion.status, Status::Bye);
        assert_eq!(ex.completion.text, "shutting down");
    }

    #[test]
    fn eof_without_bye_is_lost() {
        let (mut conn, _) = connection(b"* 3 EXISTS\r\n");
        assert!(matches!(
            exchange(&mut conn, &mut Command::simple("NOOP")),
            Err(Error::ConnectionLost)
        ));
    }

    #[test]
    fn quoted_validation() {
        let mut args = RequestArguments::new();
        args.push("ok", Argument::quoted("fine"));
        assert!(args.validate().is_ok());
        args.push(
            "nested",
            Argument::List(vec![Argument::quoted("bad\r\nline")]),
        );
        assert!(matches!(args.validate(), Err(Error::Validate(_))));
    }

    #[test]
    fn into_value_maps_failures() {
        let completion = Completion {
            tag: "a1".into(),
            status: Status::No,
            code: Some(ResponseCode::TryCreate),
            text: "no mailbox".into(),
        };
        let result: TransactionResult<()> = TransactionResult::new(completion, vec![], None);
        assert!(result.failed());
        assert!(result.has_code(&ResponseCode::TryCreate));
        match result.into_value() {
            Err(Error::No(r)) => assert_eq!(r.information, "no mailbox"),
            other => panic!("unexpected {:?}", other),
        }
        let done = TransactionResult::request_done("already selected", 7);
        assert!(done.succeeded());
        assert_eq!(done.into_value().unwrap(), 7);
    }
}
