//! Conversion of `imap_proto` responses into the owned [`ServerResponse`] model.

use std::borrow::Cow;

use base64::Engine as _;
use imap_proto::types::{
    AttributeValue, Capability, MailboxDatum, MessageSection, Response,
    ResponseCode as ProtoCode, SectionPath, Status as ProtoStatus, StatusAttribute,
};
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, ParseError, Result};
use crate::extensions::metadata::Metadata;
use crate::types::*;

lazy_static! {
    // Bracketed codes imap-proto leaves in the text, e.g. `[REFERRAL imap://...]`.
    static ref BRACKETED_CODE: Regex =
        Regex::new(r"^\[([A-Za-z0-9.\-]+)(?: ([^\]]*))?\]\s?(.*)$").unwrap();
}

/// Outcome of trying to parse one response off the front of the receive buffer.
#[derive(Debug)]
pub(crate) enum Parsed {
    /// A complete response that used the first `usize` bytes.
    Response(usize, ServerResponse),
    /// More bytes are needed, either for the line or for a literal it announced.
    Incomplete,
}

/// Parse a single response from the start of `buf`.
///
/// A complete line that `imap_proto` cannot make sense of is surfaced as
/// [`ServerResponse::Other`] so that one odd server line does not kill the connection.
pub(crate) fn parse_response(buf: &[u8]) -> Parsed {
    match imap_proto::parser::parse_response(buf) {
        Ok((rest, resp)) => {
            let used = buf.len() - rest.len();
            let resp = convert(resp).unwrap_or_else(|| raw_line(&buf[..used]));
            Parsed::Response(used, resp)
        }
        Err(nom::Err::Incomplete(_)) => Parsed::Incomplete,
        Err(_) => match buf.iter().position(|&b| b == b'\n') {
            Some(i) => Parsed::Response(i + 1, raw_line(&buf[..=i])),
            None => Parsed::Incomplete,
        },
    }
}

fn raw_line(line: &[u8]) -> ServerResponse {
    ServerResponse::Other(
        String::from_utf8_lossy(line)
            .trim_end_matches(['\r', '\n'])
            .to_string(),
    )
}

/// Decode the base64 challenge of an `AUTHENTICATE` continuation.
pub(crate) fn parse_authenticate_response(text: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|e| Error::Parse(ParseError::Authentication(text.to_string(), Some(e))))
}

fn convert(resp: Response<'_>) -> Option<ServerResponse> {
    Some(match resp {
        Response::Done {
            tag,
            status,
            code,
            information,
        } => {
            let (code, text) = split_code(code, information);
            ServerResponse::Tagged(Completion {
                tag: String::from_utf8_lossy(tag.as_bytes()).into_owned(),
                status: convert_status(status),
                code,
                text,
            })
        }
        Response::Data {
            status,
            code,
            information,
        } => {
            let (code, text) = split_code(code, information);
            ServerResponse::Untagged {
                status: convert_status(status),
                code,
                text,
            }
        }
        Response::Continue { code, information } => {
            let (code, text) = split_code(code, information);
            ServerResponse::Continue { code, text }
        }
        Response::Capabilities(caps) => {
            ServerResponse::Capabilities(caps.into_iter().map(capability).collect())
        }
        Response::Expunge(n) => ServerResponse::Expunge(n),
        Response::Vanished { earlier, uids } => ServerResponse::Vanished { earlier, uids },
        Response::Fetch(message, attrs) => ServerResponse::Fetch(convert_fetch(message, attrs)),
        Response::MailboxData(datum) => convert_mailbox_data(datum)?,
        _ => return None,
    })
}

fn convert_status(status: ProtoStatus) -> Status {
    match status {
        ProtoStatus::Ok => Status::Ok,
        ProtoStatus::No => Status::No,
        ProtoStatus::Bad => Status::Bad,
        ProtoStatus::PreAuth => Status::PreAuth,
        ProtoStatus::Bye => Status::Bye,
        #[allow(unreachable_patterns)]
        _ => Status::Bad,
    }
}

fn capability(cap: Capability<'_>) -> String {
    match cap {
        Capability::Imap4rev1 => "IMAP4rev1".to_string(),
        Capability::Auth(mech) => format!("AUTH={}", mech),
        Capability::Atom(atom) => atom.into_owned(),
        #[allow(unreachable_patterns)]
        _ => String::new(),
    }
}

fn convert_mailbox_data(datum: MailboxDatum<'_>) -> Option<ServerResponse> {
    Some(match datum {
        MailboxDatum::Exists(n) => ServerResponse::Exists(n),
        MailboxDatum::Recent(n) => ServerResponse::Recent(n),
        MailboxDatum::Flags(flags) => ServerResponse::Flags(Flag::from_strs(flags)),
        MailboxDatum::List {
            name_attributes,
            delimiter,
            name,
        } => ServerResponse::List(Name {
            attributes: name_attributes.into_iter().map(NameAttribute::from).collect(),
            delimiter: delimiter.map(Cow::into_owned),
            name: name.into_owned(),
        }),
        MailboxDatum::Status { mailbox, status } => ServerResponse::Status {
            mailbox: mailbox.into_owned(),
            items: status.into_iter().filter_map(status_item).collect(),
        },
        MailboxDatum::Search(ids) => ServerResponse::Search(ids),
        MailboxDatum::Sort(ids) => ServerResponse::Sort(ids),
        MailboxDatum::MetadataSolicited { mailbox, values } => ServerResponse::Metadata {
            mailbox: mailbox.into_owned(),
            entries: values
                .into_iter()
                .map(|m| Metadata {
                    entry: m.entry,
                    value: m.value,
                })
                .collect(),
        },
        MailboxDatum::MetadataUnsolicited { mailbox, values } => ServerResponse::Metadata {
            mailbox: mailbox.into_owned(),
            entries: values
                .into_iter()
                .map(|entry| Metadata {
                    entry: entry.into_owned(),
                    value: None,
                })
                .collect(),
        },
        _ => return None,
    })
}

fn status_item(attr: StatusAttribute) -> Option<StatusItem> {
    Some(match attr {
        StatusAttribute::Messages(n) => StatusItem::Messages(n),
        StatusAttribute::Recent(n) => StatusItem::Recent(n),
        StatusAttribute::UidNext(n) => StatusItem::UidNext(n),
        StatusAttribute::UidValidity(n) => StatusItem::UidValidity(n),
        StatusAttribute::Unseen(n) => StatusItem::Unseen(n),
        StatusAttribute::HighestModSeq(n) => StatusItem::HighestModSeq(n),
        _ => return None,
    })
}

fn convert_fetch(message: u32, attrs: Vec<AttributeValue<'_>>) -> Fetch {
    let mut fetch = Fetch {
        message,
        ..Default::default()
    };
    for attr in attrs {
        match attr {
            AttributeValue::Uid(uid) => fetch.uid = Some(uid),
            AttributeValue::Rfc822Size(size) => fetch.size = Some(size),
            AttributeValue::ModSeq(modseq) => fetch.modseq = Some(modseq),
            AttributeValue::Flags(flags) => fetch.flags = Flag::from_strs(flags),
            AttributeValue::InternalDate(date) => fetch.internal_date = Some(date.into_owned()),
            AttributeValue::Rfc822(data) => fetch.rfc822 = data.map(Cow::into_owned),
            AttributeValue::Rfc822Header(data) => fetch.rfc822_header = data.map(Cow::into_owned),
            AttributeValue::Rfc822Text(data) => fetch.rfc822_text = data.map(Cow::into_owned),
            AttributeValue::BodySection {
                section,
                index,
                data,
            } => {
                let data = data.map(Cow::into_owned);
                if let Some(SectionPath::Full(MessageSection::Header)) = section {
                    fetch.rfc822_header = data.clone();
                }
                fetch.sections.push(BodySection {
                    origin: index,
                    data,
                });
            }
            _ => {}
        }
    }
    fetch
}

fn convert_code(code: ProtoCode<'_>) -> Option<ResponseCode> {
    Some(match code {
        ProtoCode::Alert => ResponseCode::Alert,
        ProtoCode::Capabilities(caps) => {
            ResponseCode::Capabilities(caps.into_iter().map(capability).collect())
        }
        ProtoCode::HighestModSeq(n) => ResponseCode::HighestModSeq(n),
        ProtoCode::PermanentFlags(flags) => ResponseCode::PermanentFlags(Flag::from_strs(flags)),
        ProtoCode::ReadOnly => ResponseCode::ReadOnly,
        ProtoCode::ReadWrite => ResponseCode::ReadWrite,
        ProtoCode::TryCreate => ResponseCode::TryCreate,
        ProtoCode::UidNext(n) => ResponseCode::UidNext(n),
        ProtoCode::UidValidity(n) => ResponseCode::UidValidity(n),
        ProtoCode::Unseen(n) => ResponseCode::Unseen(n),
        ProtoCode::AppendUid(validity, uids) => ResponseCode::AppendUid(validity, uids),
        ProtoCode::CopyUid(validity, source, destination) => {
            ResponseCode::CopyUid(validity, source, destination)
        }
        ProtoCode::UidNotSticky => ResponseCode::UidNotSticky,
        ProtoCode::MetadataLongEntries(n) => ResponseCode::MetadataLongEntries(n),
        ProtoCode::MetadataMaxSize(n) => ResponseCode::MetadataMaxSize(n),
        ProtoCode::MetadataTooMany => ResponseCode::MetadataTooMany,
        ProtoCode::MetadataNoPrivate => ResponseCode::MetadataNoPrivate,
        _ => return None,
    })
}

/// Pair the parsed response code with the text, recovering codes `imap_proto` left in the text.
fn split_code(
    code: Option<ProtoCode<'_>>,
    information: Option<Cow<'_, str>>,
) -> (Option<ResponseCode>, String) {
    let text = information.map(Cow::into_owned).unwrap_or_default();
    if let Some(code) = code {
        return (convert_code(code), text);
    }
    match BRACKETED_CODE.captures(&text) {
        Some(caps) => {
            let name = caps[1].to_ascii_uppercase();
            let arg = caps.get(2).map(|m| m.as_str().to_string());
            let code = match name.as_str() {
                "REFERRAL" => ResponseCode::Referral(
                    arg.unwrap_or_default()
                        .split_whitespace()
                        .map(String::from)
                        .collect(),
                ),
                "ALERT" => ResponseCode::Alert,
                "TRYCREATE" => ResponseCode::TryCreate,
                "READ-ONLY" => ResponseCode::ReadOnly,
                "READ-WRITE" => ResponseCode::ReadWrite,
                _ => ResponseCode::Other(name, arg),
            };
            (Some(code), caps[3].to_string())
        }
        None => (None, text),
    }
}
