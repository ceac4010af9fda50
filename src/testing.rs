//! Enable the test_helpers feature to expose helper methods to build
//! mock response structures for testing your code that uses the imap_engine crate
//!
//! To use add a dev-dependency on the crate adding the feature "test_helpers"
//! e.g.
//!
//! ```toml
//! [dependencies]
//! imap-engine = { version = "0.1" }
//!
//! [dev-dependencies]
//! # mirror the same configuration your dependencies and add test_helpers
//! imap-engine = { version = "0.1", features = ["test_helpers"] }
//! ```
//!
use crate::parse::{parse_response, Parsed};
use crate::types::ServerResponse;

/// Parse every complete response in `input`, in order. A trailing partial response is dropped.
pub fn parse_responses(input: impl Into<Vec<u8>>) -> Vec<ServerResponse> {
    let input = input.into();
    let mut rest = &input[..];
    let mut responses = Vec::new();
    while !rest.is_empty() {
        match parse_response(rest) {
            Parsed::Response(used, response) => {
                responses.push(response);
                rest = &rest[used..];
            }
            Parsed::Incomplete => break,
        }
    }
    responses
}

/// Methods to build a [`Capabilities`](crate::Capabilities) response object
pub mod capabilities {
    use crate::types::{Capabilities, ResponseCode, ServerResponse};

    /// Builds an [`Capabilities`] based on the provided input
    ///
    /// Example input.
    ///
    /// ```
    /// let input = "* CAPABILITY IMAP4rev1 STARTTLS AUTH=GSSAPI LOGINDISABLED\r\n";
    /// let response = imap_engine::testing::capabilities::parse(input);
    /// assert!(response.has("LOGINDISABLED"));
    /// ```
    pub fn parse(input: impl Into<Vec<u8>>) -> Capabilities {
        super::parse_responses(input)
            .into_iter()
            .filter_map(|r| match r {
                ServerResponse::Capabilities(tokens) => Some(tokens),
                ServerResponse::Untagged {
                    code: Some(ResponseCode::Capabilities(tokens)),
                    ..
                } => Some(tokens),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// Methods to build [`Fetch`](crate::Fetch) response objects
pub mod fetches {
    use crate::types::{Fetch, ServerResponse};

    /// Builds a list of [`Fetch`] based on the provided input
    ///
    /// Example input.
    ///
    /// ```
    /// let input = "\
    /// * 24 FETCH (FLAGS (\\Seen) UID 4827943)\r\n\
    /// * 25 FETCH (FLAGS (\\Seen))\r\n\
    /// ";
    /// let response = imap_engine::testing::fetches::parse(input);
    /// assert_eq!(response[0].uid, Some(4827943));
    /// ```
    pub fn parse(input: impl Into<Vec<u8>>) -> Vec<Fetch> {
        super::parse_responses(input)
            .into_iter()
            .filter_map(|r| match r {
                ServerResponse::Fetch(fetch) => Some(fetch),
                _ => None,
            })
            .collect()
    }
}

/// Methods to build [`Name`](crate::Name) response objects
pub mod names {
    use crate::types::{Name, ServerResponse};

    /// Builds a list of [`Name`] based on the provided input
    ///
    /// Example input.
    ///
    /// ```
    /// let input = "\
    /// * LIST (\\HasNoChildren) \".\" \"INBOX\"\r\n\
    /// ";
    /// let response = imap_engine::testing::names::parse(input);
    /// assert_eq!(response[0].name(), "INBOX");
    /// ```
    pub fn parse(input: impl Into<Vec<u8>>) -> Vec<Name> {
        super::parse_responses(input)
            .into_iter()
            .filter_map(|r| match r {
                ServerResponse::List(name) => Some(name),
                _ => None,
            })
            .collect()
    }
}
