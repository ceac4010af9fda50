//! This module contains types used throughout the IMAP protocol.

/// From section [2.3.1.1 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-2.3.1.1).
///
/// A 32-bit value assigned to each message, which when used with the unique identifier validity
/// value forms a 64-bit value that will not refer to any other message in the mailbox or any
/// subsequent mailbox with the same name forever.  Unique identifiers are assigned in a strictly
/// ascending fashion in the mailbox; as each message is added to the mailbox it is assigned a
/// higher UID than the message(s) which were added previously.  Unlike message sequence numbers,
/// unique identifiers are not necessarily contiguous.
///
/// The unique identifier validity value is sent in a `UIDVALIDITY` response code in an `OK`
/// untagged response at mailbox selection time. If it changes, any UID cached from an earlier
/// session is meaningless.
pub type Uid = u32;

/// From section [2.3.1.2 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-2.3.1.2).
///
/// A relative position from 1 to the number of messages in the mailbox.
/// This position is ordered by ascending unique identifier.  As
/// each new message is added, it is assigned a message sequence number
/// that is 1 higher than the number of messages in the mailbox before
/// that new message was added.
///
/// Message sequence numbers can be reassigned during the session.  For
/// example, when a message is permanently removed (expunged) from the
/// mailbox, the message sequence number for all subsequent messages is
/// decremented.
pub type Seq = u32;

mod flag;
pub use self::flag::Flag;

mod fetch;
pub use self::fetch::{BodySection, Fetch};

mod name;
pub use self::name::{Name, NameAttribute};

mod capabilities;
pub use self::capabilities::Capabilities;

mod appended;
pub use self::appended::{Appended, Copied};

mod response;
pub use self::response::{Completion, ResponseCode, ServerResponse, Status, StatusItem};

/// re-exported from imap_proto;
pub use imap_proto::UidSetMember;
