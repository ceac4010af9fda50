//! The per-session registry of known mailboxes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{Flag, Name, NameAttribute, Seq, StatusItem, Uid};
use crate::utils::is_inbox;

static NEXT_MAILBOX_ID: AtomicU64 = AtomicU64::new(1);

const INBOX: &str = "INBOX";

/// A handle to a mailbox in a session's [`MailboxDirectory`].
///
/// Handles stay valid across renames. Once the mailbox is deleted or the session leaves the
/// authenticated state, looking the handle up yields [`Error::MailboxClosed`](crate::Error).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailboxId(u64);

impl MailboxId {
    fn next() -> Self {
        MailboxId(NEXT_MAILBOX_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Client-side view of a mailbox.
///
/// Counters are kept current from `SELECT`/`EXAMINE` data, `STATUS` responses and unsolicited
/// `EXISTS`, `RECENT`, `EXPUNGE` and `FETCH` updates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mailbox {
    id: MailboxId,
    name: String,
    delimiter: Option<String>,
    attributes: Vec<NameAttribute>,

    /// Number of messages in the mailbox.
    pub exists: u32,
    /// Number of messages with the `\Recent` flag.
    pub recent: u32,
    /// Sequence number of the first unseen message.
    pub unseen: Option<u32>,
    /// The next UID the server expects to assign.
    pub uid_next: Option<u32>,
    /// The UID validity value.
    pub uid_validity: Option<u32>,
    /// CONDSTORE highest modification sequence.
    pub highest_modseq: Option<u64>,
    /// Flags applicable in this mailbox, from `* FLAGS`.
    pub applicable_flags: Vec<Flag>,
    /// Flags the client can change permanently.
    pub permanent_flags: Vec<Flag>,
    /// Whether the mailbox was selected read-only.
    pub read_only: bool,

    uids: BTreeMap<Seq, Uid>,
}

impl Mailbox {
    fn new(name: &str) -> Self {
        Mailbox {
            id: MailboxId::next(),
            name: canonical_name(name),
            delimiter: None,
            attributes: Vec::new(),
            exists: 0,
            recent: 0,
            unseen: None,
            uid_next: None,
            uid_validity: None,
            highest_modseq: None,
            applicable_flags: Vec::new(),
            permanent_flags: Vec::new(),
            read_only: false,
            uids: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> MailboxId {
        self.id
    }

    /// The full hierarchical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The hierarchy delimiter, `None` or empty when the name is flat.
    pub fn delimiter(&self) -> Option<&str> {
        self.delimiter.as_deref()
    }

    /// Name attributes from the last `LIST`.
    pub fn attributes(&self) -> &[NameAttribute] {
        &self.attributes
    }

    pub fn has_attribute(&self, attribute: &NameAttribute) -> bool {
        self.attributes.contains(attribute)
    }

    /// Whether the mailbox can be selected.
    pub fn is_selectable(&self) -> bool {
        !self.has_attribute(&NameAttribute::NoSelect)
            && !self.has_attribute(&NameAttribute::NonExistent)
    }

    /// Whether the entry is a placeholder for a name that does not exist on the server.
    pub fn is_nonexistent(&self) -> bool {
        self.has_attribute(&NameAttribute::NonExistent)
    }

    /// The UID of message `seq`, if a `FETCH` reported it.
    pub fn uid(&self, seq: Seq) -> Option<Uid> {
        self.uids.get(&seq).copied()
    }

    /// The sequence number currently held by `uid`, if known.
    pub fn seq(&self, uid: Uid) -> Option<Seq> {
        self.uids.iter().find(|(_, &u)| u == uid).map(|(&s, _)| s)
    }

    pub(crate) fn set_attributes(&mut self, attributes: Vec<NameAttribute>) {
        self.attributes = attributes;
    }

    pub(crate) fn set_delimiter(&mut self, delimiter: Option<String>) {
        self.delimiter = delimiter;
    }

    pub(crate) fn remove_attribute(&mut self, attribute: &NameAttribute) {
        self.attributes.retain(|a| a != attribute);
    }

    /// Forget per-selection state ahead of a new `SELECT`.
    pub(crate) fn reset_selection(&mut self) {
        self.exists = 0;
        self.recent = 0;
        self.unseen = None;
        self.applicable_flags.clear();
        self.permanent_flags.clear();
        self.read_only = false;
        self.uids.clear();
    }

    pub(crate) fn record_uid(&mut self, seq: Seq, uid: Uid) {
        self.uids.insert(seq, uid);
    }

    /// Message `seq` was expunged: every later message moves down by one.
    pub(crate) fn expunge(&mut self, seq: Seq) {
        self.exists = self.exists.saturating_sub(1);
        self.uids.remove(&seq);
        let later: Vec<(Seq, Uid)> = self
            .uids
            .range(seq + 1..)
            .map(|(&s, &u)| (s, u))
            .collect();
        for (s, u) in later {
            self.uids.remove(&s);
            self.uids.insert(s - 1, u);
        }
    }

    /// Message with `uid` vanished (QRESYNC).
    pub(crate) fn vanish(&mut self, uid: Uid) {
        match self.seq(uid) {
            Some(seq) => self.expunge(seq),
            None => self.exists = self.exists.saturating_sub(1),
        }
    }

    pub(crate) fn apply_status(&mut self, items: &[StatusItem]) {
        for item in items {
            match *item {
                StatusItem::Messages(n) => self.exists = n,
                StatusItem::Recent(n) => self.recent = n,
                StatusItem::UidNext(n) => self.uid_next = Some(n),
                StatusItem::UidValidity(n) => self.uid_validity = Some(n),
                StatusItem::Unseen(n) => self.unseen = Some(n),
                StatusItem::HighestModSeq(n) => self.highest_modseq = Some(n),
            }
        }
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name: {}, flags: {:?}, exists: {}, recent: {}, unseen: {:?}, permanent_flags: {:?},\
             uid_next: {:?}, uid_validity: {:?}",
            self.name,
            self.applicable_flags,
            self.exists,
            self.recent,
            self.unseen,
            self.permanent_flags,
            self.uid_next,
            self.uid_validity
        )
    }
}

fn canonical_name(name: &str) -> String {
    if is_inbox(name) {
        INBOX.to_string()
    } else {
        name.to_string()
    }
}

/// Mailboxes known to one authenticated session, keyed by name.
///
/// Names compare ordinally, except `INBOX`, which matches in any case.
#[derive(Debug, Default)]
pub struct MailboxDirectory {
    entries: HashMap<MailboxId, Mailbox>,
    index: BTreeMap<String, MailboxId>,
}

impl MailboxDirectory {
    pub fn new() -> Self {
        MailboxDirectory::default()
    }

    /// The entry for `name`, created if it is not known yet.
    pub fn get_or_create(&mut self, name: &str) -> MailboxId {
        let key = canonical_name(name);
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let mailbox = Mailbox::new(name);
        let id = mailbox.id;
        self.index.insert(key, id);
        self.entries.insert(id, mailbox);
        id
    }

    /// The entry for `name`, if known.
    pub fn get_existing(&self, name: &str) -> Option<&Mailbox> {
        self.id_of(name).and_then(|id| self.entries.get(&id))
    }

    pub fn id_of(&self, name: &str) -> Option<MailboxId> {
        self.index.get(&canonical_name(name)).copied()
    }

    pub fn get(&self, id: MailboxId) -> Option<&Mailbox> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: MailboxId) -> Option<&mut Mailbox> {
        self.entries.get_mut(&id)
    }

    /// Record a `LIST`/`LSUB` entry, refreshing attributes and delimiter of a known mailbox.
    pub fn add(&mut self, name: &Name) -> MailboxId {
        let id = self.get_or_create(name.name());
        if let Some(mailbox) = self.entries.get_mut(&id) {
            mailbox.attributes = name.attributes().to_vec();
            mailbox.delimiter = name.delimiter().map(str::to_string);
        }
        id
    }

    /// Remove `name` from the directory. Its handle stops resolving. Children are not touched.
    pub fn delete(&mut self, name: &str) -> Option<Mailbox> {
        let id = self.index.remove(&canonical_name(name))?;
        self.entries.remove(&id)
    }

    /// Whether any known mailbox lives below `name`.
    pub fn has_children(&self, name: &str) -> bool {
        let delimiter = match self.get_existing(name).and_then(|m| m.delimiter()) {
            Some(d) if !d.is_empty() => d,
            _ => return false,
        };
        let prefix = format!("{}{}", canonical_name(name), delimiter);
        self.index
            .range(prefix.clone()..)
            .next()
            .map_or(false, |(k, _)| k.starts_with(&prefix))
    }

    /// Re-key `existing` as `new`, carrying its children along.
    ///
    /// Renaming `INBOX` moves its messages to a new mailbox and leaves `INBOX` in place, so
    /// that case creates the target and renames nothing. Returns the handle of the renamed
    /// entry, or `None` if `existing` is unknown or `new` is taken.
    pub fn rename(&mut self, existing: &str, new: &str) -> Option<MailboxId> {
        let new_key = canonical_name(new);
        if let Some(&taken) = self.index.get(&new_key) {
            match self.entries.get(&taken) {
                Some(m) if m.is_nonexistent() => {
                    self.index.remove(&new_key);
                    self.entries.remove(&taken);
                }
                _ => return None,
            }
        }

        let old_key = canonical_name(existing);
        if old_key == INBOX {
            let delimiter = self
                .get_existing(INBOX)
                .and_then(|m| m.delimiter.clone());
            let id = self.get_or_create(new);
            if let Some(m) = self.entries.get_mut(&id) {
                m.delimiter = delimiter;
            }
            return Some(id);
        }

        let id = self.index.remove(&old_key)?;
        let delimiter = match self.entries.get_mut(&id) {
            Some(m) => {
                m.name = new.to_string();
                m.delimiter.clone()
            }
            None => None,
        };
        self.index.insert(new_key, id);

        if let Some(delimiter) = delimiter.filter(|d| !d.is_empty()) {
            let prefix = format!("{}{}", existing, delimiter);
            let children: Vec<(String, MailboxId)> = self
                .index
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, &id)| (k.clone(), id))
                .collect();
            for (key, child) in children {
                self.index.remove(&key);
                let renamed = format!("{}{}{}", new, delimiter, &key[prefix.len()..]);
                if let Some(m) = self.entries.get_mut(&child) {
                    m.name = renamed.clone();
                }
                self.index.insert(canonical_name(&renamed), child);
            }
        }
        Some(id)
    }

    /// Drop every entry; all outstanding handles stop resolving.
    pub fn detach_all(&mut self) {
        self.index.clear();
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Known mailbox names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mailbox> {
        self.index.values().filter_map(move |id| self.entries.get(id))
    }
}
