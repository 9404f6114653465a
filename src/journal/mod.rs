//! Journal: durable, ordered log of entities.
//!
//! The consumer appends a command and its whole event stream through one
//! transaction; `commit` is all-or-nothing and `abort` leaves no trace.
//! A journal rejects any entity whose fingerprint has not been introduced
//! by an `EntityLayoutIntroduced` event earlier in journal order (the
//! introduction event's own layout is the seed).

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use thiserror::Error;

use crate::core::{
    CodecError, EntityId, EntityLayoutIntroduced, EntityRecord, Fingerprint, HybridTimestamp,
    Layout, LayoutRegistry, LayoutSnapshot,
};
use crate::error::{Effect, Transience};

pub mod file;
pub mod memory;

pub use file::FileJournal;
pub use memory::MemoryJournal;

/// Whether a journal entry is a command or an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Command,
    Event,
}

/// One persisted entity: parsed envelope fields plus the full wire frame.
///
/// The envelope is carried redundantly so scans never need layouts; the
/// payload decodes on demand via [`JournalEntry::decode_record`].
#[derive(Clone, Debug)]
pub struct JournalEntry {
    pub kind: EntityKind,
    pub fingerprint: Fingerprint,
    pub id: EntityId,
    pub at: HybridTimestamp,
    /// For events: the command this entry is attributed to.
    pub cause: Option<EntityId>,
    /// Full wire frame: fingerprint, stamp, id, payload.
    pub bytes: Bytes,
}

impl JournalEntry {
    pub fn decode_record(&self, layouts: &LayoutSnapshot) -> Result<EntityRecord, CodecError> {
        EntityRecord::decode(&self.bytes, layouts)
    }

    /// If this entry is an `EntityLayoutIntroduced` event, the introduced
    /// fingerprint and schema.
    pub fn introduced_layout(&self) -> Option<EntityLayoutIntroduced> {
        if self.fingerprint != EntityLayoutIntroduced::layout().fingerprint() {
            return None;
        }
        let record = EntityRecord::decode(&self.bytes, intro_snapshot()).ok()?;
        EntityLayoutIntroduced::from_record(&record)
    }
}

fn intro_snapshot() -> &'static LayoutSnapshot {
    static SNAP: OnceLock<LayoutSnapshot> = OnceLock::new();
    SNAP.get_or_init(|| {
        let registry = LayoutRegistry::new();
        registry
            .register(EntityLayoutIntroduced::layout())
            .expect("builtin layout");
        registry.snapshot()
    })
}

/// The fingerprint every journal accepts from birth.
pub(crate) fn seed_fingerprint() -> Fingerprint {
    EntityLayoutIntroduced::layout().fingerprint()
}

/// Filter for journal iteration. Empty filter matches everything.
#[derive(Clone, Debug, Default)]
pub struct EntryFilter {
    pub kind: Option<EntityKind>,
    pub fingerprint: Option<Fingerprint>,
    pub since: Option<HybridTimestamp>,
}

impl EntryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn events() -> Self {
        Self {
            kind: Some(EntityKind::Event),
            ..Self::default()
        }
    }

    pub fn commands() -> Self {
        Self {
            kind: Some(EntityKind::Command),
            ..Self::default()
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn since(mut self, at: HybridTimestamp) -> Self {
        self.since = Some(at);
        self
    }

    pub fn matches(&self, entry: &JournalEntry) -> bool {
        if let Some(kind) = self.kind
            && entry.kind != kind
        {
            return false;
        }
        if let Some(fp) = self.fingerprint
            && entry.fingerprint != fp
        {
            return false;
        }
        if let Some(since) = &self.since
            && entry.at <= *since
        {
            return false;
        }
        true
    }
}

/// An open journal transaction. Dropped without commit = aborted.
pub trait JournalTx: Send {
    fn append_command(&mut self, entry: JournalEntry) -> Result<(), JournalError>;
    fn append_event(&mut self, entry: JournalEntry) -> Result<(), JournalError>;
    fn commit(self: Box<Self>) -> Result<(), JournalError>;
    fn abort(self: Box<Self>);
}

/// Durable, transactional entity log.
pub trait Journal: Send + Sync {
    fn begin(&self) -> Result<Box<dyn JournalTx + '_>, JournalError>;

    /// Announce installed command types. Back-ends may use this to
    /// prepare per-type storage; re-announcing is a no-op.
    fn on_commands_added(&self, layouts: &[Arc<Layout>]) -> Result<(), JournalError>;

    /// Announce installed event types.
    fn on_events_added(&self, layouts: &[Arc<Layout>]) -> Result<(), JournalError>;

    /// Lazily iterate committed entries in journal order.
    fn iter_entries(
        &self,
        filter: &EntryFilter,
    ) -> Result<Box<dyn Iterator<Item = JournalEntry> + Send>, JournalError>;

    /// Fingerprints introduced so far, for recovery and append gating.
    fn introduced_fingerprints(&self) -> Result<HashSet<Fingerprint>, JournalError>;

    /// Largest timestamp persisted, for clock recovery on restart.
    fn latest_timestamp(&self) -> Result<Option<HybridTimestamp>, JournalError>;

    fn entry_count(&self) -> Result<usize, JournalError>;
}

/// Journal errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal corrupt: {reason}")]
    Corrupt { reason: String },

    #[error("journal format version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    #[error("fingerprint {fingerprint} appended before its layout introduction")]
    UnintroducedFingerprint { fingerprint: Fingerprint },
}

impl JournalError {
    pub fn transience(&self) -> Transience {
        match self {
            JournalError::Io(_) => Transience::Unknown,
            JournalError::Corrupt { .. } | JournalError::VersionMismatch { .. } => {
                Transience::Permanent
            }
            JournalError::UnintroducedFingerprint { .. } => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // A failed commit may or may not have reached disk.
            JournalError::Io(_) => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

/// Shared append gate: every appended fingerprint must be known already
/// or introduced earlier in the same transaction.
pub(crate) fn gate_append(
    known: &HashSet<Fingerprint>,
    pending: &mut HashSet<Fingerprint>,
    entry: &JournalEntry,
) -> Result<(), JournalError> {
    if !known.contains(&entry.fingerprint) && !pending.contains(&entry.fingerprint) {
        return Err(JournalError::UnintroducedFingerprint {
            fingerprint: entry.fingerprint,
        });
    }
    if let Some(intro) = entry.introduced_layout() {
        pending.insert(intro.fingerprint);
    }
    Ok(())
}
