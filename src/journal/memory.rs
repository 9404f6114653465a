//! In-memory journal.
//!
//! Same transactional contract as the durable back-ends, no persistence.
//! This is what unit and integration tests run against.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::core::{Fingerprint, HybridTimestamp, Layout};

use super::{
    EntityKind, EntryFilter, Journal, JournalEntry, JournalError, JournalTx, gate_append,
    seed_fingerprint,
};

#[derive(Debug)]
struct MemoryState {
    entries: Vec<JournalEntry>,
    introduced: HashSet<Fingerprint>,
    announced: HashSet<Fingerprint>,
    max_at: Option<HybridTimestamp>,
}

/// Volatile journal with atomic batch commits.
pub struct MemoryJournal {
    inner: Mutex<MemoryState>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        let mut introduced = HashSet::new();
        introduced.insert(seed_fingerprint());
        Self {
            inner: Mutex::new(MemoryState {
                entries: Vec::new(),
                introduced,
                announced: HashSet::new(),
                max_at: None,
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTx<'a> {
    journal: &'a MemoryJournal,
    staged: Vec<JournalEntry>,
    pending_intros: HashSet<Fingerprint>,
}

impl MemoryTx<'_> {
    fn stage(&mut self, kind: EntityKind, entry: JournalEntry) -> Result<(), JournalError> {
        debug_assert_eq!(entry.kind, kind);
        self.journal.with_state(|state| {
            gate_append(&state.introduced, &mut self.pending_intros, &entry)
        })?;
        self.staged.push(entry);
        Ok(())
    }
}

impl JournalTx for MemoryTx<'_> {
    fn append_command(&mut self, entry: JournalEntry) -> Result<(), JournalError> {
        self.stage(EntityKind::Command, entry)
    }

    fn append_event(&mut self, entry: JournalEntry) -> Result<(), JournalError> {
        self.stage(EntityKind::Event, entry)
    }

    fn commit(self: Box<Self>) -> Result<(), JournalError> {
        let MemoryTx {
            journal,
            staged,
            pending_intros,
        } = *self;
        journal.with_state(|state| {
            for entry in &staged {
                if state
                    .max_at
                    .as_ref()
                    .is_none_or(|max| entry.at > *max)
                {
                    state.max_at = Some(entry.at.clone());
                }
            }
            state.entries.extend(staged);
            state.introduced.extend(pending_intros);
        });
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

impl Journal for MemoryJournal {
    fn begin(&self) -> Result<Box<dyn JournalTx + '_>, JournalError> {
        Ok(Box::new(MemoryTx {
            journal: self,
            staged: Vec::new(),
            pending_intros: HashSet::new(),
        }))
    }

    fn on_commands_added(&self, layouts: &[std::sync::Arc<Layout>]) -> Result<(), JournalError> {
        self.with_state(|state| {
            state
                .announced
                .extend(layouts.iter().map(|l| l.fingerprint()));
        });
        Ok(())
    }

    fn on_events_added(&self, layouts: &[std::sync::Arc<Layout>]) -> Result<(), JournalError> {
        self.on_commands_added(layouts)
    }

    fn iter_entries(
        &self,
        filter: &EntryFilter,
    ) -> Result<Box<dyn Iterator<Item = JournalEntry> + Send>, JournalError> {
        let filter = filter.clone();
        let snapshot: Vec<JournalEntry> = self.with_state(|state| {
            state
                .entries
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect()
        });
        Ok(Box::new(snapshot.into_iter()))
    }

    fn introduced_fingerprints(&self) -> Result<std::collections::HashSet<Fingerprint>, JournalError>
    {
        Ok(self.with_state(|state| state.introduced.clone()))
    }

    fn latest_timestamp(&self) -> Result<Option<HybridTimestamp>, JournalError> {
        Ok(self.with_state(|state| state.max_at.clone()))
    }

    fn entry_count(&self) -> Result<usize, JournalError> {
        Ok(self.with_state(|state| state.entries.len()))
    }
}
