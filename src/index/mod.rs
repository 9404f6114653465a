//! Index engine: queryable collections over committed entities.
//!
//! One collection per fingerprint, plus declared attribute indices. The
//! command consumer adds every appended entity while the command's locks
//! are still held, so a successful `publish` is read-your-writes for
//! anything watching the indices. Query primitives here are deliberately
//! small; richer query layers sit above this crate.

use std::sync::Arc;

use thiserror::Error;

use crate::core::{EntityId, EntityRecord, Fingerprint, Layout, Value};
use crate::error::{Effect, Transience};

pub mod memory;

pub use memory::MemoryIndexEngine;

/// Result of declaring an index.
///
/// Re-adding an existing index is an explicit outcome, not an error to
/// pattern-match out of a message string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOutcome {
    Added,
    AlreadyPresent,
}

/// Index engine errors.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum IndexError {
    #[error("no collection registered for fingerprint {fingerprint}")]
    UnknownCollection { fingerprint: Fingerprint },

    #[error("attribute `{attribute}` does not exist on layout `{layout}`")]
    UnknownAttribute { attribute: String, layout: String },

    #[error("attribute `{attribute}` has type {ty}, which cannot key an index")]
    UnsupportedAttribute { attribute: String, ty: String },
}

impl IndexError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}

/// Maintains queryable collections keyed by layout fingerprint.
pub trait IndexEngine: Send + Sync {
    /// Ensure a collection exists for this layout. Idempotent.
    fn register_collection(&self, layout: &Arc<Layout>) -> Result<(), IndexError>;

    /// Declare an attribute index on a collection.
    fn try_add_index(
        &self,
        fingerprint: Fingerprint,
        attribute: &str,
    ) -> Result<IndexOutcome, IndexError>;

    /// Add a committed entity. Registers the collection on first sight;
    /// re-adding an entity id already present is a no-op.
    fn add_to_collection(&self, record: &EntityRecord) -> Result<(), IndexError>;

    /// Number of entities in a collection; 0 when unregistered.
    fn count(&self, fingerprint: Fingerprint) -> usize;

    /// Lookup by entity id.
    fn get(&self, fingerprint: Fingerprint, id: EntityId) -> Option<EntityRecord>;

    /// All records of a collection in insertion (journal) order.
    fn records(&self, fingerprint: Fingerprint) -> Vec<EntityRecord>;

    /// Equality query over one attribute. Served from the attribute index
    /// when one was declared, otherwise by scan.
    fn find_equal(
        &self,
        fingerprint: Fingerprint,
        attribute: &str,
        value: &Value,
    ) -> Result<Vec<EntityRecord>, IndexError>;
}
