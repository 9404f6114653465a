//! eventory: an event-sourcing repository.
//!
//! Commands go in; causally ordered, durably journaled, indexed events
//! come out. The repository is the trusted intermediary between an
//! application's domain model and its journal: it stamps every command
//! and event with a hybrid logical clock, derives content-addressed
//! layouts for every entity type, appends each command's whole event
//! stream atomically, and keeps queryable indices strictly consistent
//! with a successful `publish`.

#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod journal;
pub mod repository;
pub mod telemetry;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at crate root for convenience.
pub use crate::config::Config;
pub use crate::core::{
    Command, CommandTerminatedExceptionally, Entity, EntityId, EntityLayoutIntroduced,
    EntityRecord, Event, EventCausalityEstablished, EventStream, Fingerprint, HostError,
    HostErrorOccurred, HybridClock, HybridTimestamp, Layout, LayoutBuilder, LayoutRegistry,
    LockName, PhysicalTimeSource, PropertyType, SystemTimeSource, TypeName, Value,
};
pub use crate::index::{IndexEngine, IndexError, IndexOutcome, MemoryIndexEngine};
pub use crate::journal::{
    EntityKind, EntryFilter, FileJournal, Journal, JournalEntry, JournalError, JournalTx,
    MemoryJournal,
};
pub use crate::repository::{
    CommandFuture, CommandSetProvider, CommittedEntity, EntitySubscriber, EventSetProvider,
    IntroduceEntityLayouts, Lifecycle, LocalLockProvider, LockError, LockGuard, LockProvider,
    PublishError, Repository, RepositoryBuilder, RepositoryError, TypeRegistration,
};

#[cfg(any(test, feature = "test-harness"))]
pub use crate::core::ManualTimeSource;
