//! Repository: command pipeline and facade.
//!
//! - lock: named advisory locks (local provider)
//! - future: command result futures + cancellation
//! - subscriber: entity subscribers and isolated notification
//! - consumer: worker pool driving the per-command pipeline
//! - introduce: the built-in layout-introduction command
//! - facade: lifecycle, registration, publish entry point

use thiserror::Error;

use crate::core::{CodecError, HostError, LayoutError, LockName};
use crate::error::{Effect, Transience};
use crate::journal::JournalError;

pub mod consumer;
pub mod facade;
pub mod future;
pub mod introduce;
pub mod lock;
pub mod subscriber;

pub use facade::{
    CommandSetProvider, EventSetProvider, Lifecycle, Repository, RepositoryBuilder,
    TypeRegistration,
};
pub use future::CommandFuture;
pub use introduce::IntroduceEntityLayouts;
pub use lock::{LocalLockProvider, LockError, LockGuard, LockProvider};
pub use subscriber::{CommittedEntity, EntitySubscriber};

/// Why a published command failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublishError {
    /// Configuration or lifecycle misuse.
    #[error("illegal state: {reason}")]
    IllegalState { reason: String },

    /// A declared lock stayed contended past the configured timeout.
    /// Nothing was journaled.
    #[error("lock `{name}` acquisition timed out after {timeout_ms} ms")]
    LockTimeout { name: LockName, timeout_ms: u64 },

    /// The lock back-end itself failed.
    #[error("lock provider failed: {0}")]
    Lock(#[from] LockError),

    /// Durable append failed; no entities are visible.
    #[error("journal append failed: {0}")]
    Journal(#[from] JournalError),

    /// The codec could not encode an entity.
    #[error("serialization failed: {0}")]
    Serialization(#[from] CodecError),

    /// An entity layout could not be registered.
    #[error("layout registration failed: {0}")]
    Layout(#[from] LayoutError),

    /// User `execute` raised; the failure is recorded in the journal.
    #[error("command execution failed: {0}")]
    Host(#[from] HostError),

    /// Cancelled while still queued; never reached a worker.
    #[error("command cancelled while queued")]
    Cancelled,
}

impl PublishError {
    pub fn transience(&self) -> Transience {
        match self {
            PublishError::LockTimeout { .. } | PublishError::Cancelled => Transience::Retryable,
            PublishError::Journal(e) => e.transience(),
            PublishError::Lock(_) => Transience::Unknown,
            PublishError::IllegalState { .. }
            | PublishError::Serialization(_)
            | PublishError::Layout(_)
            | PublishError::Host(_) => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            // The failure pair is durably recorded.
            PublishError::Host(_) => Effect::Some,
            PublishError::Journal(e) => e.effect(),
            _ => Effect::None,
        }
    }
}

/// Facade lifecycle and startup errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepositoryError {
    #[error("illegal lifecycle transition: {reason}")]
    IllegalState { reason: String },

    #[error("repository has no configured {what}")]
    NotConfigured { what: &'static str },

    #[error("worker startup failed: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl RepositoryError {
    pub fn transience(&self) -> Transience {
        match self {
            RepositoryError::IllegalState { .. } | RepositoryError::NotConfigured { .. } => {
                Transience::Permanent
            }
            RepositoryError::WorkerSpawn(_) => Transience::Retryable,
            RepositoryError::Journal(e) => e.transience(),
            RepositoryError::Layout(_) => Transience::Permanent,
            RepositoryError::Publish(e) => e.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            RepositoryError::Journal(e) => e.effect(),
            RepositoryError::Publish(e) => e.effect(),
            _ => Effect::None,
        }
    }
}
