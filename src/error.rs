use thiserror::Error;

use crate::core::CoreError;
use crate::index::IndexError;
use crate::journal::JournalError;
use crate::repository::{PublishError, RepositoryError};

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (something is in the journal).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Journal(e) => e.transience(),
            Error::Index(e) => e.transience(),
            Error::Publish(e) => e.transience(),
            Error::Repository(e) => e.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(e) => e.effect(),
            Error::Journal(e) => e.effect(),
            Error::Index(e) => e.effect(),
            Error::Publish(e) => e.effect(),
            Error::Repository(e) => e.effect(),
        }
    }
}
