//! Core capability errors (identity, layout derivation, codec).
//!
//! These are bounded and stable: core errors represent domain/refusal
//! states, not library implementation details.

use thiserror::Error;

use super::layout::Fingerprint;
use crate::error::{Effect, Transience};

/// Invalid identity string.
#[derive(Debug, Error, Clone)]
#[error("{kind} `{raw}` is invalid: {reason}")]
pub struct InvalidName {
    pub kind: &'static str,
    pub raw: String,
    pub reason: String,
}

/// Layout derivation and registration errors.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum LayoutError {
    #[error("layout `{name}` is cyclic through {fingerprint}; use a uuid reference instead")]
    CyclicLayout { name: String, fingerprint: Fingerprint },

    #[error("unsupported type for {context}: {ty}")]
    UnsupportedType { context: &'static str, ty: String },

    #[error("duplicate property `{name}`")]
    DuplicateProperty { name: String },

    #[error("property name `{name}` is invalid: {reason}")]
    InvalidProperty { name: String, reason: String },

    #[error("layout references unregistered fingerprint {fingerprint}")]
    UnknownReference { fingerprint: Fingerprint },

    #[error("canonical schema is malformed: {reason}")]
    MalformedSchema { reason: String },
}

/// Binary codec errors.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CodecError {
    #[error("truncated input while decoding {context}: need {needed} more bytes")]
    Truncated { context: &'static str, needed: usize },

    #[error("unknown layout fingerprint {fingerprint}")]
    UnknownFingerprint { fingerprint: Fingerprint },

    #[error("codec invariant violated: {reason}")]
    InvariantViolated { reason: String },
}

/// Canonical error enum for core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidName(#[from] InvalidName),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Core errors are pure domain/input failures.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        Effect::None
    }
}
