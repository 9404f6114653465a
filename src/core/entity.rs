//! Layer 5: Entities
//!
//! `Entity` is the common supertype of commands and events: a layout plus
//! property values. Identity and timestamps are assigned by the pipeline,
//! not by the user type; they live in `EntityRecord`, the persisted
//! envelope.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::codec::{decode_payload, encode_payload};
use super::error::CodecError;
use super::identity::{EntityId, LockName};
use super::layout::{Fingerprint, Layout, LayoutSnapshot};
use super::time::HybridTimestamp;
use super::value::Value;

/// Common supertype of [`Command`] and [`Event`].
///
/// A user type describes itself as (layout, values); the pipeline owns
/// everything else about its life.
pub trait Entity: fmt::Debug + Send + Sync + 'static {
    fn layout(&self) -> Arc<Layout>;

    /// One value per layout property, in layout (sorted-name) order.
    fn values(&self) -> Vec<Value>;
}

/// An immutable fact appended to the journal.
pub trait Event: Entity {}

/// An intent. Executing it yields a lazy, finite stream of events plus an
/// accumulator; `result` maps the final accumulator to the caller-visible
/// output once the stream is durable.
pub trait Command: Entity {
    type State: Send + 'static;
    type Output: Send + 'static;

    /// Advisory locks this command needs. Acquired in ascending name
    /// order regardless of the order returned here.
    fn locks(&self) -> Vec<LockName> {
        Vec::new()
    }

    fn execute(&self) -> Result<EventStream<Self::State>, HostError>;

    /// Called only after the command's whole stream is committed.
    fn result(&self, state: Self::State) -> Self::Output;
}

/// A failure raised by user command logic.
///
/// Reified into the journal as `CommandTerminatedExceptionally` plus
/// `HostErrorOccurred`; the history records the failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct HostError {
    pub kind: String,
    pub message: String,
}

impl HostError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture an error with its concrete type as the kind.
    pub fn capture<E: std::error::Error>(err: &E) -> Self {
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
        }
    }
}

/// One pull from a command's event stream.
pub type StreamItem = Result<Box<dyn Event>, HostError>;

/// Lazy, pull-based event stream with an accumulator.
///
/// Each pull sees the accumulator mutably; the final accumulator value is
/// handed to [`Command::result`] after commit.
pub struct EventStream<S> {
    state: S,
    next: Box<dyn FnMut(&mut S) -> Option<StreamItem> + Send>,
}

impl<S: Send + 'static> EventStream<S> {
    pub fn new(
        state: S,
        next: impl FnMut(&mut S) -> Option<StreamItem> + Send + 'static,
    ) -> Self {
        Self {
            state,
            next: Box::new(next),
        }
    }

    /// No events; the accumulator passes through unchanged.
    pub fn empty(state: S) -> Self {
        Self::new(state, |_| None)
    }

    /// Fixed set of events, accumulator untouched by the pulls.
    pub fn from_iter<I>(state: S, events: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn Event>>,
        I::IntoIter: Send + 'static,
    {
        let mut iter = events.into_iter();
        Self::new(state, move |_| iter.next().map(Ok))
    }

    pub(crate) fn pull(&mut self) -> Option<StreamItem> {
        (self.next)(&mut self.state)
    }

    pub(crate) fn into_state(self) -> S {
        self.state
    }
}

/// Wire frame prefix: fingerprint, timestamp, entity id.
pub const FRAME_HEADER_LEN: usize =
    Fingerprint::WIRE_LEN + HybridTimestamp::WIRE_LEN + EntityId::WIRE_LEN;

/// A stamped, typed entity as persisted and indexed.
#[derive(Clone, Debug)]
pub struct EntityRecord {
    id: EntityId,
    at: HybridTimestamp,
    layout: Arc<Layout>,
    values: Vec<Value>,
}

impl EntityRecord {
    pub fn new(
        id: EntityId,
        at: HybridTimestamp,
        layout: Arc<Layout>,
        values: Vec<Value>,
    ) -> Self {
        Self {
            id,
            at,
            layout,
            values,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn at(&self) -> &HybridTimestamp {
        &self.at
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.layout.fingerprint()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.layout
            .property_index(name)
            .and_then(|i| self.values.get(i))
    }

    /// Full wire frame: `[fingerprint][wall_ms][logical][uuid][payload]`.
    pub fn encode(&self, layouts: &LayoutSnapshot) -> Result<Bytes, CodecError> {
        let payload = encode_payload(&self.layout, &self.values, layouts)?;
        Ok(assemble_frame(
            self.fingerprint(),
            &self.at,
            self.id,
            &payload,
        ))
    }

    pub fn decode(bytes: &[u8], layouts: &LayoutSnapshot) -> Result<Self, CodecError> {
        let (fingerprint, at, id) = decode_frame_header(bytes)?;
        let layout = layouts
            .get(&fingerprint)
            .ok_or(CodecError::UnknownFingerprint { fingerprint })?
            .clone();
        let values = decode_payload(&layout, &bytes[FRAME_HEADER_LEN..], layouts)?;
        Ok(Self {
            id,
            at,
            layout,
            values,
        })
    }
}

/// Assemble a frame from an already-encoded payload.
pub fn assemble_frame(
    fingerprint: Fingerprint,
    at: &HybridTimestamp,
    id: EntityId,
    payload: &[u8],
) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_slice(fingerprint.as_bytes());
    at.write_to(&mut frame);
    frame.put_slice(id.as_bytes());
    frame.put_slice(payload);
    frame.freeze()
}

/// Parse only the fixed frame prefix. Needs no layout knowledge, so the
/// journal can scan frames before any schema is recovered.
pub fn decode_frame_header(
    bytes: &[u8],
) -> Result<(Fingerprint, HybridTimestamp, EntityId), CodecError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(CodecError::Truncated {
            context: "entity frame header",
            needed: FRAME_HEADER_LEN - bytes.len(),
        });
    }
    let mut fp = [0u8; 20];
    fp.copy_from_slice(&bytes[..20]);
    let mut cursor = &bytes[20..FRAME_HEADER_LEN];
    let at = HybridTimestamp::read_from(&mut cursor);
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[32..48]);
    Ok((
        Fingerprint::from_bytes(fp),
        at,
        EntityId::from_bytes(id),
    ))
}
