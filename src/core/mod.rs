//! Core domain types (Layers 0-6)
//!
//! Module hierarchy follows type dependency order:
//! - time: HLC primitives (Layer 0)
//! - identity: EntityId, TypeName, LockName (Layer 1)
//! - value: property value tree (Layer 2)
//! - layout: canonical schemas + fingerprints (Layer 3)
//! - codec: deterministic binary encoding (Layer 4)
//! - entity: Entity/Command/Event traits, persisted records (Layer 5)
//! - events: built-in pipeline events (Layer 6)

pub mod codec;
pub mod entity;
pub mod error;
pub mod events;
pub mod identity;
pub mod layout;
pub mod time;
pub mod value;

pub use codec::{decode_payload, encode_payload};
pub use entity::{
    Command, Entity, EntityRecord, Event, EventStream, FRAME_HEADER_LEN, HostError, StreamItem,
    assemble_frame, decode_frame_header,
};
pub use error::{CodecError, CoreError, InvalidName, LayoutError};
pub use events::{
    CommandTerminatedExceptionally, EntityLayoutIntroduced, EventCausalityEstablished,
    HostErrorOccurred,
};
pub use identity::{EntityId, LockName, TypeName};
pub use layout::{
    Fingerprint, Layout, LayoutBuilder, LayoutRegistry, LayoutSnapshot, Property, PropertyType,
};
pub use time::{HybridClock, HybridTimestamp, PhysicalTimeSource, SystemTimeSource};
pub use value::{ScalarValue, Value, scalar_cmp};

#[cfg(any(test, feature = "test-harness"))]
pub use time::ManualTimeSource;
