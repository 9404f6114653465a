//! Layer 6: Built-in events
//!
//! Events the pipeline itself emits: causality edges, failure capture,
//! and layout introductions. Their layouts are static and registered by
//! the repository before anything user-defined runs.

use std::sync::{Arc, OnceLock};

use super::entity::{Entity, EntityRecord, Event, HostError};
use super::identity::{EntityId, TypeName};
use super::layout::{Fingerprint, Layout, LayoutBuilder, PropertyType};
use super::value::Value;

fn builtin(name: &str, build: impl FnOnce(LayoutBuilder) -> LayoutBuilder) -> Arc<Layout> {
    let builder = LayoutBuilder::new(TypeName::new(name).expect("builtin type name"));
    build(builder).finish().expect("builtin layout")
}

/// Declares a causal edge from a command to one of its events.
///
/// Payload position 0 is the 16-byte cause uuid ("cause" sorts before
/// "event"), as the wire contract requires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventCausalityEstablished {
    pub event: EntityId,
    pub cause: EntityId,
}

impl EventCausalityEstablished {
    pub fn new(event: EntityId, cause: EntityId) -> Self {
        Self { event, cause }
    }

    pub fn layout() -> Arc<Layout> {
        static LAYOUT: OnceLock<Arc<Layout>> = OnceLock::new();
        LAYOUT
            .get_or_init(|| {
                builtin("EventCausalityEstablished", |b| {
                    b.property("cause", PropertyType::Uuid)
                        .property("event", PropertyType::Uuid)
                })
            })
            .clone()
    }

    pub fn from_record(record: &EntityRecord) -> Option<Self> {
        if record.fingerprint() != Self::layout().fingerprint() {
            return None;
        }
        let cause = record.property("cause")?.as_uuid()?;
        let event = record.property("event")?.as_uuid()?;
        Some(Self {
            event: EntityId::from_uuid(*event),
            cause: EntityId::from_uuid(*cause),
        })
    }
}

impl Entity for EventCausalityEstablished {
    fn layout(&self) -> Arc<Layout> {
        Self::layout()
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Uuid(*self.cause.as_uuid()),
            Value::Uuid(*self.event.as_uuid()),
        ]
    }
}

impl Event for EventCausalityEstablished {}

/// Recorded when an in-progress command fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandTerminatedExceptionally {
    pub message: String,
}

impl CommandTerminatedExceptionally {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn layout() -> Arc<Layout> {
        static LAYOUT: OnceLock<Arc<Layout>> = OnceLock::new();
        LAYOUT
            .get_or_init(|| {
                builtin("CommandTerminatedExceptionally", |b| {
                    b.property("message", PropertyType::Str)
                })
            })
            .clone()
    }

    pub fn from_record(record: &EntityRecord) -> Option<Self> {
        if record.fingerprint() != Self::layout().fingerprint() {
            return None;
        }
        Some(Self {
            message: record.property("message")?.as_str()?.to_string(),
        })
    }
}

impl Entity for CommandTerminatedExceptionally {
    fn layout(&self) -> Arc<Layout> {
        Self::layout()
    }

    fn values(&self) -> Vec<Value> {
        vec![Value::Str(self.message.clone())]
    }
}

impl Event for CommandTerminatedExceptionally {}

/// Opaque host-side failure capture: the error's type-ish kind plus its
/// rendered message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostErrorOccurred {
    pub kind: String,
    pub message: String,
}

impl HostErrorOccurred {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn layout() -> Arc<Layout> {
        static LAYOUT: OnceLock<Arc<Layout>> = OnceLock::new();
        LAYOUT
            .get_or_init(|| {
                builtin("HostErrorOccurred", |b| {
                    b.property("kind", PropertyType::Str)
                        .property("message", PropertyType::Str)
                })
            })
            .clone()
    }

    pub fn from_record(record: &EntityRecord) -> Option<Self> {
        if record.fingerprint() != Self::layout().fingerprint() {
            return None;
        }
        Some(Self {
            kind: record.property("kind")?.as_str()?.to_string(),
            message: record.property("message")?.as_str()?.to_string(),
        })
    }
}

impl From<&HostError> for HostErrorOccurred {
    fn from(err: &HostError) -> Self {
        Self {
            kind: err.kind.clone(),
            message: err.message.clone(),
        }
    }
}

impl Entity for HostErrorOccurred {
    fn layout(&self) -> Arc<Layout> {
        Self::layout()
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Str(self.kind.clone()),
            Value::Str(self.message.clone()),
        ]
    }
}

impl Event for HostErrorOccurred {}

/// Recorded once per newly observed entity schema, before the first
/// entity carrying that fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityLayoutIntroduced {
    pub fingerprint: Fingerprint,
    /// Canonical schema serialization; parseable back into a `Layout`.
    pub schema: Vec<u8>,
}

impl EntityLayoutIntroduced {
    pub fn new(layout: &Layout) -> Self {
        Self {
            fingerprint: layout.fingerprint(),
            schema: layout.canonical_bytes().to_vec(),
        }
    }

    pub fn layout() -> Arc<Layout> {
        static LAYOUT: OnceLock<Arc<Layout>> = OnceLock::new();
        LAYOUT
            .get_or_init(|| {
                builtin("EntityLayoutIntroduced", |b| {
                    b.property("fingerprint", PropertyType::Bytes)
                        .property("schema", PropertyType::Bytes)
                })
            })
            .clone()
    }

    pub fn from_record(record: &EntityRecord) -> Option<Self> {
        if record.fingerprint() != Self::layout().fingerprint() {
            return None;
        }
        let fp_bytes = record.property("fingerprint")?.as_bytes()?;
        let fp: [u8; 20] = fp_bytes.try_into().ok()?;
        Some(Self {
            fingerprint: Fingerprint::from_bytes(fp),
            schema: record.property("schema")?.as_bytes()?.to_vec(),
        })
    }
}

impl Entity for EntityLayoutIntroduced {
    fn layout(&self) -> Arc<Layout> {
        Self::layout()
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Bytes(self.fingerprint.as_bytes().to_vec()),
            Value::Bytes(self.schema.clone()),
        ]
    }
}

impl Event for EntityLayoutIntroduced {}
