//! Entity subscribers.
//!
//! Subscribers see every appended entity, synchronously, in journal
//! order, while the command's locks are still held (read-your-writes
//! against the indices). A subscriber that panics is isolated and
//! logged; it cannot affect other subscribers or the command's result.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{EntityId, EntityRecord};
use crate::journal::EntityKind;

/// A committed entity as handed to subscribers.
#[derive(Clone, Debug)]
pub struct CommittedEntity {
    pub kind: EntityKind,
    pub record: EntityRecord,
    /// For events: the command this entity is attributed to.
    pub cause: Option<EntityId>,
}

/// Observer of committed entities.
pub trait EntitySubscriber: Send + Sync {
    fn on_entity(&self, entity: &CommittedEntity);
}

/// Notify every subscriber with every entity, in journal order.
pub(crate) fn notify_all(
    subscribers: &[Arc<dyn EntitySubscriber>],
    entities: &[CommittedEntity],
    budget: Duration,
) {
    for (index, subscriber) in subscribers.iter().enumerate() {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            for entity in entities {
                subscriber.on_entity(entity);
            }
        }));
        if let Err(payload) = outcome {
            tracing::warn!(
                subscriber = index,
                panic = panic_message(payload.as_ref()),
                "entity subscriber panicked; isolated"
            );
        }
        let elapsed = started.elapsed();
        if elapsed > budget {
            tracing::warn!(
                subscriber = index,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "entity subscriber exceeded notify budget"
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
