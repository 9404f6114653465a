//! In-memory index engine.
//!
//! Collections are guarded by one read-write lock; attribute indices are
//! B-trees over scalar keys. Optional attributes index their inner value;
//! absent values simply stay out of the index.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::core::{
    EntityId, EntityRecord, Fingerprint, Layout, PropertyType, ScalarValue, Value,
};

use super::{IndexEngine, IndexError, IndexOutcome};

struct TypeCollection {
    layout: Arc<Layout>,
    records: Vec<EntityRecord>,
    by_id: HashMap<EntityId, usize>,
    indices: BTreeMap<String, BTreeMap<ScalarValue, Vec<usize>>>,
}

impl TypeCollection {
    fn new(layout: Arc<Layout>) -> Self {
        Self {
            layout,
            records: Vec::new(),
            by_id: HashMap::new(),
            indices: BTreeMap::new(),
        }
    }

    fn insert(&mut self, record: EntityRecord) {
        if self.by_id.contains_key(&record.id()) {
            return;
        }
        let pos = self.records.len();
        self.by_id.insert(record.id(), pos);
        for (attribute, index) in &mut self.indices {
            if let Some(key) = index_key(record.property(attribute)) {
                index.entry(key).or_default().push(pos);
            }
        }
        self.records.push(record);
    }
}

/// Index key of a property value: the scalar itself, or the inner scalar
/// of a present optional.
fn index_key(value: Option<&Value>) -> Option<ScalarValue> {
    match value? {
        Value::Optional(Some(inner)) => ScalarValue::from_value(inner),
        Value::Optional(None) => None,
        other => ScalarValue::from_value(other),
    }
}

/// The type an index over `ty` keys on, if any.
fn indexable(ty: &PropertyType) -> bool {
    match ty {
        PropertyType::Optional(inner) => inner.is_scalar(),
        other => other.is_scalar(),
    }
}

/// Process-local index engine.
pub struct MemoryIndexEngine {
    inner: RwLock<HashMap<Fingerprint, TypeCollection>>,
}

impl MemoryIndexEngine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryIndexEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexEngine for MemoryIndexEngine {
    fn register_collection(&self, layout: &Arc<Layout>) -> Result<(), IndexError> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(layout.fingerprint())
            .or_insert_with(|| TypeCollection::new(layout.clone()));
        Ok(())
    }

    fn try_add_index(
        &self,
        fingerprint: Fingerprint,
        attribute: &str,
    ) -> Result<IndexOutcome, IndexError> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let collection = guard
            .get_mut(&fingerprint)
            .ok_or(IndexError::UnknownCollection { fingerprint })?;
        if collection.indices.contains_key(attribute) {
            return Ok(IndexOutcome::AlreadyPresent);
        }
        let prop = collection.layout.property(attribute).ok_or_else(|| {
            IndexError::UnknownAttribute {
                attribute: attribute.to_string(),
                layout: collection.layout.name().to_string(),
            }
        })?;
        if !indexable(prop.ty()) {
            return Err(IndexError::UnsupportedAttribute {
                attribute: attribute.to_string(),
                ty: prop.ty().display_name(),
            });
        }

        let mut index: BTreeMap<ScalarValue, Vec<usize>> = BTreeMap::new();
        for (pos, record) in collection.records.iter().enumerate() {
            if let Some(key) = index_key(record.property(attribute)) {
                index.entry(key).or_default().push(pos);
            }
        }
        collection.indices.insert(attribute.to_string(), index);
        Ok(IndexOutcome::Added)
    }

    fn add_to_collection(&self, record: &EntityRecord) -> Result<(), IndexError> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let collection = guard
            .entry(record.fingerprint())
            .or_insert_with(|| TypeCollection::new(record.layout().clone()));
        collection.insert(record.clone());
        Ok(())
    }

    fn count(&self, fingerprint: Fingerprint) -> usize {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.get(&fingerprint).map_or(0, |c| c.records.len())
    }

    fn get(&self, fingerprint: Fingerprint, id: EntityId) -> Option<EntityRecord> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let collection = guard.get(&fingerprint)?;
        collection
            .by_id
            .get(&id)
            .map(|&pos| collection.records[pos].clone())
    }

    fn records(&self, fingerprint: Fingerprint) -> Vec<EntityRecord> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard
            .get(&fingerprint)
            .map_or_else(Vec::new, |c| c.records.clone())
    }

    fn find_equal(
        &self,
        fingerprint: Fingerprint,
        attribute: &str,
        value: &Value,
    ) -> Result<Vec<EntityRecord>, IndexError> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let collection = guard
            .get(&fingerprint)
            .ok_or(IndexError::UnknownCollection { fingerprint })?;
        if collection.layout.property(attribute).is_none() {
            return Err(IndexError::UnknownAttribute {
                attribute: attribute.to_string(),
                layout: collection.layout.name().to_string(),
            });
        }

        let Some(key) = index_key(Some(value)) else {
            return Err(IndexError::UnsupportedAttribute {
                attribute: attribute.to_string(),
                ty: value.kind().to_string(),
            });
        };

        if let Some(index) = collection.indices.get(attribute) {
            let hits = index.get(&key).map_or_else(Vec::new, |positions| {
                positions
                    .iter()
                    .map(|&pos| collection.records[pos].clone())
                    .collect()
            });
            return Ok(hits);
        }

        tracing::debug!(attribute, "equality query without a declared index, scanning");
        Ok(collection
            .records
            .iter()
            .filter(|r| index_key(r.property(attribute)).as_ref() == Some(&key))
            .cloned()
            .collect())
    }
}
