//! Layer 3: Layouts
//!
//! A `Layout` is the canonicalized schema of an entity type: properties
//! sorted by name, types drawn from a closed tag set, identity given by a
//! 160-bit fingerprint over the canonical serialization. The fingerprint
//! deliberately excludes the type name: two types with identical schemas
//! share one fingerprint.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use super::codec::{read_varint, write_varint};
use super::error::LayoutError;
use super::identity::TypeName;

/// 160-bit content hash identifying a layout.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    pub const WIRE_LEN: usize = 20;

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// First 8 hex chars, for logs.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// Type tags of the canonical schema serialization.
pub(crate) const TAG_BOOL: u8 = 0x00;
pub(crate) const TAG_I8: u8 = 0x01;
pub(crate) const TAG_I16: u8 = 0x02;
pub(crate) const TAG_I32: u8 = 0x03;
pub(crate) const TAG_I64: u8 = 0x04;
pub(crate) const TAG_F32: u8 = 0x05;
pub(crate) const TAG_F64: u8 = 0x06;
pub(crate) const TAG_STR: u8 = 0x07;
pub(crate) const TAG_UUID: u8 = 0x08;
pub(crate) const TAG_BYTES: u8 = 0x09;
pub(crate) const TAG_LIST: u8 = 0x0a;
pub(crate) const TAG_MAP: u8 = 0x0b;
pub(crate) const TAG_OPTIONAL: u8 = 0x0c;
pub(crate) const TAG_LAYOUT_REF: u8 = 0x0d;

/// Closed set of property types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Str,
    Uuid,
    Bytes,
    List(Box<PropertyType>),
    Map(Box<PropertyType>, Box<PropertyType>),
    Optional(Box<PropertyType>),
    /// Reference to another layout by fingerprint. Self-reference is not
    /// expressible this way; recursive schemas go through `Uuid`.
    LayoutRef(Fingerprint),
}

impl PropertyType {
    pub fn list(elem: PropertyType) -> Self {
        PropertyType::List(Box::new(elem))
    }

    pub fn map(key: PropertyType, value: PropertyType) -> Self {
        PropertyType::Map(Box::new(key), Box::new(value))
    }

    pub fn optional(inner: PropertyType) -> Self {
        PropertyType::Optional(Box::new(inner))
    }

    pub fn nested(layout: &Layout) -> Self {
        PropertyType::LayoutRef(layout.fingerprint())
    }

    /// Human-readable tag, e.g. `map<str,i64>`.
    pub fn display_name(&self) -> String {
        match self {
            PropertyType::Bool => "bool".into(),
            PropertyType::I8 => "i8".into(),
            PropertyType::I16 => "i16".into(),
            PropertyType::I32 => "i32".into(),
            PropertyType::I64 => "i64".into(),
            PropertyType::F32 => "f32".into(),
            PropertyType::F64 => "f64".into(),
            PropertyType::Str => "str".into(),
            PropertyType::Uuid => "uuid".into(),
            PropertyType::Bytes => "bytes".into(),
            PropertyType::List(elem) => format!("list<{}>", elem.display_name()),
            PropertyType::Map(k, v) => {
                format!("map<{},{}>", k.display_name(), v.display_name())
            }
            PropertyType::Optional(inner) => format!("optional<{}>", inner.display_name()),
            PropertyType::LayoutRef(fp) => format!("layout<{}>", fp.short_hex()),
        }
    }

    /// Scalars are the only admissible map keys and index keys: sorted
    /// encodings and B-tree indices need a total order, which floats and
    /// composites do not give.
    pub(crate) fn is_scalar(&self) -> bool {
        matches!(
            self,
            PropertyType::Bool
                | PropertyType::I8
                | PropertyType::I16
                | PropertyType::I32
                | PropertyType::I64
                | PropertyType::Str
                | PropertyType::Uuid
                | PropertyType::Bytes
        )
    }

    fn validate(&self) -> Result<(), LayoutError> {
        match self {
            PropertyType::List(elem) | PropertyType::Optional(elem) => elem.validate(),
            PropertyType::Map(key, value) => {
                if !key.is_scalar() {
                    return Err(LayoutError::UnsupportedType {
                        context: "map key",
                        ty: key.display_name(),
                    });
                }
                value.validate()
            }
            _ => Ok(()),
        }
    }

    fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            PropertyType::Bool => out.push(TAG_BOOL),
            PropertyType::I8 => out.push(TAG_I8),
            PropertyType::I16 => out.push(TAG_I16),
            PropertyType::I32 => out.push(TAG_I32),
            PropertyType::I64 => out.push(TAG_I64),
            PropertyType::F32 => out.push(TAG_F32),
            PropertyType::F64 => out.push(TAG_F64),
            PropertyType::Str => out.push(TAG_STR),
            PropertyType::Uuid => out.push(TAG_UUID),
            PropertyType::Bytes => out.push(TAG_BYTES),
            PropertyType::List(elem) => {
                out.push(TAG_LIST);
                elem.write_canonical(out);
            }
            PropertyType::Map(key, value) => {
                out.push(TAG_MAP);
                key.write_canonical(out);
                value.write_canonical(out);
            }
            PropertyType::Optional(inner) => {
                out.push(TAG_OPTIONAL);
                inner.write_canonical(out);
            }
            PropertyType::LayoutRef(fp) => {
                out.push(TAG_LAYOUT_REF);
                out.extend_from_slice(fp.as_bytes());
            }
        }
    }

    fn read_canonical(buf: &mut &[u8]) -> Result<Self, LayoutError> {
        let tag = take_byte(buf)?;
        let ty = match tag {
            TAG_BOOL => PropertyType::Bool,
            TAG_I8 => PropertyType::I8,
            TAG_I16 => PropertyType::I16,
            TAG_I32 => PropertyType::I32,
            TAG_I64 => PropertyType::I64,
            TAG_F32 => PropertyType::F32,
            TAG_F64 => PropertyType::F64,
            TAG_STR => PropertyType::Str,
            TAG_UUID => PropertyType::Uuid,
            TAG_BYTES => PropertyType::Bytes,
            TAG_LIST => PropertyType::list(Self::read_canonical(buf)?),
            TAG_MAP => {
                let key = Self::read_canonical(buf)?;
                let value = Self::read_canonical(buf)?;
                PropertyType::Map(Box::new(key), Box::new(value))
            }
            TAG_OPTIONAL => PropertyType::optional(Self::read_canonical(buf)?),
            TAG_LAYOUT_REF => {
                if buf.len() < Fingerprint::WIRE_LEN {
                    return Err(LayoutError::MalformedSchema {
                        reason: "truncated layout reference".into(),
                    });
                }
                let mut fp = [0u8; 20];
                fp.copy_from_slice(&buf[..20]);
                *buf = &buf[20..];
                PropertyType::LayoutRef(Fingerprint::from_bytes(fp))
            }
            other => {
                return Err(LayoutError::MalformedSchema {
                    reason: format!("unknown type tag 0x{other:02x}"),
                });
            }
        };
        Ok(ty)
    }
}

fn take_byte(buf: &mut &[u8]) -> Result<u8, LayoutError> {
    let (&first, rest) = buf.split_first().ok_or_else(|| LayoutError::MalformedSchema {
        reason: "truncated schema".into(),
    })?;
    *buf = rest;
    Ok(first)
}

/// A named, typed property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    name: String,
    ty: PropertyType,
}

impl Property {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &PropertyType {
        &self.ty
    }
}

/// Canonicalized schema of an entity type.
#[derive(Clone, Debug)]
pub struct Layout {
    name: TypeName,
    properties: Vec<Property>,
    canonical: Vec<u8>,
    fingerprint: Fingerprint,
}

impl Layout {
    /// Properties sorted lexicographically by name. Payload encoding
    /// follows this order.
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn name(&self) -> &TypeName {
        &self.name
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The exact bytes the fingerprint hashes. Parseable back via
    /// [`Layout::from_canonical_bytes`]; persisted inside
    /// `EntityLayoutIntroduced` events.
    pub fn canonical_bytes(&self) -> &[u8] {
        &self.canonical
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties
            .binary_search_by(|p| p.name.as_str().cmp(name))
            .ok()
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.property_index(name).map(|i| &self.properties[i])
    }

    /// Reconstruct a layout from its canonical serialization, e.g. while
    /// recovering introductions from a journal. The name is not part of
    /// the canonical form and must be supplied by the caller.
    pub fn from_canonical_bytes(name: TypeName, bytes: &[u8]) -> Result<Arc<Layout>, LayoutError> {
        let mut cursor = bytes;
        let count = read_schema_varint(&mut cursor)?;
        // Every property costs at least two bytes (name length + tag).
        if count as usize > cursor.len() {
            return Err(LayoutError::MalformedSchema {
                reason: format!("property count {count} exceeds schema size"),
            });
        }
        let mut properties = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_len = read_schema_varint(&mut cursor)? as usize;
            if cursor.len() < name_len {
                return Err(LayoutError::MalformedSchema {
                    reason: "truncated property name".into(),
                });
            }
            let prop_name = std::str::from_utf8(&cursor[..name_len])
                .map_err(|_| LayoutError::MalformedSchema {
                    reason: "property name is not UTF-8".into(),
                })?
                .to_string();
            cursor = &cursor[name_len..];
            let ty = PropertyType::read_canonical(&mut cursor)?;
            properties.push(Property { name: prop_name, ty });
        }
        if !cursor.is_empty() {
            return Err(LayoutError::MalformedSchema {
                reason: format!("{} trailing bytes", cursor.len()),
            });
        }
        if !properties.windows(2).all(|w| w[0].name < w[1].name) {
            return Err(LayoutError::MalformedSchema {
                reason: "properties not in sorted order".into(),
            });
        }
        Ok(Arc::new(Layout {
            name,
            properties,
            canonical: bytes.to_vec(),
            fingerprint: fingerprint_of(bytes),
        }))
    }
}

fn read_schema_varint(buf: &mut &[u8]) -> Result<u64, LayoutError> {
    let mut slice = *buf;
    let value = read_varint(&mut slice, "schema").map_err(|_| LayoutError::MalformedSchema {
        reason: "truncated varint".into(),
    })?;
    *buf = slice;
    Ok(value)
}

fn fingerprint_of(canonical: &[u8]) -> Fingerprint {
    let mut hasher = Sha1::new();
    hasher.update(canonical);
    Fingerprint::from_bytes(hasher.finalize().into())
}

/// Explicit schema builder.
///
/// The application declares named properties in any order; `finish`
/// canonicalizes, validates and fingerprints them.
pub struct LayoutBuilder {
    name: TypeName,
    properties: Vec<Property>,
}

impl LayoutBuilder {
    pub fn new(name: TypeName) -> Self {
        Self {
            name,
            properties: Vec::new(),
        }
    }

    pub fn property(mut self, name: impl Into<String>, ty: PropertyType) -> Self {
        self.properties.push(Property {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn finish(self) -> Result<Arc<Layout>, LayoutError> {
        let mut properties = self.properties;
        for prop in &properties {
            if prop.name.is_empty() {
                return Err(LayoutError::InvalidProperty {
                    name: prop.name.clone(),
                    reason: "empty".into(),
                });
            }
            prop.ty.validate()?;
        }
        properties.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(dup) = properties.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(LayoutError::DuplicateProperty {
                name: dup[0].name.clone(),
            });
        }

        let mut canonical = Vec::new();
        write_varint(&mut canonical, properties.len() as u64);
        for prop in &properties {
            write_varint(&mut canonical, prop.name.len() as u64);
            canonical.extend_from_slice(prop.name.as_bytes());
            prop.ty.write_canonical(&mut canonical);
        }
        let fingerprint = fingerprint_of(&canonical);

        Ok(Arc::new(Layout {
            name: self.name,
            properties,
            canonical,
            fingerprint,
        }))
    }
}

/// Process-wide layout cache keyed by fingerprint.
///
/// Read-mostly: readers grab an `Arc` snapshot; registration copies the
/// table under the single writer lock.
pub struct LayoutRegistry {
    inner: RwLock<LayoutSnapshot>,
}

pub type LayoutSnapshot = Arc<HashMap<Fingerprint, Arc<Layout>>>;

impl LayoutRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn snapshot(&self) -> LayoutSnapshot {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, fingerprint: Fingerprint) -> Option<Arc<Layout>> {
        self.snapshot().get(&fingerprint).cloned()
    }

    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.snapshot().contains_key(&fingerprint)
    }

    /// Register a layout. Returns `false` if the fingerprint was already
    /// present (re-registration is a no-op, not an error).
    ///
    /// Every `layout<ref>` must resolve to an already-registered layout;
    /// a reference to the layout's own fingerprint is a cycle.
    pub fn register(&self, layout: Arc<Layout>) -> Result<bool, LayoutError> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&layout.fingerprint()) {
            return Ok(false);
        }
        for prop in layout.properties() {
            check_refs(prop.ty(), &layout, &guard)?;
        }
        let mut next: HashMap<_, _> = (**guard).clone();
        next.insert(layout.fingerprint(), layout);
        *guard = Arc::new(next);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl Default for LayoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn check_refs(
    ty: &PropertyType,
    layout: &Layout,
    registered: &LayoutSnapshot,
) -> Result<(), LayoutError> {
    match ty {
        PropertyType::List(elem) | PropertyType::Optional(elem) => {
            check_refs(elem, layout, registered)
        }
        PropertyType::Map(key, value) => {
            check_refs(key, layout, registered)?;
            check_refs(value, layout, registered)
        }
        PropertyType::LayoutRef(fp) => {
            if *fp == layout.fingerprint() {
                return Err(LayoutError::CyclicLayout {
                    name: layout.name().to_string(),
                    fingerprint: *fp,
                });
            }
            if !registered.contains_key(fp) {
                return Err(LayoutError::UnknownReference { fingerprint: *fp });
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
