//! Layer 4: Binary codec
//!
//! Fixed, endian-stable encodings per type tag. The contract is
//! determinism both ways: encoding a value twice yields identical bytes,
//! and decode followed by encode is the identity. Maps are emitted in
//! sorted key order; varints must be minimal; optionals carry exactly one
//! presence byte.

use std::cmp::Ordering;

use bytes::{Buf, BufMut};

use super::error::CodecError;
use super::layout::{Fingerprint, Layout, LayoutSnapshot, PropertyType};
use super::value::{Value, scalar_cmp};

/// Unsigned LEB128.
pub(crate) fn write_varint(out: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.put_u8(byte);
            return;
        }
        out.put_u8(byte | 0x80);
    }
}

/// Minimal-form unsigned LEB128. Non-minimal encodings are rejected so
/// that decode∘encode stays the identity.
pub(crate) fn read_varint(buf: &mut impl Buf, context: &'static str) -> Result<u64, CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        need(buf, 1, context)?;
        let byte = buf.get_u8();
        if shift > 0 && byte == 0 {
            return Err(CodecError::InvariantViolated {
                reason: format!("non-minimal varint in {context}"),
            });
        }
        if shift == 63 && byte > 1 {
            return Err(CodecError::InvariantViolated {
                reason: format!("varint overflow in {context}"),
            });
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(CodecError::InvariantViolated {
                reason: format!("varint overflow in {context}"),
            });
        }
    }
}

fn need(buf: &impl Buf, n: usize, context: &'static str) -> Result<(), CodecError> {
    let remaining = buf.remaining();
    if remaining < n {
        return Err(CodecError::Truncated {
            context,
            needed: n - remaining,
        });
    }
    Ok(())
}

/// Encode an entity payload: one value per layout property, in layout
/// (sorted-name) order.
pub fn encode_payload(
    layout: &Layout,
    values: &[Value],
    layouts: &LayoutSnapshot,
) -> Result<Vec<u8>, CodecError> {
    if values.len() != layout.properties().len() {
        return Err(CodecError::InvariantViolated {
            reason: format!(
                "layout `{}` has {} properties, got {} values",
                layout.name(),
                layout.properties().len(),
                values.len()
            ),
        });
    }
    let mut out = Vec::new();
    for (prop, value) in layout.properties().iter().zip(values) {
        encode_value(&mut out, value, prop.ty(), layouts)?;
    }
    Ok(out)
}

/// Decode an entity payload against a layout. Trailing bytes are an
/// invariant violation: a payload is exactly its property values.
pub fn decode_payload(
    layout: &Layout,
    bytes: &[u8],
    layouts: &LayoutSnapshot,
) -> Result<Vec<Value>, CodecError> {
    let mut buf = bytes;
    let mut values = Vec::with_capacity(layout.properties().len());
    for prop in layout.properties() {
        values.push(decode_value(&mut buf, prop.ty(), layouts)?);
    }
    if buf.has_remaining() {
        return Err(CodecError::InvariantViolated {
            reason: format!("{} trailing payload bytes", buf.remaining()),
        });
    }
    Ok(values)
}

fn type_mismatch(expected: &PropertyType, got: &Value) -> CodecError {
    CodecError::InvariantViolated {
        reason: format!(
            "expected {}, got {}",
            expected.display_name(),
            got.kind()
        ),
    }
}

fn encode_value(
    out: &mut Vec<u8>,
    value: &Value,
    ty: &PropertyType,
    layouts: &LayoutSnapshot,
) -> Result<(), CodecError> {
    match (ty, value) {
        (PropertyType::Bool, Value::Bool(v)) => out.put_u8(u8::from(*v)),
        (PropertyType::I8, Value::I8(v)) => out.put_i8(*v),
        (PropertyType::I16, Value::I16(v)) => out.put_i16(*v),
        (PropertyType::I32, Value::I32(v)) => out.put_i32(*v),
        (PropertyType::I64, Value::I64(v)) => out.put_i64(*v),
        (PropertyType::F32, Value::F32(v)) => out.put_f32(*v),
        (PropertyType::F64, Value::F64(v)) => out.put_f64(*v),
        (PropertyType::Str, Value::Str(v)) => {
            write_varint(out, v.len() as u64);
            out.extend_from_slice(v.as_bytes());
        }
        (PropertyType::Uuid, Value::Uuid(v)) => out.extend_from_slice(v.as_bytes()),
        (PropertyType::Bytes, Value::Bytes(v)) => {
            write_varint(out, v.len() as u64);
            out.extend_from_slice(v);
        }
        (PropertyType::List(elem), Value::List(items)) => {
            write_varint(out, items.len() as u64);
            for item in items {
                encode_value(out, item, elem, layouts)?;
            }
        }
        (PropertyType::Map(key_ty, value_ty), Value::Map(entries)) => {
            let mut sorted: Vec<&(Value, Value)> = entries.iter().collect();
            sorted.sort_by(|a, b| {
                scalar_cmp(&a.0, &b.0).unwrap_or(Ordering::Equal)
            });
            for pair in sorted.windows(2) {
                match scalar_cmp(&pair[0].0, &pair[1].0) {
                    Some(Ordering::Equal) => {
                        return Err(CodecError::InvariantViolated {
                            reason: "duplicate map key".into(),
                        });
                    }
                    None => {
                        return Err(CodecError::InvariantViolated {
                            reason: "map keys are not comparable scalars".into(),
                        });
                    }
                    _ => {}
                }
            }
            write_varint(out, sorted.len() as u64);
            for (k, v) in sorted {
                encode_value(out, k, key_ty, layouts)?;
                encode_value(out, v, value_ty, layouts)?;
            }
        }
        (PropertyType::Optional(inner), Value::Optional(opt)) => match opt {
            Some(v) => {
                out.put_u8(1);
                encode_value(out, v, inner, layouts)?;
            }
            None => out.put_u8(0),
        },
        (PropertyType::LayoutRef(expected_fp), Value::Nested(fp, values)) => {
            if fp != expected_fp {
                return Err(CodecError::InvariantViolated {
                    reason: format!(
                        "nested value has fingerprint {fp}, layout expects {expected_fp}"
                    ),
                });
            }
            let nested = layouts
                .get(fp)
                .ok_or(CodecError::UnknownFingerprint { fingerprint: *fp })?;
            if values.len() != nested.properties().len() {
                return Err(CodecError::InvariantViolated {
                    reason: format!(
                        "nested layout `{}` has {} properties, got {} values",
                        nested.name(),
                        nested.properties().len(),
                        values.len()
                    ),
                });
            }
            out.extend_from_slice(fp.as_bytes());
            for (prop, value) in nested.properties().iter().zip(values) {
                encode_value(out, value, prop.ty(), layouts)?;
            }
        }
        (expected, got) => return Err(type_mismatch(expected, got)),
    }
    Ok(())
}

fn decode_value(
    buf: &mut &[u8],
    ty: &PropertyType,
    layouts: &LayoutSnapshot,
) -> Result<Value, CodecError> {
    let value = match ty {
        PropertyType::Bool => {
            need(buf, 1, "bool")?;
            match buf.get_u8() {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(CodecError::InvariantViolated {
                        reason: format!("malformed bool byte 0x{other:02x}"),
                    });
                }
            }
        }
        PropertyType::I8 => {
            need(buf, 1, "i8")?;
            Value::I8(buf.get_i8())
        }
        PropertyType::I16 => {
            need(buf, 2, "i16")?;
            Value::I16(buf.get_i16())
        }
        PropertyType::I32 => {
            need(buf, 4, "i32")?;
            Value::I32(buf.get_i32())
        }
        PropertyType::I64 => {
            need(buf, 8, "i64")?;
            Value::I64(buf.get_i64())
        }
        PropertyType::F32 => {
            need(buf, 4, "f32")?;
            Value::F32(buf.get_f32())
        }
        PropertyType::F64 => {
            need(buf, 8, "f64")?;
            Value::F64(buf.get_f64())
        }
        PropertyType::Str => {
            let len = read_varint(buf, "str length")? as usize;
            need(buf, len, "str")?;
            let s = std::str::from_utf8(&buf[..len]).map_err(|_| {
                CodecError::InvariantViolated {
                    reason: "string is not UTF-8".into(),
                }
            })?;
            let value = Value::Str(s.to_string());
            buf.advance(len);
            value
        }
        PropertyType::Uuid => {
            need(buf, 16, "uuid")?;
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&buf[..16]);
            buf.advance(16);
            Value::Uuid(uuid::Uuid::from_bytes(raw))
        }
        PropertyType::Bytes => {
            let len = read_varint(buf, "bytes length")? as usize;
            need(buf, len, "bytes")?;
            let value = Value::Bytes(buf[..len].to_vec());
            buf.advance(len);
            value
        }
        PropertyType::List(elem) => {
            let count = read_varint(buf, "list length")? as usize;
            // Every element costs at least one byte.
            need(buf, count, "list")?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(buf, elem, layouts)?);
            }
            Value::List(items)
        }
        PropertyType::Map(key_ty, value_ty) => {
            let count = read_varint(buf, "map length")? as usize;
            need(buf, count, "map")?;
            let mut entries: Vec<(Value, Value)> = Vec::with_capacity(count);
            for _ in 0..count {
                let key = decode_value(buf, key_ty, layouts)?;
                if let Some(last) = entries.last()
                    && !matches!(
                        scalar_cmp(&last.0, &key),
                        Some(Ordering::Less)
                    )
                {
                    return Err(CodecError::InvariantViolated {
                        reason: "map keys not in strict sorted order".into(),
                    });
                }
                let value = decode_value(buf, value_ty, layouts)?;
                entries.push((key, value));
            }
            Value::Map(entries)
        }
        PropertyType::Optional(inner) => {
            need(buf, 1, "optional")?;
            match buf.get_u8() {
                0 => Value::Optional(None),
                1 => Value::some(decode_value(buf, inner, layouts)?),
                other => {
                    return Err(CodecError::InvariantViolated {
                        reason: format!("malformed presence byte 0x{other:02x}"),
                    });
                }
            }
        }
        PropertyType::LayoutRef(expected_fp) => {
            need(buf, Fingerprint::WIRE_LEN, "layout reference")?;
            let mut raw = [0u8; 20];
            raw.copy_from_slice(&buf[..20]);
            buf.advance(20);
            let fp = Fingerprint::from_bytes(raw);
            if fp != *expected_fp {
                return Err(CodecError::InvariantViolated {
                    reason: format!(
                        "nested value has fingerprint {fp}, layout expects {expected_fp}"
                    ),
                });
            }
            let nested = layouts
                .get(&fp)
                .ok_or(CodecError::UnknownFingerprint { fingerprint: fp })?;
            let mut values = Vec::with_capacity(nested.properties().len());
            for prop in nested.properties() {
                values.push(decode_value(buf, prop.ty(), layouts)?);
            }
            Value::Nested(fp, values)
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::TypeName;
    use crate::core::layout::{LayoutBuilder, LayoutRegistry};
    use std::sync::Arc;
    use uuid::Uuid;

    fn empty_snapshot() -> LayoutSnapshot {
        LayoutRegistry::new().snapshot()
    }

    fn layout_of(props: &[(&str, PropertyType)]) -> Arc<Layout> {
        let mut builder = LayoutBuilder::new(TypeName::new("T").unwrap());
        for (name, ty) in props {
            builder = builder.property(*name, ty.clone());
        }
        builder.finish().unwrap()
    }

    fn roundtrip(layout: &Layout, values: Vec<Value>) {
        let layouts = empty_snapshot();
        let bytes = encode_payload(layout, &values, &layouts).unwrap();
        let decoded = decode_payload(layout, &bytes, &layouts).unwrap();
        assert_eq!(decoded, values);
        let re_encoded = encode_payload(layout, &decoded, &layouts).unwrap();
        assert_eq!(re_encoded, bytes);
    }

    #[test]
    fn varint_roundtrip_and_minimality() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            let mut buf = out.as_slice();
            assert_eq!(read_varint(&mut buf, "test").unwrap(), value);
            assert!(buf.is_empty());
        }
        // 0x80 0x00 is a non-minimal zero.
        let mut buf: &[u8] = &[0x80, 0x00];
        assert!(matches!(
            read_varint(&mut buf, "test"),
            Err(CodecError::InvariantViolated { .. })
        ));
    }

    #[test]
    fn scalar_roundtrips() {
        let layout = layout_of(&[
            ("a", PropertyType::Bool),
            ("b", PropertyType::I8),
            ("c", PropertyType::I16),
            ("d", PropertyType::I32),
            ("e", PropertyType::I64),
            ("f", PropertyType::F32),
            ("g", PropertyType::F64),
            ("h", PropertyType::Str),
            ("i", PropertyType::Uuid),
            ("j", PropertyType::Bytes),
        ]);
        roundtrip(
            &layout,
            vec![
                Value::Bool(true),
                Value::I8(-5),
                Value::I16(-1234),
                Value::I32(7),
                Value::I64(i64::MIN),
                Value::F32(1.5),
                Value::F64(-0.25),
                Value::Str("héllo".into()),
                Value::Uuid(Uuid::new_v4()),
                Value::Bytes(vec![0, 255, 3]),
            ],
        );
    }

    #[test]
    fn integers_are_big_endian() {
        let layout = layout_of(&[("n", PropertyType::I32)]);
        let bytes =
            encode_payload(&layout, &[Value::I32(0x0102_0304)], &empty_snapshot()).unwrap();
        assert_eq!(bytes, [0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn map_encoding_is_order_independent() {
        let layout = layout_of(&[(
            "m",
            PropertyType::map(PropertyType::Str, PropertyType::I32),
        )]);
        let layouts = empty_snapshot();
        let forward = Value::Map(vec![
            (Value::Str("a".into()), Value::I32(1)),
            (Value::Str("b".into()), Value::I32(2)),
        ]);
        let backward = Value::Map(vec![
            (Value::Str("b".into()), Value::I32(2)),
            (Value::Str("a".into()), Value::I32(1)),
        ]);
        let a = encode_payload(&layout, &[forward], &layouts).unwrap();
        let b = encode_payload(&layout, &[backward], &layouts).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_map_keys_rejected() {
        let layout = layout_of(&[(
            "m",
            PropertyType::map(PropertyType::Str, PropertyType::I32),
        )]);
        let dup = Value::Map(vec![
            (Value::Str("a".into()), Value::I32(1)),
            (Value::Str("a".into()), Value::I32(2)),
        ]);
        let err = encode_payload(&layout, &[dup], &empty_snapshot()).unwrap_err();
        assert!(matches!(err, CodecError::InvariantViolated { .. }));
    }

    #[test]
    fn unsorted_map_bytes_rejected_on_decode() {
        let layout = layout_of(&[(
            "m",
            PropertyType::map(PropertyType::I8, PropertyType::Bool),
        )]);
        let layouts = empty_snapshot();
        let sorted = Value::Map(vec![
            (Value::I8(1), Value::Bool(true)),
            (Value::I8(2), Value::Bool(false)),
        ]);
        let mut bytes = encode_payload(&layout, &[sorted], &layouts).unwrap();
        // Swap the two entries: [count, k1, v1, k2, v2].
        bytes.swap(1, 3);
        bytes.swap(2, 4);
        let err = decode_payload(&layout, &bytes, &layouts).unwrap_err();
        assert!(matches!(err, CodecError::InvariantViolated { .. }));
    }

    #[test]
    fn optional_roundtrip_and_malformed_presence() {
        let layout = layout_of(&[("o", PropertyType::optional(PropertyType::I32))]);
        roundtrip(&layout, vec![Value::some(Value::I32(9))]);
        roundtrip(&layout, vec![Value::none()]);

        let err = decode_payload(&layout, &[2], &empty_snapshot()).unwrap_err();
        assert!(matches!(err, CodecError::InvariantViolated { .. }));
    }

    #[test]
    fn truncated_input_reports_needed_bytes() {
        let layout = layout_of(&[("n", PropertyType::I64)]);
        let err = decode_payload(&layout, &[0, 0], &empty_snapshot()).unwrap_err();
        match err {
            CodecError::Truncated { needed, .. } => assert_eq!(needed, 6),
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn nested_layout_roundtrip() {
        let registry = LayoutRegistry::new();
        let inner = layout_of(&[("x", PropertyType::I32)]);
        registry.register(inner.clone()).unwrap();
        let outer = LayoutBuilder::new(TypeName::new("Outer").unwrap())
            .property("child", PropertyType::nested(&inner))
            .finish()
            .unwrap();
        registry.register(outer.clone()).unwrap();
        let layouts = registry.snapshot();

        let value = Value::Nested(inner.fingerprint(), vec![Value::I32(42)]);
        let bytes = encode_payload(&outer, &[value.clone()], &layouts).unwrap();
        assert_eq!(
            &bytes[..Fingerprint::WIRE_LEN],
            inner.fingerprint().as_bytes()
        );
        let decoded = decode_payload(&outer, &bytes, &layouts).unwrap();
        assert_eq!(decoded, vec![value]);
    }

    #[test]
    fn nested_unknown_fingerprint() {
        let inner = layout_of(&[("x", PropertyType::I32)]);
        let outer = LayoutBuilder::new(TypeName::new("Outer").unwrap())
            .property("child", PropertyType::nested(&inner))
            .finish()
            .unwrap();
        let value = Value::Nested(inner.fingerprint(), vec![Value::I32(42)]);
        // Snapshot without the inner layout registered.
        let err = encode_payload(&outer, &[value], &empty_snapshot()).unwrap_err();
        assert!(matches!(err, CodecError::UnknownFingerprint { .. }));
    }

    #[test]
    fn type_mismatch_is_invariant_violation() {
        let layout = layout_of(&[("n", PropertyType::I32)]);
        let err =
            encode_payload(&layout, &[Value::Str("no".into())], &empty_snapshot()).unwrap_err();
        assert!(matches!(err, CodecError::InvariantViolated { .. }));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let layout = layout_of(&[("b", PropertyType::Bool)]);
        let err = decode_payload(&layout, &[1, 0], &empty_snapshot()).unwrap_err();
        assert!(matches!(err, CodecError::InvariantViolated { .. }));
    }
}
