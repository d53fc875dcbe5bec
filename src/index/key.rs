use crate::core::error::{Error, Result};
use crate::core::numeric::NumericValue;
use crate::core::types::Value;

// Class bytes order the value space: absent < numeric < text < guid <
// timestamp < raw bytes. Within the numeric class every kind is normalized
// to an order-preserving f64 image, the same promotion rule deserialization
// uses, so historical data written with mixed numeric tags sorts
// consistently.
const CLASS_NULL: u8 = 0x00;
const CLASS_NUMERIC: u8 = 0x10;
const CLASS_STRING: u8 = 0x20;
const CLASS_GUID: u8 = 0x30;
const CLASS_DATETIME: u8 = 0x40;
const CLASS_BYTES: u8 = 0x50;

/// f64 bits rearranged so that unsigned byte comparison follows numeric
/// order (negative values invert, positives set the sign bit).
fn ordered_f64(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let ordered = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    ordered.to_be_bytes()
}

fn ordered_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

/// Append text/bytes with `0x00` escaped as `0x00 0x01` and a `0x00 0x00`
/// terminator, keeping lexicographic order across different lengths.
fn push_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0x00 {
            out.push(0x00);
            out.push(0x01);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
}

/// Append one field's order-preserving encoding. A descending field is
/// byte-complemented, which exactly inverts its ordering.
pub fn encode_field(out: &mut Vec<u8>, value: Option<&Value>, descending: bool) -> Result<()> {
    let start = out.len();
    match value {
        None | Some(Value::Null) => out.push(CLASS_NULL),
        Some(value) => match value {
            Value::Null => out.push(CLASS_NULL),
            Value::Boolean(_)
            | Value::Byte(_)
            | Value::SByte(_)
            | Value::Int16(_)
            | Value::UInt16(_)
            | Value::Int32(_)
            | Value::UInt32(_)
            | Value::Int64(_)
            | Value::UInt64(_)
            | Value::Single(_)
            | Value::Double(_)
            | Value::Decimal(_)
            | Value::TimeSpan(_) => {
                let numeric = NumericValue::from_value(value)
                    .expect("numeric variants lift to NumericValue");
                out.push(CLASS_NUMERIC);
                out.extend_from_slice(&ordered_f64(numeric.as_f64()));
            }
            Value::Char(c) => {
                out.push(CLASS_STRING);
                let mut buf = [0u8; 4];
                push_escaped(out, c.encode_utf8(&mut buf).as_bytes());
            }
            Value::String(s) | Value::Enum(s) => {
                out.push(CLASS_STRING);
                push_escaped(out, s.as_bytes());
            }
            Value::Guid(g) => {
                out.push(CLASS_GUID);
                out.extend_from_slice(g.as_bytes());
            }
            Value::DateTime(dt) => {
                out.push(CLASS_DATETIME);
                out.extend_from_slice(&ordered_i64(dt.timestamp_millis()));
            }
            Value::ByteArray(b) => {
                out.push(CLASS_BYTES);
                push_escaped(out, b);
            }
            Value::Object(_) => {
                return Err(Error::invalid_argument("nested objects cannot be indexed"));
            }
        },
    }
    if descending {
        for b in &mut out[start..] {
            *b = !*b;
        }
    }
    Ok(())
}

/// Advance past one encoded field, honoring its direction. Returns the
/// position after the field.
pub fn skip_field(data: &[u8], pos: usize, descending: bool) -> Result<usize> {
    let read = |p: usize| -> Result<u8> {
        data.get(p)
            .map(|&b| if descending { !b } else { b })
            .ok_or_else(|| Error::corrupt("truncated index key"))
    };

    let class = read(pos)?;
    match class {
        CLASS_NULL => Ok(pos + 1),
        CLASS_NUMERIC | CLASS_DATETIME => Ok(pos + 9),
        CLASS_GUID => Ok(pos + 17),
        CLASS_STRING | CLASS_BYTES => {
            let mut p = pos + 1;
            loop {
                if read(p)? != 0x00 {
                    p += 1;
                    continue;
                }
                let marker = read(p + 1)?;
                p += 2;
                if marker == 0x00 {
                    return Ok(p);
                }
            }
        }
        other => Err(Error::corrupt(format!("unknown key class {:#x}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn encoded(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        encode_field(&mut out, Some(value), false).unwrap();
        out
    }

    #[test]
    fn numeric_kinds_share_one_order() {
        // Mixed historical kinds must interleave by numeric value.
        let values = vec![
            Value::Int64(-10),
            Value::Single(-1.5),
            Value::Boolean(false),
            Value::Byte(1),
            Value::Double(1.5),
            Value::UInt32(7),
            Value::Decimal(100.25),
            Value::UInt64(1000),
        ];
        let mut keys: Vec<Vec<u8>> = values.iter().map(encoded).collect();
        let sorted = keys.clone();
        keys.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn strings_order_with_embedded_zeros() {
        let a = encoded(&Value::String("a".into()));
        let a0 = encoded(&Value::String("a\0".into()));
        let ab = encoded(&Value::String("ab".into()));
        let b = encoded(&Value::String("b".into()));
        assert!(a < a0);
        assert!(a0 < ab);
        assert!(ab < b);
    }

    #[test]
    fn null_sorts_before_everything() {
        let mut null_key = Vec::new();
        encode_field(&mut null_key, None, false).unwrap();
        assert!(null_key < encoded(&Value::Int64(i64::MIN)));
        assert!(null_key < encoded(&Value::String(String::new())));
    }

    #[test]
    fn descending_inverts_order() {
        let mut low = Vec::new();
        let mut high = Vec::new();
        encode_field(&mut low, Some(&Value::Int32(1)), true).unwrap();
        encode_field(&mut high, Some(&Value::Int32(2)), true).unwrap();
        assert!(high < low);
    }

    #[test]
    fn skip_field_walks_every_class() {
        let ts = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let values = vec![
            Some(Value::Int32(5)),
            None,
            Some(Value::String("with\0zero".into())),
            Some(Value::Guid(uuid::Uuid::new_v4())),
            Some(Value::DateTime(ts)),
            Some(Value::ByteArray(vec![1, 0, 2])),
        ];
        for descending in [false, true] {
            let mut out = Vec::new();
            let mut bounds = Vec::new();
            for value in &values {
                encode_field(&mut out, value.as_ref(), descending).unwrap();
                bounds.push(out.len());
            }
            let mut pos = 0;
            for expected in bounds {
                pos = skip_field(&out, pos, descending).unwrap();
                assert_eq!(pos, expected);
            }
        }
    }

    #[test]
    fn truncated_key_is_corrupt() {
        let key = encoded(&Value::String("abc".into()));
        let err = skip_field(&key[..2], 0, false).unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::CorruptRecord);
    }
}
