use std::cmp::Ordering;
use crate::core::error::{Error, Result};
use crate::core::types::{FieldKind, Value};

/// Numeric value lifted out of a [`Value`] for promotion and comparison.
///
/// Conversions between stored and in-memory numeric kinds go through this
/// union with explicit range checks; a value that cannot be represented in
/// the target kind is a corrupt record, not a silent truncation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl NumericValue {
    /// Lift a value into numeric form. Booleans map to 0/1, strings are
    /// parsed; non-numeric values yield `None`.
    pub fn from_value(value: &Value) -> Option<NumericValue> {
        match value {
            Value::Boolean(b) => Some(NumericValue::Unsigned(*b as u64)),
            Value::Byte(v) => Some(NumericValue::Unsigned(*v as u64)),
            Value::UInt16(v) => Some(NumericValue::Unsigned(*v as u64)),
            Value::UInt32(v) => Some(NumericValue::Unsigned(*v as u64)),
            Value::UInt64(v) => Some(NumericValue::Unsigned(*v)),
            Value::SByte(v) => Some(NumericValue::Signed(*v as i64)),
            Value::Int16(v) => Some(NumericValue::Signed(*v as i64)),
            Value::Int32(v) => Some(NumericValue::Signed(*v as i64)),
            Value::Int64(v) => Some(NumericValue::Signed(*v)),
            Value::Single(v) => Some(NumericValue::Float(*v as f64)),
            Value::Double(v) => Some(NumericValue::Float(*v)),
            Value::Decimal(v) => Some(NumericValue::Float(*v)),
            Value::TimeSpan(v) => Some(NumericValue::Signed(*v)),
            Value::String(s) => {
                if let Ok(i) = s.parse::<i64>() {
                    Some(NumericValue::Signed(i))
                } else if let Ok(u) = s.parse::<u64>() {
                    Some(NumericValue::Unsigned(u))
                } else {
                    s.parse::<f64>().ok().map(NumericValue::Float)
                }
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            NumericValue::Signed(v) => *v as f64,
            NumericValue::Unsigned(v) => *v as f64,
            NumericValue::Float(v) => *v,
        }
    }

    fn to_i64(&self) -> Result<i64> {
        match self {
            NumericValue::Signed(v) => Ok(*v),
            NumericValue::Unsigned(v) => i64::try_from(*v)
                .map_err(|_| Error::corrupt(format!("{} does not fit in i64", v))),
            NumericValue::Float(v) => {
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v <= i64::MAX as f64 {
                    Ok(*v as i64)
                } else {
                    Err(Error::corrupt(format!("{} does not fit in i64", v)))
                }
            }
        }
    }

    fn to_u64(&self) -> Result<u64> {
        match self {
            NumericValue::Unsigned(v) => Ok(*v),
            NumericValue::Signed(v) => u64::try_from(*v)
                .map_err(|_| Error::corrupt(format!("{} does not fit in u64", v))),
            NumericValue::Float(v) => {
                if v.fract() == 0.0 && *v >= 0.0 && *v <= u64::MAX as f64 {
                    Ok(*v as u64)
                } else {
                    Err(Error::corrupt(format!("{} does not fit in u64", v)))
                }
            }
        }
    }

    /// Narrow or widen into the requested numeric kind.
    pub fn to_kind(&self, kind: FieldKind) -> Result<Value> {
        fn narrow<T: TryFrom<i64>>(v: i64, kind: FieldKind) -> Result<T> {
            T::try_from(v).map_err(|_| {
                Error::corrupt(format!("{} does not fit in {:?}", v, kind))
            })
        }

        match kind {
            FieldKind::Boolean => Ok(Value::Boolean(self.as_f64() != 0.0)),
            FieldKind::Byte => Ok(Value::Byte(narrow(self.to_i64()?, kind)?)),
            FieldKind::SByte => Ok(Value::SByte(narrow(self.to_i64()?, kind)?)),
            FieldKind::Int16 => Ok(Value::Int16(narrow(self.to_i64()?, kind)?)),
            FieldKind::UInt16 => Ok(Value::UInt16(narrow(self.to_i64()?, kind)?)),
            FieldKind::Int32 => Ok(Value::Int32(narrow(self.to_i64()?, kind)?)),
            FieldKind::UInt32 => Ok(Value::UInt32(narrow(self.to_i64()?, kind)?)),
            FieldKind::Int64 => Ok(Value::Int64(self.to_i64()?)),
            FieldKind::UInt64 => Ok(Value::UInt64(self.to_u64()?)),
            FieldKind::Single => Ok(Value::Single(self.as_f64() as f32)),
            FieldKind::Double => Ok(Value::Double(self.as_f64())),
            FieldKind::Decimal => Ok(Value::Decimal(self.as_f64())),
            FieldKind::TimeSpan => Ok(Value::TimeSpan(self.to_i64()?)),
            FieldKind::String => Ok(Value::String(match self {
                NumericValue::Signed(v) => v.to_string(),
                NumericValue::Unsigned(v) => v.to_string(),
                NumericValue::Float(v) => v.to_string(),
            })),
            _ => Err(Error::corrupt(format!(
                "cannot convert numeric value to {:?}",
                kind
            ))),
        }
    }

    /// Total order across mixed numeric kinds.
    pub fn compare(a: &NumericValue, b: &NumericValue) -> Ordering {
        match (a, b) {
            (NumericValue::Signed(x), NumericValue::Signed(y)) => x.cmp(y),
            (NumericValue::Unsigned(x), NumericValue::Unsigned(y)) => x.cmp(y),
            (NumericValue::Signed(x), NumericValue::Unsigned(y)) => {
                if *x < 0 {
                    Ordering::Less
                } else {
                    (*x as u64).cmp(y)
                }
            }
            (NumericValue::Unsigned(x), NumericValue::Signed(y)) => {
                if *y < 0 {
                    Ordering::Greater
                } else {
                    x.cmp(&(*y as u64))
                }
            }
            _ => a.as_f64().total_cmp(&b.as_f64()),
        }
    }
}
