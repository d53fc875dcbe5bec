use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;
use crate::codec::{BitReader, BitWriter};
use crate::core::error::{Error, Result};
use crate::core::numeric::NumericValue;
use crate::core::types::{FieldDef, FieldKind, ObjectSchema, TypedObject, Value};
use super::*;

/// Maps registered type names to their schemas and drives the wire format
/// for every value kind.
///
/// Nullable fields are flexible at rest, strict in memory: the wire carries
/// whatever concrete tag was written historically, and reads convert toward
/// the schema's declared kind through [`NumericValue`].
pub struct SerializerRegistry {
    schemas: RwLock<HashMap<String, Arc<ObjectSchema>>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        SerializerRegistry {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Register a schema. Re-registering a type name replaces the schema.
    pub fn register(&self, schema: ObjectSchema) {
        let mut schemas = self.schemas.write();
        schemas.insert(schema.type_name.clone(), Arc::new(schema));
    }

    pub fn schema(&self, type_name: &str) -> Result<Arc<ObjectSchema>> {
        self.schemas
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| Error::key_not_found(format!("no schema registered for '{}'", type_name)))
    }

    pub fn has_schema(&self, type_name: &str) -> bool {
        self.schemas.read().contains_key(type_name)
    }

    /// Serialize an object to a standalone record payload.
    pub fn serialize_object(&self, object: &TypedObject) -> Result<Vec<u8>> {
        let mut w = BitWriter::new();
        self.write_value(&mut w, &Value::Object(object.clone()), true)?;
        Ok(w.finish())
    }

    pub fn deserialize_object(&self, bytes: &[u8]) -> Result<TypedObject> {
        let mut r = BitReader::new(bytes);
        match self.read_value(&mut r)? {
            Value::Object(object) => Ok(object),
            other => Err(Error::corrupt(format!(
                "expected object record, found {:?} tag",
                other.kind()
            ))),
        }
    }

    /// Write a value, optionally preceded by its 6-bit type tag.
    pub fn write_value(&self, w: &mut BitWriter, value: &Value, with_code: bool) -> Result<()> {
        let code = match value {
            Value::Null => TYPE_NULL,
            Value::Object(_) => TYPE_OBJECT,
            other => tag_for_kind(other.kind().expect("non-null value has a kind")),
        };
        if with_code {
            w.write_bits(code as u64, 6);
        }
        match value {
            Value::Null => {}
            Value::Boolean(v) => w.write_bool(*v),
            Value::Byte(v) => w.write_u8(*v),
            Value::SByte(v) => w.write_i8(*v),
            Value::Int16(v) => w.write_i16(*v),
            Value::UInt16(v) => w.write_u16(*v),
            Value::Int32(v) => w.write_i32(*v),
            Value::UInt32(v) => w.write_u32(*v),
            Value::Int64(v) => w.write_i64(*v),
            Value::UInt64(v) => w.write_u64(*v),
            Value::Single(v) => w.write_f32(*v),
            Value::Double(v) => w.write_f64(*v),
            Value::Decimal(v) => w.write_f64(*v),
            Value::Char(v) => w.write_char(*v),
            Value::String(v) => w.write_string(v),
            Value::Enum(v) => w.write_string(v),
            Value::Guid(v) => w.write_guid(v),
            Value::DateTime(v) => w.write_datetime(v),
            Value::TimeSpan(v) => w.write_i64(*v),
            Value::ByteArray(v) => w.write_bytes(v),
            Value::Object(object) => self.write_object_payload(w, object)?,
        }
        Ok(())
    }

    fn write_object_payload(&self, w: &mut BitWriter, object: &TypedObject) -> Result<()> {
        let schema = self.schema(&object.type_name)?;
        w.write_string(&object.type_name);
        for def in &schema.fields {
            match object.fields.get(&def.name) {
                None | Some(Value::Null) => {
                    if !def.nullable {
                        return Err(Error::invalid_argument(format!(
                            "field '{}' of '{}' is not nullable",
                            def.name, object.type_name
                        )));
                    }
                    w.write_bits(TYPE_NULL as u64, 6);
                }
                Some(value) => {
                    let coerced = self.coerce_for_field(value, def)?;
                    self.write_value(w, &coerced, true)?;
                }
            }
        }
        Ok(())
    }

    /// Strict in-memory check: a field value must match its declared kind,
    /// with numeric kinds converting to the declared one before writing.
    fn coerce_for_field(&self, value: &Value, def: &FieldDef) -> Result<Value> {
        if value.kind() == Some(def.kind) {
            return Ok(value.clone());
        }
        if def.kind.is_numeric() {
            if let Some(n) = NumericValue::from_value(value) {
                return n
                    .to_kind(def.kind)
                    .map_err(|e| Error::invalid_argument(e.context));
            }
        }
        Err(Error::invalid_argument(format!(
            "field '{}' expects {:?}, got {:?}",
            def.name,
            def.kind,
            value.kind()
        )))
    }

    /// Read a tagged value.
    pub fn read_value(&self, r: &mut BitReader<'_>) -> Result<Value> {
        let code = r.read_bits(6)? as u8;
        self.read_payload(r, code)
    }

    pub fn read_payload(&self, r: &mut BitReader<'_>, code: u8) -> Result<Value> {
        Ok(match code {
            TYPE_NULL => Value::Null,
            TYPE_BOOLEAN => Value::Boolean(r.read_bool()?),
            TYPE_BYTE => Value::Byte(r.read_u8()?),
            TYPE_SBYTE => Value::SByte(r.read_i8()?),
            TYPE_INT16 => Value::Int16(r.read_i16()?),
            TYPE_UINT16 => Value::UInt16(r.read_u16()?),
            TYPE_INT32 => Value::Int32(r.read_i32()?),
            TYPE_UINT32 => Value::UInt32(r.read_u32()?),
            TYPE_INT64 => Value::Int64(r.read_i64()?),
            TYPE_UINT64 => Value::UInt64(r.read_u64()?),
            TYPE_SINGLE => Value::Single(r.read_f32()?),
            TYPE_DOUBLE => Value::Double(r.read_f64()?),
            TYPE_DECIMAL => Value::Decimal(r.read_f64()?),
            TYPE_CHAR => Value::Char(r.read_char()?),
            TYPE_STRING => Value::String(r.read_string()?),
            TYPE_ENUM => Value::Enum(r.read_string()?),
            TYPE_GUID => Value::Guid(r.read_guid()?),
            TYPE_DATETIME => Value::DateTime(r.read_datetime()?),
            TYPE_TIMESPAN => Value::TimeSpan(r.read_i64()?),
            TYPE_BYTEARRAY => Value::ByteArray(r.read_bytes()?),
            TYPE_OBJECT => {
                let type_name = r.read_string()?;
                let schema = self.schema(&type_name).map_err(|_| {
                    Error::corrupt(format!("no schema registered for stored type '{}'", type_name))
                })?;
                let mut object = TypedObject::new(type_name);
                for def in &schema.fields {
                    let value = self.read_field(r, def)?;
                    if !value.is_null() {
                        object.fields.insert(def.name.clone(), value);
                    }
                }
                Value::Object(object)
            }
            other => {
                return Err(Error::corrupt(format!("unexpected type tag {}", other)));
            }
        })
    }

    /// Skip a tagged value without materializing it.
    pub fn skip_value(&self, r: &mut BitReader<'_>) -> Result<()> {
        let code = r.read_bits(6)? as u8;
        self.skip_payload(r, code)
    }

    pub fn skip_payload(&self, r: &mut BitReader<'_>, code: u8) -> Result<()> {
        match code {
            TYPE_NULL => Ok(()),
            TYPE_BOOLEAN => r.skip_bits(1),
            TYPE_BYTE | TYPE_SBYTE => r.skip_bits(8),
            TYPE_INT16 | TYPE_UINT16 => r.skip_bits(16),
            TYPE_INT32 | TYPE_UINT32 | TYPE_SINGLE | TYPE_CHAR => r.skip_bits(32),
            TYPE_INT64 | TYPE_UINT64 | TYPE_DOUBLE | TYPE_DECIMAL | TYPE_DATETIME
            | TYPE_TIMESPAN => r.skip_bits(64),
            TYPE_STRING | TYPE_ENUM => r.skip_string(),
            TYPE_BYTEARRAY => r.skip_bytes(),
            TYPE_GUID => r.skip_guid(),
            TYPE_OBJECT => {
                // The type name has to be materialized to resolve the schema.
                let type_name = r.read_string()?;
                let schema = self.schema(&type_name).map_err(|_| {
                    Error::corrupt(format!("no schema registered for stored type '{}'", type_name))
                })?;
                for _ in &schema.fields {
                    self.skip_value(r)?;
                }
                Ok(())
            }
            other => Err(Error::corrupt(format!("unexpected type tag {}", other))),
        }
    }

    /// Read a field toward its declared kind, upgrading from whatever tag
    /// was actually written.
    pub fn read_field(&self, r: &mut BitReader<'_>, def: &FieldDef) -> Result<Value> {
        let code = r.read_bits(6)? as u8;
        if code == TYPE_NULL {
            if def.nullable {
                return Ok(Value::Null);
            }
            return Err(Error::corrupt(format!(
                "null stored for non-nullable field '{}'",
                def.name
            )));
        }
        if code == tag_for_kind(def.kind) {
            return self.read_payload(r, code);
        }

        // Historical data may carry any numeric (or stringified) tag; upgrade
        // it to the declared kind.
        let stored = self.read_payload(r, code)?;
        if def.kind.is_numeric() || matches!(def.kind, FieldKind::String | FieldKind::TimeSpan) {
            if let Some(n) = NumericValue::from_value(&stored) {
                return n.to_kind(def.kind);
            }
        }
        Err(Error::corrupt(format!(
            "field '{}' expects {:?}, found tag {}",
            def.name, def.kind, code
        )))
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        SerializerRegistry::new()
    }
}
