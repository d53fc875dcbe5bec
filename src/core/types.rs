use std::collections::HashMap;
use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 128-bit object identifier, unique within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    pub fn new() -> Self {
        ObjectId(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        ObjectId(Uuid::nil())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ObjectId(Uuid::from_bytes(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(ObjectId(Uuid::from_bytes(arr)))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run-time value of a persisted field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(u8),
    SByte(i8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Single(f32),
    Double(f64),
    Decimal(f64),
    Char(char),
    String(String),
    Enum(String),
    Guid(Uuid),
    DateTime(DateTime<Utc>),
    /// Duration in milliseconds.
    TimeSpan(i64),
    ByteArray(Vec<u8>),
    Object(TypedObject),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(FieldKind::Boolean),
            Value::Byte(_) => Some(FieldKind::Byte),
            Value::SByte(_) => Some(FieldKind::SByte),
            Value::Int16(_) => Some(FieldKind::Int16),
            Value::UInt16(_) => Some(FieldKind::UInt16),
            Value::Int32(_) => Some(FieldKind::Int32),
            Value::UInt32(_) => Some(FieldKind::UInt32),
            Value::Int64(_) => Some(FieldKind::Int64),
            Value::UInt64(_) => Some(FieldKind::UInt64),
            Value::Single(_) => Some(FieldKind::Single),
            Value::Double(_) => Some(FieldKind::Double),
            Value::Decimal(_) => Some(FieldKind::Decimal),
            Value::Char(_) => Some(FieldKind::Char),
            Value::String(_) => Some(FieldKind::String),
            Value::Enum(_) => Some(FieldKind::Enum),
            Value::Guid(_) => Some(FieldKind::Guid),
            Value::DateTime(_) => Some(FieldKind::DateTime),
            Value::TimeSpan(_) => Some(FieldKind::TimeSpan),
            Value::ByteArray(_) => Some(FieldKind::ByteArray),
            Value::Object(_) => Some(FieldKind::Object),
        }
    }
}

/// Logical kind of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Boolean,
    Byte,
    SByte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Single,
    Double,
    Decimal,
    Char,
    String,
    Enum,
    Guid,
    DateTime,
    TimeSpan,
    ByteArray,
    Object,
}

impl FieldKind {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldKind::Boolean
                | FieldKind::Byte
                | FieldKind::SByte
                | FieldKind::Int16
                | FieldKind::UInt16
                | FieldKind::Int32
                | FieldKind::UInt32
                | FieldKind::Int64
                | FieldKind::UInt64
                | FieldKind::Single
                | FieldKind::Double
                | FieldKind::Decimal
        )
    }
}

/// A persisted object: a named type plus its field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedObject {
    pub type_name: String,
    pub object_id: Option<ObjectId>,
    pub fields: HashMap<String, Value>,
}

impl TypedObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        TypedObject {
            type_name: type_name.into(),
            object_id: None,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn get_field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Field descriptor inside an object schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
}

/// Explicit per-type schema, registered once at startup. Serialization walks
/// the descriptors in declaration order; there is no run-time field discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSchema {
    pub type_name: String,
    pub fields: Vec<FieldDef>,
}

impl ObjectSchema {
    pub fn new(type_name: impl Into<String>) -> Self {
        ObjectSchema {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind,
            nullable: false,
        });
        self
    }

    pub fn nullable_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind,
            nullable: true,
        });
        self
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}
