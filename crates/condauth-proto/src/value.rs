//! Runtime values, entity rows, and entity identifiers.

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};
use std::fmt;

/// Entity identifier (UUID bytes).
pub type EntityId = [u8; 16];

/// Render an entity id as lowercase hex.
pub fn format_id(id: &EntityId) -> String {
    hex::encode(id)
}

/// A runtime value stored in an entity field or carried as a principal attribute.
///
/// Arrays are typed (e.g., StringArray, Int64Array) to keep the enum
/// non-recursive for rkyv.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit floating point.
    Float64(f64),
    /// UTF-8 string.
    String(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// Timestamp as microseconds since Unix epoch.
    Timestamp(i64),
    /// UUID as 16 bytes.
    Uuid([u8; 16]),
    /// Array of strings.
    StringArray(Vec<String>),
    /// Array of 64-bit integers.
    Int64Array(Vec<i64>),
    /// Array of UUIDs.
    UuidArray(Vec<[u8; 16]>),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this value is an array type.
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Value::StringArray(_) | Value::Int64Array(_) | Value::UuidArray(_)
        )
    }

    /// Expand an array value into its scalar elements.
    ///
    /// Scalars expand to a single-element list.
    pub fn to_elements(&self) -> Vec<Value> {
        match self {
            Value::StringArray(items) => items.iter().cloned().map(Value::String).collect(),
            Value::Int64Array(items) => items.iter().copied().map(Value::Int64).collect(),
            Value::UuidArray(items) => items.iter().copied().map(Value::Uuid).collect(),
            other => vec![other.clone()],
        }
    }

    /// Try to get as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) => Some(*i),
            Value::Int32(i) => Some(*i as i64),
            _ => None,
        }
    }

    /// Try to get as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(f) => Some(*f),
            Value::Int32(i) => Some(*i as f64),
            Value::Int64(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as UUID.
    pub fn as_uuid(&self) -> Option<&[u8; 16]> {
        match self {
            Value::Uuid(u) => Some(u),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int32(i) => write!(f, "{}", i),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Float64(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "'{}'", s),
            Value::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Value::Timestamp(t) => write!(f, "@{}", t),
            Value::Uuid(u) => write!(f, "{}", format_id(u)),
            Value::StringArray(items) => write!(f, "{:?}", items),
            Value::Int64Array(items) => write!(f, "{:?}", items),
            Value::UuidArray(items) => {
                let ids: Vec<String> = items.iter().map(format_id).collect();
                write!(f, "[{}]", ids.join(", "))
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringArray(v)
    }
}

/// A named field value inside an entity row.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: Value,
}

impl Field {
    /// Create a new field.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A materialized entity: its identity plus field values.
///
/// The `id` field is always present as `Value::Uuid` so filters can address it.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize)]
pub struct EntityRow {
    /// Entity identity.
    pub id: EntityId,
    /// Field values, including `id`.
    pub fields: Vec<Field>,
}

impl EntityRow {
    /// Create a row holding only its `id` field.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            fields: vec![Field::new("id", Value::Uuid(id))],
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a field, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(existing) => existing.value = value,
            None => self.fields.push(Field { name, value }),
        }
    }

    /// Get a field value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.fields.iter().position(|f| f.name == name)?;
        Some(self.fields.remove(pos).value)
    }

    /// Whether two rows carry the same field values, ignoring field order.
    pub fn same_content(&self, other: &EntityRow) -> bool {
        self.id == other.id
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .all(|f| other.get(&f.name) == Some(&f.value))
    }
}

/// A reference to an entity that may not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, SerdeSerialize, SerdeDeserialize)]
pub struct EntityRef {
    /// Entity type name.
    pub entity: String,
    /// Entity identity.
    pub id: EntityId,
}

impl EntityRef {
    /// Create a new reference.
    pub fn new(entity: impl Into<String>, id: EntityId) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.entity, format_id(&self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_always_has_id() {
        let row = EntityRow::new([3u8; 16]);
        assert_eq!(row.get("id"), Some(&Value::Uuid([3u8; 16])));
    }

    #[test]
    fn test_row_set_replaces() {
        let mut row = EntityRow::new([1u8; 16]).with_field("amount", 10i64);
        row.set("amount", 20i64);
        assert_eq!(row.get("amount"), Some(&Value::Int64(20)));
        assert_eq!(row.fields.len(), 2);
    }

    #[test]
    fn test_same_content_ignores_order() {
        let a = EntityRow::new([1u8; 16])
            .with_field("x", 1i64)
            .with_field("y", "a");
        let mut b = EntityRow::new([1u8; 16]);
        b.set("y", "a");
        b.set("x", 1i64);
        assert!(a.same_content(&b));

        b.set("x", 2i64);
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_to_elements() {
        let v = Value::StringArray(vec!["a".into(), "b".into()]);
        assert_eq!(
            v.to_elements(),
            vec![Value::String("a".into()), Value::String("b".into())]
        );
        assert_eq!(Value::Int64(4).to_elements(), vec![Value::Int64(4)]);
    }

    #[test]
    fn test_entity_ref_display() {
        let r = EntityRef::new("Invoice", [0xab; 16]);
        assert!(r.to_string().starts_with("Invoice(abab"));
    }
}
