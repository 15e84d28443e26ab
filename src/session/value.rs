//! Attribute values and their wire form
//!
//! [`AttributeValue::Local`] holds node-local state (handles, caches) that can
//! live in a session but never crosses the wire; converting it to a
//! [`WireValue`] fails and the attribute is skipped during replication.
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bincode::{Decode, Encode};

use crate::error::SerializationError;

#[derive(Clone)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
    Local(Arc<dyn Any + Send + Sync>),
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum WireValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
}

impl AttributeValue {
    pub fn local<T: Any + Send + Sync>(value: T) -> Self {
        AttributeValue::Local(Arc::new(value))
    }

    pub fn is_serializable(&self) -> bool {
        match self {
            AttributeValue::Local(_) => false,
            AttributeValue::List(items) => items.iter().all(AttributeValue::is_serializable),
            AttributeValue::Map(entries) => entries.values().all(AttributeValue::is_serializable),
            _ => true,
        }
    }

    pub fn to_wire(&self) -> Result<WireValue, SerializationError> {
        Ok(match self {
            AttributeValue::Bool(b) => WireValue::Bool(*b),
            AttributeValue::Int(i) => WireValue::Int(*i),
            AttributeValue::Float(f) => WireValue::Float(*f),
            AttributeValue::Text(s) => WireValue::Text(s.clone()),
            AttributeValue::Bytes(b) => WireValue::Bytes(b.clone()),
            AttributeValue::List(items) => WireValue::List(
                items
                    .iter()
                    .map(AttributeValue::to_wire)
                    .collect::<Result<_, _>>()?,
            ),
            AttributeValue::Map(entries) => WireValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| v.to_wire().map(|w| (k.clone(), w)))
                    .collect::<Result<_, _>>()?,
            ),
            AttributeValue::Local(_) => {
                return Err(SerializationError::NotSerializable("local value".to_string()))
            }
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn downcast_local<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            AttributeValue::Local(v) => v.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl From<WireValue> for AttributeValue {
    fn from(value: WireValue) -> Self {
        match value {
            WireValue::Bool(b) => AttributeValue::Bool(b),
            WireValue::Int(i) => AttributeValue::Int(i),
            WireValue::Float(f) => AttributeValue::Float(f),
            WireValue::Text(s) => AttributeValue::Text(s),
            WireValue::Bytes(b) => AttributeValue::Bytes(b),
            WireValue::List(items) => {
                AttributeValue::List(items.into_iter().map(AttributeValue::from).collect())
            }
            WireValue::Map(entries) => AttributeValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, AttributeValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Text(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Int(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        use AttributeValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Local(a), Local(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "Bool({})", b),
            AttributeValue::Int(i) => write!(f, "Int({})", i),
            AttributeValue::Float(x) => write!(f, "Float({})", x),
            AttributeValue::Text(s) => write!(f, "Text({:?})", s),
            AttributeValue::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            AttributeValue::List(items) => f.debug_list().entries(items).finish(),
            AttributeValue::Map(entries) => f.debug_map().entries(entries).finish(),
            AttributeValue::Local(_) => write!(f, "Local(..)"),
        }
    }
}

/// Authenticated user bound to a session
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Principal {
    pub name: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(name: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            name: name.into(),
            roles,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_local_is_not_serializable() {
        let mut map = BTreeMap::new();
        map.insert("ok".to_string(), AttributeValue::Int(1));
        map.insert("conn".to_string(), AttributeValue::local(42u32));
        let value = AttributeValue::Map(map);

        assert!(!value.is_serializable());
        assert!(matches!(
            value.to_wire(),
            Err(SerializationError::NotSerializable(_))
        ));
    }

    #[test]
    fn test_wire_conversion_preserves_structure() {
        let value = AttributeValue::List(vec!["a".into(), 7i64.into(), true.into()]);
        let back = AttributeValue::from(value.to_wire().unwrap());
        assert_eq!(back, value);
    }

    #[test]
    fn test_local_downcast() {
        let value = AttributeValue::local(String::from("handle"));
        assert_eq!(value.downcast_local::<String>().unwrap(), "handle");
        assert!(value.downcast_local::<u8>().is_none());
    }
}
