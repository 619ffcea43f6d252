//! In-memory value graphs handed to the write path.
//!
//! Application state is not always a tree: records get linked back to their
//! parents, event payloads end up inside message objects, callbacks get stored
//! next to data. `Node` models that graph faithfully (shared containers,
//! host objects, callables) so the serialization guard can decide what is
//! storable. Nothing below the guard ever sees a `Node`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::value::Value;

/// A shared, mutable container. Cloning shares the same container, which is
/// what makes cycles expressible.
pub struct Shared<T>(Arc<RwLock<T>>);

impl<T> Shared<T> {
    pub fn new(inner: T) -> Self {
        Self(Arc::new(RwLock::new(inner)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Identity of the container, stable while any clone is alive.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

/// Object container type.
pub type ObjectMap = BTreeMap<String, Node>;

/// A node of an in-memory value graph.
#[derive(Clone, Default)]
pub enum Node {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Shared<Vec<Node>>),
    Object(Shared<ObjectMap>),
    /// A host object with no data representation (event, window handle, DOM
    /// element, open file...).
    Foreign {
        type_name: String,
    },
    /// A function or closure reference.
    Callable {
        name: String,
    },
}

impl Node {
    pub fn array(items: Vec<Node>) -> Self {
        Self::Array(Shared::new(items))
    }

    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Node)>,
    {
        Self::Object(Shared::new(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn foreign(type_name: impl Into<String>) -> Self {
        Self::Foreign {
            type_name: type_name.into(),
        }
    }

    pub fn callable(name: impl Into<String>) -> Self {
        Self::Callable { name: name.into() }
    }

    /// Returns the shared handle of an object node, for linking nodes together.
    pub fn object_handle(&self) -> Option<Shared<ObjectMap>> {
        match self {
            Self::Object(shared) => Some(shared.clone()),
            _ => None,
        }
    }

    /// Returns the shared handle of an array node.
    pub fn array_handle(&self) -> Option<Shared<Vec<Node>>> {
        match self {
            Self::Array(shared) => Some(shared.clone()),
            _ => None,
        }
    }
}

impl fmt::Debug for Node {
    // Containers are summarized; a derived impl would recurse forever on cycles.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(v) => write!(f, "Bool({v})"),
            Self::Int(v) => write!(f, "Int({v})"),
            Self::Float(v) => write!(f, "Float({v})"),
            Self::String(v) => write!(f, "String({v:?})"),
            Self::Array(items) => write!(f, "Array(len={})", items.read().len()),
            Self::Object(map) => {
                let keys: Vec<String> = map.read().keys().cloned().collect();
                write!(f, "Object(keys={keys:?})")
            }
            Self::Foreign { type_name } => write!(f, "Foreign({type_name})"),
            Self::Callable { name } => write!(f, "Callable({name})"),
        }
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(v) => Self::Bool(v),
            Value::Int(v) => Self::Int(v),
            Value::Float(v) => Self::Float(v),
            Value::String(v) => Self::String(v),
            Value::Array(items) => Self::array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::object(map.into_iter().map(|(k, v)| (k, Self::from(v)))),
        }
    }
}

impl From<&Value> for Node {
    fn from(value: &Value) -> Self {
        Self::from(value.clone())
    }
}

impl From<serde_json::Value> for Node {
    fn from(value: serde_json::Value) -> Self {
        Self::from(Value::from(value))
    }
}

impl From<bool> for Node {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Node {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Node {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Node {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Node {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Node {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_clone_keeps_identity() {
        let node = Node::object([("a", Node::from(1))]);
        let h1 = node.object_handle().unwrap();
        let h2 = node.object_handle().unwrap();
        assert_eq!(h1.identity(), h2.identity());

        let other = Node::object([("a", Node::from(1))]);
        assert_ne!(h1.identity(), other.object_handle().unwrap().identity());
    }

    #[test]
    fn test_debug_on_cyclic_node_terminates() {
        let node = Node::object([("name", Node::from("loop"))]);
        let handle = node.object_handle().unwrap();
        handle.write().insert("me".to_string(), node.clone());

        let rendered = format!("{node:?}");
        assert!(rendered.contains("me"));
        assert!(rendered.contains("name"));
    }

    #[test]
    fn test_from_value_builds_fresh_containers() {
        let value = Value::Array(vec![Value::from("x"), Value::object()]);
        let node = Node::from(value);
        let items = node.array_handle().unwrap();
        assert_eq!(items.read().len(), 2);
        assert!(matches!(items.read()[1], Node::Object(_)));
    }
}
