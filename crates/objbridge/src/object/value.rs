//! Managed Objects - the garbage-collected side of the bridge
//!
//! An `Object` is a shared handle to an immutable-identity value. Holding a
//! clone keeps the value alive; a `WeakObject` remembers it without doing
//! so, and stops resolving once the last `Object` handle is dropped. The
//! bridge arbitrates between these two kinds of ownership and the native
//! refcount.
//!
//! Identity is the address of the shared allocation: two handles are the
//! same object iff `Object::is` holds. `PartialEq` is structural.

use indexmap::IndexMap;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// Tag of a native object whose managed counterpart has not been built yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferredMarker {
    String,
    Tuple,
    List,
    None,
}

impl DeferredMarker {
    pub fn name(self) -> &'static str {
        match self {
            DeferredMarker::String => "string",
            DeferredMarker::Tuple => "tuple",
            DeferredMarker::List => "list",
            DeferredMarker::None => "none",
        }
    }
}

/// Hashable dictionary key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    Str(Vec<u8>),
    Int(i64),
    Bool(bool),
}

/// Value carried by a managed object
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Vec<u8>),
    Tuple(Vec<Object>),
    List(RwLock<Vec<Object>>),
    Dict(RwLock<IndexMap<DictKey, Object>>),
    /// Managed view of a native type descriptor
    Type(String),
    /// Host object with no native payload
    Opaque {
        type_name: String,
        payload: Box<dyn Any + Send + Sync>,
    },
    /// Placeholder for a deferred native object; never handed to clients
    /// by `retrieve`
    Sentinel(DeferredMarker),
}

/// Coarse classification used for store dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    None,
    Bool,
    Int,
    Float,
    Str,
    Tuple,
    List,
    Dict,
    Type,
    Opaque,
    Sentinel,
}

impl ObjectKind {
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::None => "none",
            ObjectKind::Bool => "bool",
            ObjectKind::Int => "int",
            ObjectKind::Float => "float",
            ObjectKind::Str => "string",
            ObjectKind::Tuple => "tuple",
            ObjectKind::List => "list",
            ObjectKind::Dict => "dict",
            ObjectKind::Type => "type",
            ObjectKind::Opaque => "object",
            ObjectKind::Sentinel => "sentinel",
        }
    }
}

/// Shared handle to a managed value
#[derive(Clone)]
pub struct Object(Arc<Value>);

/// Non-owning handle to a managed value
#[derive(Clone)]
pub struct WeakObject(Weak<Value>);

lazy_static::lazy_static! {
    static ref NONE: Object = Object(Arc::new(Value::None));
    static ref TRUE: Object = Object(Arc::new(Value::Bool(true)));
    static ref FALSE: Object = Object(Arc::new(Value::Bool(false)));
}

impl Object {
    fn new(value: Value) -> Self {
        Object(Arc::new(value))
    }

    /// The process-wide none object
    pub fn none() -> Self {
        NONE.clone()
    }

    /// One of the two process-wide booleans
    pub fn bool(value: bool) -> Self {
        if value {
            TRUE.clone()
        } else {
            FALSE.clone()
        }
    }

    pub fn int(value: i64) -> Self {
        Self::new(Value::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Self::new(Value::Float(value))
    }

    pub fn string(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(Value::Str(bytes.into()))
    }

    pub fn tuple(items: Vec<Object>) -> Self {
        Self::new(Value::Tuple(items))
    }

    pub fn list(items: Vec<Object>) -> Self {
        Self::new(Value::List(RwLock::new(items)))
    }

    pub fn dict(items: IndexMap<DictKey, Object>) -> Self {
        Self::new(Value::Dict(RwLock::new(items)))
    }

    pub fn type_object(name: impl Into<String>) -> Self {
        Self::new(Value::Type(name.into()))
    }

    pub fn opaque(type_name: impl Into<String>, payload: impl Any + Send + Sync) -> Self {
        Self::new(Value::Opaque {
            type_name: type_name.into(),
            payload: Box::new(payload),
        })
    }

    /// Fresh placeholder for a deferred native object
    ///
    /// Every call returns a distinct identity. Passing one to `store` is
    /// rejected.
    pub fn deferred_marker(marker: DeferredMarker) -> Self {
        Self::new(Value::Sentinel(marker))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn kind(&self) -> ObjectKind {
        match self.value() {
            Value::None => ObjectKind::None,
            Value::Bool(_) => ObjectKind::Bool,
            Value::Int(_) => ObjectKind::Int,
            Value::Float(_) => ObjectKind::Float,
            Value::Str(_) => ObjectKind::Str,
            Value::Tuple(_) => ObjectKind::Tuple,
            Value::List(_) => ObjectKind::List,
            Value::Dict(_) => ObjectKind::Dict,
            Value::Type(_) => ObjectKind::Type,
            Value::Opaque { .. } => ObjectKind::Opaque,
            Value::Sentinel(_) => ObjectKind::Sentinel,
        }
    }

    /// Identity of the object, stable for as long as any handle is alive
    #[inline]
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Identity comparison
    #[inline]
    pub fn is(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_none(&self) -> bool {
        matches!(self.value(), Value::None)
    }

    pub fn marker(&self) -> Option<DeferredMarker> {
        match self.value() {
            Value::Sentinel(marker) => Some(*marker),
            _ => None,
        }
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject(Arc::downgrade(&self.0))
    }

    /// Number of live strong handles, including this one
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.value() {
            Value::Str(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.value() {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Snapshot of the items of a tuple or list
    pub fn items(&self) -> Option<Vec<Object>> {
        match self.value() {
            Value::Tuple(items) => Some(items.clone()),
            Value::List(items) => Some(items.read().clone()),
            _ => None,
        }
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        match self.value() {
            Value::Opaque { payload, .. } => payload.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl WeakObject {
    pub fn upgrade(&self) -> Option<Object> {
        self.0.upgrade().map(Object)
    }

    pub fn is_collected(&self) -> bool {
        self.0.strong_count() == 0
    }

    /// Identity of the referent
    ///
    /// The allocation outlives every weak handle, so the identity cannot be
    /// reused by another object while this handle exists.
    pub fn id(&self) -> usize {
        Weak::as_ptr(&self.0) as *const () as usize
    }
}

impl DictKey {
    pub fn from_object(obj: &Object) -> Option<DictKey> {
        match obj.value() {
            Value::Str(bytes) => Some(DictKey::Str(bytes.clone())),
            Value::Int(v) => Some(DictKey::Int(*v)),
            Value::Bool(b) => Some(DictKey::Bool(*b)),
            _ => None,
        }
    }
}

fn items_eq(a: &[Object], b: &[Object]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        if self.is(other) {
            return true;
        }
        match (self.value(), other.value()) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => items_eq(a, b),
            (Value::List(a), Value::List(b)) => items_eq(&a.read(), &b.read()),
            (Value::Dict(a), Value::Dict(b)) => {
                let (a, b) = (a.read(), b.read());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).map_or(false, |w| v == w))
            },
            (Value::Type(a), Value::Type(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value() {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Str(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Value::Tuple(items) => f.debug_tuple("").field(items).finish(),
            Value::List(items) => f.debug_list().entries(items.read().iter()).finish(),
            Value::Dict(items) => f.debug_map().entries(items.read().iter()).finish(),
            Value::Type(name) => write!(f, "<type '{}'>", name),
            Value::Opaque { type_name, .. } => write!(f, "<{} at {:#x}>", type_name, self.id()),
            Value::Sentinel(marker) => write!(f, "<deferred {}>", marker.name()),
        }
    }
}

impl From<bool> for Object {
    fn from(value: bool) -> Self {
        Object::bool(value)
    }
}

impl From<i64> for Object {
    fn from(value: i64) -> Self {
        Object::int(value)
    }
}

impl From<f64> for Object {
    fn from(value: f64) -> Self {
        Object::float(value)
    }
}

impl From<&str> for Object {
    fn from(value: &str) -> Self {
        Object::string(value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons_share_identity() {
        assert!(Object::none().is(&Object::none()));
        assert!(Object::bool(true).is(&Object::from(true)));
        assert!(!Object::bool(true).is(&Object::bool(false)));
    }

    #[test]
    fn test_structural_equality_is_not_identity() {
        let a = Object::tuple(vec![Object::int(1), Object::from("x")]);
        let b = Object::tuple(vec![Object::int(1), Object::from("x")]);
        assert_eq!(a, b);
        assert!(!a.is(&b));
    }

    #[test]
    fn test_markers_have_distinct_identities() {
        let a = Object::deferred_marker(DeferredMarker::Tuple);
        let b = Object::deferred_marker(DeferredMarker::Tuple);
        assert_eq!(a.marker(), b.marker());
        assert!(!a.is(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_weak_handle_stops_resolving() {
        let obj = Object::int(5);
        let weak = obj.downgrade();
        assert!(weak.upgrade().is_some());

        drop(obj);
        assert!(weak.is_collected());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_opaque_payload() {
        let obj = Object::opaque("Widget", 42u32);
        assert_eq!(obj.payload::<u32>(), Some(&42));
        assert_eq!(obj.kind(), ObjectKind::Opaque);
    }
}
