//! Values exchanged with the host
//!
//! The engine never knows the concrete layout of host objects. Everything that
//! crosses the boundary (receivers, arguments, return values, field contents)
//! is a `HostValue`. Host objects travel as opaque `ObjectRef`s that adapter
//! code downcasts back to its own types.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

/// Argument list passed to host methods and before-hooks.
///
/// Most host calls take at most four arguments, so those stay on the stack.
pub type Args = SmallVec<[HostValue; 4]>;

/// Opaque, reference-counted handle to a host object
///
/// Equality is identity: two refs are equal only if they point at the same
/// allocation. That is what staleness checks in the fast path rely on.
#[derive(Clone)]
pub struct ObjectRef {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ObjectRef {
    /// Wrap a host object.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    /// Wrap an object that is already shared with the host.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self { inner: value }
    }

    /// Borrow the object as `T`, if that is what it is.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Identity comparison.
    #[inline]
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.inner) as *const ()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.addr())
    }
}

/// A value read from or written to the host
#[derive(Clone, Debug, Default)]
pub enum HostValue {
    /// No value. Also the receiver of static members.
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Object(ObjectRef),
}

impl HostValue {
    /// Name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Unit => "Unit",
            HostValue::Bool(_) => "Bool",
            HostValue::Int(_) => "Int",
            HostValue::Float(_) => "Float",
            HostValue::Str(_) => "Str",
            HostValue::Object(_) => "Object",
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, HostValue::Unit)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HostValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            HostValue::Float(x) => Some(*x),
            HostValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            HostValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Multiply a numeric value by an integer factor.
    ///
    /// Returns `None` for non-numeric values. Integer scaling saturates.
    pub fn scaled(&self, factor: i64) -> Option<HostValue> {
        match self {
            HostValue::Int(n) => Some(HostValue::Int(n.saturating_mul(factor))),
            HostValue::Float(x) => Some(HostValue::Float(x * factor as f64)),
            _ => None,
        }
    }

    /// Whether two values denote the same receiver.
    ///
    /// Objects compare by identity; everything else by value.
    pub fn same_receiver(&self, other: &HostValue) -> bool {
        self == other
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Unit, HostValue::Unit) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Int(a), HostValue::Int(b)) => a == b,
            (HostValue::Float(a), HostValue::Float(b)) => a.to_bits() == b.to_bits(),
            (HostValue::Str(a), HostValue::Str(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<i64> for HostValue {
    fn from(n: i64) -> Self {
        HostValue::Int(n)
    }
}

impl From<i32> for HostValue {
    fn from(n: i32) -> Self {
        HostValue::Int(n as i64)
    }
}

impl From<f64> for HostValue {
    fn from(x: f64) -> Self {
        HostValue::Float(x)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::Str(Arc::from(s))
    }
}

impl From<ObjectRef> for HostValue {
    fn from(o: ObjectRef) -> Self {
        HostValue::Object(o)
    }
}
