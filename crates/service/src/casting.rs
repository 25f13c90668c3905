//! Runtime interface casting.
//!
//! A concrete implementation satisfies a set of interfaces. Instead of
//! language-level multiple inheritance, the capability set is a lookup
//! from interface ordinal to a typed handle: [`Castable::query_interface`]
//! answers "does this object implement that interface, and if so hand me
//! a handle for it". The generated code implements it for every
//! implementation type, enumerating the interfaces it was declared with.
//!
//! [`dynamic_cast`] is the caller-side counterpart. On a local object it
//! is a table lookup; on a remote handle it becomes a `try_cast` to the
//! object's home zone, and a second typed proxy is produced over the same
//! object proxy when the answer is yes.

use crate::proxy::{ObjectProxy, RemoteProxy};

use std::any::Any;
use std::sync::Arc;

use codec::{error::Error, ids::InterfaceOrdinal};

/// A type-erased handle to a typed interface `Arc`.
///
/// The inner value is the `Arc<dyn SomeInterface>` itself, stored behind
/// `Any`, so downcasting recovers the exact typed handle without a copy
/// of the object.
#[derive(Clone)]
pub struct InterfaceRef(Arc<dyn Any + Send + Sync>);

impl InterfaceRef {
    pub fn new<I>(interface: Arc<I>) -> Self
    where
        I: ?Sized + Send + Sync + 'static,
    {
        Self(Arc::new(interface))
    }

    pub fn downcast<I>(&self) -> Option<Arc<I>>
    where
        I: ?Sized + Send + Sync + 'static,
    {
        self.0.downcast_ref::<Arc<I>>().cloned()
    }
}

impl std::fmt::Debug for InterfaceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InterfaceRef")
    }
}

/// The casting surface every remotable implementation exposes.
pub trait Castable: Send + Sync + 'static {
    /// Maps an interface ordinal to a typed handle on this object, or
    /// `None` when the object does not implement the interface.
    fn query_interface(self: Arc<Self>, interface: InterfaceOrdinal) -> Option<InterfaceRef>;

    /// This object as a plain castable handle, preserving identity.
    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable>;
}

/// Marks handles that may be remote. A typed proxy reports the object
/// proxy it rides on; a local implementation reports nothing.
pub trait Proxied {
    fn object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        None
    }
}

/// Umbrella bound for interface trait objects: castable locally,
/// identifiable as remote, sendable across threads.
pub trait Interface: Castable + Proxied + Send + Sync + 'static {}

impl<T> Interface for T where T: Castable + Proxied + Send + Sync + 'static + ?Sized {}

/// Cross-zone dynamic cast.
///
/// Returns `Ok(None)` when the target object does not implement `To`.
/// The query is idempotent: once an interface has been confirmed, later
/// casts are answered from the proxy's cache without touching the wire.
pub fn dynamic_cast<To, From>(from: &Arc<From>) -> Result<Option<Arc<To>>, Error>
where
    To: RemoteProxy + Send + Sync + ?Sized + 'static,
    From: Interface + ?Sized,
{
    if let Some(proxy) = from.object_proxy() {
        return proxy.query_remote::<To>();
    }

    Ok(from
        .clone()
        .query_interface(To::ordinal())
        .and_then(|interface| interface.downcast::<To>()))
}
