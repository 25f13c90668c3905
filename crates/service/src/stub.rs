//! Callee-side object wrappers.
//!
//! An object stub owns one concrete implementation for as long as any
//! other zone references it. It keeps one reference counter per caller
//! zone, so a zone that disappears can be torn out without disturbing
//! the references other zones still hold, and a set of interface stubs,
//! one per interface the object has been used through. The interface
//! stubs themselves are produced by the code generator; the runtime only
//! knows their dispatch surface.

use crate::{Service, casting::Castable};

use std::sync::{Arc, Weak};

use ahash::{HashMap, HashMapExt};
use codec::{
    Encoding,
    error::Error,
    ids::{CallerChannelZone, CallerZone, InterfaceOrdinal, MethodId, ObjectId},
};
use parking_lot::{Mutex, RwLock};

/// Everything a generated stub needs to serve one call: the service for
/// resolving and marshalling object references in the parameters, the
/// routing coordinates of the caller, and the payload encoding.
pub struct CallContext {
    pub service: Arc<Service>,
    pub caller_channel: CallerChannelZone,
    pub caller: CallerZone,
    pub encoding: Encoding,
}

/// Per-interface dispatch surface over an object stub. Implementations
/// are generated; they decode the payload, invoke the implementation and
/// encode the outputs.
pub trait InterfaceStub: Send + Sync + 'static {
    fn interface(&self) -> InterfaceOrdinal;

    /// Whether the generated marshalling for this interface understands
    /// `encoding`. Json must always be accepted.
    fn supports(&self, encoding: Encoding) -> bool;

    fn call(
        &self,
        context: &CallContext,
        method: MethodId,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error>;
}

/// Constructor for one interface's stub, registered once per process by
/// the generated bootstrap code. `create` returns `None` when the
/// implementation does not expose the factory's interface.
pub trait StubFactory: Send + Sync + 'static {
    fn interface(&self) -> InterfaceOrdinal;

    fn create(&self, implementation: &Arc<dyn Castable>) -> Option<Arc<dyn InterfaceStub>>;
}

/// Callee-side owner of one concrete object.
pub struct ObjectStub {
    object: ObjectId,
    /// Pointer identity of the implementation, for the one-stub-per-
    /// instance guarantee.
    identity: usize,
    castable: Arc<dyn Castable>,
    interfaces: RwLock<HashMap<InterfaceOrdinal, Arc<dyn InterfaceStub>>>,
    counts: Mutex<HashMap<CallerZone, u64>>,
    service: Weak<Service>,
}

impl ObjectStub {
    pub(crate) fn new(
        object: ObjectId,
        identity: usize,
        castable: Arc<dyn Castable>,
        service: Weak<Service>,
    ) -> Arc<Self> {
        Arc::new(Self {
            object,
            identity,
            castable,
            interfaces: RwLock::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
            service,
        })
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub(crate) fn identity(&self) -> usize {
        self.identity
    }

    /// The concrete implementation's casting surface, for in-zone typing.
    pub fn get_castable_interface(&self) -> &Arc<dyn Castable> {
        &self.castable
    }

    /// Weak back-link to the owning service.
    pub fn get_zone(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    pub fn interface(&self, ordinal: InterfaceOrdinal) -> Option<Arc<dyn InterfaceStub>> {
        self.interfaces.read().get(&ordinal).cloned()
    }

    pub(crate) fn install_interface(&self, stub: Arc<dyn InterfaceStub>) {
        self.interfaces.write().insert(stub.interface(), stub);
    }

    /// Grants `caller` another `delta` references. Returns that caller's
    /// updated count.
    pub fn add_ref(&self, caller: CallerZone, delta: u64) -> u64 {
        let mut counts = self.counts.lock();
        let count = counts.entry(caller).or_insert(0);
        *count += delta;
        *count
    }

    /// Returns `delta` references held by `caller`. Yields the caller's
    /// remaining count; releasing more than was granted is a protocol
    /// violation reported as invalid data.
    pub fn release(&self, caller: CallerZone, delta: u64) -> Result<u64, Error> {
        let mut counts = self.counts.lock();
        let Some(count) = counts.get_mut(&caller) else {
            return Err(Error::InvalidData);
        };

        if *count < delta {
            return Err(Error::InvalidData);
        }

        *count -= delta;
        let remaining = *count;
        if remaining == 0 {
            counts.remove(&caller);
        }

        Ok(remaining)
    }

    /// Forgets every reference `caller` held, used when that zone
    /// announces it is terminating. Reports whether the caller held
    /// anything and the total count left over across all other callers.
    pub(crate) fn purge(&self, caller: CallerZone) -> (bool, u64) {
        let mut counts = self.counts.lock();
        let held = counts.remove(&caller).is_some();
        (held, counts.values().sum())
    }

    /// Outstanding references across every caller zone. The stub is torn
    /// down when this reaches zero.
    pub fn total_count(&self) -> u64 {
        self.counts.lock().values().sum()
    }

    /// References held by one caller zone, mainly for diagnostics.
    pub fn count_for(&self, caller: CallerZone) -> u64 {
        self.counts.lock().get(&caller).copied().unwrap_or(0)
    }
}
