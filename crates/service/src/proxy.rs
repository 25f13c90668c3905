//! Caller-side object handles.
//!
//! An object proxy is the one local stand-in for one remote object. All
//! typed handles to that object, whatever interface they view it
//! through, share the single proxy; the proxy records how many wire
//! references were taken out on its behalf and returns every one of them
//! when the last typed handle is dropped.
//!
//! Typed interface proxies are generated. The runtime's contract with
//! them is [`RemoteProxy`]: given an object proxy, build the typed view,
//! and say which interface ordinal it speaks for.

use crate::service_proxy::ServiceProxy;

use std::any::Any;
use std::sync::{Arc, Weak, atomic::{AtomicU64, Ordering}};

use ahash::{HashMap, HashMapExt};
use codec::{
    Encoding, PostOptions,
    error::Error,
    ids::{InterfaceDescriptor, InterfaceOrdinal, MethodId, ObjectId},
};
use parking_lot::Mutex;

/// The generated-code contract for typed proxies, implemented on the
/// interface trait object itself.
pub trait RemoteProxy {
    /// The wire ordinal of the interface this proxy speaks for.
    fn ordinal() -> InterfaceOrdinal;

    /// Builds the typed view over an object proxy.
    fn build(object: Arc<ObjectProxy>) -> Arc<Self>;
}

/// Caller-side handle to one remote object.
pub struct ObjectProxy {
    descriptor: InterfaceDescriptor,
    service_proxy: Arc<ServiceProxy>,
    /// Typed views over this proxy, one per interface ordinal. The
    /// entries are weak so a view dies with its last outside holder; a
    /// present entry, alive or not, also records that the remote object
    /// confirmed the interface.
    interfaces: Mutex<HashMap<InterfaceOrdinal, Box<dyn Any + Send + Sync>>>,
    /// Wire references taken out on this proxy's behalf. Every one is
    /// matched by a release when the proxy is destroyed.
    grants: AtomicU64,
}

impl ObjectProxy {
    pub(crate) fn new(
        descriptor: InterfaceDescriptor,
        service_proxy: Arc<ServiceProxy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            service_proxy,
            interfaces: Mutex::new(HashMap::new()),
            grants: AtomicU64::new(0),
        })
    }

    pub fn descriptor(&self) -> InterfaceDescriptor {
        self.descriptor
    }

    pub fn service_proxy(&self) -> &Arc<ServiceProxy> {
        &self.service_proxy
    }

    /// Wire references currently owed back to the object's home zone.
    pub fn grants(&self) -> u64 {
        self.grants.load(Ordering::Acquire)
    }

    /// Takes ownership of `count` wire references granted by a sender or
    /// by this zone's own `add_ref`.
    pub(crate) fn adopt(&self, count: u64) {
        self.grants.fetch_add(count, Ordering::AcqRel);
    }

    /// The typed view of this object for interface `I`, building and
    /// caching it on first use. All holders of the same interface share
    /// one view.
    pub fn typed<I>(self: &Arc<Self>) -> Arc<I>
    where
        I: RemoteProxy + Send + Sync + ?Sized + 'static,
    {
        let mut interfaces = self.interfaces.lock();
        if let Some(entry) = interfaces.get(&I::ordinal()) {
            if let Some(existing) = entry.downcast_ref::<Weak<I>>().and_then(Weak::upgrade) {
                return existing;
            }
        }

        let view = I::build(self.clone());
        interfaces.insert(I::ordinal(), Box::new(Arc::downgrade(&view)));
        view
    }

    /// Asks the object's home zone whether it implements `I`. A
    /// confirmed interface is remembered, repeated queries answer from
    /// the cache.
    pub fn query_remote<I>(self: &Arc<Self>) -> Result<Option<Arc<I>>, Error>
    where
        I: RemoteProxy + Send + Sync + ?Sized + 'static,
    {
        {
            if self.interfaces.lock().contains_key(&I::ordinal()) {
                return Ok(Some(self.typed::<I>()));
            }
        }

        match self.service_proxy.try_cast(
            self.descriptor.destination,
            self.descriptor.object,
            I::ordinal(),
        ) {
            Ok(()) => Ok(Some(self.typed::<I>())),
            Err(Error::InvalidInterfaceId) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Sends one method call on this object. `marshal` produces the
    /// payload for whichever encoding the edge settles on; the reply
    /// bytes come back with that encoding so the generated code can
    /// decode them.
    pub fn call(
        &self,
        interface: InterfaceOrdinal,
        method: MethodId,
        marshal: &dyn Fn(Encoding) -> Result<Vec<u8>, Error>,
    ) -> Result<(Encoding, Vec<u8>), Error> {
        self.service_proxy
            .call(self.descriptor.object, interface, method, marshal)
    }

    /// Fires one one-way message at this object. Nothing comes back,
    /// not even errors; delivery is best effort by design.
    pub fn post(
        &self,
        interface: InterfaceOrdinal,
        method: MethodId,
        options: PostOptions,
        marshal: &dyn Fn(Encoding) -> Result<Vec<u8>, Error>,
    ) -> Result<(), Error> {
        let encoding = self.service_proxy.encoding();
        self.service_proxy.post(
            encoding,
            self.service_proxy.zone().as_caller(),
            self.descriptor.destination,
            self.descriptor.object,
            interface,
            method,
            options,
            &marshal(encoding)?,
        )
    }

    fn object(&self) -> ObjectId {
        self.descriptor.object
    }
}

impl Drop for ObjectProxy {
    fn drop(&mut self) {
        self.service_proxy.forget_proxy(self.object());

        // Return every wire reference taken out on this proxy's behalf.
        // Release failures are logged and swallowed; the holder cannot
        // act on them and the counts must not be retried into imbalance.
        let grants = self.grants.load(Ordering::Acquire);
        if self.service_proxy.is_alive() {
            for _ in 0..grants {
                if let Err(error) = self.service_proxy.release(self.object()) {
                    log::warn!(
                        "release of {} from zone {} failed: {}",
                        self.descriptor,
                        self.service_proxy.zone(),
                        error,
                    );
                    break;
                }
            }
        }

        if let Some(service) = self.service_proxy.service() {
            service.prune_peer(&self.service_proxy);
        }
    }
}

impl std::fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("descriptor", &self.descriptor.to_string())
            .field("grants", &self.grants())
            .finish()
    }
}
