//! Caller-side endpoint towards one peer zone.
//!
//! A service proxy pairs a destination zone with the channel used to
//! reach it and owns the negotiation state for that edge: the protocol
//! revision the peer last accepted and the payload encoding it prefers.
//! It also keeps the weak map of object proxies for that destination, so
//! that any number of handles to the same remote object collapse onto a
//! single proxy.
//!
//! The transport underneath is out of the runtime's scope. In-process
//! channels, sockets and enclave bridges all look the same from here:
//! five operations that move a frame and return the peer's answer.

use crate::{Service, proxy::ObjectProxy};

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
};

use ahash::{HashMap, HashMapExt};
use codec::{
    AddRefOptions, Encoding, PostOptions, SUPPORTED_PROTOCOL_VERSIONS,
    error::Error,
    frame::{AddRefFrame, PostFrame, ReleaseFrame, SendFrame, TryCastFrame},
    ids::{
        CallerZone, DestinationChannelZone, DestinationZone, InterfaceDescriptor, InterfaceOrdinal,
        MethodId, ObjectId, Zone,
    },
};
use parking_lot::Mutex;

/// One concrete channel to an adjacent zone.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: SendFrame<'_>) -> Result<Vec<u8>, Error>;

    fn try_cast(&self, request: TryCastFrame) -> Result<(), Error>;

    /// Returns the updated reference count reported by the destination.
    fn add_ref(&self, request: AddRefFrame) -> Result<u64, Error>;

    /// Returns the remaining reference count reported by the destination.
    fn release(&self, request: ReleaseFrame) -> Result<u64, Error>;

    fn post(&self, request: PostFrame<'_>) -> Result<(), Error>;
}

pub struct ServiceProxy {
    /// The zone this proxy leads to.
    destination: DestinationZone,
    /// The local zone.
    zone: Zone,
    /// The adjacent zone whose channel carries this proxy's traffic.
    /// Equals the destination when the link is direct.
    via: Zone,
    transport: Arc<dyn Transport>,
    proxies: Mutex<HashMap<ObjectId, Weak<ObjectProxy>>>,
    /// Negotiated protocol revision for this edge. Only ever decreases.
    version: AtomicU64,
    /// Preferred payload encoding for this edge, as a wire tag.
    encoding: AtomicU64,
    /// Wire references granted through this edge and not yet returned.
    granted: AtomicI64,
    tags: AtomicU64,
    /// Installed by an explicit attach rather than by routing, never
    /// pruned automatically.
    attached: bool,
    alive: AtomicBool,
    service: Weak<Service>,
}

impl ServiceProxy {
    pub(crate) fn new(
        service: Weak<Service>,
        zone: Zone,
        destination: DestinationZone,
        via: Zone,
        transport: Arc<dyn Transport>,
        attached: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            destination,
            zone,
            via,
            transport,
            proxies: Mutex::new(HashMap::new()),
            version: AtomicU64::new(SUPPORTED_PROTOCOL_VERSIONS[0]),
            encoding: AtomicU64::new(Encoding::Binary.into()),
            granted: AtomicI64::new(0),
            tags: AtomicU64::new(1),
            attached,
            alive: AtomicBool::new(true),
            service,
        })
    }

    /// A proxy to a different destination over the same channel,
    /// inheriting this edge's negotiation state. This is how routes are
    /// extended when a descriptor for a previously unseen zone arrives.
    pub(crate) fn clone_for(&self, destination: DestinationZone) -> Arc<Self> {
        let proxy = Self::new(
            self.service.clone(),
            self.zone,
            destination,
            self.via,
            self.transport.clone(),
            false,
        );

        proxy.version.store(self.version(), Ordering::Relaxed);
        proxy.encoding.store(self.encoding().into(), Ordering::Relaxed);
        proxy
    }

    pub fn destination(&self) -> DestinationZone {
        self.destination
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    pub fn via(&self) -> Zone {
        self.via
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn encoding(&self) -> Encoding {
        Encoding::try_from(self.encoding.load(Ordering::Acquire)).unwrap_or(Encoding::Binary)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    pub(crate) fn granted(&self) -> i64 {
        self.granted.load(Ordering::Acquire)
    }

    fn next_tag(&self) -> u64 {
        self.tags.fetch_add(1, Ordering::Relaxed)
    }

    /// Marks the edge lost. Outstanding and future operations fail with
    /// a transport error and object proxies release synthetically, there
    /// is no peer left to account the references with.
    pub fn mark_terminal(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            log::debug!(
                "zone {} closed its channel towards zone {}",
                self.zone,
                self.destination,
            );
        }
    }

    /// Runs `operation` at the edge's negotiated revision, dropping the
    /// revision and retrying when the peer rejects it. Fallback stops at
    /// the lowest supported revision; the rejection is surfaced then.
    fn with_version<T>(
        &self,
        mut operation: impl FnMut(u64) -> Result<T, Error>,
    ) -> Result<T, Error> {
        if !self.is_alive() {
            return Err(Error::TransportError);
        }

        let mut version = self.version();
        loop {
            match operation(version) {
                Err(Error::InvalidVersion) => match codec::next_version_below(version) {
                    Some(next) => {
                        self.version.fetch_min(next, Ordering::AcqRel);
                        version = next;
                    }
                    None => return Err(Error::InvalidVersion),
                },
                Err(Error::TransportError) => {
                    self.mark_terminal();
                    return Err(Error::TransportError);
                }
                other => return other,
            }
        }
    }

    /// The unique object proxy for `object` on this edge, resuscitating
    /// the registered one when it is still alive. The boolean reports
    /// whether a new proxy was created.
    pub fn get_proxy(self: &Arc<Self>, object: ObjectId) -> (Arc<ObjectProxy>, bool) {
        let mut proxies = self.proxies.lock();
        if let Some(existing) = proxies.get(&object).and_then(Weak::upgrade) {
            return (existing, false);
        }

        let proxy = ObjectProxy::new(
            InterfaceDescriptor::new(self.destination, object),
            self.clone(),
        );

        proxies.insert(object, Arc::downgrade(&proxy));
        (proxy, true)
    }

    /// Drops the registration for `object` if its proxy is gone. Called
    /// from the object proxy's destructor; a freshly resuscitated entry
    /// is left alone.
    pub(crate) fn forget_proxy(&self, object: ObjectId) {
        let mut proxies = self.proxies.lock();
        if let Some(weak) = proxies.get(&object) {
            if weak.upgrade().is_none() {
                proxies.remove(&object);
            }
        }
    }

    /// Live object proxies on this edge.
    pub fn proxy_count(&self) -> usize {
        self.proxies
            .lock()
            .values()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }

    /// An originating call. The payload is produced by `marshal` for the
    /// edge's preferred encoding; when the callee's stub rejects that
    /// encoding, the call re-marshals with the universal encoding and
    /// retries exactly once. Returns the encoding actually used so the
    /// caller can decode the reply with it.
    pub fn call(
        &self,
        object: ObjectId,
        interface: InterfaceOrdinal,
        method: MethodId,
        marshal: &dyn Fn(Encoding) -> Result<Vec<u8>, Error>,
    ) -> Result<(Encoding, Vec<u8>), Error> {
        let encoding = self.encoding();
        let payload = marshal(encoding)?;
        match self.send_raw(encoding, &payload, object, interface, method) {
            Err(Error::IncompatibleSerialisation) if encoding != Encoding::universal() => {
                let fallback = Encoding::universal();
                let payload = marshal(fallback)?;
                let output = self.send_raw(fallback, &payload, object, interface, method)?;
                self.encoding.store(fallback.into(), Ordering::Release);
                Ok((fallback, output))
            }
            other => other.map(|output| (encoding, output)),
        }
    }

    fn send_raw(
        &self,
        encoding: Encoding,
        payload: &[u8],
        object: ObjectId,
        interface: InterfaceOrdinal,
        method: MethodId,
    ) -> Result<Vec<u8>, Error> {
        self.with_version(|version| {
            self.transport.send(SendFrame {
                version,
                tag: self.next_tag(),
                encoding,
                caller_channel: self.zone.as_caller_channel(),
                caller: self.zone.as_caller(),
                destination: self.destination,
                object,
                interface,
                method,
                payload,
            })
        })
    }

    /// Relays a call that originated in another zone. The caller stays
    /// the original zone, the channel becomes this zone, and the payload
    /// passes through untouched; re-encoding is the originator's business.
    pub(crate) fn forward_send(
        &self,
        encoding: Encoding,
        caller: CallerZone,
        destination: DestinationZone,
        object: ObjectId,
        interface: InterfaceOrdinal,
        method: MethodId,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        self.with_version(|version| {
            self.transport.send(SendFrame {
                version,
                tag: self.next_tag(),
                encoding,
                caller_channel: self.zone.as_caller_channel(),
                caller,
                destination,
                object,
                interface,
                method,
                payload,
            })
        })
    }

    pub fn try_cast(
        &self,
        destination: DestinationZone,
        object: ObjectId,
        interface: InterfaceOrdinal,
    ) -> Result<(), Error> {
        self.with_version(|version| {
            self.transport.try_cast(TryCastFrame {
                version,
                tag: self.next_tag(),
                destination,
                object,
                interface,
            })
        })
    }

    /// Emits or relays an `add_ref` over this edge. `caller_channel` is
    /// always the local zone on the wire; `caller` names the zone that
    /// will hold the reference, which is not necessarily this one.
    pub(crate) fn add_ref(
        &self,
        destination_channel: DestinationChannelZone,
        destination: DestinationZone,
        object: ObjectId,
        caller: CallerZone,
        known_direction: Zone,
        options: AddRefOptions,
    ) -> Result<u64, Error> {
        let count = self.with_version(|version| {
            self.transport.add_ref(AddRefFrame {
                version,
                tag: self.next_tag(),
                destination_channel,
                destination,
                object,
                caller_channel: self.zone.as_caller_channel(),
                caller,
                known_direction,
                options,
            })
        })?;

        self.granted.fetch_add(1, Ordering::AcqRel);
        Ok(count)
    }

    /// Returns one reference held by `caller`. Mirrors `add_ref`; the
    /// edge's grant balance shrinks with each successful release.
    pub(crate) fn release_as(
        &self,
        destination: DestinationZone,
        object: ObjectId,
        caller: CallerZone,
    ) -> Result<u64, Error> {
        let count = self.with_version(|version| {
            self.transport.release(ReleaseFrame {
                version,
                tag: self.next_tag(),
                destination,
                object,
                caller,
            })
        })?;

        self.granted.fetch_sub(1, Ordering::AcqRel);
        Ok(count)
    }

    /// Returns one of this zone's own references on `object`.
    pub fn release(&self, object: ObjectId) -> Result<u64, Error> {
        self.release_as(self.destination, object, self.zone.as_caller())
    }

    /// A one-way message. Errors are reported to the caller of this
    /// method but never travel back to any remote originator.
    pub(crate) fn post(
        &self,
        encoding: Encoding,
        caller: CallerZone,
        destination: DestinationZone,
        object: ObjectId,
        interface: InterfaceOrdinal,
        method: MethodId,
        options: PostOptions,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.with_version(|version| {
            self.transport.post(PostFrame {
                version,
                tag: self.next_tag(),
                encoding,
                caller_channel: self.zone.as_caller_channel(),
                caller,
                destination,
                object,
                interface,
                method,
                options,
                payload,
            })
        })
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("zone", &self.zone)
            .field("destination", &self.destination)
            .field("via", &self.via)
            .field("version", &self.version())
            .finish()
    }
}
