//! ## Cross-zone RPC service
//!
//! One service per zone. The service owns every object the zone exposes
//! to its neighbours, every route towards the zones it can reach, and
//! the reference-count protocol that keeps remote objects alive exactly
//! as long as somebody in the topology still holds them.
//!
//! The caller surface is typed: [`Service::expose`] turns a local
//! implementation into a wire descriptor, [`Service::resolve`] and
//! [`Service::acquire`] turn descriptors back into typed handles.
//! The callee surface is the uniform set of wire operations a transport
//! delivers: `send`, `try_cast`, `add_ref`, `release` and `post`, with
//! routing applied whenever the destination is not this zone.
//!
//! Locking discipline: the service's maps are read-mostly and guarded by
//! `parking_lot` locks taken for short scopes. No lock is ever held
//! across a transport operation, callbacks re-entering this zone from
//! inside an outbound call are expected and safe.

pub mod casting;
pub mod local;
pub mod proxy;
pub mod routing;
pub mod service_proxy;
pub mod stub;

pub use crate::{
    casting::{Castable, Interface, InterfaceRef, Proxied, dynamic_cast},
    proxy::{ObjectProxy, RemoteProxy},
    service_proxy::{ServiceProxy, Transport},
    stub::{CallContext, InterfaceStub, ObjectStub, StubFactory},
};

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use codec::{
    AddRefOptions, Encoding, PostOptions, SUPPORTED_PROTOCOL_VERSIONS,
    error::Error,
    frame::{SendFrame, TryCastFrame},
    ids::{
        CallerChannelZone, CallerZone, DestinationZone, InterfaceDescriptor, InterfaceOrdinal,
        MethodId, ObjectId, Zone,
    },
};
use parking_lot::RwLock;

pub struct ServiceOptions {
    pub zone: Zone,
    /// Diagnostic label carried in log lines.
    pub name: String,
    /// Protocol revisions this zone accepts, newest first.
    pub supported_versions: Vec<u64>,
}

impl ServiceOptions {
    pub fn new(zone: Zone, name: impl Into<String>) -> Self {
        Self {
            zone,
            name: name.into(),
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS.to_vec(),
        }
    }
}

/// Where a descriptor being resolved arrived from, so a missing route
/// can be extended over the channel that delivered it.
enum Arrival<'a> {
    /// The reply path of a call made through this proxy.
    Proxy(&'a Arc<ServiceProxy>),
    /// An inbound parameter, delivered through the first adjacent zone
    /// by the named caller. The caller is the direction hint: it is the
    /// zone that knows how to reach whatever it sent us.
    Channel(CallerChannelZone, CallerZone),
}

/// The zone-local root of the runtime.
pub struct Service {
    zone: Zone,
    name: String,
    supported_versions: Vec<u64>,
    /// Objects this zone exposes, by minted id.
    pub(crate) objects: RwLock<HashMap<ObjectId, Arc<ObjectStub>>>,
    /// Implementation pointer to object id, one stub per instance.
    pub(crate) identities: RwLock<HashMap<usize, ObjectId>>,
    /// Route table: destination zone to the edge that carries it.
    pub(crate) peers: RwLock<HashMap<DestinationZone, Arc<ServiceProxy>>>,
    /// Reverse adjacency: zones that call us and how to answer them.
    pub(crate) callers: RwLock<HashMap<CallerZone, Arc<ServiceProxy>>>,
    /// Direction hints: destination to an intermediate known to reach it.
    pub(crate) hints: RwLock<HashMap<DestinationZone, Zone>>,
    /// Physical channels by adjacent zone.
    pub(crate) links: RwLock<HashMap<Zone, Arc<dyn Transport>>>,
    pub(crate) factories: RwLock<HashMap<InterfaceOrdinal, Arc<dyn StubFactory>>>,
    /// Caller zones that announced shutdown; no new calls are accepted
    /// from them.
    pub(crate) terminating: RwLock<HashSet<CallerZone>>,
    next_object: AtomicU64,
    terminated: AtomicBool,
    this: Weak<Service>,
}

impl Service {
    pub fn new(options: ServiceOptions) -> Arc<Self> {
        assert!(!options.zone.is_none(), "zone id zero is reserved");

        Arc::new_cyclic(|this| Self {
            zone: options.zone,
            name: options.name,
            supported_versions: options.supported_versions,
            objects: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            callers: RwLock::new(HashMap::new()),
            hints: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            terminating: RwLock::new(HashSet::new()),
            next_object: AtomicU64::new(1),
            terminated: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn supports_version(&self, version: u64) -> bool {
        self.supported_versions.contains(&version)
    }

    /// Wires a generated stub constructor into the dispatch table.
    pub fn register_stub_factory(&self, factory: Arc<dyn StubFactory>) {
        self.factories.write().insert(factory.interface(), factory);
    }

    /// Registers the physical channel to an adjacent zone without
    /// routing anything over it yet.
    pub fn register_link(&self, adjacent: Zone, transport: Arc<dyn Transport>) {
        self.links.write().insert(adjacent, transport);
    }

    /// Reports the channel to an adjacent zone as lost. Every route that
    /// rode it goes terminal: outstanding calls fail with a transport
    /// error and object proxies release synthetically.
    pub fn lose_channel(&self, adjacent: Zone) {
        self.links.write().remove(&adjacent);

        let mut lost = Vec::new();
        {
            let mut peers = self.peers.write();
            peers.retain(|_, proxy| {
                if proxy.via() == adjacent {
                    lost.push(proxy.clone());
                    false
                } else {
                    true
                }
            });
        }
        {
            let mut callers = self.callers.write();
            callers.retain(|_, proxy| {
                if proxy.via() == adjacent {
                    lost.push(proxy.clone());
                    false
                } else {
                    true
                }
            });
        }

        self.hints.write().retain(|_, zone| *zone != adjacent);
        for proxy in lost {
            proxy.mark_terminal();
        }
    }

    pub(crate) fn proxy_over_link(
        &self,
        channel: Zone,
        destination: DestinationZone,
    ) -> Option<Arc<ServiceProxy>> {
        let transport = self.links.read().get(&channel).cloned()?;
        Some(ServiceProxy::new(
            self.this.clone(),
            self.zone,
            destination,
            channel,
            transport,
            false,
        ))
    }

    /// Creates the edge used to reach a newly reachable peer zone and
    /// enters it into the route table.
    pub fn attach_remote_zone(
        &self,
        destination: DestinationZone,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<ServiceProxy>, Error> {
        if destination.is_none() || destination == self.zone.as_destination() {
            return Err(Error::InvalidData);
        }

        if let Some(existing) = self.peers.read().get(&destination).cloned() {
            return Ok(existing);
        }

        self.register_link(destination.as_zone(), transport.clone());
        let proxy = ServiceProxy::new(
            self.this.clone(),
            self.zone,
            destination,
            destination.as_zone(),
            transport,
            true,
        );

        self.peers.write().insert(destination, proxy.clone());
        log::debug!("zone {} attached remote zone {}", self.zone, destination);
        Ok(proxy)
    }

    /// Tears an attached edge out of the route table again, used to
    /// unwind a half-built bidirectional attachment.
    pub fn detach_remote_zone(&self, destination: DestinationZone) {
        self.peers.write().remove(&destination);
        self.links.write().remove(&destination.as_zone());
    }

    /// The edge currently routed towards `destination`, if any.
    pub fn peer(&self, destination: DestinationZone) -> Option<Arc<ServiceProxy>> {
        self.peers.read().get(&destination).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    pub fn find_stub(&self, object: ObjectId) -> Option<Arc<ObjectStub>> {
        self.objects.read().get(&object).cloned()
    }

    pub(crate) fn remove_stub(&self, object: ObjectId) {
        let Some(stub) = self.objects.write().remove(&object) else {
            return;
        };

        self.identities.write().remove(&stub.identity());
        log::debug!("zone {} dropped object stub {}", self.zone, object);
    }

    /// Registers a local implementation so remote zones may refer to it.
    /// One instance gets one stub, exposing it again yields the same
    /// descriptor.
    pub fn expose(&self, implementation: Arc<dyn Castable>) -> Result<InterfaceDescriptor, Error> {
        let identity = Arc::as_ptr(&implementation) as *const () as usize;

        {
            if let Some(&object) = self.identities.read().get(&identity) {
                return Ok(InterfaceDescriptor::new(self.zone.as_destination(), object));
            }
        }

        // Wrap the implementation in a stub for every registered
        // interface it answers to, before taking any map lock.
        let stubs: Vec<_> = {
            let factories = self.factories.read();
            factories
                .values()
                .filter_map(|factory| factory.create(&implementation))
                .collect()
        };

        if stubs.is_empty() {
            return Err(Error::InvalidInterfaceId);
        }

        let mut identities = self.identities.write();
        if let Some(&object) = identities.get(&identity) {
            return Ok(InterfaceDescriptor::new(self.zone.as_destination(), object));
        }

        let object = ObjectId::new(self.next_object.fetch_add(1, Ordering::Relaxed));
        let stub = ObjectStub::new(object, identity, implementation, self.this.clone());
        for interface in stubs {
            stub.install_interface(interface);
        }

        self.objects.write().insert(object, stub);
        identities.insert(identity, object);

        log::debug!("zone {} exposed object {}", self.zone, object);
        Ok(InterfaceDescriptor::new(self.zone.as_destination(), object))
    }

    /// Resolves a descriptor that came back in a reply received through
    /// `via`. The sender granted the reference before handing the
    /// descriptor over; resolving adopts that grant.
    pub fn resolve<I>(
        &self,
        descriptor: InterfaceDescriptor,
        via: &Arc<ServiceProxy>,
    ) -> Result<Arc<I>, Error>
    where
        I: RemoteProxy + Send + Sync + ?Sized + 'static,
    {
        self.adopt_granted(descriptor, Arrival::Proxy(via))
    }

    /// Resolves a descriptor that arrived inside an inbound call from
    /// `caller` through the adjacent zone `channel`.
    pub fn resolve_inbound<I>(
        &self,
        descriptor: InterfaceDescriptor,
        channel: CallerChannelZone,
        caller: CallerZone,
    ) -> Result<Arc<I>, Error>
    where
        I: RemoteProxy + Send + Sync + ?Sized + 'static,
    {
        self.adopt_granted(descriptor, Arrival::Channel(channel, caller))
    }

    /// Resolves a descriptor obtained out of band, issuing this zone's
    /// own reference grant for it. Requires an existing route or hint
    /// towards the descriptor's home.
    pub fn acquire<I>(&self, descriptor: InterfaceDescriptor) -> Result<Arc<I>, Error>
    where
        I: RemoteProxy + Send + Sync + ?Sized + 'static,
    {
        if !descriptor.is_valid() {
            return Err(Error::InvalidData);
        }

        if descriptor.destination == self.zone.as_destination() {
            return self.resolve_local(descriptor);
        }

        let route = self.next_hop(descriptor.destination, None)?;
        let (proxy, _created) = route.get_proxy(descriptor.object);
        let known = self
            .hints
            .read()
            .get(&descriptor.destination)
            .copied()
            .unwrap_or(route.via());

        route.add_ref(
            route.via().as_destination_channel(),
            descriptor.destination,
            descriptor.object,
            self.zone.as_caller(),
            known,
            AddRefOptions::BUILD_DESTINATION_ROUTE | AddRefOptions::BUILD_CALLER_ROUTE,
        )?;

        proxy.adopt(1);
        Ok(proxy.typed::<I>())
    }

    /// Prepares an object reference for marshalling to `receiver`: the
    /// receiving zone is granted its wire reference before the
    /// descriptor travels, so the object cannot die in transit.
    pub fn marshal_reference<I>(
        &self,
        target: &Arc<I>,
        receiver: CallerZone,
    ) -> Result<InterfaceDescriptor, Error>
    where
        I: Interface + ?Sized,
    {
        if let Some(remote) = target.object_proxy() {
            let descriptor = remote.descriptor();
            if receiver.as_zone() == descriptor.destination.as_zone() {
                // The reference is going home; the receiver owns the
                // real object and needs no grant for it.
                return Ok(descriptor);
            }

            let route = remote.service_proxy();
            let known = self
                .hints
                .read()
                .get(&descriptor.destination)
                .copied()
                .unwrap_or(route.via());

            route.add_ref(
                route.via().as_destination_channel(),
                descriptor.destination,
                descriptor.object,
                receiver,
                known,
                AddRefOptions::BUILD_CALLER_ROUTE,
            )?;

            return Ok(descriptor);
        }

        let descriptor = self.expose(target.clone().as_castable())?;
        if receiver.as_zone() != self.zone {
            let stub = self.find_stub(descriptor.object).ok_or(Error::InvalidData)?;
            stub.add_ref(receiver, 1);
        }

        Ok(descriptor)
    }

    /// A descriptor naming this zone resolves straight back to the
    /// implementation it was exposed from, preserving identity.
    fn resolve_local<I>(&self, descriptor: InterfaceDescriptor) -> Result<Arc<I>, Error>
    where
        I: RemoteProxy + Send + Sync + ?Sized + 'static,
    {
        let stub = self.find_stub(descriptor.object).ok_or(Error::InvalidData)?;
        stub.get_castable_interface()
            .clone()
            .query_interface(I::ordinal())
            .and_then(|interface| interface.downcast::<I>())
            .ok_or(Error::InvalidInterfaceId)
    }

    fn adopt_granted<I>(
        &self,
        descriptor: InterfaceDescriptor,
        arrival: Arrival<'_>,
    ) -> Result<Arc<I>, Error>
    where
        I: RemoteProxy + Send + Sync + ?Sized + 'static,
    {
        if !descriptor.is_valid() {
            return Err(Error::InvalidData);
        }

        if descriptor.destination == self.zone.as_destination() {
            return self.resolve_local(descriptor);
        }

        let destination = descriptor.destination;
        let (route, installed) = 'route: {
            if let Some(existing) = self.peers.read().get(&destination).cloned() {
                break 'route (existing, false);
            }

            let (candidate, hint) = match arrival {
                Arrival::Proxy(via) => (via.clone_for(destination), via.destination().as_zone()),
                Arrival::Channel(channel, caller) => (
                    self.proxy_over_link(channel.as_zone(), destination)
                        .ok_or(Error::ZoneNotFound)?,
                    caller.as_zone(),
                ),
            };

            let mut peers = self.peers.write();
            if let Some(existing) = peers.get(&destination).cloned() {
                break 'route (existing, false);
            }

            peers.insert(destination, candidate.clone());
            drop(peers);
            self.hints.write().insert(destination, hint);
            log::debug!(
                "zone {} installed route to zone {} for descriptor {}",
                self.zone,
                destination,
                descriptor,
            );
            (candidate, true)
        };

        let (proxy, _created) = route.get_proxy(descriptor.object);
        let mut grants = 1; // the sender's grant travels with the descriptor

        if installed {
            // A fresh route still has to be built hop by hop: this
            // zone's own grant travels the route and extends the table
            // of every relay between here and the object's home.
            let known = self
                .hints
                .read()
                .get(&destination)
                .copied()
                .unwrap_or(route.via());

            match route.add_ref(
                route.via().as_destination_channel(),
                destination,
                descriptor.object,
                self.zone.as_caller(),
                known,
                AddRefOptions::BUILD_DESTINATION_ROUTE,
            ) {
                Ok(_) => grants += 1,
                Err(error) => {
                    // The route cannot back a live reference; take it
                    // out again and send the sender's grant home.
                    self.remove_peer_entry(destination, &route);
                    if let Err(release_error) =
                        route.release_as(destination, descriptor.object, self.zone.as_caller())
                    {
                        log::warn!(
                            "zone {} could not return the grant for {}: {}",
                            self.zone,
                            descriptor,
                            release_error,
                        );
                    }

                    return Err(error);
                }
            }
        }

        proxy.adopt(grants);
        Ok(proxy.typed::<I>())
    }

    fn remove_peer_entry(&self, destination: DestinationZone, route: &Arc<ServiceProxy>) {
        let mut peers = self.peers.write();
        if peers
            .get(&destination)
            .is_some_and(|entry| Arc::ptr_eq(entry, route))
        {
            peers.remove(&destination);
            self.hints.write().remove(&destination);
        }
    }

    /// A call arriving from the wire: forward it when it is not ours,
    /// dispatch it into the named object stub when it is.
    pub fn handle_send(&self, request: SendFrame<'_>) -> Result<Vec<u8>, Error> {
        if !self.supports_version(request.version) {
            return Err(Error::InvalidVersion);
        }

        if request.destination != self.zone.as_destination() {
            let hop = self.next_hop(
                request.destination,
                Some(request.caller_channel.as_zone()),
            )?;

            return hop.forward_send(
                request.encoding,
                request.caller,
                request.destination,
                request.object,
                request.interface,
                request.method,
                request.payload,
            );
        }

        self.dispatch_local(
            request.caller_channel,
            request.caller,
            request.encoding,
            request.object,
            request.interface,
            request.method,
            request.payload,
        )
    }

    /// Runtime type query against a local or routed object.
    pub fn handle_try_cast(&self, request: TryCastFrame) -> Result<(), Error> {
        if !self.supports_version(request.version) {
            return Err(Error::InvalidVersion);
        }

        if request.destination != self.zone.as_destination() {
            let hop = self.next_hop(request.destination, None)?;
            return hop.try_cast(request.destination, request.object, request.interface);
        }

        let stub = self.find_stub(request.object).ok_or(Error::InvalidData)?;
        self.interface_stub(&stub, request.interface).map(|_| ())
    }

    pub(crate) fn dispatch_local(
        &self,
        caller_channel: CallerChannelZone,
        caller: CallerZone,
        encoding: Encoding,
        object: ObjectId,
        interface: InterfaceOrdinal,
        method: MethodId,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if self.terminating.read().contains(&caller) {
            return Err(Error::InvalidData);
        }

        let stub = self.find_stub(object).ok_or(Error::InvalidData)?;
        let interface_stub = self.interface_stub(&stub, interface)?;

        if method.is_none() {
            return Err(Error::InvalidMethodId);
        }

        if !interface_stub.supports(encoding) {
            return Err(Error::IncompatibleSerialisation);
        }

        // The caller may need answering later; remember the way back.
        self.install_caller_route(caller, caller_channel);

        let context = CallContext {
            service: self.this.upgrade().ok_or(Error::TransportError)?,
            caller_channel,
            caller,
            encoding,
        };

        // No exception crosses a zone boundary: a panicking callee is
        // reported as a protocol-level failure.
        match catch_unwind(AssertUnwindSafe(|| {
            interface_stub.call(&context, method, payload)
        })) {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "zone {} caught a panic dispatching method {} on object {}",
                    self.zone,
                    method,
                    object,
                );
                Err(Error::Exception)
            }
        }
    }

    /// The interface stub serving `ordinal` on `stub`, created on first
    /// use from the registered factory.
    fn interface_stub(
        &self,
        stub: &Arc<ObjectStub>,
        ordinal: InterfaceOrdinal,
    ) -> Result<Arc<dyn InterfaceStub>, Error> {
        if let Some(existing) = stub.interface(ordinal) {
            return Ok(existing);
        }

        let factory = self
            .factories
            .read()
            .get(&ordinal)
            .cloned()
            .ok_or(Error::InvalidInterfaceId)?;

        let interface = factory
            .create(stub.get_castable_interface())
            .ok_or(Error::InvalidInterfaceId)?;

        stub.install_interface(interface.clone());
        Ok(interface)
    }

    /// Announces shutdown to every connected zone and drops all local
    /// state. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        let edges: Vec<_> = {
            let mut edges: Vec<Arc<ServiceProxy>> =
                self.peers.write().drain().map(|(_, proxy)| proxy).collect();
            edges.extend(self.callers.write().drain().map(|(_, proxy)| proxy));
            edges
        };

        for edge in edges {
            let _ = edge.post(
                Encoding::universal(),
                self.zone.as_caller(),
                edge.destination(),
                ObjectId::NONE,
                InterfaceOrdinal::NONE,
                MethodId::NONE,
                PostOptions::ZONE_TERMINATING,
                &[],
            );

            edge.mark_terminal();
        }

        self.hints.write().clear();
        self.links.write().clear();
        self.objects.write().clear();
        self.identities.write().clear();
        log::debug!("zone {} ({}) shut down", self.zone, self.name);
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("zone", &self.zone)
            .field("name", &self.name)
            .field("objects", &self.object_count())
            .field("peers", &self.peer_count())
            .finish()
    }
}
