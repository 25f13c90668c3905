//! The inter-zone router.
//!
//! Routing answers one question: given a destination zone, which service
//! proxy carries the next hop. The peer map answers it directly for
//! zones this service has spoken to; the caller map answers it for zones
//! that have spoken to us; the hint table answers it for zones that some
//! intermediate is known to reach, extending the peer map lazily when a
//! message actually needs the route.
//!
//! The `add_ref` relay is where topology changes happen. A reference
//! crossing zones is only usable if every zone on the holder's future
//! call path can route towards the object's home, so the relay installs
//! peer entries as the `add_ref` travels and the flag set says which
//! side effects the emitter wants. The `known_direction` hint covers the
//! branching topologies where a descriptor reaches a zone through a path
//! the zone has no direct entry for: some intermediate zone is known to
//! reach the destination, and the relay leans on the route to that
//! intermediate instead, without ever recursing into the channel the
//! `add_ref` arrived through.

use crate::{Service, service_proxy::ServiceProxy};

use std::sync::Arc;

use codec::{
    AddRefOptions, PostOptions,
    error::Error,
    frame::{AddRefFrame, PostFrame, ReleaseFrame},
    ids::{CallerChannelZone, CallerZone, DestinationZone, Zone},
};

impl Service {
    /// Selects the service proxy carrying the next hop towards
    /// `destination`. `exclude` names the adjacent zone a message
    /// arrived through; a route that would send the message straight
    /// back is a routing loop and counts as no route at all.
    pub(crate) fn next_hop(
        &self,
        destination: DestinationZone,
        exclude: Option<Zone>,
    ) -> Result<Arc<ServiceProxy>, Error> {
        let excluded = |proxy: &Arc<ServiceProxy>| {
            exclude.is_some_and(|channel| proxy.via() == channel)
        };

        if let Some(proxy) = self.peers.read().get(&destination).cloned() {
            if excluded(&proxy) {
                return Err(Error::ZoneNotFound);
            }

            return Ok(proxy);
        }

        // A zone that calls into us is also a zone we can deliver to.
        if let Some(proxy) = self
            .callers
            .read()
            .get(&destination.as_zone().as_caller())
            .cloned()
        {
            if !excluded(&proxy) {
                return Ok(proxy);
            }
        }

        // Direction hints: some intermediate is known to reach the
        // destination, ride its route and remember the extension.
        let hint = self.hints.read().get(&destination).copied();
        if let Some(intermediate) = hint {
            if let Some(carrier) = self.route_to_zone(intermediate) {
                if !excluded(&carrier) {
                    let proxy = carrier.clone_for(destination);
                    self.install_peer(destination, proxy.clone());
                    log::debug!(
                        "zone {} extended route to zone {} over its channel to zone {}",
                        self.zone,
                        destination,
                        intermediate,
                    );
                    return Ok(proxy);
                }
            }
        }

        Err(Error::ZoneNotFound)
    }

    /// A route towards `zone` in either direction: as a destination we
    /// call, or as a caller we answer.
    pub(crate) fn route_to_zone(&self, zone: Zone) -> Option<Arc<ServiceProxy>> {
        if let Some(proxy) = self.peers.read().get(&zone.as_destination()).cloned() {
            return Some(proxy);
        }

        self.callers.read().get(&zone.as_caller()).cloned()
    }

    pub(crate) fn install_peer(&self, destination: DestinationZone, proxy: Arc<ServiceProxy>) {
        self.peers.write().entry(destination).or_insert(proxy);
    }

    /// Installs the reverse route used to originate messages back to a
    /// caller, riding the channel the caller's traffic arrives through.
    pub(crate) fn install_caller_route(&self, caller: CallerZone, channel: CallerChannelZone) {
        if caller.as_zone() == self.zone || caller.is_none() {
            return;
        }

        if self.callers.read().contains_key(&caller) {
            return;
        }

        let Some(proxy) =
            self.proxy_over_link(channel.as_zone(), caller.as_zone().as_destination())
        else {
            return;
        };

        self.callers.write().entry(caller).or_insert(proxy);
        log::debug!(
            "zone {} installed reverse route to caller zone {} via zone {}",
            self.zone,
            caller,
            channel,
        );
    }

    /// Grants a reference on a remote object, relaying towards its home
    /// zone and extending routes on the way as the options request.
    pub fn handle_add_ref(&self, request: AddRefFrame) -> Result<u64, Error> {
        if !self.supports_version(request.version) {
            return Err(Error::InvalidVersion);
        }

        if request.destination.is_none() || request.object.is_none() {
            return Err(Error::InvalidData);
        }

        // Terminal hop: the object lives here, account the reference.
        if request.destination == self.zone.as_destination() {
            let stub = self
                .find_stub(request.object)
                .ok_or(Error::InvalidData)?;

            if request.options.contains(AddRefOptions::BUILD_CALLER_ROUTE) {
                self.install_caller_route(request.caller, request.caller_channel);
            }

            return Ok(stub.add_ref(request.caller, 1));
        }

        let delivering = request.caller_channel.as_zone();
        let mut installed: Option<DestinationZone> = None;

        let hop = match self.next_hop(request.destination, Some(delivering)) {
            Ok(hop) => hop,
            Err(_)
                if request.destination_channel.as_zone() == delivering
                    && request
                        .options
                        .contains(AddRefOptions::BUILD_DESTINATION_ROUTE) =>
            {
                // The descriptor is travelling through this zone on its
                // own channel: the emitter asserts the destination lies
                // back through the channel that delivered the add_ref.
                let proxy = self
                    .proxy_over_link(delivering, request.destination)
                    .ok_or(Error::ZoneNotFound)?;

                self.install_peer(request.destination, proxy.clone());
                installed = Some(request.destination);
                proxy
            }
            Err(_)
                if !request.known_direction.is_none()
                    && request.known_direction != self.zone =>
            {
                // Branching topology: no route of our own, but the
                // emitter named an intermediate known to reach the
                // destination. Never recurse into the delivering channel.
                let carrier = self
                    .route_to_zone(request.known_direction)
                    .filter(|proxy| proxy.via() != delivering)
                    .ok_or(Error::ZoneNotFound)?;

                let proxy = carrier.clone_for(request.destination);
                self.install_peer(request.destination, proxy.clone());
                self.hints
                    .write()
                    .insert(request.destination, request.known_direction);
                installed = Some(request.destination);
                proxy
            }
            Err(error) => return Err(error),
        };

        // Pure relay: the caller and the emitter's destination channel
        // travel unchanged, the channel becomes this zone and the hint
        // records us for any further unknown-destination propagation.
        let count = match hop.add_ref(
            request.destination_channel,
            request.destination,
            request.object,
            request.caller,
            self.zone,
            request.options,
        ) {
            Ok(count) => count,
            Err(error) => {
                // An installed route must not outlive the failed grant
                // it was installed for.
                if let Some(destination) = installed.take() {
                    self.remove_peer_if(destination, &hop);
                }

                return Err(error);
            }
        };

        if request
            .options
            .contains(AddRefOptions::BUILD_DESTINATION_ROUTE)
        {
            if installed.is_none() && !self.peers.read().contains_key(&request.destination) {
                self.install_peer(request.destination, hop.clone_for(request.destination));
            }

            if !request.known_direction.is_none() {
                self.hints
                    .write()
                    .entry(request.destination)
                    .or_insert(request.known_direction);
            }
        }

        if request.options.contains(AddRefOptions::BUILD_CALLER_ROUTE) {
            self.install_caller_route(request.caller, request.caller_channel);
        }

        Ok(count)
    }

    /// Returns a reference on a remote object. A release on a reference
    /// that was granted must find its way home, the routes are kept
    /// alive by the reference itself; failing to route one is reported
    /// loudly because the counts cannot be repaired afterwards.
    pub fn handle_release(&self, request: ReleaseFrame) -> Result<u64, Error> {
        if !self.supports_version(request.version) {
            return Err(Error::InvalidVersion);
        }

        if request.destination == self.zone.as_destination() {
            let stub = self
                .find_stub(request.object)
                .ok_or(Error::InvalidData)?;

            let remaining = stub.release(request.caller, 1)?;
            if stub.total_count() == 0 {
                self.remove_stub(request.object);
            }

            return Ok(remaining);
        }

        let hop = match self.next_hop(request.destination, None) {
            Ok(hop) => hop,
            Err(error) => {
                log::error!(
                    "zone {} has no route to return zone {}'s reference on {}.{}",
                    self.zone,
                    request.caller,
                    request.destination,
                    request.object,
                );
                return Err(error);
            }
        };

        let count = hop.release_as(request.destination, request.object, request.caller)?;
        self.prune_peer(&hop);
        Ok(count)
    }

    /// One-way delivery. Nothing propagates back to the originator, a
    /// failed post is logged and dropped.
    pub fn handle_post(&self, request: PostFrame<'_>) {
        if !self.supports_version(request.version) {
            log::debug!(
                "zone {} dropped a post at unsupported version {}",
                self.zone,
                request.version,
            );
            return;
        }

        if request.destination != self.zone.as_destination() {
            match self.next_hop(request.destination, Some(request.caller_channel.as_zone())) {
                Ok(hop) => {
                    if let Err(error) = hop.post(
                        request.encoding,
                        request.caller,
                        request.destination,
                        request.object,
                        request.interface,
                        request.method,
                        request.options,
                        request.payload,
                    ) {
                        log::debug!(
                            "zone {} failed to relay a post towards zone {}: {}",
                            self.zone,
                            request.destination,
                            error,
                        );
                    }
                }
                Err(error) => {
                    log::debug!(
                        "zone {} dropped an unroutable post towards zone {}: {}",
                        self.zone,
                        request.destination,
                        error,
                    );
                }
            }

            return;
        }

        if request.options.contains(PostOptions::ZONE_TERMINATING) {
            self.purge_caller(request.caller);
            return;
        }

        if request.options.contains(PostOptions::RELEASE_OPTIMISTIC) {
            // Optimistic: the reference may already be gone, nothing to
            // account strictly.
            if let Some(stub) = self.find_stub(request.object) {
                if stub.release(request.caller, 1).is_ok() && stub.total_count() == 0 {
                    self.remove_stub(request.object);
                }
            }

            return;
        }

        if let Err(error) = self.dispatch_local(
            request.caller_channel,
            request.caller,
            request.encoding,
            request.object,
            request.interface,
            request.method,
            request.payload,
        ) {
            log::debug!(
                "zone {} swallowed a failed post on object {}: {}",
                self.zone,
                request.object,
                error,
            );
        }
    }

    /// Drops everything held on behalf of a terminating caller zone: its
    /// reference counts, its reverse route, and any route that was
    /// carried towards it.
    pub(crate) fn purge_caller(&self, caller: CallerZone) {
        self.terminating.write().insert(caller);

        let dead: Vec<_> = {
            let objects = self.objects.read();
            objects
                .values()
                .filter(|stub| matches!(stub.purge(caller), (true, 0)))
                .map(|stub| stub.object())
                .collect()
        };

        for object in dead {
            self.remove_stub(object);
        }

        self.callers.write().remove(&caller);
        if let Some(proxy) = self
            .peers
            .write()
            .remove(&caller.as_zone().as_destination())
        {
            proxy.mark_terminal();
        }

        log::debug!(
            "zone {} dropped all state held for terminating zone {}",
            self.zone,
            caller,
        );
    }

    /// Removes a routed peer entry once nothing references it: no live
    /// object proxies, no outstanding grants, and not an explicit
    /// attachment. The route table never designates such an edge again
    /// until something reinstalls it.
    pub(crate) fn prune_peer(&self, proxy: &Arc<ServiceProxy>) {
        if proxy.is_attached() || proxy.proxy_count() > 0 || proxy.granted() > 0 {
            return;
        }

        self.remove_peer_if(proxy.destination(), proxy);
    }

    /// The hint outlives the entry on purpose: "that intermediate
    /// knows the destination" stays true, and a later release or call
    /// rebuilds the route from it lazily.
    fn remove_peer_if(&self, destination: DestinationZone, proxy: &Arc<ServiceProxy>) {
        let mut peers = self.peers.write();
        if peers
            .get(&destination)
            .is_some_and(|entry| Arc::ptr_eq(entry, proxy))
        {
            peers.remove(&destination);
        }
    }
}
