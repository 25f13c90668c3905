//! In-process channels.
//!
//! Two zones living in one process talk through direct calls: the
//! transport upgrades a weak reference to the peer service and invokes
//! its callee surface on the caller's thread. This is the degenerate
//! transport the runtime itself ships; sockets and bridges live outside
//! the core and implement the same trait.
//!
//! The weak reference matters. A peer that has shut down must look like
//! a lost channel, not keep the whole zone alive through its callers.

use crate::{Service, service_proxy::{ServiceProxy, Transport}};

use std::sync::{Arc, Weak};

use codec::{
    error::Error,
    frame::{AddRefFrame, PostFrame, ReleaseFrame, SendFrame, TryCastFrame},
};

/// Direct channel to a service in the same process.
pub struct LocalTransport {
    peer: Weak<Service>,
}

impl LocalTransport {
    pub fn new(peer: &Arc<Service>) -> Arc<Self> {
        Arc::new(Self {
            peer: Arc::downgrade(peer),
        })
    }

    fn peer(&self) -> Result<Arc<Service>, Error> {
        self.peer.upgrade().ok_or(Error::TransportError)
    }
}

impl Transport for LocalTransport {
    fn send(&self, request: SendFrame<'_>) -> Result<Vec<u8>, Error> {
        self.peer()?.handle_send(request)
    }

    fn try_cast(&self, request: TryCastFrame) -> Result<(), Error> {
        self.peer()?.handle_try_cast(request)
    }

    fn add_ref(&self, request: AddRefFrame) -> Result<u64, Error> {
        self.peer()?.handle_add_ref(request)
    }

    fn release(&self, request: ReleaseFrame) -> Result<u64, Error> {
        self.peer()?.handle_release(request)
    }

    fn post(&self, request: PostFrame<'_>) -> Result<(), Error> {
        self.peer()?.handle_post(request);
        Ok(())
    }
}

/// Wires two in-process zones together in both directions and returns
/// the service proxy each side now holds towards the other.
pub fn connect(
    first: &Arc<Service>,
    second: &Arc<Service>,
) -> Result<(Arc<ServiceProxy>, Arc<ServiceProxy>), Error> {
    let forward = first.attach_remote_zone(
        second.zone().as_destination(),
        LocalTransport::new(second),
    )?;

    let backward = match second.attach_remote_zone(
        first.zone().as_destination(),
        LocalTransport::new(first),
    ) {
        Ok(backward) => backward,
        Err(error) => {
            first.detach_remote_zone(second.zone().as_destination());
            return Err(error);
        }
    };

    Ok((forward, backward))
}
