//! TCP bridge between zones.
//!
//! A bridge carries the framed wire protocol over one TCP connection:
//! every frame travels behind a 32-bit length prefix, requests from both
//! directions interleave freely, and replies find their requests again
//! through the correlation tag. One connection therefore serves as the
//! physical channel for any number of service proxies in either
//! direction.
//!
//! The runtime's callee surface is synchronous, so inbound requests are
//! dispatched on blocking worker threads; a callee that calls back over
//! the same bridge never deadlocks the connection's reader.

use crate::config;

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc::{RecvTimeoutError, SyncSender, sync_channel},
};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::BytesMut;
use codec::{
    error::{self, Error},
    frame::{AddRefFrame, Frame, PostFrame, ReleaseFrame, ReplyFrame, SendFrame, TryCastFrame},
    ids::Zone,
};
use parking_lot::Mutex;
use service::{Service, ServiceProxy, Transport};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

const MAGIC: u32 = 0x5a52_5043;

/// Frames above this size are treated as a protocol violation.
const MAX_FRAME: usize = 64 * 1024 * 1024;

struct Reply {
    result: i64,
    value: u64,
    payload: Vec<u8>,
}

struct Shared {
    outbound: UnboundedSender<Vec<u8>>,
    /// Replies we are waiting for, by correlation tag. Small and
    /// short-lived, a plain map under a lock is all it needs.
    pending: Mutex<std::collections::HashMap<u64, SyncSender<Reply>>>,
    tags: AtomicU64,
    alive: AtomicBool,
    timeout: Duration,
}

impl Shared {
    fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.pending.lock().clear();
    }

    fn next_tag(&self) -> u64 {
        self.tags.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, tag: u64, sender: SyncSender<Reply>) {
        self.pending.lock().insert(tag, sender);
    }

    fn answer(&self, tag: u64, reply: Reply) {
        if let Some(sender) = self.pending.lock().remove(&tag) {
            let _ = sender.try_send(reply);
        }
    }

    /// Ships one request frame and blocks the calling thread until the
    /// peer answers, the timeout fires, or the connection dies.
    fn roundtrip(&self, build: impl FnOnce(u64, &mut BytesMut)) -> Result<Reply, Error> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(Error::TransportError);
        }

        let tag = self.next_tag();
        let (sender, receiver) = sync_channel(1);
        self.register(tag, sender);

        let mut buf = BytesMut::with_capacity(256);
        build(tag, &mut buf);
        if self.outbound.send(buf.to_vec()).is_err() {
            self.pending.lock().remove(&tag);
            return Err(Error::TransportError);
        }

        match receiver.recv_timeout(self.timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                self.pending.lock().remove(&tag);
                Err(Error::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::TransportError),
        }
    }

    fn fire(&self, build: impl FnOnce(u64, &mut BytesMut)) -> Result<(), Error> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(Error::TransportError);
        }

        let mut buf = BytesMut::with_capacity(256);
        build(self.next_tag(), &mut buf);
        self.outbound
            .send(buf.to_vec())
            .map_err(|_| Error::TransportError)
    }
}

/// The transport side of one bridge connection.
pub struct BridgeTransport {
    shared: Arc<Shared>,
}

impl Transport for BridgeTransport {
    fn send(&self, request: SendFrame<'_>) -> Result<Vec<u8>, Error> {
        let reply = self
            .shared
            .roundtrip(|tag, buf| Frame::Send(SendFrame { tag, ..request }).encode(buf))?;

        error::result_from_wire(reply.result)?;
        Ok(reply.payload)
    }

    fn try_cast(&self, request: TryCastFrame) -> Result<(), Error> {
        let reply = self
            .shared
            .roundtrip(|tag, buf| Frame::TryCast(TryCastFrame { tag, ..request }).encode(buf))?;

        error::result_from_wire(reply.result)
    }

    fn add_ref(&self, request: AddRefFrame) -> Result<u64, Error> {
        let reply = self
            .shared
            .roundtrip(|tag, buf| Frame::AddRef(AddRefFrame { tag, ..request }).encode(buf))?;

        error::result_from_wire(reply.result)?;
        Ok(reply.value)
    }

    fn release(&self, request: ReleaseFrame) -> Result<u64, Error> {
        let reply = self
            .shared
            .roundtrip(|tag, buf| Frame::Release(ReleaseFrame { tag, ..request }).encode(buf))?;

        error::result_from_wire(reply.result)?;
        Ok(reply.value)
    }

    fn post(&self, request: PostFrame<'_>) -> Result<(), Error> {
        self.shared
            .fire(|tag, buf| Frame::Post(PostFrame { tag, ..request }).encode(buf))
    }
}

/// Performs the handshake on a fresh connection, spawns the read and
/// write loops, and hands back the transport plus the zone id the peer
/// announced.
pub async fn establish(
    service: &Arc<Service>,
    stream: TcpStream,
    timeout: Duration,
) -> Result<(Arc<BridgeTransport>, Zone)> {
    let (mut reader, mut writer) = stream.into_split();

    writer.write_u32(MAGIC).await?;
    writer.write_u64(service.zone().get()).await?;
    writer.flush().await?;

    if reader.read_u32().await? != MAGIC {
        bail!("peer did not speak the bridge protocol");
    }

    let peer = Zone::new(reader.read_u64().await?);
    if peer.is_none() || peer == service.zone() {
        bail!("peer announced an unusable zone id {}", peer);
    }

    let (outbound, outbound_rx) = unbounded_channel();
    let shared = Arc::new(Shared {
        outbound,
        pending: Mutex::new(std::collections::HashMap::new()),
        tags: AtomicU64::new(1),
        alive: AtomicBool::new(true),
        timeout,
    });

    tokio::spawn(write_loop(writer, outbound_rx));
    tokio::spawn(read_loop(service.clone(), reader, shared.clone(), peer));

    Ok((Arc::new(BridgeTransport { shared }), peer))
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = outbound.recv().await {
        if writer.write_u32(frame.len() as u32).await.is_err()
            || writer.write_all(&frame).await.is_err()
            || writer.flush().await.is_err()
        {
            break;
        }
    }
}

async fn read_loop(
    service: Arc<Service>,
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    peer: Zone,
) {
    let mut buf = Vec::new();
    loop {
        let size = match reader.read_u32().await {
            Ok(size) if (size as usize) <= MAX_FRAME => size as usize,
            _ => break,
        };

        buf.resize(size, 0);
        if reader.read_exact(&mut buf).await.is_err() {
            break;
        }

        if dispatch(&service, &shared, &buf).is_err() {
            break;
        }
    }

    shared.close();
    service.lose_channel(peer);
    log::debug!("zone {} lost the bridge to zone {}", service.zone(), peer);
}

/// Routes one decoded frame: replies resolve pending roundtrips, posts
/// and calls go to the service on a blocking worker so a callee that
/// calls back over this bridge cannot starve the reader.
fn dispatch(service: &Arc<Service>, shared: &Arc<Shared>, bytes: &[u8]) -> Result<(), Error> {
    match Frame::decode(bytes)? {
        Frame::Reply(reply) => {
            shared.answer(
                reply.tag,
                Reply {
                    result: reply.result,
                    value: reply.value,
                    payload: reply.payload.to_vec(),
                },
            );
        }
        Frame::Send(request) => {
            let service = service.clone();
            let shared = shared.clone();
            let payload = request.payload.to_vec();
            let request = SendFrame {
                payload: &[],
                ..request
            };

            tokio::task::spawn_blocking(move || {
                let result = service.handle_send(SendFrame {
                    payload: &payload,
                    ..request
                });

                respond(&shared, request.tag, result.map(|payload| (0, payload)));
            });
        }
        Frame::TryCast(request) => {
            let service = service.clone();
            let shared = shared.clone();
            tokio::task::spawn_blocking(move || {
                let result = service.handle_try_cast(request);
                respond(&shared, request.tag, result.map(|_| (0, Vec::new())));
            });
        }
        Frame::AddRef(request) => {
            let service = service.clone();
            let shared = shared.clone();
            tokio::task::spawn_blocking(move || {
                let result = service.handle_add_ref(request);
                respond(&shared, request.tag, result.map(|count| (count, Vec::new())));
            });
        }
        Frame::Release(request) => {
            let service = service.clone();
            let shared = shared.clone();
            tokio::task::spawn_blocking(move || {
                let result = service.handle_release(request);
                respond(&shared, request.tag, result.map(|count| (count, Vec::new())));
            });
        }
        Frame::Post(request) => {
            let service = service.clone();
            let payload = request.payload.to_vec();
            let request = PostFrame {
                payload: &[],
                ..request
            };

            tokio::task::spawn_blocking(move || {
                service.handle_post(PostFrame {
                    payload: &payload,
                    ..request
                });
            });
        }
    }

    Ok(())
}

fn respond(shared: &Shared, tag: u64, result: Result<(u64, Vec<u8>), Error>) {
    let (result, value, payload) = match result {
        Ok((value, payload)) => (error::OK, value, payload),
        Err(error) => (error.to_wire(), 0, Vec::new()),
    };

    let mut buf = BytesMut::with_capacity(64 + payload.len());
    Frame::Reply(ReplyFrame {
        tag,
        result,
        value,
        payload: &payload,
    })
    .encode(&mut buf);

    let _ = shared.outbound.send(buf.to_vec());
}

/// Connects to a remote zone and enters it into the route table. The
/// peer must announce the configured destination zone.
pub async fn connect(
    service: &Arc<Service>,
    address: std::net::SocketAddr,
    destination: Zone,
    timeout: Duration,
) -> Result<Arc<ServiceProxy>> {
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("bridge connect to {address}"))?;

    stream.set_nodelay(true)?;
    let (transport, peer) = establish(service, stream, timeout).await?;
    if peer != destination {
        bail!("expected zone {destination} at {address}, found zone {peer}");
    }

    service
        .attach_remote_zone(destination.as_destination(), transport)
        .map_err(|error| anyhow::anyhow!("attach of zone {destination} failed: {error}"))
}

/// Accepts bridge connections for `service`. Each accepted peer becomes
/// an adjacent channel; routes over it appear on demand when traffic
/// needs them.
pub async fn listen(service: Arc<Service>, bridge: config::Bridge) -> Result<()> {
    let config::Bridge::Listen { listen, timeout } = bridge else {
        bail!("listen called with a connect bridge");
    };

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bridge listen on {listen}"))?;

    log::info!("zone {} accepting bridges on {}", service.zone(), listen);

    loop {
        let (stream, address) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let service = service.clone();
        tokio::spawn(async move {
            match establish(&service, stream, Duration::from_secs(timeout)).await {
                Ok((transport, peer)) => {
                    service.register_link(peer, transport);
                    log::info!(
                        "zone {} accepted a bridge from zone {} at {}",
                        service.zone(),
                        peer,
                        address,
                    );
                }
                Err(error) => {
                    log::warn!("bridge handshake with {} failed: {}", address, error);
                }
            }
        });
    }
}
