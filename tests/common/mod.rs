//! Hand-written stand-ins for generator output.
//!
//! The runtime consumes proxies, stubs and stub factories produced by
//! the interface compiler. The fixtures here are what it would emit for
//! a calculator interface, an auditing side interface on the same
//! object, and a directory interface that passes object references in
//! both directions.

#![allow(dead_code)]

use std::sync::{
    Arc, LazyLock,
    atomic::{AtomicU64, Ordering},
};

use codec::{
    Encoding,
    error::Error,
    fingerprint::{Declaration, EntityKind, LegacyFlags, Method, Parameter, Registry},
    ids::{InterfaceDescriptor, InterfaceOrdinal, MethodId, Zone},
};
use parking_lot::Mutex;
use service::{
    CallContext, Castable, InterfaceRef, InterfaceStub, ObjectProxy, Proxied, RemoteProxy, Service,
    ServiceOptions, StubFactory, Transport, local::LocalTransport,
};

pub trait Calculator: Castable + Proxied + Send + Sync {
    fn square(&self, value: i32) -> Result<i32, Error>;
}

pub trait Auditor: Castable + Proxied + Send + Sync {
    fn calls(&self) -> Result<u64, Error>;
}

pub trait Reporter: Castable + Proxied + Send + Sync {
    fn report(&self) -> Result<String, Error>;
}

pub trait Directory: Castable + Proxied + Send + Sync {
    fn put(&self, item: Arc<dyn Calculator>) -> Result<(), Error>;
    fn get(&self) -> Result<Arc<dyn Calculator>, Error>;
    fn delegate(&self) -> Result<Arc<dyn Directory>, Error>;
}

pub struct Ordinals {
    pub calculator: InterfaceOrdinal,
    pub auditor: InterfaceOrdinal,
    pub reporter: InterfaceOrdinal,
    pub directory: InterfaceOrdinal,
}

static ORDINALS: LazyLock<Ordinals> = LazyLock::new(|| {
    let mut registry = Registry::new();

    let interface = |name: &str, methods: Vec<Method>| Declaration {
        kind: EntityKind::Interface,
        namespaces: vec!["demo".to_string()],
        name: name.to_string(),
        bases: vec![],
        methods,
        fields: vec![],
        template: vec![],
        template_arguments: vec![],
        legacy: LegacyFlags::default(),
    };

    let method = |name: &str, parameters: Vec<Parameter>| Method {
        attributes: vec![],
        name: name.to_string(),
        parameters,
    };

    let parameter = |type_name: &str, name: &str| Parameter {
        attributes: vec![],
        type_name: type_name.to_string(),
        modifiers: String::new(),
        name: name.to_string(),
    };

    registry.insert(interface(
        "i_calculator",
        vec![method("square", vec![parameter("int32", "value")])],
    ));
    registry.insert(interface("i_auditor", vec![method("calls", vec![])]));
    registry.insert(interface("i_reporter", vec![method("report", vec![])]));
    registry.insert(interface(
        "i_directory",
        vec![
            method("put", vec![parameter("demo::i_calculator", "item")]),
            method("get", vec![]),
            method("delegate", vec![]),
        ],
    ));

    Ordinals {
        calculator: registry.fingerprint("demo::i_calculator").unwrap(),
        auditor: registry.fingerprint("demo::i_auditor").unwrap(),
        reporter: registry.fingerprint("demo::i_reporter").unwrap(),
        directory: registry.fingerprint("demo::i_directory").unwrap(),
    }
});

pub fn ordinals() -> &'static Ordinals {
    &ORDINALS
}

pub fn encode_i32(encoding: Encoding, value: i32) -> Result<Vec<u8>, Error> {
    Ok(match encoding {
        Encoding::Json => serde_json::to_vec(&value).map_err(|_| Error::InvalidData)?,
        _ => value.to_be_bytes().to_vec(),
    })
}

pub fn decode_i32(encoding: Encoding, payload: &[u8]) -> Result<i32, Error> {
    match encoding {
        Encoding::Json => serde_json::from_slice(payload).map_err(|_| Error::InvalidData),
        _ => payload
            .try_into()
            .map(i32::from_be_bytes)
            .map_err(|_| Error::InvalidData),
    }
}

pub fn encode_u64(encoding: Encoding, value: u64) -> Result<Vec<u8>, Error> {
    Ok(match encoding {
        Encoding::Json => serde_json::to_vec(&value).map_err(|_| Error::InvalidData)?,
        _ => value.to_be_bytes().to_vec(),
    })
}

pub fn decode_u64(encoding: Encoding, payload: &[u8]) -> Result<u64, Error> {
    match encoding {
        Encoding::Json => serde_json::from_slice(payload).map_err(|_| Error::InvalidData),
        _ => payload
            .try_into()
            .map(u64::from_be_bytes)
            .map_err(|_| Error::InvalidData),
    }
}

pub fn encode_descriptor(
    encoding: Encoding,
    descriptor: InterfaceDescriptor,
) -> Result<Vec<u8>, Error> {
    Ok(match encoding {
        Encoding::Json => serde_json::to_vec(&descriptor).map_err(|_| Error::InvalidData)?,
        _ => {
            let mut payload = Vec::with_capacity(16);
            payload.extend_from_slice(&descriptor.destination.get().to_be_bytes());
            payload.extend_from_slice(&descriptor.object.get().to_be_bytes());
            payload
        }
    })
}

pub fn decode_descriptor(encoding: Encoding, payload: &[u8]) -> Result<InterfaceDescriptor, Error> {
    match encoding {
        Encoding::Json => serde_json::from_slice(payload).map_err(|_| Error::InvalidData),
        _ => {
            if payload.len() != 16 {
                return Err(Error::InvalidData);
            }

            Ok(InterfaceDescriptor::new(
                Zone::new(u64::from_be_bytes(payload[..8].try_into().unwrap())).as_destination(),
                u64::from_be_bytes(payload[8..].try_into().unwrap()).into(),
            ))
        }
    }
}

#[derive(Default)]
pub struct CalculatorImpl {
    calls: AtomicU64,
}

impl CalculatorImpl {
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Calculator for CalculatorImpl {
    fn square(&self, value: i32) -> Result<i32, Error> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(value.wrapping_mul(value))
    }
}

impl Auditor for CalculatorImpl {
    fn calls(&self) -> Result<u64, Error> {
        Ok(self.call_count())
    }
}

impl Proxied for CalculatorImpl {}

impl Castable for CalculatorImpl {
    fn query_interface(self: Arc<Self>, interface: InterfaceOrdinal) -> Option<InterfaceRef> {
        if interface == ordinals().calculator {
            Some(InterfaceRef::new::<dyn Calculator>(self))
        } else if interface == ordinals().auditor {
            Some(InterfaceRef::new::<dyn Auditor>(self))
        } else {
            None
        }
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }
}

#[derive(Default)]
pub struct DirectoryImpl {
    item: Mutex<Option<Arc<dyn Calculator>>>,
    sub: Mutex<Option<Arc<dyn Directory>>>,
}

impl DirectoryImpl {
    pub fn set_item(&self, item: Arc<dyn Calculator>) {
        *self.item.lock() = Some(item);
    }

    pub fn set_delegate(&self, sub: Arc<dyn Directory>) {
        *self.sub.lock() = Some(sub);
    }
}

impl Directory for DirectoryImpl {
    fn put(&self, item: Arc<dyn Calculator>) -> Result<(), Error> {
        self.set_item(item);
        Ok(())
    }

    fn get(&self) -> Result<Arc<dyn Calculator>, Error> {
        self.item.lock().clone().ok_or(Error::Application(100))
    }

    fn delegate(&self) -> Result<Arc<dyn Directory>, Error> {
        self.sub.lock().clone().ok_or(Error::Application(101))
    }
}

impl Proxied for DirectoryImpl {}

impl Castable for DirectoryImpl {
    fn query_interface(self: Arc<Self>, interface: InterfaceOrdinal) -> Option<InterfaceRef> {
        (interface == ordinals().directory).then(|| InterfaceRef::new::<dyn Directory>(self))
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }
}

pub struct CalculatorProxy {
    object: Arc<ObjectProxy>,
}

impl Calculator for CalculatorProxy {
    fn square(&self, value: i32) -> Result<i32, Error> {
        let (encoding, reply) =
            self.object
                .call(ordinals().calculator, MethodId::new(1), &|encoding| {
                    encode_i32(encoding, value)
                })?;

        decode_i32(encoding, &reply)
    }
}

impl Proxied for CalculatorProxy {
    fn object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        Some(self.object.clone())
    }
}

impl Castable for CalculatorProxy {
    fn query_interface(self: Arc<Self>, interface: InterfaceOrdinal) -> Option<InterfaceRef> {
        (interface == ordinals().calculator)
            .then(|| InterfaceRef::new::<dyn Calculator>(self))
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }
}

impl RemoteProxy for dyn Calculator {
    fn ordinal() -> InterfaceOrdinal {
        ordinals().calculator
    }

    fn build(object: Arc<ObjectProxy>) -> Arc<Self> {
        Arc::new(CalculatorProxy { object })
    }
}

pub struct AuditorProxy {
    object: Arc<ObjectProxy>,
}

impl Auditor for AuditorProxy {
    fn calls(&self) -> Result<u64, Error> {
        let (encoding, reply) =
            self.object
                .call(ordinals().auditor, MethodId::new(1), &|_| Ok(Vec::new()))?;

        decode_u64(encoding, &reply)
    }
}

impl Proxied for AuditorProxy {
    fn object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        Some(self.object.clone())
    }
}

impl Castable for AuditorProxy {
    fn query_interface(self: Arc<Self>, interface: InterfaceOrdinal) -> Option<InterfaceRef> {
        (interface == ordinals().auditor)
            .then(|| InterfaceRef::new::<dyn Auditor>(self))
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }
}

impl RemoteProxy for dyn Auditor {
    fn ordinal() -> InterfaceOrdinal {
        ordinals().auditor
    }

    fn build(object: Arc<ObjectProxy>) -> Arc<Self> {
        Arc::new(AuditorProxy { object })
    }
}

pub struct ReporterProxy {
    object: Arc<ObjectProxy>,
}

impl Reporter for ReporterProxy {
    fn report(&self) -> Result<String, Error> {
        let (_, reply) =
            self.object
                .call(ordinals().reporter, MethodId::new(1), &|_| Ok(Vec::new()))?;

        String::from_utf8(reply).map_err(|_| Error::InvalidData)
    }
}

impl Proxied for ReporterProxy {
    fn object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        Some(self.object.clone())
    }
}

impl Castable for ReporterProxy {
    fn query_interface(self: Arc<Self>, interface: InterfaceOrdinal) -> Option<InterfaceRef> {
        (interface == ordinals().reporter)
            .then(|| InterfaceRef::new::<dyn Reporter>(self))
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }
}

impl RemoteProxy for dyn Reporter {
    fn ordinal() -> InterfaceOrdinal {
        ordinals().reporter
    }

    fn build(object: Arc<ObjectProxy>) -> Arc<Self> {
        Arc::new(ReporterProxy { object })
    }
}

pub struct DirectoryProxy {
    object: Arc<ObjectProxy>,
}

impl DirectoryProxy {
    fn service(&self) -> Result<Arc<Service>, Error> {
        self.object
            .service_proxy()
            .service()
            .ok_or(Error::TransportError)
    }
}

impl Directory for DirectoryProxy {
    fn put(&self, item: Arc<dyn Calculator>) -> Result<(), Error> {
        let service = self.service()?;
        let receiver = self.object.descriptor().destination.as_zone().as_caller();
        let descriptor = service.marshal_reference(&item, receiver)?;

        self.object
            .call(ordinals().directory, MethodId::new(1), &|encoding| {
                encode_descriptor(encoding, descriptor)
            })?;

        Ok(())
    }

    fn get(&self) -> Result<Arc<dyn Calculator>, Error> {
        let (encoding, reply) =
            self.object
                .call(ordinals().directory, MethodId::new(2), &|_| Ok(Vec::new()))?;

        let descriptor = decode_descriptor(encoding, &reply)?;
        self.service()?
            .resolve::<dyn Calculator>(descriptor, self.object.service_proxy())
    }

    fn delegate(&self) -> Result<Arc<dyn Directory>, Error> {
        let (encoding, reply) =
            self.object
                .call(ordinals().directory, MethodId::new(3), &|_| Ok(Vec::new()))?;

        let descriptor = decode_descriptor(encoding, &reply)?;
        self.service()?
            .resolve::<dyn Directory>(descriptor, self.object.service_proxy())
    }
}

impl Proxied for DirectoryProxy {
    fn object_proxy(&self) -> Option<Arc<ObjectProxy>> {
        Some(self.object.clone())
    }
}

impl Castable for DirectoryProxy {
    fn query_interface(self: Arc<Self>, interface: InterfaceOrdinal) -> Option<InterfaceRef> {
        (interface == ordinals().directory)
            .then(|| InterfaceRef::new::<dyn Directory>(self))
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }
}

impl RemoteProxy for dyn Directory {
    fn ordinal() -> InterfaceOrdinal {
        ordinals().directory
    }

    fn build(object: Arc<ObjectProxy>) -> Arc<Self> {
        Arc::new(DirectoryProxy { object })
    }
}

pub struct CalculatorStub {
    implementation: Arc<dyn Calculator>,
    encodings: Vec<Encoding>,
}

impl InterfaceStub for CalculatorStub {
    fn interface(&self) -> InterfaceOrdinal {
        ordinals().calculator
    }

    fn supports(&self, encoding: Encoding) -> bool {
        self.encodings.contains(&encoding)
    }

    fn call(
        &self,
        context: &CallContext,
        method: MethodId,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        match method.get() {
            1 => {
                let value = decode_i32(context.encoding, payload)?;
                encode_i32(context.encoding, self.implementation.square(value)?)
            }
            _ => Err(Error::InvalidMethodId),
        }
    }
}

pub struct AuditorStub {
    implementation: Arc<dyn Auditor>,
}

impl InterfaceStub for AuditorStub {
    fn interface(&self) -> InterfaceOrdinal {
        ordinals().auditor
    }

    fn supports(&self, encoding: Encoding) -> bool {
        matches!(encoding, Encoding::Binary | Encoding::Json)
    }

    fn call(
        &self,
        context: &CallContext,
        method: MethodId,
        _payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        match method.get() {
            1 => encode_u64(context.encoding, self.implementation.calls()?),
            _ => Err(Error::InvalidMethodId),
        }
    }
}

pub struct DirectoryStub {
    implementation: Arc<dyn Directory>,
}

impl InterfaceStub for DirectoryStub {
    fn interface(&self) -> InterfaceOrdinal {
        ordinals().directory
    }

    fn supports(&self, encoding: Encoding) -> bool {
        matches!(encoding, Encoding::Binary | Encoding::Json)
    }

    fn call(
        &self,
        context: &CallContext,
        method: MethodId,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        match method.get() {
            1 => {
                let descriptor = decode_descriptor(context.encoding, payload)?;
                let item = context.service.resolve_inbound::<dyn Calculator>(
                    descriptor,
                    context.caller_channel,
                    context.caller,
                )?;

                self.implementation.put(item)?;
                Ok(Vec::new())
            }
            2 => {
                let item = self.implementation.get()?;
                let descriptor = context.service.marshal_reference(&item, context.caller)?;
                encode_descriptor(context.encoding, descriptor)
            }
            3 => {
                let sub = self.implementation.delegate()?;
                let descriptor = context.service.marshal_reference(&sub, context.caller)?;
                encode_descriptor(context.encoding, descriptor)
            }
            _ => Err(Error::InvalidMethodId),
        }
    }
}

pub struct CalculatorStubFactory {
    pub encodings: Vec<Encoding>,
}

impl Default for CalculatorStubFactory {
    fn default() -> Self {
        Self {
            encodings: vec![Encoding::Binary, Encoding::Json],
        }
    }
}

impl StubFactory for CalculatorStubFactory {
    fn interface(&self) -> InterfaceOrdinal {
        ordinals().calculator
    }

    fn create(&self, implementation: &Arc<dyn Castable>) -> Option<Arc<dyn InterfaceStub>> {
        let implementation = implementation
            .clone()
            .query_interface(ordinals().calculator)?
            .downcast::<dyn Calculator>()?;

        Some(Arc::new(CalculatorStub {
            implementation,
            encodings: self.encodings.clone(),
        }))
    }
}

pub struct AuditorStubFactory;

impl StubFactory for AuditorStubFactory {
    fn interface(&self) -> InterfaceOrdinal {
        ordinals().auditor
    }

    fn create(&self, implementation: &Arc<dyn Castable>) -> Option<Arc<dyn InterfaceStub>> {
        let implementation = implementation
            .clone()
            .query_interface(ordinals().auditor)?
            .downcast::<dyn Auditor>()?;

        Some(Arc::new(AuditorStub { implementation }))
    }
}

pub struct DirectoryStubFactory;

impl StubFactory for DirectoryStubFactory {
    fn interface(&self) -> InterfaceOrdinal {
        ordinals().directory
    }

    fn create(&self, implementation: &Arc<dyn Castable>) -> Option<Arc<dyn InterfaceStub>> {
        let implementation = implementation
            .clone()
            .query_interface(ordinals().directory)?
            .downcast::<dyn Directory>()?;

        Some(Arc::new(DirectoryStub { implementation }))
    }
}

/// The bootstrap the generator would emit: one factory per interface.
pub fn register_stubs(service: &Arc<Service>) {
    service.register_stub_factory(Arc::new(CalculatorStubFactory::default()));
    service.register_stub_factory(Arc::new(AuditorStubFactory));
    service.register_stub_factory(Arc::new(DirectoryStubFactory));
}

pub fn make_zone(id: u64) -> Arc<Service> {
    let service = Service::new(ServiceOptions::new(Zone::new(id), format!("zone-{id}")));
    register_stubs(&service);
    service
}

pub fn make_zone_with_versions(id: u64, versions: Vec<u64>) -> Arc<Service> {
    let mut options = ServiceOptions::new(Zone::new(id), format!("zone-{id}"));
    options.supported_versions = versions;
    let service = Service::new(options);
    register_stubs(&service);
    service
}

/// Builds a linear chain of in-process zones, connecting neighbours.
pub fn chain(ids: &[u64]) -> anyhow::Result<Vec<Arc<Service>>> {
    let zones: Vec<_> = ids.iter().map(|&id| make_zone(id)).collect();
    for pair in zones.windows(2) {
        service::local::connect(&pair[0], &pair[1])?;
    }

    Ok(zones)
}

/// A transport wrapper tallying traffic and the negotiation errors the
/// peer answers with.
pub struct CountingTransport {
    inner: Arc<dyn Transport>,
    pub sends: AtomicU64,
    pub casts: AtomicU64,
    pub invalid_version: AtomicU64,
    pub incompatible_serialisation: AtomicU64,
}

impl CountingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            sends: AtomicU64::new(0),
            casts: AtomicU64::new(0),
            invalid_version: AtomicU64::new(0),
            incompatible_serialisation: AtomicU64::new(0),
        })
    }

    pub fn sends(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }

    pub fn casts(&self) -> u64 {
        self.casts.load(Ordering::Relaxed)
    }

    pub fn invalid_versions(&self) -> u64 {
        self.invalid_version.load(Ordering::Relaxed)
    }

    pub fn incompatible_serialisations(&self) -> u64 {
        self.incompatible_serialisation.load(Ordering::Relaxed)
    }

    fn tally<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        match &result {
            Err(Error::InvalidVersion) => {
                self.invalid_version.fetch_add(1, Ordering::Relaxed);
            }
            Err(Error::IncompatibleSerialisation) => {
                self.incompatible_serialisation.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        result
    }
}

impl Transport for CountingTransport {
    fn send(&self, request: codec::frame::SendFrame<'_>) -> Result<Vec<u8>, Error> {
        self.sends.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.send(request);
        self.tally(result)
    }

    fn try_cast(&self, request: codec::frame::TryCastFrame) -> Result<(), Error> {
        self.casts.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.try_cast(request);
        self.tally(result)
    }

    fn add_ref(&self, request: codec::frame::AddRefFrame) -> Result<u64, Error> {
        let result = self.inner.add_ref(request);
        self.tally(result)
    }

    fn release(&self, request: codec::frame::ReleaseFrame) -> Result<u64, Error> {
        let result = self.inner.release(request);
        self.tally(result)
    }

    fn post(&self, request: codec::frame::PostFrame<'_>) -> Result<(), Error> {
        let result = self.inner.post(request);
        self.tally(result)
    }
}

/// Connects two zones with a counting transport on the first-to-second
/// direction.
pub fn connect_counted(
    first: &Arc<Service>,
    second: &Arc<Service>,
) -> anyhow::Result<Arc<CountingTransport>> {
    let counted = CountingTransport::new(LocalTransport::new(second));
    first.attach_remote_zone(second.zone().as_destination(), counted.clone())?;
    second.attach_remote_zone(first.zone().as_destination(), LocalTransport::new(first))?;
    Ok(counted)
}
