//! Framed message layout.
//!
//! Every inter-zone operation is one frame: a kind octet, the protocol
//! version, a correlation tag, the routing coordinates the operation
//! needs, and for calls an opaque payload whose shape is fixed by
//! `(interface, method, encoding)`. All integers are big-endian. The
//! frame does not carry its own length, byte transports are expected to
//! add their own length prefix.
//!
//! Replies carry only the tag they answer, a result value from the
//! frozen range in [`crate::error`], a small numeric value (the updated
//! reference count for `add_ref` and `release`, zero otherwise) and the
//! output payload.

use crate::{
    AddRefOptions, Encoding, PostOptions,
    error::Error,
    ids::{
        CallerChannelZone, CallerZone, DestinationChannelZone, DestinationZone, InterfaceOrdinal,
        MethodId, ObjectId, Zone,
    },
};

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
enum FrameKind {
    Send = 1,
    TryCast = 2,
    AddRef = 3,
    Release = 4,
    Post = 5,
    Reply = 6,
}

/// A two-way method invocation.
#[derive(Debug, Clone, Copy)]
pub struct SendFrame<'a> {
    pub version: u64,
    pub tag: u64,
    pub encoding: Encoding,
    pub caller_channel: CallerChannelZone,
    pub caller: CallerZone,
    pub destination: DestinationZone,
    pub object: ObjectId,
    pub interface: InterfaceOrdinal,
    pub method: MethodId,
    pub payload: &'a [u8],
}

/// A runtime type query: does `object` also implement `interface`?
#[derive(Debug, Clone, Copy)]
pub struct TryCastFrame {
    pub version: u64,
    pub tag: u64,
    pub destination: DestinationZone,
    pub object: ObjectId,
    pub interface: InterfaceOrdinal,
}

/// Grants `caller` one reference on `object`, optionally extending
/// routes along the way.
///
/// `caller_channel` and `known_direction` are rewritten to the local
/// zone at every relay hop; `caller` and `destination_channel` travel
/// end to end unchanged.
#[derive(Debug, Clone, Copy)]
pub struct AddRefFrame {
    pub version: u64,
    pub tag: u64,
    pub destination_channel: DestinationChannelZone,
    pub destination: DestinationZone,
    pub object: ObjectId,
    pub caller_channel: CallerChannelZone,
    pub caller: CallerZone,
    pub known_direction: Zone,
    pub options: AddRefOptions,
}

/// Returns one reference on `object` held by `caller`.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseFrame {
    pub version: u64,
    pub tag: u64,
    pub destination: DestinationZone,
    pub object: ObjectId,
    pub caller: CallerZone,
}

/// A one-way invocation. No reply frame is ever produced for a post.
#[derive(Debug, Clone, Copy)]
pub struct PostFrame<'a> {
    pub version: u64,
    pub tag: u64,
    pub encoding: Encoding,
    pub caller_channel: CallerChannelZone,
    pub caller: CallerZone,
    pub destination: DestinationZone,
    pub object: ObjectId,
    pub interface: InterfaceOrdinal,
    pub method: MethodId,
    pub options: PostOptions,
    pub payload: &'a [u8],
}

/// The answer to a `send`, `try_cast`, `add_ref` or `release` frame.
#[derive(Debug, Clone, Copy)]
pub struct ReplyFrame<'a> {
    pub tag: u64,
    pub result: i64,
    pub value: u64,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone)]
pub enum Frame<'a> {
    Send(SendFrame<'a>),
    TryCast(TryCastFrame),
    AddRef(AddRefFrame),
    Release(ReleaseFrame),
    Post(PostFrame<'a>),
    Reply(ReplyFrame<'a>),
}

fn take_u8(bytes: &mut &[u8]) -> Result<u8, Error> {
    let (&value, rest) = bytes.split_first().ok_or(Error::InvalidData)?;
    *bytes = rest;
    Ok(value)
}

fn take_u64(bytes: &mut &[u8]) -> Result<u64, Error> {
    if bytes.len() < 8 {
        return Err(Error::InvalidData);
    }

    let (head, rest) = bytes.split_at(8);
    *bytes = rest;
    Ok(u64::from_be_bytes(head.try_into().unwrap()))
}

fn take_i64(bytes: &mut &[u8]) -> Result<i64, Error> {
    Ok(take_u64(bytes)? as i64)
}

fn take_payload<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], Error> {
    if bytes.len() < 4 {
        return Err(Error::InvalidData);
    }

    let (head, rest) = bytes.split_at(4);
    let size = u32::from_be_bytes(head.try_into().unwrap()) as usize;
    if rest.len() < size {
        return Err(Error::InvalidData);
    }

    let (payload, rest) = rest.split_at(size);
    *bytes = rest;
    Ok(payload)
}

fn take_encoding(bytes: &mut &[u8]) -> Result<Encoding, Error> {
    Encoding::try_from(take_u64(bytes)?).map_err(|_| Error::IncompatibleSerialisation)
}

fn put_payload(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u32(payload.len() as u32);
    buf.put(payload);
}

impl Frame<'_> {
    /// Appends the encoded frame to `buf`. The buffer is not cleared
    /// first, transports prepend their own length prefix.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Send(frame) => {
                buf.put_u8(FrameKind::Send.into());
                buf.put_u64(frame.version);
                buf.put_u64(frame.tag);
                buf.put_u64(frame.encoding.into());
                buf.put_u64(frame.caller_channel.get());
                buf.put_u64(frame.caller.get());
                buf.put_u64(frame.destination.get());
                buf.put_u64(frame.object.get());
                buf.put_u64(frame.interface.get());
                buf.put_u64(frame.method.get());
                put_payload(buf, frame.payload);
            }
            Frame::TryCast(frame) => {
                buf.put_u8(FrameKind::TryCast.into());
                buf.put_u64(frame.version);
                buf.put_u64(frame.tag);
                buf.put_u64(frame.destination.get());
                buf.put_u64(frame.object.get());
                buf.put_u64(frame.interface.get());
            }
            Frame::AddRef(frame) => {
                buf.put_u8(FrameKind::AddRef.into());
                buf.put_u64(frame.version);
                buf.put_u64(frame.tag);
                buf.put_u64(frame.destination_channel.get());
                buf.put_u64(frame.destination.get());
                buf.put_u64(frame.object.get());
                buf.put_u64(frame.caller_channel.get());
                buf.put_u64(frame.caller.get());
                buf.put_u64(frame.known_direction.get());
                buf.put_u64(frame.options.bits());
            }
            Frame::Release(frame) => {
                buf.put_u8(FrameKind::Release.into());
                buf.put_u64(frame.version);
                buf.put_u64(frame.tag);
                buf.put_u64(frame.destination.get());
                buf.put_u64(frame.object.get());
                buf.put_u64(frame.caller.get());
            }
            Frame::Post(frame) => {
                buf.put_u8(FrameKind::Post.into());
                buf.put_u64(frame.version);
                buf.put_u64(frame.tag);
                buf.put_u64(frame.encoding.into());
                buf.put_u64(frame.caller_channel.get());
                buf.put_u64(frame.caller.get());
                buf.put_u64(frame.destination.get());
                buf.put_u64(frame.object.get());
                buf.put_u64(frame.interface.get());
                buf.put_u64(frame.method.get());
                buf.put_u64(frame.options.bits());
                put_payload(buf, frame.payload);
            }
            Frame::Reply(frame) => {
                buf.put_u8(FrameKind::Reply.into());
                buf.put_u64(frame.tag);
                buf.put_u64(frame.result as u64);
                buf.put_u64(frame.value);
                put_payload(buf, frame.payload);
            }
        }
    }

    /// Decodes one frame from `bytes`. Trailing bytes are rejected, a
    /// frame owns its transport-level slice completely.
    ///
    /// # Test
    ///
    /// ```
    /// use zone_rpc_codec::frame::Frame;
    ///
    /// let buffer = [
    ///     0x02u8, // try_cast
    ///     0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, // version 3
    ///     0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, // tag 7
    ///     0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, // destination 9
    ///     0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, // object 5
    ///     0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // interface
    /// ];
    ///
    /// let Frame::TryCast(frame) = Frame::decode(&buffer).unwrap() else {
    ///     panic!("expected a try_cast frame");
    /// };
    ///
    /// assert_eq!(frame.version, 3);
    /// assert_eq!(frame.tag, 7);
    /// assert_eq!(frame.destination.get(), 9);
    /// assert_eq!(frame.object.get(), 5);
    /// assert_eq!(frame.interface.get(), 0x0102030405060708);
    /// ```
    ///
    /// A frame survives an encode and decode unchanged:
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use zone_rpc_codec::frame::{Frame, SendFrame};
    /// use zone_rpc_codec::ids::Zone;
    /// use zone_rpc_codec::Encoding;
    ///
    /// let frame = Frame::Send(SendFrame {
    ///     version: 3,
    ///     tag: 11,
    ///     encoding: Encoding::Binary,
    ///     caller_channel: Zone::new(1).as_caller_channel(),
    ///     caller: Zone::new(1).as_caller(),
    ///     destination: Zone::new(2).as_destination(),
    ///     object: 4.into(),
    ///     interface: 0xfeed.into(),
    ///     method: 1.into(),
    ///     payload: b"\x00\x00\x00\x07",
    /// });
    ///
    /// let mut buf = BytesMut::new();
    /// frame.encode(&mut buf);
    ///
    /// let Frame::Send(decoded) = Frame::decode(&buf).unwrap() else {
    ///     panic!("expected a send frame");
    /// };
    ///
    /// assert_eq!(decoded.tag, 11);
    /// assert_eq!(decoded.destination.get(), 2);
    /// assert_eq!(decoded.payload, b"\x00\x00\x00\x07");
    /// ```
    pub fn decode(mut bytes: &[u8]) -> Result<Frame<'_>, Error> {
        let bytes = &mut bytes;
        let kind =
            FrameKind::try_from(take_u8(bytes)?).map_err(|_| Error::InvalidData)?;

        let frame = match kind {
            FrameKind::Send => Frame::Send(SendFrame {
                version: take_u64(bytes)?,
                tag: take_u64(bytes)?,
                encoding: take_encoding(bytes)?,
                caller_channel: take_u64(bytes)?.into(),
                caller: take_u64(bytes)?.into(),
                destination: take_u64(bytes)?.into(),
                object: take_u64(bytes)?.into(),
                interface: take_u64(bytes)?.into(),
                method: take_u64(bytes)?.into(),
                payload: take_payload(bytes)?,
            }),
            FrameKind::TryCast => Frame::TryCast(TryCastFrame {
                version: take_u64(bytes)?,
                tag: take_u64(bytes)?,
                destination: take_u64(bytes)?.into(),
                object: take_u64(bytes)?.into(),
                interface: take_u64(bytes)?.into(),
            }),
            FrameKind::AddRef => Frame::AddRef(AddRefFrame {
                version: take_u64(bytes)?,
                tag: take_u64(bytes)?,
                destination_channel: take_u64(bytes)?.into(),
                destination: take_u64(bytes)?.into(),
                object: take_u64(bytes)?.into(),
                caller_channel: take_u64(bytes)?.into(),
                caller: take_u64(bytes)?.into(),
                known_direction: take_u64(bytes)?.into(),
                options: AddRefOptions::from_bits(take_u64(bytes)?),
            }),
            FrameKind::Release => Frame::Release(ReleaseFrame {
                version: take_u64(bytes)?,
                tag: take_u64(bytes)?,
                destination: take_u64(bytes)?.into(),
                object: take_u64(bytes)?.into(),
                caller: take_u64(bytes)?.into(),
            }),
            FrameKind::Post => Frame::Post(PostFrame {
                version: take_u64(bytes)?,
                tag: take_u64(bytes)?,
                encoding: take_encoding(bytes)?,
                caller_channel: take_u64(bytes)?.into(),
                caller: take_u64(bytes)?.into(),
                destination: take_u64(bytes)?.into(),
                object: take_u64(bytes)?.into(),
                interface: take_u64(bytes)?.into(),
                method: take_u64(bytes)?.into(),
                options: PostOptions::from_bits(take_u64(bytes)?),
                payload: take_payload(bytes)?,
            }),
            FrameKind::Reply => Frame::Reply(ReplyFrame {
                tag: take_u64(bytes)?,
                result: take_i64(bytes)?,
                value: take_u64(bytes)?,
                payload: take_payload(bytes)?,
            }),
        };

        if !bytes.is_empty() {
            return Err(Error::InvalidData);
        }

        Ok(frame)
    }

    /// The correlation tag, for multiplexing transports.
    pub fn tag(&self) -> u64 {
        match self {
            Frame::Send(frame) => frame.tag,
            Frame::TryCast(frame) => frame.tag,
            Frame::AddRef(frame) => frame.tag,
            Frame::Release(frame) => frame.tag,
            Frame::Post(frame) => frame.tag,
            Frame::Reply(frame) => frame.tag,
        }
    }
}
