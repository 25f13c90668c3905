//! Routing identifiers.
//!
//! Every identifier is a distinct newtype over a 64-bit unsigned integer.
//! The directional zone wrappers share the value space of [`Zone`] but are
//! deliberately incompatible types: a message header mixes up to four zone
//! coordinates and swapping two of them silently produces a message that
//! routes somewhere legal but wrong. Conversions go through [`Zone`]
//! explicitly.
//!
//! Id zero is reserved everywhere as the "none" value.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
        pub struct $name(u64);

        impl $name {
            pub const NONE: Self = Self(0);

            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            pub const fn is_none(self) -> bool {
                self.0 == 0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type! {
    /// Identity of a zone.
    Zone
}

id_type! {
    /// The zone a message is travelling to.
    DestinationZone
}

id_type! {
    /// The zone a message originates from, which is also the zone that
    /// will hold the reference granted by an `add_ref`.
    CallerZone
}

id_type! {
    /// The adjacent zone a message arrived through. Rewritten at every
    /// hop, unlike [`CallerZone`] which names the origin end to end.
    CallerChannelZone
}

id_type! {
    /// The adjacent zone through which the emitter of an `add_ref`
    /// reaches the destination. Stamped once at emission and left alone
    /// by relays.
    DestinationChannelZone
}

id_type! {
    /// Per-zone identity of an object stub. Unique only within the zone
    /// that minted it.
    ObjectId
}

id_type! {
    /// Wire name of an interface, a 64-bit fingerprint of its canonical
    /// declaration.
    InterfaceOrdinal
}

id_type! {
    /// Ordinal of a method within an interface. Methods are numbered
    /// from one; zero is not a method.
    MethodId
}

impl Zone {
    pub const fn as_destination(self) -> DestinationZone {
        DestinationZone(self.0)
    }

    pub const fn as_caller(self) -> CallerZone {
        CallerZone(self.0)
    }

    pub const fn as_caller_channel(self) -> CallerChannelZone {
        CallerChannelZone(self.0)
    }

    pub const fn as_destination_channel(self) -> DestinationChannelZone {
        DestinationChannelZone(self.0)
    }
}

impl DestinationZone {
    pub const fn as_zone(self) -> Zone {
        Zone(self.0)
    }
}

impl CallerZone {
    pub const fn as_zone(self) -> Zone {
        Zone(self.0)
    }
}

impl CallerChannelZone {
    pub const fn as_zone(self) -> Zone {
        Zone(self.0)
    }
}

impl DestinationChannelZone {
    pub const fn as_zone(self) -> Zone {
        Zone(self.0)
    }
}

/// The wire form of an object reference.
///
/// A descriptor is the only shape in which an object crosses a zone
/// boundary, in any parameter slot and in either direction. Resolving one
/// back into a typed handle is the runtime's job; the descriptor itself
/// carries no interface information, that travels separately as an
/// [`InterfaceOrdinal`].
///
/// # Test
///
/// ```
/// use zone_rpc_codec::ids::{InterfaceDescriptor, ObjectId, Zone};
///
/// let descriptor = InterfaceDescriptor {
///     destination: Zone::new(4).as_destination(),
///     object: ObjectId::new(2),
/// };
///
/// assert!(descriptor.is_valid());
/// assert_eq!(descriptor.to_string(), "4.2");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InterfaceDescriptor {
    pub destination: DestinationZone,
    pub object: ObjectId,
}

impl InterfaceDescriptor {
    pub const NONE: Self = Self {
        destination: DestinationZone::NONE,
        object: ObjectId::NONE,
    };

    pub const fn new(destination: DestinationZone, object: ObjectId) -> Self {
        Self {
            destination,
            object,
        }
    }

    /// A descriptor naming zone zero or object zero refers to nothing.
    pub const fn is_valid(self) -> bool {
        !self.destination.is_none() && !self.object.is_none()
    }
}

impl std::fmt::Display for InterfaceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.destination, self.object)
    }
}
