//! ## Cross-zone RPC wire vocabulary
//!
//! Everything that travels between zones is described here: the strongly
//! typed routing identifiers, the frozen result-code range, the framed
//! message layout, and the interface fingerprints that name interfaces on
//! the wire.
//!
//! A zone is an isolation boundary with its own address space and service
//! instance. Zones exchange messages through channels they share with
//! adjacent zones; an object reference crosses a channel only as an
//! [`ids::InterfaceDescriptor`], a pair of destination zone and object id.
//! This crate performs no I/O and holds no state, it only defines what the
//! bytes mean.

pub mod error;
pub mod fingerprint;
pub mod frame;
pub mod ids;

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Newest protocol revision this build speaks.
pub const PROTOCOL_VERSION_3: u64 = 3;

/// Previous protocol revision, kept alive for peers that have not been
/// rebuilt yet.
pub const PROTOCOL_VERSION_2: u64 = 2;

/// Protocol revisions this build accepts, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: [u64; 2] = [PROTOCOL_VERSION_3, PROTOCOL_VERSION_2];

/// The floor of version negotiation. A peer that rejects this revision
/// cannot be spoken to at all.
pub const LOWEST_SUPPORTED_VERSION: u64 = PROTOCOL_VERSION_2;

/// Whether this build can serve a call made at `version`.
pub fn is_supported_version(version: u64) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// The next revision to try after `version` was rejected by a peer.
///
/// # Test
///
/// ```
/// assert_eq!(zone_rpc_codec::next_version_below(3), Some(2));
/// assert_eq!(zone_rpc_codec::next_version_below(2), None);
/// ```
pub fn next_version_below(version: u64) -> Option<u64> {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|&supported| supported < version)
}

/// Serialization format of a call payload.
///
/// The runtime treats payloads as opaque bytes, only the generated
/// interface stubs interpret them. Stubs declare which encodings they
/// accept; every stub must accept [`Encoding::Json`], it is the target of
/// encoding fallback when a peer rejects the preferred format.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Encoding {
    Binary = 1,
    CompressedBinary = 2,
    Json = 3,
}

impl Encoding {
    /// The encoding every interface stub is required to accept.
    pub const fn universal() -> Self {
        Encoding::Json
    }
}

/// Topology side effects requested by an `add_ref`.
///
/// An empty set means "reference count only, change no routes".
///
/// # Test
///
/// ```
/// use zone_rpc_codec::AddRefOptions;
///
/// let options = AddRefOptions::BUILD_DESTINATION_ROUTE | AddRefOptions::BUILD_CALLER_ROUTE;
///
/// assert!(options.contains(AddRefOptions::BUILD_DESTINATION_ROUTE));
/// assert!(options.contains(AddRefOptions::BUILD_CALLER_ROUTE));
/// assert!(!AddRefOptions::NONE.contains(AddRefOptions::BUILD_CALLER_ROUTE));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct AddRefOptions(u64);

impl AddRefOptions {
    pub const NONE: Self = Self(0);

    /// Zones relaying the `add_ref` promise to route future traffic from
    /// the reference holder towards the destination zone through
    /// themselves.
    pub const BUILD_DESTINATION_ROUTE: Self = Self(1);

    /// Zones relaying the `add_ref` install a reverse route so that the
    /// destination side can originate messages back to the holder.
    pub const BUILD_CALLER_ROUTE: Self = Self(2);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for AddRefOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Delivery semantics of a one-way `post`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct PostOptions(u64);

impl PostOptions {
    /// Plain fire and forget.
    pub const NORMAL: Self = Self(0);

    /// The calling zone is shutting down. Recipients may drop any state
    /// held on behalf of that zone.
    pub const ZONE_TERMINATING: Self = Self(1);

    /// An optimistic release that need not be strictly accounted.
    pub const RELEASE_OPTIMISTIC: Self = Self(2);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PostOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
