//! Result codes.
//!
//! The protocol reserves the wire range `-63..=-1` for its own error
//! codes and `0` for success. Every other value is an application result
//! and passes through the runtime verbatim, the runtime never interprets
//! it. The reserved values are frozen, renumbering any of them is a
//! protocol break.

/// Success on the wire.
pub const OK: i64 = 0;

/// Lowest value of the reserved protocol range (inclusive).
pub const RESERVED_MIN: i64 = -63;

/// Highest value of the reserved protocol range (inclusive).
pub const RESERVED_MAX: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The message names an unknown object, a zero descriptor, or is
    /// otherwise malformed.
    InvalidData,
    /// The interface ordinal is not implemented by the target object.
    InvalidInterfaceId,
    /// The method ordinal is zero or outside the interface.
    InvalidMethodId,
    /// The peer does not accept the protocol revision of the message.
    InvalidVersion,
    /// The interface stub does not accept the payload encoding.
    IncompatibleSerialisation,
    /// The two services cannot interoperate at all.
    IncompatibleService,
    /// The channel to the peer failed or is gone.
    TransportError,
    /// No route to the destination zone.
    ZoneNotFound,
    /// The peer did not reply within the channel timeout.
    TimedOut,
    /// An output buffer was too small, retry with a larger one.
    NeedMoreMemory,
    /// The callee implementation raised, the failure was converted at
    /// the stub boundary.
    Exception,
    /// An application-defined result, surfaced verbatim.
    Application(i64),
}

impl Error {
    /// The frozen wire value of this error.
    pub const fn to_wire(self) -> i64 {
        match self {
            Error::InvalidData => -1,
            Error::InvalidInterfaceId => -2,
            Error::InvalidMethodId => -3,
            Error::InvalidVersion => -4,
            Error::IncompatibleSerialisation => -5,
            Error::IncompatibleService => -6,
            Error::TransportError => -7,
            Error::ZoneNotFound => -8,
            Error::TimedOut => -9,
            Error::NeedMoreMemory => -10,
            Error::Exception => -11,
            Error::Application(value) => value,
        }
    }

    /// Maps a wire value back to an error. Returns `None` for [`OK`].
    ///
    /// Unassigned values inside the reserved range decode as
    /// [`Error::InvalidData`] so that a newer peer's codes cannot be
    /// mistaken for application results.
    pub const fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => None,
            -1 => Some(Error::InvalidData),
            -2 => Some(Error::InvalidInterfaceId),
            -3 => Some(Error::InvalidMethodId),
            -4 => Some(Error::InvalidVersion),
            -5 => Some(Error::IncompatibleSerialisation),
            -6 => Some(Error::IncompatibleService),
            -7 => Some(Error::TransportError),
            -8 => Some(Error::ZoneNotFound),
            -9 => Some(Error::TimedOut),
            -10 => Some(Error::NeedMoreMemory),
            -11 => Some(Error::Exception),
            value if value >= RESERVED_MIN && value <= RESERVED_MAX => Some(Error::InvalidData),
            value => Some(Error::Application(value)),
        }
    }

    /// Whether this is a reserved protocol error rather than an
    /// application result.
    pub const fn is_protocol(self) -> bool {
        !matches!(self, Error::Application(_))
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Application(value) => write!(f, "application error {}", value),
            other => write!(f, "{:?}", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Collapses a runtime result into its wire value.
pub fn result_to_wire(result: &Result<()>) -> i64 {
    match result {
        Ok(()) => OK,
        Err(error) => error.to_wire(),
    }
}

/// Expands a wire value back into a runtime result.
///
/// # Test
///
/// ```
/// use zone_rpc_codec::error::{result_from_wire, Error};
///
/// assert_eq!(result_from_wire(0), Ok(()));
/// assert_eq!(result_from_wire(-8), Err(Error::ZoneNotFound));
/// assert_eq!(result_from_wire(42), Err(Error::Application(42)));
/// ```
pub fn result_from_wire(value: i64) -> Result<()> {
    match Error::from_wire(value) {
        None => Ok(()),
        Some(error) => Err(error),
    }
}
