//! Response status codes.
//!
//! Two protocol generations exist and frontends are built against exactly one of them:
//! - [`ProtocolGeneration::Legacy`] reports a small enumerated status set
//!   ([`LEGACY_STATUS_OK`], [`LEGACY_STATUS_ERROR`], [`LEGACY_STATUS_NOT_SUPPORTED`]).
//! - [`ProtocolGeneration::Errno`] reports `0` or a negative POSIX errno value.
//!
//! The backend classifies every outcome as a [`StatusKind`] and the configured generation turns
//! that into the wire value. The two encodings are never mixed on one connection.

use serde::{Deserialize, Serialize};

pub const LEGACY_STATUS_OK: i32 = 0;
pub const LEGACY_STATUS_ERROR: i32 = 1;
pub const LEGACY_STATUS_NOT_SUPPORTED: i32 = 2;

pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const EEXIST: i32 = 17;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const EOPNOTSUPP: i32 = 95;
pub const ESHUTDOWN: i32 = 108;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolGeneration {
    Legacy,
    #[default]
    Errno,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    NotSupported,
    InvalidArgument,
    NoEntry,
    Exists,
    Busy,
    NoDevice,
    Shutdown,
    OutOfMemory,
    Io,
}

impl StatusKind {
    pub const fn errno(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::NotSupported => EOPNOTSUPP,
            Self::InvalidArgument => EINVAL,
            Self::NoEntry => ENOENT,
            Self::Exists => EEXIST,
            Self::Busy => EBUSY,
            Self::NoDevice => ENODEV,
            Self::Shutdown => ESHUTDOWN,
            Self::OutOfMemory => ENOMEM,
            Self::Io => EIO,
        }
    }
}

impl ProtocolGeneration {
    pub const fn encode(self, kind: StatusKind) -> i32 {
        match self {
            Self::Legacy => match kind {
                StatusKind::Ok => LEGACY_STATUS_OK,
                StatusKind::NotSupported => LEGACY_STATUS_NOT_SUPPORTED,
                _ => LEGACY_STATUS_ERROR,
            },
            Self::Errno => -kind.errno(),
        }
    }
}
