use core::fmt;

use pvdisplay_protocol::displif::DisplDecodeError;
use pvdisplay_protocol::status::StatusKind;
use pvdisplay_protocol::GrantRef;
use thiserror::Error;

use crate::{ConnectorId, EngineId};

pub type Result<T> = std::result::Result<T, DisplayError>;

/// Which guest cookie namespace an error refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CookieKind {
    Display,
    Scanout,
}

impl fmt::Display for CookieKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CookieKind::Display => f.write_str("dbuf"),
            CookieKind::Scanout => f.write_str("fb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrantError {
    #[error("grant reference {0} is not shared with the host")]
    UnknownGrant(GrantRef),
    #[error("failed to map {count} grant pages: {reason}")]
    MapFailed { count: usize, reason: String },
    #[error("grant export is not supported")]
    ExportUnsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },
    #[error("unknown native buffer {0}")]
    UnknownBuffer(u64),
    #[error("unknown connector {0}")]
    UnknownConnector(ConnectorId),
    #[error("unknown scanout engine {0}")]
    UnknownEngine(EngineId),
    #[error("backend cannot {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Grant(#[from] GrantError),
}

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("{kind} cookie 0x{cookie:x} is already registered")]
    DuplicateCookie { kind: CookieKind, cookie: u64 },
    #[error("{kind} cookie 0x{cookie:x} is not registered")]
    UnknownCookie { kind: CookieKind, cookie: u64 },
    #[error("invalid buffer descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("no native mode for {width}x{height}")]
    UnsupportedMode { width: u32, height: u32 },
    #[error("no free scanout engine for connector {connector}")]
    NoEngineAvailable { connector: ConnectorId },
    #[error("connector {connector} has no display attached")]
    NotConnected { connector: ConnectorId },
    #[error("output already bound to scanout engine {engine}")]
    AlreadyInitialized { engine: EngineId },
    #[error("output is not initialized")]
    NotInitialized,
    #[error("page flip already pending on scanout engine {engine}")]
    FlipPending { engine: EngineId },
    #[error("display device event loop has stopped")]
    DeviceStopped,
    #[error("dbuf cookie 0x{db_cookie:x} is zero-copy and cannot be copied")]
    CopyNotSupported { db_cookie: u64 },
    #[error("dbuf cookie 0x{db_cookie:x} is still referenced by fb cookie 0x{fb_cookie:x}")]
    BufferInUse { db_cookie: u64, fb_cookie: u64 },
    #[error("unsupported pixel format 0x{0:08x}")]
    UnsupportedFormat(u32),
    #[error("backend cannot allocate buffers on behalf of the guest")]
    HostAllocUnsupported,
    #[error("operation 0x{0:02x} is not supported")]
    NotSupported(u8),
    #[error("malformed request: {0}")]
    InvalidRequest(DisplDecodeError),
    #[error("failed to start display device: {0}")]
    Startup(#[from] std::io::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<DisplDecodeError> for DisplayError {
    fn from(err: DisplDecodeError) -> Self {
        match err {
            DisplDecodeError::UnknownOpcode(op) => DisplayError::NotSupported(op),
            other => DisplayError::InvalidRequest(other),
        }
    }
}

impl DisplayError {
    /// Protocol-level classification reported back to the guest.
    pub fn status_kind(&self) -> StatusKind {
        match self {
            DisplayError::DuplicateCookie { .. } => StatusKind::Exists,
            DisplayError::UnknownCookie { .. } => StatusKind::NoEntry,
            DisplayError::InvalidDescriptor(_)
            | DisplayError::UnsupportedMode { .. }
            | DisplayError::UnsupportedFormat(_)
            | DisplayError::NotInitialized
            | DisplayError::FlipPending { .. }
            | DisplayError::InvalidRequest(_) => StatusKind::InvalidArgument,
            DisplayError::NoEngineAvailable { .. }
            | DisplayError::AlreadyInitialized { .. }
            | DisplayError::BufferInUse { .. } => StatusKind::Busy,
            DisplayError::NotConnected { .. } => StatusKind::NoDevice,
            DisplayError::DeviceStopped => StatusKind::Shutdown,
            DisplayError::CopyNotSupported { .. }
            | DisplayError::HostAllocUnsupported
            | DisplayError::NotSupported(_) => StatusKind::NotSupported,
            DisplayError::Startup(_) => StatusKind::OutOfMemory,
            DisplayError::Backend(BackendError::OutOfMemory { .. }) => StatusKind::OutOfMemory,
            DisplayError::Backend(BackendError::Unsupported(_)) => StatusKind::NotSupported,
            DisplayError::Backend(_) => StatusKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_opcode_maps_to_not_supported() {
        let err = DisplayError::from(DisplDecodeError::UnknownOpcode(0x42));
        assert!(matches!(err, DisplayError::NotSupported(0x42)));
        assert_eq!(err.status_kind(), StatusKind::NotSupported);
    }

    #[test]
    fn flip_pending_is_reported_like_not_initialized() {
        assert_eq!(
            DisplayError::FlipPending { engine: 3 }.status_kind(),
            DisplayError::NotInitialized.status_kind()
        );
    }

    #[test]
    fn messages_name_the_cookie_namespace() {
        let err = DisplayError::UnknownCookie {
            kind: CookieKind::Scanout,
            cookie: 0x2,
        };
        assert_eq!(err.to_string(), "fb cookie 0x2 is not registered");
    }
}
