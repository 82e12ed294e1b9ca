//! Host-side backend for the paravirtual display protocol.
//!
//! The guest frontend shares pixel memory through grant references and drives one logical output
//! per connection. This crate turns those requests into work for a [`RenderingBackend`]:
//!
//! - [`grant`]: resolves guest page-directory chains into [`GrantDescriptor`]s.
//! - [`registry`]: owns display/scanout buffers keyed by guest cookies.
//! - [`output`]: binds an output to a scanout engine and runs the page-flip state machine.
//! - [`device`]: per-device engine allocation, pending flips, and the completion thread.
//! - [`dispatch`]: decodes request records and maps results onto protocol status codes.
//!
//! [`SoftwareBackend`], [`GrantTable`] and [`RecordingTransport`] are in-memory collaborators used
//! by tests and the replay tool.
#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod backend;
pub mod buffer;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod grant;
pub mod grant_table;
pub mod output;
pub mod registry;
pub mod software;

/// Hardware scanout engine (CRTC) identifier.
pub type EngineId = u32;

/// Physical signal path (connector) identifier.
pub type ConnectorId = u32;

pub use backend::{
    AllocRequest, BackendCaps, BufferSource, ConnectorInfo, DisplayMode, EngineConfig,
    NativeBuffer, NativeHandle, NativeScanout, RenderingBackend,
};
pub use buffer::{DisplayBuffer, DisplayStorage, ScanoutBuffer};
pub use config::DisplbackConfig;
pub use device::{DisplayDevice, FlipOutcome, FlipTicket};
pub use dispatch::{CommandDispatcher, EventNotifier, RecordingTransport, Transport};
pub use engine::{EngineAllocator, EngineClaims};
pub use error::{BackendError, CookieKind, DisplayError, GrantError, Result};
pub use grant::{resolve_grant_refs, write_grant_refs, GrantDescriptor, GrantMapper, GrantMapping};
pub use grant_table::GrantTable;
pub use output::{OutputController, OutputState};
pub use registry::{BufferRegistry, DisplayBufferRequest, ScanoutBufferRequest};
pub use software::{SoftwareBackend, SoftwareBackendConfig, SoftwareConnector, SoftwareFrame};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
