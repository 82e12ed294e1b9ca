use std::time::Duration;

use pvdisplay_protocol::format::PixelFormat;
use pvdisplay_protocol::GrantRef;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::grant::GrantDescriptor;
use crate::{ConnectorId, EngineId};

/// Opaque backend-side identifier for a native buffer or scanout object.
pub type NativeHandle = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendCaps {
    /// Buffers can be imported directly over guest grants.
    pub zero_copy_import: bool,
    /// Buffers can be allocated by the host and granted to the guest.
    pub host_export: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocRequest {
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub stride: u32,
    pub size: usize,
}

/// Where the pixels of a new native buffer live.
#[derive(Clone, Copy, Debug)]
pub enum BufferSource<'a> {
    /// Host-local memory; contents are filled via [`RenderingBackend::write_pixels`].
    HostLocal,
    /// Imported over the guest pages named by the descriptor.
    GuestGrants(&'a GrantDescriptor),
    /// Allocated by the host and granted to the guest; references are returned in
    /// [`NativeBuffer::exported_grefs`].
    HostExport,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeBuffer {
    pub handle: NativeHandle,
    pub stride: u32,
    pub size: usize,
    /// Non-empty only for [`BufferSource::HostExport`] allocations.
    pub exported_grefs: Vec<GrantRef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeScanout {
    pub handle: NativeHandle,
    pub buffer: NativeHandle,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_refresh_mhz")]
    pub refresh_mhz: u32,
}

fn default_refresh_mhz() -> u32 {
    60_000
}

impl DisplayMode {
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            refresh_mhz: 60_000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub connected: bool,
    /// Native modes reported by the attached display.
    pub modes: Vec<DisplayMode>,
    /// Engine currently driving this connector's signal path, if any.
    pub current_engine: Option<EngineId>,
    /// Engines able to drive this connector, in preference order.
    pub possible_engines: Vec<EngineId>,
}

/// Snapshot of a scanout engine's configuration, used to restore it after the guest is done.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub connector: Option<ConnectorId>,
    pub mode: Option<DisplayMode>,
    pub scanout: Option<NativeHandle>,
}

impl EngineConfig {
    pub fn is_active(&self) -> bool {
        self.mode.is_some()
    }
}

/// Boundary between guest-facing protocol handling and the host display stack.
///
/// Methods take `&self`: one backend instance is shared by every output on a device and by the
/// device's completion thread.
pub trait RenderingBackend: Send + Sync {
    fn capabilities(&self) -> BackendCaps;

    fn allocate(
        &self,
        request: &AllocRequest,
        source: BufferSource<'_>,
    ) -> Result<NativeBuffer, BackendError>;

    /// Free a native buffer. Unknown handles are ignored.
    fn release_buffer(&self, handle: NativeHandle);

    /// Overwrite the start of a host-local buffer with `pixels`.
    fn write_pixels(&self, handle: NativeHandle, pixels: &[u8]) -> Result<(), BackendError>;

    /// Register `buffer` as a mode-set/flip-ready scanout object.
    fn wrap_for_scanout(
        &self,
        buffer: &NativeBuffer,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<NativeScanout, BackendError>;

    /// Unregister a scanout object. Unknown handles are ignored.
    fn release_scanout(&self, handle: NativeHandle);

    fn connector(&self, connector: ConnectorId) -> Result<ConnectorInfo, BackendError>;

    fn save_engine(&self, engine: EngineId) -> Result<EngineConfig, BackendError>;

    fn set_mode(
        &self,
        engine: EngineId,
        connector: ConnectorId,
        mode: &DisplayMode,
        scanout: &NativeScanout,
    ) -> Result<(), BackendError>;

    /// Put `engine` back into `saved`, or switch it off when `saved` is `None`.
    ///
    /// Any flip queued on `engine` is cancelled: once this returns, `wait_for_completions` must
    /// not report a completion for it. Completions are matched to pending flips by engine only,
    /// so a late one would resolve the next owner's flip.
    fn restore_engine(
        &self,
        engine: EngineId,
        saved: Option<&EngineConfig>,
    ) -> Result<(), BackendError>;

    /// Queue a flip to `scanout` on the next vertical blank.
    fn flip(&self, engine: EngineId, scanout: &NativeScanout) -> Result<(), BackendError>;

    /// Block for up to `timeout` and return the engines whose flips completed.
    fn wait_for_completions(&self, timeout: Duration) -> Vec<EngineId>;
}
