//! In-memory [`RenderingBackend`].
//!
//! Models connectors, scanout engines and the vblank completion queue without touching real
//! display hardware. Every mode-set and flip records a [`SoftwareFrame`] with the bytes the
//! engine would scan out at that moment.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use pvdisplay_protocol::directory::grefs_for_size;
use pvdisplay_protocol::format::PixelFormat;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::backend::{
    AllocRequest, BackendCaps, BufferSource, ConnectorInfo, DisplayMode, EngineConfig,
    NativeBuffer, NativeHandle, NativeScanout, RenderingBackend,
};
use crate::error::BackendError;
use crate::grant::{GrantMapper, GrantMapping};
use crate::{lock, ConnectorId, EngineId};

fn default_connected() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SoftwareConnector {
    pub id: ConnectorId,
    #[serde(default = "default_connected")]
    pub connected: bool,
    pub modes: Vec<DisplayMode>,
    /// Engine that drives this connector at startup (e.g. the host console).
    #[serde(default)]
    pub current_engine: Option<EngineId>,
    pub possible_engines: Vec<EngineId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SoftwareBackendConfig {
    pub connectors: Vec<SoftwareConnector>,
    pub zero_copy: bool,
    pub host_export: bool,
    /// Complete every flip immediately instead of waiting for [`SoftwareBackend::complete_flip`].
    pub auto_complete_flips: bool,
}

/// What an engine was scanning out after its last mode-set or flip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoftwareFrame {
    pub scanout: NativeHandle,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

enum Storage {
    Local(Vec<u8>),
    Guest(Box<dyn GrantMapping>),
}

struct SoftwareBuffer {
    storage: Storage,
    size: usize,
}

impl SoftwareBuffer {
    fn snapshot(&self) -> Vec<u8> {
        match &self.storage {
            Storage::Local(bytes) => bytes.clone(),
            Storage::Guest(mapping) => {
                let mut out = vec![0u8; self.size.min(mapping.len())];
                mapping.read(0, &mut out);
                out
            }
        }
    }
}

#[derive(Default)]
struct SoftwareState {
    next_handle: NativeHandle,
    buffers: HashMap<NativeHandle, SoftwareBuffer>,
    scanouts: HashMap<NativeHandle, NativeScanout>,
    connectors: BTreeMap<ConnectorId, SoftwareConnector>,
    engines: BTreeMap<EngineId, EngineConfig>,
    frames: HashMap<EngineId, SoftwareFrame>,
}

impl SoftwareState {
    fn alloc_handle(&mut self) -> NativeHandle {
        self.next_handle += 1;
        self.next_handle
    }

    fn engine_mut(&mut self, engine: EngineId) -> Result<&mut EngineConfig, BackendError> {
        self.engines
            .get_mut(&engine)
            .ok_or(BackendError::UnknownEngine(engine))
    }

    fn record_frame(
        &mut self,
        engine: EngineId,
        scanout: &NativeScanout,
    ) -> Result<(), BackendError> {
        let registered = self
            .scanouts
            .get(&scanout.handle)
            .ok_or(BackendError::UnknownBuffer(scanout.handle))?;
        let buffer = self
            .buffers
            .get(&registered.buffer)
            .ok_or(BackendError::UnknownBuffer(registered.buffer))?;
        let frame = SoftwareFrame {
            scanout: scanout.handle,
            width: scanout.width,
            height: scanout.height,
            format: scanout.format,
            pixels: buffer.snapshot(),
        };
        self.frames.insert(engine, frame);
        Ok(())
    }
}

#[derive(Default)]
struct CompletionQueue {
    ready: VecDeque<EngineId>,
    in_flight: BTreeSet<EngineId>,
}

pub struct SoftwareBackend {
    caps: BackendCaps,
    auto_complete: bool,
    grants: Arc<dyn GrantMapper>,
    state: Mutex<SoftwareState>,
    completions: Mutex<CompletionQueue>,
    completion_ready: Condvar,
}

impl SoftwareBackend {
    pub fn new(config: SoftwareBackendConfig, grants: Arc<dyn GrantMapper>) -> Self {
        let mut state = SoftwareState::default();
        for connector in config.connectors {
            for engine in &connector.possible_engines {
                state.engines.entry(*engine).or_default();
            }
            if let Some(engine) = connector.current_engine {
                // Whatever was driving the connector before the guest showed up.
                state.engines.insert(
                    engine,
                    EngineConfig {
                        connector: Some(connector.id),
                        mode: connector.modes.first().copied(),
                        scanout: None,
                    },
                );
            }
            state.connectors.insert(connector.id, connector);
        }

        Self {
            caps: BackendCaps {
                zero_copy_import: config.zero_copy,
                host_export: config.host_export,
            },
            auto_complete: config.auto_complete_flips,
            grants,
            state: Mutex::new(state),
            completions: Mutex::new(CompletionQueue::default()),
            completion_ready: Condvar::new(),
        }
    }

    /// Signal vblank for a flip queued on `engine`. Returns `false` if none was in flight.
    pub fn complete_flip(&self, engine: EngineId) -> bool {
        let mut queue = lock(&self.completions);
        if !queue.in_flight.remove(&engine) {
            return false;
        }
        queue.ready.push_back(engine);
        self.completion_ready.notify_all();
        true
    }

    /// Signal vblank on every engine with a flip in flight.
    pub fn complete_all_flips(&self) -> usize {
        let mut queue = lock(&self.completions);
        let engines = std::mem::take(&mut queue.in_flight);
        let count = engines.len();
        queue.ready.extend(engines);
        if count > 0 {
            self.completion_ready.notify_all();
        }
        count
    }

    pub fn flips_in_flight(&self) -> Vec<EngineId> {
        lock(&self.completions).in_flight.iter().copied().collect()
    }

    pub fn last_frame(&self, engine: EngineId) -> Option<SoftwareFrame> {
        lock(&self.state).frames.get(&engine).cloned()
    }

    pub fn engine_config(&self, engine: EngineId) -> Option<EngineConfig> {
        lock(&self.state).engines.get(&engine).cloned()
    }

    /// Simulate hotplug on `connector`.
    pub fn set_connected(&self, connector: ConnectorId, connected: bool) -> bool {
        match lock(&self.state).connectors.get_mut(&connector) {
            Some(info) => {
                info.connected = connected;
                true
            }
            None => false,
        }
    }

    pub fn buffer_count(&self) -> usize {
        lock(&self.state).buffers.len()
    }

    pub fn scanout_count(&self) -> usize {
        lock(&self.state).scanouts.len()
    }

    pub fn buffer_contents(&self, handle: NativeHandle) -> Option<Vec<u8>> {
        lock(&self.state)
            .buffers
            .get(&handle)
            .map(SoftwareBuffer::snapshot)
    }
}

impl RenderingBackend for SoftwareBackend {
    fn capabilities(&self) -> BackendCaps {
        self.caps
    }

    fn allocate(
        &self,
        request: &AllocRequest,
        source: BufferSource<'_>,
    ) -> Result<NativeBuffer, BackendError> {
        let (storage, exported_grefs) = match source {
            BufferSource::HostLocal => {
                let mut bytes = Vec::new();
                bytes
                    .try_reserve_exact(request.size)
                    .map_err(|_| BackendError::OutOfMemory {
                        bytes: request.size,
                    })?;
                bytes.resize(request.size, 0);
                (Storage::Local(bytes), Vec::new())
            }
            BufferSource::GuestGrants(grants) => {
                if !self.caps.zero_copy_import {
                    return Err(BackendError::Unsupported("import guest grants"));
                }
                let mapping = self.grants.map(grants.grefs())?;
                (Storage::Guest(mapping), Vec::new())
            }
            BufferSource::HostExport => {
                if !self.caps.host_export {
                    return Err(BackendError::Unsupported("export buffers to the guest"));
                }
                let grefs = self.grants.export(grefs_for_size(request.size))?;
                let mapping = self.grants.map(&grefs)?;
                (Storage::Guest(mapping), grefs)
            }
        };

        let mut state = lock(&self.state);
        let handle = state.alloc_handle();
        state.buffers.insert(
            handle,
            SoftwareBuffer {
                storage,
                size: request.size,
            },
        );
        trace!(handle, size = request.size, "allocated software buffer");
        Ok(NativeBuffer {
            handle,
            stride: request.stride,
            size: request.size,
            exported_grefs,
        })
    }

    fn release_buffer(&self, handle: NativeHandle) {
        lock(&self.state).buffers.remove(&handle);
    }

    fn write_pixels(&self, handle: NativeHandle, pixels: &[u8]) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        let buffer = state
            .buffers
            .get_mut(&handle)
            .ok_or(BackendError::UnknownBuffer(handle))?;
        match &mut buffer.storage {
            Storage::Local(bytes) => {
                let len = pixels.len().min(bytes.len());
                bytes[..len].copy_from_slice(&pixels[..len]);
                Ok(())
            }
            Storage::Guest(_) => Err(BackendError::Unsupported("write into guest-backed memory")),
        }
    }

    fn wrap_for_scanout(
        &self,
        buffer: &NativeBuffer,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<NativeScanout, BackendError> {
        let mut state = lock(&self.state);
        if !state.buffers.contains_key(&buffer.handle) {
            return Err(BackendError::UnknownBuffer(buffer.handle));
        }
        let scanout = NativeScanout {
            handle: state.alloc_handle(),
            buffer: buffer.handle,
            width,
            height,
            format,
        };
        state.scanouts.insert(scanout.handle, scanout);
        Ok(scanout)
    }

    fn release_scanout(&self, handle: NativeHandle) {
        lock(&self.state).scanouts.remove(&handle);
    }

    fn connector(&self, connector: ConnectorId) -> Result<ConnectorInfo, BackendError> {
        let state = lock(&self.state);
        let info = state
            .connectors
            .get(&connector)
            .ok_or(BackendError::UnknownConnector(connector))?;
        Ok(ConnectorInfo {
            connected: info.connected,
            modes: info.modes.clone(),
            current_engine: info.current_engine,
            possible_engines: info.possible_engines.clone(),
        })
    }

    fn save_engine(&self, engine: EngineId) -> Result<EngineConfig, BackendError> {
        let mut state = lock(&self.state);
        Ok(state.engine_mut(engine)?.clone())
    }

    fn set_mode(
        &self,
        engine: EngineId,
        connector: ConnectorId,
        mode: &DisplayMode,
        scanout: &NativeScanout,
    ) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if !state.connectors.contains_key(&connector) {
            return Err(BackendError::UnknownConnector(connector));
        }
        state.engine_mut(engine)?;
        state.record_frame(engine, scanout)?;
        *state.engine_mut(engine)? = EngineConfig {
            connector: Some(connector),
            mode: Some(*mode),
            scanout: Some(scanout.handle),
        };
        if let Some(info) = state.connectors.get_mut(&connector) {
            info.current_engine = Some(engine);
        }
        Ok(())
    }

    fn restore_engine(
        &self,
        engine: EngineId,
        saved: Option<&EngineConfig>,
    ) -> Result<(), BackendError> {
        {
            let mut state = lock(&self.state);
            let restored = saved.cloned().unwrap_or_default();
            *state.engine_mut(engine)? = restored.clone();
            state.frames.remove(&engine);
            for info in state.connectors.values_mut() {
                if restored.connector == Some(info.id) {
                    info.current_engine = Some(engine);
                } else if info.current_engine == Some(engine) {
                    info.current_engine = None;
                }
            }
        }
        // A restored engine drops whatever flip it had queued, signalled or not.
        let mut queue = lock(&self.completions);
        queue.in_flight.remove(&engine);
        queue.ready.retain(|ready| *ready != engine);
        Ok(())
    }

    fn flip(&self, engine: EngineId, scanout: &NativeScanout) -> Result<(), BackendError> {
        {
            let mut state = lock(&self.state);
            if !state.engine_mut(engine)?.is_active() {
                return Err(BackendError::Unsupported("flip on an inactive engine"));
            }
            state.record_frame(engine, scanout)?;
            state.engine_mut(engine)?.scanout = Some(scanout.handle);
        }

        let mut queue = lock(&self.completions);
        if self.auto_complete {
            queue.ready.push_back(engine);
            self.completion_ready.notify_all();
        } else {
            queue.in_flight.insert(engine);
        }
        Ok(())
    }

    fn wait_for_completions(&self, timeout: Duration) -> Vec<EngineId> {
        let mut queue = lock(&self.completions);
        if queue.ready.is_empty() {
            queue = match self.completion_ready.wait_timeout(queue, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        queue.ready.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use pvdisplay_protocol::PAGE_SIZE;

    use super::*;
    use crate::grant::GrantDescriptor;
    use crate::grant_table::GrantTable;

    fn connector() -> SoftwareConnector {
        SoftwareConnector {
            id: 1,
            connected: true,
            modes: vec![DisplayMode::new(64, 16)],
            current_engine: Some(20),
            possible_engines: vec![10, 20],
        }
    }

    fn backend(config: SoftwareBackendConfig) -> (Arc<GrantTable>, SoftwareBackend) {
        let table = Arc::new(GrantTable::new());
        let backend = SoftwareBackend::new(config, table.clone());
        (table, backend)
    }

    fn request(size: usize) -> AllocRequest {
        AllocRequest {
            width: 64,
            height: 16,
            bpp: 32,
            stride: 256,
            size,
        }
    }

    #[test]
    fn console_engine_is_saved_as_initial_config() {
        let (_, backend) = backend(SoftwareBackendConfig {
            connectors: vec![connector()],
            ..Default::default()
        });

        let saved = backend.save_engine(20).unwrap();
        assert_eq!(saved.connector, Some(1));
        assert_eq!(saved.mode, Some(DisplayMode::new(64, 16)));
        assert_eq!(backend.save_engine(10).unwrap(), EngineConfig::default());
        assert_eq!(
            backend.save_engine(99),
            Err(BackendError::UnknownEngine(99))
        );
    }

    #[test]
    fn zero_copy_import_requires_capability() {
        let (table, plain) = backend(SoftwareBackendConfig::default());
        table.share_page(5, &[1, 2, 3]);
        let desc = GrantDescriptor::new(vec![5], 3);
        assert_eq!(
            plain.allocate(&request(3), BufferSource::GuestGrants(&desc)),
            Err(BackendError::Unsupported("import guest grants"))
        );

        let zero_copy = SoftwareBackend::new(
            SoftwareBackendConfig {
                zero_copy: true,
                ..Default::default()
            },
            table.clone(),
        );
        let buffer = zero_copy
            .allocate(&request(3), BufferSource::GuestGrants(&desc))
            .unwrap();
        table.write(5, 0, &[9]).unwrap();
        assert_eq!(zero_copy.buffer_contents(buffer.handle), Some(vec![9, 2, 3]));
    }

    #[test]
    fn host_export_grants_fresh_pages() {
        let (table, backend) = backend(SoftwareBackendConfig {
            host_export: true,
            ..Default::default()
        });
        let buffer = backend
            .allocate(&request(PAGE_SIZE + 1), BufferSource::HostExport)
            .unwrap();
        assert_eq!(buffer.exported_grefs.len(), 2);
        assert!(buffer.exported_grefs.iter().all(|g| table.is_shared(*g)));
    }

    #[test]
    fn manual_flip_completion() {
        let (_, backend) = backend(SoftwareBackendConfig {
            connectors: vec![connector()],
            ..Default::default()
        });
        let buffer = backend
            .allocate(&request(64 * 16 * 4), BufferSource::HostLocal)
            .unwrap();
        backend.write_pixels(buffer.handle, &[0x11; 8]).unwrap();
        let scanout = backend
            .wrap_for_scanout(&buffer, 64, 16, PixelFormat::Xrgb8888)
            .unwrap();

        assert!(backend.flip(10, &scanout).is_err(), "engine 10 is off");
        backend
            .set_mode(10, 1, &DisplayMode::new(64, 16), &scanout)
            .unwrap();
        backend.flip(10, &scanout).unwrap();
        assert_eq!(backend.flips_in_flight(), vec![10]);
        assert!(backend
            .wait_for_completions(Duration::from_millis(1))
            .is_empty());

        assert!(backend.complete_flip(10));
        assert!(!backend.complete_flip(10));
        assert_eq!(
            backend.wait_for_completions(Duration::from_millis(1)),
            vec![10]
        );

        let frame = backend.last_frame(10).unwrap();
        assert_eq!(frame.scanout, scanout.handle);
        assert_eq!(&frame.pixels[..9], &[0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0]);
    }

    #[test]
    fn restore_discards_queued_and_signalled_flips() {
        let (_, backend) = backend(SoftwareBackendConfig {
            connectors: vec![connector()],
            ..Default::default()
        });
        let buffer = backend
            .allocate(&request(64 * 16 * 4), BufferSource::HostLocal)
            .unwrap();
        let scanout = backend
            .wrap_for_scanout(&buffer, 64, 16, PixelFormat::Xrgb8888)
            .unwrap();
        backend
            .set_mode(10, 1, &DisplayMode::new(64, 16), &scanout)
            .unwrap();

        backend.flip(10, &scanout).unwrap();
        backend.restore_engine(10, None).unwrap();
        assert!(!backend.complete_flip(10));

        backend
            .set_mode(10, 1, &DisplayMode::new(64, 16), &scanout)
            .unwrap();
        backend.flip(10, &scanout).unwrap();
        assert!(backend.complete_flip(10));
        backend.restore_engine(10, None).unwrap();
        assert!(backend
            .wait_for_completions(Duration::from_millis(1))
            .is_empty());
    }

    #[test]
    fn restore_without_saved_config_switches_engine_off() {
        let (_, backend) = backend(SoftwareBackendConfig {
            connectors: vec![connector()],
            ..Default::default()
        });
        backend.restore_engine(20, None).unwrap();
        assert!(!backend.engine_config(20).unwrap().is_active());
        assert_eq!(backend.connector(1).unwrap().current_engine, None);
    }
}
