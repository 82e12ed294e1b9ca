//! One logical output: engine binding and the page-flip state machine.
//!
//! ```text
//! Disconnected / ConnectedIdle --initialize--> Initialized --page_flip--> FlipPending
//!          ^                                   |    ^                         |
//!          +------------- release -------------+    +------- completion ------+
//! ```
//!
//! Lock order: output state, then the device's engine claims or pending-flip table. Flip
//! completions take the output state lock from the device thread, so nothing here waits for a
//! flip while holding it.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info, warn};

use crate::backend::{DisplayMode, EngineConfig};
use crate::buffer::ScanoutBuffer;
use crate::device::{DisplayDevice, FlipCompletion, FlipOutcome, FlipTicket};
use crate::error::{DisplayError, Result};
use crate::{lock, ConnectorId, EngineId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputState {
    Disconnected,
    ConnectedIdle,
    Initialized,
    FlipPending,
}

struct Binding {
    engine: EngineId,
    mode: DisplayMode,
    saved: EngineConfig,
    /// Buffer the engine is currently scanning out.
    current: Arc<ScanoutBuffer>,
}

struct InFlight {
    seq: u64,
    ticket: FlipTicket,
}

#[derive(Default)]
struct OutputInner {
    binding: Option<Binding>,
    flip: Option<InFlight>,
    flip_seq: u64,
}

pub struct OutputController {
    connector: ConnectorId,
    device: Arc<DisplayDevice>,
    inner: Arc<Mutex<OutputInner>>,
}

impl OutputController {
    pub fn new(device: Arc<DisplayDevice>, connector: ConnectorId) -> Self {
        Self {
            connector,
            device,
            inner: Arc::new(Mutex::new(OutputInner::default())),
        }
    }

    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    pub fn device(&self) -> &Arc<DisplayDevice> {
        &self.device
    }

    pub fn engine(&self) -> Option<EngineId> {
        lock(&self.inner).binding.as_ref().map(|b| b.engine)
    }

    pub fn mode(&self) -> Option<DisplayMode> {
        lock(&self.inner).binding.as_ref().map(|b| b.mode)
    }

    /// fb cookie of the buffer currently on screen.
    pub fn current_fb_cookie(&self) -> Option<u64> {
        lock(&self.inner)
            .binding
            .as_ref()
            .map(|b| b.current.fb_cookie())
    }

    pub fn state(&self) -> OutputState {
        {
            let inner = lock(&self.inner);
            match (&inner.binding, &inner.flip) {
                (Some(_), Some(_)) => return OutputState::FlipPending,
                (Some(_), None) => return OutputState::Initialized,
                (None, _) => {}
            }
        }
        match self.device.backend().connector(self.connector) {
            Ok(info) if info.connected => OutputState::ConnectedIdle,
            _ => OutputState::Disconnected,
        }
    }

    /// Bind an engine to this output and mode-set it to `width x height` scanning out `scanout`.
    pub fn initialize(&self, width: u32, height: u32, scanout: Arc<ScanoutBuffer>) -> Result<()> {
        let backend = self.device.backend();
        let info = backend.connector(self.connector)?;
        if !info.connected {
            return Err(DisplayError::NotConnected {
                connector: self.connector,
            });
        }

        let mut inner = lock(&self.inner);
        if let Some(binding) = &inner.binding {
            return Err(DisplayError::AlreadyInitialized {
                engine: binding.engine,
            });
        }

        let mut claims = self.device.engines().lock();
        let engine = claims
            .select(info.current_engine, &info.possible_engines)
            .ok_or(DisplayError::NoEngineAvailable {
                connector: self.connector,
            })?;
        let mode = info
            .modes
            .iter()
            .find(|mode| mode.width == width && mode.height == height)
            .copied()
            .ok_or(DisplayError::UnsupportedMode { width, height })?;

        // Only an accepted mode-set may touch the host copy.
        scanout.prepare_for_scanout()?;
        let saved = backend.save_engine(engine)?;
        backend.set_mode(engine, self.connector, &mode, scanout.native())?;
        claims.claim(engine);
        drop(claims);

        info!(
            connector = self.connector,
            engine,
            width,
            height,
            fb_cookie = scanout.fb_cookie(),
            "output initialized"
        );
        inner.binding = Some(Binding {
            engine,
            mode,
            saved,
            current: scanout,
        });
        Ok(())
    }

    /// Queue a flip to `scanout`. `on_complete` runs exactly once, from the device's completion
    /// thread or from whichever call aborts the flip.
    pub fn page_flip<F>(&self, scanout: Arc<ScanoutBuffer>, on_complete: F) -> Result<FlipTicket>
    where
        F: FnOnce(FlipOutcome) + Send + 'static,
    {
        let mut inner = lock(&self.inner);
        let Some(binding) = &inner.binding else {
            return Err(DisplayError::NotInitialized);
        };
        let engine = binding.engine;
        if inner.flip.is_some() {
            return Err(DisplayError::FlipPending { engine });
        }

        inner.flip_seq += 1;
        let seq = inner.flip_seq;
        let ticket = FlipTicket::new();
        let completion = flip_completion(
            Arc::downgrade(&self.inner),
            seq,
            scanout.clone(),
            ticket.clone(),
            on_complete,
        );
        let fb_cookie = scanout.fb_cookie();
        self.device
            .schedule_flip(engine, self.connector, scanout, completion)?;
        inner.flip = Some(InFlight {
            seq,
            ticket: ticket.clone(),
        });
        debug!(connector = self.connector, engine, fb_cookie, "page flip queued");
        Ok(ticket)
    }

    /// Give the engine back: wait (bounded) for an in-flight flip, restore the engine, and drop
    /// the binding. Does nothing if no engine is bound.
    pub fn release(&self) -> Result<()> {
        let ticket = lock(&self.inner).flip.as_ref().map(|f| f.ticket.clone());
        if let Some(ticket) = ticket {
            let timeout = self.device.config().flip_timeout();
            if ticket.wait_timeout(timeout).is_none() {
                warn!(
                    connector = self.connector,
                    timeout_ms = timeout.as_millis() as u64,
                    "page flip did not complete before release"
                );
            }
        }

        let binding = {
            let mut inner = lock(&self.inner);
            inner.flip = None;
            inner.binding.take()
        };
        let Some(binding) = binding else {
            return Ok(());
        };

        let backend = self.device.backend();
        let saved = self
            .device
            .config()
            .restore_on_release
            .then_some(&binding.saved);
        let restored = backend.restore_engine(binding.engine, saved);
        if let Err(err) = &restored {
            error!(
                connector = self.connector,
                engine = binding.engine,
                %err,
                "failed to restore scanout engine"
            );
        }
        self.device.abandon_flip(binding.engine);
        self.device.engines().release(binding.engine);
        info!(
            connector = self.connector,
            engine = binding.engine,
            "output released"
        );
        restored.map_err(DisplayError::from)
    }
}

fn flip_completion<F>(
    inner: Weak<Mutex<OutputInner>>,
    seq: u64,
    scanout: Arc<ScanoutBuffer>,
    ticket: FlipTicket,
    on_complete: F,
) -> FlipCompletion
where
    F: FnOnce(FlipOutcome) + Send + 'static,
{
    Box::new(move |outcome| {
        if let Some(inner) = inner.upgrade() {
            let mut inner = lock(&inner);
            // A released output has already forgotten this flip.
            if inner.flip.as_ref().is_some_and(|f| f.seq == seq) {
                inner.flip = None;
                if outcome == FlipOutcome::Completed {
                    if let Some(binding) = inner.binding.as_mut() {
                        binding.current = scanout;
                    }
                }
            }
        }
        ticket.resolve(outcome);
        on_complete(outcome);
    })
}

impl Drop for OutputController {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(connector = self.connector, %err, "release on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use pvdisplay_protocol::format::FOURCC_XRGB8888;
    use pvdisplay_protocol::PAGE_SIZE;

    use super::*;
    use crate::config::DisplbackConfig;
    use crate::grant_table::GrantTable;
    use crate::registry::{BufferRegistry, DisplayBufferRequest, ScanoutBufferRequest};
    use crate::software::{SoftwareBackend, SoftwareBackendConfig, SoftwareConnector};

    struct Fixture {
        backend: Arc<SoftwareBackend>,
        device: Arc<DisplayDevice>,
        registry: BufferRegistry,
    }

    fn fixture(connected: bool) -> Fixture {
        let table = Arc::new(GrantTable::new());
        let backend = Arc::new(SoftwareBackend::new(
            SoftwareBackendConfig {
                connectors: vec![SoftwareConnector {
                    id: 1,
                    connected,
                    modes: vec![DisplayMode::new(64, 16)],
                    current_engine: None,
                    possible_engines: vec![10, 11],
                }],
                ..Default::default()
            },
            table.clone(),
        ));
        let device = DisplayDevice::start(backend.clone(), DisplbackConfig::default()).unwrap();
        let registry = BufferRegistry::new(backend.clone(), table.clone());

        table.share_directory_chain(&[1], &[2]);
        table.share_page(2, &[]);
        registry
            .create_display_buffer(&DisplayBufferRequest {
                db_cookie: 1,
                directory_start: 1,
                size: PAGE_SIZE,
                width: 64,
                height: 16,
                bpp: 32,
                alloc_on_host: false,
            })
            .unwrap();
        registry
            .create_scanout_buffer(&ScanoutBufferRequest {
                db_cookie: 1,
                fb_cookie: 2,
                width: 64,
                height: 16,
                pixel_format: FOURCC_XRGB8888,
            })
            .unwrap();

        Fixture {
            backend,
            device,
            registry,
        }
    }

    #[test]
    fn disconnected_connector_cannot_initialize() {
        let f = fixture(false);
        let output = OutputController::new(f.device.clone(), 1);
        assert_eq!(output.state(), OutputState::Disconnected);
        let err = output
            .initialize(64, 16, f.registry.scanout_buffer(2).unwrap())
            .unwrap_err();
        assert!(matches!(err, DisplayError::NotConnected { connector: 1 }));
    }

    #[test]
    fn initialize_rejects_non_native_mode_without_claiming() {
        let f = fixture(true);
        let output = OutputController::new(f.device.clone(), 1);
        let err = output
            .initialize(32, 16, f.registry.scanout_buffer(2).unwrap())
            .unwrap_err();
        assert!(matches!(
            err,
            DisplayError::UnsupportedMode {
                width: 32,
                height: 16
            }
        ));
        assert!(f.device.engines().claimed().is_empty());
        assert_eq!(output.state(), OutputState::ConnectedIdle);
    }

    #[test]
    fn flip_lifecycle() {
        let f = fixture(true);
        let output = OutputController::new(f.device.clone(), 1);
        let scanout = f.registry.scanout_buffer(2).unwrap();

        assert!(matches!(
            output.page_flip(scanout.clone(), |_| {}),
            Err(DisplayError::NotInitialized)
        ));

        output.initialize(64, 16, scanout.clone()).unwrap();
        assert_eq!(output.state(), OutputState::Initialized);
        assert_eq!(output.engine(), Some(10));
        assert!(matches!(
            output.initialize(64, 16, scanout.clone()),
            Err(DisplayError::AlreadyInitialized { engine: 10 })
        ));

        let (tx, rx) = mpsc::channel();
        let ticket = output
            .page_flip(scanout.clone(), move |outcome| tx.send(outcome).unwrap())
            .unwrap();
        assert_eq!(output.state(), OutputState::FlipPending);
        assert!(matches!(
            output.page_flip(scanout.clone(), |_| panic!("rejected flip must not complete")),
            Err(DisplayError::FlipPending { engine: 10 })
        ));

        assert!(f.backend.complete_flip(10));
        assert_eq!(
            ticket.wait_timeout(Duration::from_secs(5)),
            Some(FlipOutcome::Completed)
        );
        assert_eq!(rx.recv().unwrap(), FlipOutcome::Completed);
        assert!(rx.try_recv().is_err());
        assert_eq!(output.state(), OutputState::Initialized);
    }

    #[test]
    fn release_is_idempotent_and_frees_engine() {
        let f = fixture(true);
        let output = OutputController::new(f.device.clone(), 1);
        output.release().unwrap();

        output
            .initialize(64, 16, f.registry.scanout_buffer(2).unwrap())
            .unwrap();
        assert!(f.device.engines().is_claimed(10));
        output.release().unwrap();
        output.release().unwrap();
        assert!(!f.device.engines().is_claimed(10));
        assert_eq!(output.state(), OutputState::ConnectedIdle);
        assert_eq!(f.backend.engine_config(10), Some(EngineConfig::default()));
    }

    #[test]
    fn release_times_out_and_aborts_stuck_flip() {
        let f = fixture(true);
        let output = OutputController::new(f.device.clone(), 1);
        let scanout = f.registry.scanout_buffer(2).unwrap();
        output.initialize(64, 16, scanout.clone()).unwrap();

        let (tx, rx) = mpsc::channel();
        let ticket = output
            .page_flip(scanout, move |outcome| tx.send(outcome).unwrap())
            .unwrap();

        // Nobody completes the flip; release must not hang.
        output.release().unwrap();
        assert_eq!(ticket.outcome(), Some(FlipOutcome::Aborted));
        assert_eq!(rx.recv().unwrap(), FlipOutcome::Aborted);
        assert_eq!(f.device.pending_flips(), 0);
        assert!(!f.device.engines().is_claimed(10));
    }

    #[test]
    fn flip_after_device_stop_is_refused() {
        let f = fixture(true);
        let output = OutputController::new(f.device.clone(), 1);
        let scanout = f.registry.scanout_buffer(2).unwrap();
        output.initialize(64, 16, scanout.clone()).unwrap();

        f.device.stop();
        assert!(matches!(
            output.page_flip(scanout, |_| {}),
            Err(DisplayError::DeviceStopped)
        ));
        assert_eq!(output.state(), OutputState::Initialized);
    }
}
