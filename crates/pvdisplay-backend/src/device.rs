//! Per-device state shared by every output: engine allocation, the pending-flip table, and the
//! thread that turns backend vblank completions into flip callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backend::RenderingBackend;
use crate::buffer::ScanoutBuffer;
use crate::config::DisplbackConfig;
use crate::engine::EngineAllocator;
use crate::error::{DisplayError, Result};
use crate::{lock, ConnectorId, EngineId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlipOutcome {
    /// The engine is now scanning out the new buffer.
    Completed,
    /// The flip was dropped by device shutdown or output teardown.
    Aborted,
}

/// Resolves once per accepted flip.
#[derive(Clone, Debug)]
pub struct FlipTicket {
    state: Arc<(Mutex<Option<FlipOutcome>>, Condvar)>,
}

impl FlipTicket {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    pub(crate) fn resolve(&self, outcome: FlipOutcome) {
        let (slot, cv) = &*self.state;
        let mut slot = lock(slot);
        if slot.is_none() {
            *slot = Some(outcome);
            cv.notify_all();
        }
    }

    pub fn outcome(&self) -> Option<FlipOutcome> {
        *lock(&self.state.0)
    }

    /// Block until the flip resolves or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<FlipOutcome> {
        let (slot, cv) = &*self.state;
        let deadline = Instant::now() + timeout;
        let mut slot = lock(slot);
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = match cv.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *slot
    }
}

pub(crate) type FlipCompletion = Box<dyn FnOnce(FlipOutcome) + Send>;

struct PendingFlip {
    connector: ConnectorId,
    // Keeps the buffer alive while the engine may still read it.
    scanout: Arc<ScanoutBuffer>,
    completion: FlipCompletion,
}

#[derive(Default)]
struct FlipTable {
    stopped: bool,
    pending: HashMap<EngineId, PendingFlip>,
}

struct DeviceShared {
    backend: Arc<dyn RenderingBackend>,
    flips: Mutex<FlipTable>,
}

impl DeviceShared {
    fn is_stopped(&self) -> bool {
        lock(&self.flips).stopped
    }

    fn complete(&self, engines: Vec<EngineId>) {
        for engine in engines {
            // Matched by engine alone; `restore_engine` cancels a released output's flip so a
            // stale completion cannot resolve the next owner's.
            // Callbacks run without the table lock so they may schedule the next flip.
            let pending = lock(&self.flips).pending.remove(&engine);
            match pending {
                Some(flip) => {
                    debug!(
                        engine,
                        connector = flip.connector,
                        fb_cookie = flip.scanout.fb_cookie(),
                        "page flip completed"
                    );
                    (flip.completion)(FlipOutcome::Completed);
                }
                None => warn!(engine, "flip completion for engine with no pending flip"),
            }
        }
    }

    fn run(&self, poll: Duration) {
        while !self.is_stopped() {
            let completed = self.backend.wait_for_completions(poll);
            if !completed.is_empty() {
                self.complete(completed);
            }
        }
    }
}

pub struct DisplayDevice {
    shared: Arc<DeviceShared>,
    engines: EngineAllocator,
    config: DisplbackConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DisplayDevice {
    /// Create the device and start its completion thread.
    pub fn start(
        backend: Arc<dyn RenderingBackend>,
        config: DisplbackConfig,
    ) -> Result<Arc<Self>> {
        let shared = Arc::new(DeviceShared {
            backend,
            flips: Mutex::new(FlipTable::default()),
        });

        let poll = config.completion_poll();
        let worker = std::thread::Builder::new()
            .name("pvdisplay-flips".to_string())
            .spawn({
                let shared = shared.clone();
                move || shared.run(poll)
            })?;
        info!(poll_ms = poll.as_millis() as u64, "display device started");

        Ok(Arc::new(Self {
            shared,
            engines: EngineAllocator::new(),
            config,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn backend(&self) -> &Arc<dyn RenderingBackend> {
        &self.shared.backend
    }

    pub fn engines(&self) -> &EngineAllocator {
        &self.engines
    }

    pub fn config(&self) -> &DisplbackConfig {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    pub fn pending_flips(&self) -> usize {
        lock(&self.shared.flips).pending.len()
    }

    pub fn has_pending_flip(&self, engine: EngineId) -> bool {
        lock(&self.shared.flips).pending.contains_key(&engine)
    }

    /// Submit a flip to the backend and remember its completion.
    ///
    /// The stopped check and the insertion happen under one lock, so nothing is scheduled after
    /// [`DisplayDevice::stop`] has started.
    pub(crate) fn schedule_flip(
        &self,
        engine: EngineId,
        connector: ConnectorId,
        scanout: Arc<ScanoutBuffer>,
        completion: FlipCompletion,
    ) -> Result<()> {
        let mut table = lock(&self.shared.flips);
        if table.stopped {
            return Err(DisplayError::DeviceStopped);
        }
        if table.pending.contains_key(&engine) {
            return Err(DisplayError::FlipPending { engine });
        }
        // Refused flips must leave the host copy of an in-flight buffer alone.
        scanout.prepare_for_scanout()?;
        self.shared.backend.flip(engine, scanout.native())?;
        table.pending.insert(
            engine,
            PendingFlip {
                connector,
                scanout,
                completion,
            },
        );
        Ok(())
    }

    /// Drop the pending flip on `engine`, if any, and abort its completion.
    pub(crate) fn abandon_flip(&self, engine: EngineId) -> bool {
        let pending = lock(&self.shared.flips).pending.remove(&engine);
        match pending {
            Some(flip) => {
                warn!(
                    engine,
                    connector = flip.connector,
                    fb_cookie = flip.scanout.fb_cookie(),
                    "abandoning page flip"
                );
                (flip.completion)(FlipOutcome::Aborted);
                true
            }
            None => false,
        }
    }

    /// Stop the completion thread. Pending flips are aborted; later flips fail with
    /// [`DisplayError::DeviceStopped`].
    pub fn stop(&self) {
        let aborted: Vec<PendingFlip> = {
            let mut table = lock(&self.shared.flips);
            if table.stopped {
                Vec::new()
            } else {
                table.stopped = true;
                table.pending.drain().map(|(_, flip)| flip).collect()
            }
        };
        for flip in aborted {
            debug!(fb_cookie = flip.scanout.fb_cookie(), "aborting page flip");
            (flip.completion)(FlipOutcome::Aborted);
        }

        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        if worker.thread().id() == std::thread::current().id() {
            // Called from a completion callback; the loop exits on its own.
            return;
        }
        if worker.join().is_err() {
            error!("display completion thread panicked");
        }
        info!("display device stopped");
    }
}

impl Drop for DisplayDevice {
    fn drop(&mut self) {
        self.stop();
    }
}
