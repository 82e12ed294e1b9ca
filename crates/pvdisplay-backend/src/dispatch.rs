//! Per-connection request dispatch.
//!
//! [`CommandDispatcher::process_request`] decodes one request record, runs it against the
//! connection's [`BufferRegistry`] and [`OutputController`], and answers with a response that
//! echoes the request id and operation. Page-flip completions arrive later as `PG_FLIP` events.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use pvdisplay_protocol::displif::{
    DbufCreateReq, DisplCommand, DisplEvent, DisplEventKind, DisplRequest, DisplRequestHeader,
    DisplResponse, FbAttachReq, SetConfigReq,
};
use pvdisplay_protocol::status::{ProtocolGeneration, StatusKind};
use tracing::{debug, warn};

use crate::device::{DisplayDevice, FlipOutcome};
use crate::error::{DisplayError, Result};
use crate::grant::GrantMapper;
use crate::output::OutputController;
use crate::registry::{BufferRegistry, DisplayBufferRequest, ScanoutBufferRequest};
use crate::{lock, ConnectorId};

/// Outgoing side of a connection (response ring and event channel).
pub trait Transport: Send + Sync {
    fn send_response(&self, response: DisplResponse);
    fn send_event(&self, event: DisplEvent);
}

/// Stamps events with a per-connection id before handing them to the transport.
pub struct EventNotifier {
    transport: Arc<dyn Transport>,
    next_id: AtomicU16,
}

impl EventNotifier {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            next_id: AtomicU16::new(0),
        }
    }

    pub fn notify_page_flip(&self, fb_cookie: u64) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.transport.send_event(DisplEvent {
            id,
            kind: DisplEventKind::PgFlip { fb_cookie },
        });
    }
}

/// [`Transport`] that keeps everything it is given.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    responses: Mutex<Vec<DisplResponse>>,
    events: Mutex<Vec<DisplEvent>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn responses(&self) -> Vec<DisplResponse> {
        lock(&self.responses).clone()
    }

    pub fn events(&self) -> Vec<DisplEvent> {
        lock(&self.events).clone()
    }

    pub fn take_responses(&self) -> Vec<DisplResponse> {
        std::mem::take(&mut *lock(&self.responses))
    }

    pub fn take_events(&self) -> Vec<DisplEvent> {
        std::mem::take(&mut *lock(&self.events))
    }
}

impl Transport for RecordingTransport {
    fn send_response(&self, response: DisplResponse) {
        lock(&self.responses).push(response);
    }

    fn send_event(&self, event: DisplEvent) {
        lock(&self.events).push(event);
    }
}

pub struct CommandDispatcher {
    generation: ProtocolGeneration,
    registry: BufferRegistry,
    output: OutputController,
    transport: Arc<dyn Transport>,
    events: Arc<EventNotifier>,
}

impl CommandDispatcher {
    pub fn new(
        device: &Arc<DisplayDevice>,
        grants: Arc<dyn GrantMapper>,
        connector: ConnectorId,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            generation: device.config().protocol,
            registry: BufferRegistry::new(device.backend().clone(), grants),
            output: OutputController::new(device.clone(), connector),
            events: Arc::new(EventNotifier::new(transport.clone())),
            transport,
        }
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.generation
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn output(&self) -> &OutputController {
        &self.output
    }

    /// Handle one request record and send its response.
    ///
    /// Records too short to carry a header have no id to answer and are dropped.
    pub fn process_request(&mut self, record: &[u8]) -> Option<DisplResponse> {
        let header = match DisplRequestHeader::decode_from_le_bytes(record) {
            Ok(header) => header,
            Err(err) => {
                warn!(%err, "dropping malformed request");
                return None;
            }
        };

        let status = match DisplRequest::decode_from_le_bytes(record) {
            Ok(request) => self.process_command(&request.command),
            Err(err) => self.status_for(Err(DisplayError::from(err)), header.operation),
        };
        let response = DisplResponse::for_request(header, status);
        self.transport.send_response(response);
        Some(response)
    }

    /// Run one decoded command and return its wire status.
    pub fn process_command(&mut self, command: &DisplCommand) -> i32 {
        let result = match command {
            DisplCommand::DbufCreate(req) => self.create_display_buffer(req),
            DisplCommand::DbufDestroy(req) => self.registry.destroy_display_buffer(req.dbuf_cookie),
            DisplCommand::FbAttach(req) => self.attach_scanout(req),
            DisplCommand::FbDetach(req) => self.registry.destroy_scanout_buffer(req.fb_cookie),
            DisplCommand::SetConfig(req) => self.set_config(req),
            DisplCommand::PgFlip(req) => self.page_flip(req.fb_cookie),
        };
        self.status_for(result, command.opcode() as u8)
    }

    fn status_for(&self, result: Result<()>, operation: u8) -> i32 {
        let kind = match result {
            Ok(()) => StatusKind::Ok,
            Err(err) => {
                warn!(operation, %err, "request failed");
                err.status_kind()
            }
        };
        self.generation.encode(kind)
    }

    fn create_display_buffer(&self, req: &DbufCreateReq) -> Result<()> {
        self.registry
            .create_display_buffer(&DisplayBufferRequest {
                db_cookie: req.dbuf_cookie,
                directory_start: req.gref_directory,
                size: req.buffer_sz as usize,
                width: req.width,
                height: req.height,
                bpp: req.bpp,
                alloc_on_host: req.alloc_on_host(),
            })
            .map(drop)
    }

    fn attach_scanout(&self, req: &FbAttachReq) -> Result<()> {
        self.registry
            .create_scanout_buffer(&ScanoutBufferRequest {
                db_cookie: req.dbuf_cookie,
                fb_cookie: req.fb_cookie,
                width: req.width,
                height: req.height,
                pixel_format: req.pixel_format,
            })
            .map(drop)
    }

    fn set_config(&self, req: &SetConfigReq) -> Result<()> {
        if req.is_release() {
            return self.output.release();
        }
        let scanout = self.registry.scanout_buffer(req.fb_cookie)?;
        if req.bpp != 0 && req.bpp != scanout.display().bpp() {
            return Err(DisplayError::UnsupportedFormat(scanout.format().fourcc()));
        }
        if req.x != 0 || req.y != 0 {
            debug!(x = req.x, y = req.y, "ignoring scanout offset");
        }
        self.output.initialize(req.width, req.height, scanout)
    }

    fn page_flip(&self, fb_cookie: u64) -> Result<()> {
        let scanout = self.registry.scanout_buffer(fb_cookie)?;
        let events = self.events.clone();
        self.output
            .page_flip(scanout, move |outcome| match outcome {
                FlipOutcome::Completed => events.notify_page_flip(fb_cookie),
                FlipOutcome::Aborted => debug!(fb_cookie, "page flip aborted, no event sent"),
            })
            .map(drop)
    }

    /// Release the output and drop every buffer. Safe to call more than once.
    pub fn teardown(&mut self) {
        if let Err(err) = self.output.release() {
            warn!(%err, "output release during teardown failed");
        }
        self.registry.clear();
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.teardown();
    }
}
