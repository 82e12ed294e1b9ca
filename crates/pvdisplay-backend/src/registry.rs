//! Per-connection buffer registry.
//!
//! Display buffers are keyed by `dbuf` cookie and scanout buffers by `fb` cookie; the two
//! namespaces are independent. One mutex guards both maps. Pixel copies for copy-backed buffers
//! run under each buffer's own copy lock instead, so a slow copy never blocks other cookies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pvdisplay_protocol::format::PixelFormat;
use pvdisplay_protocol::GrantRef;
use tracing::{debug, info};

use crate::backend::{AllocRequest, BufferSource, NativeBuffer, RenderingBackend};
use crate::buffer::{CopySource, DisplayBuffer, DisplayStorage, ScanoutBuffer};
use crate::error::{CookieKind, DisplayError, Result};
use crate::grant::{resolve_grant_refs, write_grant_refs, GrantDescriptor, GrantMapper};
use crate::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayBufferRequest {
    pub db_cookie: u64,
    /// First page of the guest's grant directory chain.
    pub directory_start: GrantRef,
    pub size: usize,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    /// The host allocates the pages and writes their references into the directory chain.
    pub alloc_on_host: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanoutBufferRequest {
    pub db_cookie: u64,
    pub fb_cookie: u64,
    pub width: u32,
    pub height: u32,
    /// DRM fourcc code.
    pub pixel_format: u32,
}

#[derive(Default)]
struct RegistryState {
    display: HashMap<u64, Arc<DisplayBuffer>>,
    scanout: HashMap<u64, Arc<ScanoutBuffer>>,
}

pub struct BufferRegistry {
    backend: Arc<dyn RenderingBackend>,
    grants: Arc<dyn GrantMapper>,
    state: Mutex<RegistryState>,
}

/// Bytes per row for a tightly packed `width x bpp` image.
fn packed_stride(width: u32, bpp: u32) -> Option<u32> {
    width.checked_mul(bpp.div_ceil(8))
}

impl BufferRegistry {
    pub fn new(backend: Arc<dyn RenderingBackend>, grants: Arc<dyn GrantMapper>) -> Self {
        Self {
            backend,
            grants,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn create_display_buffer(&self, req: &DisplayBufferRequest) -> Result<Arc<DisplayBuffer>> {
        let mut state = lock(&self.state);
        if state.display.contains_key(&req.db_cookie) {
            return Err(DisplayError::DuplicateCookie {
                kind: CookieKind::Display,
                cookie: req.db_cookie,
            });
        }

        let alloc = Self::validate_geometry(req)?;
        let caps = self.backend.capabilities();
        let buffer = if req.alloc_on_host {
            if !caps.host_export {
                return Err(DisplayError::HostAllocUnsupported);
            }
            let native = self.backend.allocate(&alloc, BufferSource::HostExport)?;
            let grants = GrantDescriptor::new(native.exported_grefs.clone(), req.size);
            let buffer = self.display_buffer_from(
                req,
                native,
                DisplayStorage::ZeroCopy {
                    grants,
                    host_allocated: true,
                },
            );
            // On failure `buffer` is dropped and its native allocation released.
            write_grant_refs(
                self.grants.as_ref(),
                req.directory_start,
                buffer.grants().grefs(),
            )?;
            buffer
        } else {
            let grants = resolve_grant_refs(self.grants.as_ref(), req.directory_start, req.size)?;
            if caps.zero_copy_import {
                let native = self
                    .backend
                    .allocate(&alloc, BufferSource::GuestGrants(&grants))?;
                self.display_buffer_from(
                    req,
                    native,
                    DisplayStorage::ZeroCopy {
                        grants,
                        host_allocated: false,
                    },
                )
            } else {
                let mapping = self.grants.map(grants.grefs()).map_err(|err| {
                    DisplayError::InvalidDescriptor(format!("cannot map buffer pages: {err}"))
                })?;
                let native = self.backend.allocate(&alloc, BufferSource::HostLocal)?;
                self.display_buffer_from(
                    req,
                    native,
                    DisplayStorage::CopyBacked {
                        grants,
                        source: Mutex::new(CopySource {
                            mapping,
                            staging: Vec::new(),
                        }),
                    },
                )
            }
        };

        let buffer = Arc::new(buffer);
        state.display.insert(req.db_cookie, buffer.clone());
        info!(
            db_cookie = req.db_cookie,
            width = req.width,
            height = req.height,
            bpp = req.bpp,
            size = req.size,
            zero_copy = buffer.is_zero_copy(),
            pages = buffer.grants().page_count(),
            "created display buffer"
        );
        Ok(buffer)
    }

    fn validate_geometry(req: &DisplayBufferRequest) -> Result<AllocRequest> {
        if req.width == 0 || req.height == 0 || req.bpp == 0 {
            return Err(DisplayError::InvalidDescriptor(format!(
                "empty geometry {}x{}x{}",
                req.width, req.height, req.bpp
            )));
        }
        let stride = packed_stride(req.width, req.bpp);
        let needed = stride.and_then(|stride| (stride as usize).checked_mul(req.height as usize));
        match (stride, needed) {
            (Some(stride), Some(needed)) if needed <= req.size => Ok(AllocRequest {
                width: req.width,
                height: req.height,
                bpp: req.bpp,
                stride,
                size: req.size,
            }),
            _ => Err(DisplayError::InvalidDescriptor(format!(
                "{}x{}x{} does not fit in {} bytes",
                req.width, req.height, req.bpp, req.size
            ))),
        }
    }

    fn display_buffer_from(
        &self,
        req: &DisplayBufferRequest,
        native: NativeBuffer,
        storage: DisplayStorage,
    ) -> DisplayBuffer {
        DisplayBuffer::new(
            req.db_cookie,
            req.width,
            req.height,
            req.bpp,
            native,
            storage,
            self.backend.clone(),
        )
    }

    pub fn create_scanout_buffer(&self, req: &ScanoutBufferRequest) -> Result<Arc<ScanoutBuffer>> {
        let mut state = lock(&self.state);
        let display = state
            .display
            .get(&req.db_cookie)
            .cloned()
            .ok_or(DisplayError::UnknownCookie {
                kind: CookieKind::Display,
                cookie: req.db_cookie,
            })?;
        if state.scanout.contains_key(&req.fb_cookie) {
            return Err(DisplayError::DuplicateCookie {
                kind: CookieKind::Scanout,
                cookie: req.fb_cookie,
            });
        }

        let format = PixelFormat::from_fourcc(req.pixel_format)
            .filter(|format| format.bits_per_pixel() == display.bpp())
            .ok_or(DisplayError::UnsupportedFormat(req.pixel_format))?;
        if req.width == 0
            || req.height == 0
            || req.width > display.width()
            || req.height > display.height()
        {
            return Err(DisplayError::InvalidDescriptor(format!(
                "scanout {}x{} does not fit display buffer {}x{}",
                req.width,
                req.height,
                display.width(),
                display.height()
            )));
        }

        let native =
            self.backend
                .wrap_for_scanout(display.native(), req.width, req.height, format)?;
        let scanout = Arc::new(ScanoutBuffer::new(
            req.fb_cookie,
            native,
            display,
            self.backend.clone(),
        ));
        state.scanout.insert(req.fb_cookie, scanout.clone());
        info!(
            db_cookie = req.db_cookie,
            fb_cookie = req.fb_cookie,
            width = req.width,
            height = req.height,
            ?format,
            "attached scanout buffer"
        );
        Ok(scanout)
    }

    pub fn display_buffer(&self, db_cookie: u64) -> Result<Arc<DisplayBuffer>> {
        lock(&self.state)
            .display
            .get(&db_cookie)
            .cloned()
            .ok_or(DisplayError::UnknownCookie {
                kind: CookieKind::Display,
                cookie: db_cookie,
            })
    }

    pub fn scanout_buffer(&self, fb_cookie: u64) -> Result<Arc<ScanoutBuffer>> {
        lock(&self.state)
            .scanout
            .get(&fb_cookie)
            .cloned()
            .ok_or(DisplayError::UnknownCookie {
                kind: CookieKind::Scanout,
                cookie: fb_cookie,
            })
    }

    /// Look up `fb_cookie` and bring its pixels up to date for a mode-set or flip.
    ///
    /// [`OutputController`](crate::output::OutputController) does the same copy itself once a
    /// request has passed its state checks; the dispatcher only uses [`Self::scanout_buffer`].
    pub fn scanout_buffer_for_flip(&self, fb_cookie: u64) -> Result<Arc<ScanoutBuffer>> {
        let scanout = self.scanout_buffer(fb_cookie)?;
        scanout.prepare_for_scanout()?;
        Ok(scanout)
    }

    pub fn destroy_display_buffer(&self, db_cookie: u64) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.display.contains_key(&db_cookie) {
            return Err(DisplayError::UnknownCookie {
                kind: CookieKind::Display,
                cookie: db_cookie,
            });
        }
        if let Some(scanout) = state
            .scanout
            .values()
            .find(|scanout| scanout.display().db_cookie() == db_cookie)
        {
            return Err(DisplayError::BufferInUse {
                db_cookie,
                fb_cookie: scanout.fb_cookie(),
            });
        }
        state.display.remove(&db_cookie);
        debug!(db_cookie, "destroyed display buffer");
        Ok(())
    }

    /// Forget `fb_cookie`. A flip still using it keeps the scanout alive until it completes.
    pub fn destroy_scanout_buffer(&self, fb_cookie: u64) -> Result<()> {
        match lock(&self.state).scanout.remove(&fb_cookie) {
            Some(_) => {
                debug!(fb_cookie, "detached scanout buffer");
                Ok(())
            }
            None => Err(DisplayError::UnknownCookie {
                kind: CookieKind::Scanout,
                cookie: fb_cookie,
            }),
        }
    }

    /// Drop every scanout buffer, then every display buffer.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        let scanouts = state.scanout.len();
        let displays = state.display.len();
        state.scanout.clear();
        state.display.clear();
        if scanouts + displays > 0 {
            debug!(scanouts, displays, "cleared buffer registry");
        }
    }

    pub fn display_count(&self) -> usize {
        lock(&self.state).display.len()
    }

    pub fn scanout_count(&self) -> usize {
        lock(&self.state).scanout.len()
    }

    pub fn contains_display(&self, db_cookie: u64) -> bool {
        lock(&self.state).display.contains_key(&db_cookie)
    }

    pub fn contains_scanout(&self, fb_cookie: u64) -> bool {
        lock(&self.state).scanout.contains_key(&fb_cookie)
    }
}
