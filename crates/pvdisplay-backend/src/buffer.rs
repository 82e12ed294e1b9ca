//! Display and scanout buffer objects.
//!
//! A [`DisplayBuffer`] is either copy-backed (guest pages are mapped and copied into a host-local
//! native buffer before use) or zero-copy (the native buffer aliases guest or host-exported pages).
//! A [`ScanoutBuffer`] wraps one display buffer as a mode-set/flip-ready object and keeps it alive.
//! Both release their native objects on drop.

use std::sync::{Arc, Mutex};

use pvdisplay_protocol::format::PixelFormat;
use tracing::trace;

use crate::backend::{NativeBuffer, NativeScanout, RenderingBackend};
use crate::error::{DisplayError, Result};
use crate::grant::{GrantDescriptor, GrantMapping};
use crate::lock;

/// Guest mapping plus staging space; the mutex serializes copies into one native buffer.
pub struct CopySource {
    pub(crate) mapping: Box<dyn GrantMapping>,
    pub(crate) staging: Vec<u8>,
}

pub enum DisplayStorage {
    CopyBacked {
        grants: GrantDescriptor,
        source: Mutex<CopySource>,
    },
    ZeroCopy {
        /// Guest grants imported by the backend, or the references the host exported.
        grants: GrantDescriptor,
        host_allocated: bool,
    },
}

pub struct DisplayBuffer {
    db_cookie: u64,
    width: u32,
    height: u32,
    bpp: u32,
    native: NativeBuffer,
    storage: DisplayStorage,
    backend: Arc<dyn RenderingBackend>,
}

impl DisplayBuffer {
    pub(crate) fn new(
        db_cookie: u64,
        width: u32,
        height: u32,
        bpp: u32,
        native: NativeBuffer,
        storage: DisplayStorage,
        backend: Arc<dyn RenderingBackend>,
    ) -> Self {
        Self {
            db_cookie,
            width,
            height,
            bpp,
            native,
            storage,
            backend,
        }
    }

    pub fn db_cookie(&self) -> u64 {
        self.db_cookie
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    pub fn stride(&self) -> u32 {
        self.native.stride
    }

    pub fn size(&self) -> usize {
        self.native.size
    }

    pub fn native(&self) -> &NativeBuffer {
        &self.native
    }

    pub fn storage(&self) -> &DisplayStorage {
        &self.storage
    }

    pub fn grants(&self) -> &GrantDescriptor {
        match &self.storage {
            DisplayStorage::CopyBacked { grants, .. } | DisplayStorage::ZeroCopy { grants, .. } => {
                grants
            }
        }
    }

    pub fn is_zero_copy(&self) -> bool {
        matches!(self.storage, DisplayStorage::ZeroCopy { .. })
    }

    /// Copy the guest-mapped bytes into the host-local native buffer.
    pub fn copy_from_guest(&self) -> Result<()> {
        let DisplayStorage::CopyBacked { source, .. } = &self.storage else {
            return Err(DisplayError::CopyNotSupported {
                db_cookie: self.db_cookie,
            });
        };

        let mut source = lock(source);
        let CopySource { mapping, staging } = &mut *source;
        let len = self.native.size.min(mapping.len());
        staging.resize(len, 0);
        mapping.read(0, &mut staging[..]);
        self.backend.write_pixels(self.native.handle, &staging[..])?;
        trace!(db_cookie = self.db_cookie, len, "copied guest pixels");
        Ok(())
    }
}

impl Drop for DisplayBuffer {
    fn drop(&mut self) {
        self.backend.release_buffer(self.native.handle);
    }
}

pub struct ScanoutBuffer {
    fb_cookie: u64,
    native: NativeScanout,
    display: Arc<DisplayBuffer>,
    backend: Arc<dyn RenderingBackend>,
}

impl ScanoutBuffer {
    pub(crate) fn new(
        fb_cookie: u64,
        native: NativeScanout,
        display: Arc<DisplayBuffer>,
        backend: Arc<dyn RenderingBackend>,
    ) -> Self {
        Self {
            fb_cookie,
            native,
            display,
            backend,
        }
    }

    pub fn fb_cookie(&self) -> u64 {
        self.fb_cookie
    }

    pub fn width(&self) -> u32 {
        self.native.width
    }

    pub fn height(&self) -> u32 {
        self.native.height
    }

    pub fn format(&self) -> PixelFormat {
        self.native.format
    }

    pub fn native(&self) -> &NativeScanout {
        &self.native
    }

    pub fn display(&self) -> &Arc<DisplayBuffer> {
        &self.display
    }

    /// Make the native buffer reflect the guest's latest pixels.
    ///
    /// No-op for zero-copy buffers, which the engine reads in place.
    pub fn prepare_for_scanout(&self) -> Result<()> {
        if self.display.is_zero_copy() {
            return Ok(());
        }
        self.display.copy_from_guest()
    }
}

impl Drop for ScanoutBuffer {
    fn drop(&mut self) {
        self.backend.release_scanout(self.native.handle);
    }
}

impl std::fmt::Debug for DisplayBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayBuffer")
            .field("db_cookie", &self.db_cookie)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bpp", &self.bpp)
            .field("native", &self.native)
            .field("zero_copy", &self.is_zero_copy())
            .finish()
    }
}

impl std::fmt::Debug for ScanoutBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanoutBuffer")
            .field("fb_cookie", &self.fb_cookie)
            .field("native", &self.native)
            .field("db_cookie", &self.display.db_cookie)
            .finish()
    }
}
