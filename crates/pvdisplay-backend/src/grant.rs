//! Grant mapping boundary and page-directory resolution.
//!
//! Guest buffers are described by a chain of directory pages (see
//! [`pvdisplay_protocol::directory`]). [`resolve_grant_refs`] walks that chain and produces a
//! [`GrantDescriptor`]; [`write_grant_refs`] fills a guest-prepared chain with references the
//! host exported.

use pvdisplay_protocol::directory::{
    grefs_for_size, read_directory_grefs, read_next_directory, write_directory_grefs,
    GREF_CHAIN_END,
};
use pvdisplay_protocol::{GrantRef, PAGE_SIZE};
use tracing::debug;

use crate::error::{DisplayError, GrantError, Result};

/// Host view of a contiguous range of guest pages.
///
/// Dropping the mapping unmaps the pages.
pub trait GrantMapping: Send {
    /// Mapped length in bytes (`pages * PAGE_SIZE`).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the mapping.
    ///
    /// Panics if the range is outside the mapping.
    fn read(&self, offset: usize, dst: &mut [u8]);

    /// Copy `src` into the mapping at `offset`.
    ///
    /// Panics if the range is outside the mapping.
    fn write(&mut self, offset: usize, src: &[u8]);
}

/// Grant-table access provided by the hypervisor glue.
pub trait GrantMapper: Send + Sync {
    /// Map `grefs` (in order) as one contiguous host range.
    fn map(&self, grefs: &[GrantRef]) -> std::result::Result<Box<dyn GrantMapping>, GrantError>;

    /// Allocate `count` host pages and grant them to the guest.
    fn export(&self, count: usize) -> std::result::Result<Vec<GrantRef>, GrantError> {
        let _ = count;
        Err(GrantError::ExportUnsupported)
    }
}

/// Ordered grant references backing one logical buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GrantDescriptor {
    grefs: Vec<GrantRef>,
    size: usize,
}

impl GrantDescriptor {
    pub fn new(grefs: Vec<GrantRef>, size: usize) -> Self {
        Self { grefs, size }
    }

    pub fn grefs(&self) -> &[GrantRef] {
        &self.grefs
    }

    /// Buffer length in bytes; the last page may be partially used.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_count(&self) -> usize {
        self.grefs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grefs.is_empty()
    }
}

fn map_directory_page(
    mapper: &dyn GrantMapper,
    gref: GrantRef,
) -> Result<Box<dyn GrantMapping>> {
    let mapping = mapper.map(&[gref]).map_err(|err| {
        DisplayError::InvalidDescriptor(format!("cannot map directory page {gref}: {err}"))
    })?;
    if mapping.len() < PAGE_SIZE {
        return Err(DisplayError::InvalidDescriptor(format!(
            "directory page {gref} mapped {} bytes",
            mapping.len()
        )));
    }
    Ok(mapping)
}

/// Walk the directory chain starting at `directory_start` and collect the grant references for a
/// buffer of `size` bytes.
///
/// A chain that ends before `ceil(size / PAGE_SIZE)` references were collected is rejected.
pub fn resolve_grant_refs(
    mapper: &dyn GrantMapper,
    directory_start: GrantRef,
    size: usize,
) -> Result<GrantDescriptor> {
    let needed = grefs_for_size(size);
    let mut grefs = Vec::with_capacity(needed);
    let mut page = vec![0u8; PAGE_SIZE];
    let mut next = directory_start;
    let mut directory_pages = 0usize;

    while grefs.len() < needed {
        if next == GREF_CHAIN_END {
            return Err(DisplayError::InvalidDescriptor(format!(
                "directory chain ended after {} of {needed} grant references",
                grefs.len()
            )));
        }

        // The mapping only lives for the duration of the read.
        map_directory_page(mapper, next)?.read(0, &mut page);
        read_directory_grefs(&page, needed - grefs.len(), &mut grefs);
        next = read_next_directory(&page);
        directory_pages += 1;
    }

    debug!(
        directory_start,
        directory_pages,
        grefs = grefs.len(),
        size,
        "resolved grant directory"
    );
    Ok(GrantDescriptor::new(grefs, size))
}

/// Store `grefs` into the guest-prepared directory chain starting at `directory_start`.
///
/// Used for host-allocated buffers: the guest supplies empty directory pages and reads back the
/// references of the pages the host exported.
pub fn write_grant_refs(
    mapper: &dyn GrantMapper,
    directory_start: GrantRef,
    grefs: &[GrantRef],
) -> Result<()> {
    let mut remaining = grefs;
    let mut page = vec![0u8; PAGE_SIZE];
    let mut next = directory_start;

    while !remaining.is_empty() {
        if next == GREF_CHAIN_END {
            return Err(DisplayError::InvalidDescriptor(format!(
                "directory chain too short for {} exported grant references",
                grefs.len()
            )));
        }

        let mut mapping = map_directory_page(mapper, next)?;
        mapping.read(0, &mut page);
        let written = write_directory_grefs(&mut page, remaining);
        mapping.write(0, &page);
        remaining = &remaining[written..];
        next = read_next_directory(&page);
    }
    Ok(())
}
