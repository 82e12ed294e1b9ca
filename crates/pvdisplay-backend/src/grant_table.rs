//! In-memory grant table.
//!
//! Plays the hypervisor's role in tests and in the replay tool: the "guest" shares pages under
//! chosen grant references, and mappings read and write through to the same page storage so both
//! sides observe each other's writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pvdisplay_protocol::directory::{
    write_directory_grefs, write_next_directory, GREF_CHAIN_END,
};
use pvdisplay_protocol::{GrantRef, PAGE_SIZE};

use crate::error::GrantError;
use crate::grant::{GrantMapper, GrantMapping};
use crate::lock;

/// First reference handed out by [`GrantMapper::export`]; guest-chosen references stay below it.
pub const EXPORTED_GREF_BASE: GrantRef = 0x8000_0000;

type SharedPage = Arc<Mutex<Box<[u8]>>>;

#[derive(Debug)]
struct GrantTableState {
    pages: HashMap<GrantRef, SharedPage>,
    next_export: GrantRef,
}

#[derive(Debug)]
pub struct GrantTable {
    state: Mutex<GrantTableState>,
}

impl Default for GrantTable {
    fn default() -> Self {
        Self::new()
    }
}

impl GrantTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GrantTableState {
                pages: HashMap::new(),
                next_export: EXPORTED_GREF_BASE,
            }),
        }
    }

    /// Share one page under `gref`. `contents` is zero-padded (or truncated) to a page.
    pub fn share_page(&self, gref: GrantRef, contents: &[u8]) {
        let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let len = contents.len().min(PAGE_SIZE);
        page[..len].copy_from_slice(&contents[..len]);
        lock(&self.state)
            .pages
            .insert(gref, Arc::new(Mutex::new(page)));
    }

    /// Share `bytes` across `grefs`, one page per reference.
    pub fn share_buffer(&self, grefs: &[GrantRef], bytes: &[u8]) {
        for (i, gref) in grefs.iter().enumerate() {
            let start = (i * PAGE_SIZE).min(bytes.len());
            let end = ((i + 1) * PAGE_SIZE).min(bytes.len());
            self.share_page(*gref, &bytes[start..end]);
        }
    }

    /// Share directory pages `directory` (linked in order, last one terminating the chain) that
    /// list `data` as the buffer's grant references.
    pub fn share_directory_chain(&self, directory: &[GrantRef], data: &[GrantRef]) {
        let mut remaining = data;
        for (i, gref) in directory.iter().enumerate() {
            let mut page = vec![0u8; PAGE_SIZE];
            let next = directory.get(i + 1).copied().unwrap_or(GREF_CHAIN_END);
            write_next_directory(&mut page, next);
            let written = write_directory_grefs(&mut page, remaining);
            remaining = &remaining[written..];
            self.share_page(*gref, &page);
        }
    }

    /// Withdraw a shared page. Existing mappings keep their view of it.
    pub fn revoke(&self, gref: GrantRef) -> bool {
        lock(&self.state).pages.remove(&gref).is_some()
    }

    pub fn is_shared(&self, gref: GrantRef) -> bool {
        lock(&self.state).pages.contains_key(&gref)
    }

    pub fn shared_pages(&self) -> usize {
        lock(&self.state).pages.len()
    }

    /// Guest-side write into a shared page.
    pub fn write(&self, gref: GrantRef, offset: usize, bytes: &[u8]) -> Result<(), GrantError> {
        let page = self.page(gref)?;
        let mut page = lock(&page);
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= PAGE_SIZE)
            .ok_or(GrantError::MapFailed {
                count: 1,
                reason: format!("write of {} bytes at {offset} overflows the page", bytes.len()),
            })?;
        page[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_page(&self, gref: GrantRef) -> Option<Vec<u8>> {
        let page = self.page(gref).ok()?;
        let page = lock(&page);
        Some(page.to_vec())
    }

    /// Concatenated contents of `grefs`, truncated to `len` bytes.
    pub fn read_buffer(&self, grefs: &[GrantRef], len: usize) -> Result<Vec<u8>, GrantError> {
        let mut out = Vec::with_capacity(grefs.len() * PAGE_SIZE);
        for gref in grefs {
            let page = self.page(*gref)?;
            out.extend_from_slice(&lock(&page));
        }
        out.truncate(len);
        Ok(out)
    }

    fn page(&self, gref: GrantRef) -> Result<SharedPage, GrantError> {
        lock(&self.state)
            .pages
            .get(&gref)
            .cloned()
            .ok_or(GrantError::UnknownGrant(gref))
    }
}

impl GrantMapper for GrantTable {
    fn map(&self, grefs: &[GrantRef]) -> Result<Box<dyn GrantMapping>, GrantError> {
        let state = lock(&self.state);
        let pages = grefs
            .iter()
            .map(|gref| {
                state
                    .pages
                    .get(gref)
                    .cloned()
                    .ok_or(GrantError::UnknownGrant(*gref))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(GrantTableMapping { pages }))
    }

    fn export(&self, count: usize) -> Result<Vec<GrantRef>, GrantError> {
        let mut state = lock(&self.state);
        let mut grefs = Vec::with_capacity(count);
        for _ in 0..count {
            let gref = state.next_export;
            state.next_export = gref.checked_add(1).ok_or(GrantError::MapFailed {
                count,
                reason: "exported grant references exhausted".to_string(),
            })?;
            let page = vec![0u8; PAGE_SIZE].into_boxed_slice();
            state.pages.insert(gref, Arc::new(Mutex::new(page)));
            grefs.push(gref);
        }
        Ok(grefs)
    }
}

struct GrantTableMapping {
    pages: Vec<SharedPage>,
}

impl GrantTableMapping {
    /// Yields `(page, offset in page, offset in caller buffer, len)` for each touched page.
    fn chunks(
        &self,
        offset: usize,
        len: usize,
    ) -> impl Iterator<Item = (usize, usize, usize, usize)> {
        let end = offset + len;
        assert!(
            end <= self.pages.len() * PAGE_SIZE,
            "grant mapping access {offset}..{end} out of range"
        );
        let mut pos = offset;
        std::iter::from_fn(move || {
            if pos >= end {
                return None;
            }
            let page = pos / PAGE_SIZE;
            let in_page = pos % PAGE_SIZE;
            let chunk = (PAGE_SIZE - in_page).min(end - pos);
            let item = (page, in_page, pos - offset, chunk);
            pos += chunk;
            Some(item)
        })
    }
}

impl GrantMapping for GrantTableMapping {
    fn len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        for (page, in_page, at, len) in self.chunks(offset, dst.len()) {
            let page = lock(&self.pages[page]);
            dst[at..at + len].copy_from_slice(&page[in_page..in_page + len]);
        }
    }

    fn write(&mut self, offset: usize, src: &[u8]) {
        for (page, in_page, at, len) in self.chunks(offset, src.len()) {
            let mut page = lock(&self.pages[page]);
            page[in_page..in_page + len].copy_from_slice(&src[at..at + len]);
        }
    }
}
