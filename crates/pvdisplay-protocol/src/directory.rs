//! Grant page-directory layout.
//!
//! A buffer larger than one page is described by a chain of directory pages. Each directory page
//! starts with the grant reference of the next directory page (`0` terminates the chain) followed
//! by as many buffer grant references as fit in the rest of the page:
//!
//! ```text
//! offset 0: u32 gref_dir_next_page
//! offset 4: u32 gref[GREFS_PER_DIRECTORY_PAGE]
//! ```

use core::mem::size_of;

use crate::{read_u32_le, write_u32_le, GrantRef, PAGE_SIZE};

pub const PAGE_DIRECTORY_NEXT_OFFSET: usize = 0;
pub const PAGE_DIRECTORY_HEADER_SIZE_BYTES: usize = 4;
pub const PAGE_DIRECTORY_REFS_OFFSET: usize = PAGE_DIRECTORY_HEADER_SIZE_BYTES;

/// Grant reference value that terminates a directory chain.
pub const GREF_CHAIN_END: GrantRef = 0;

pub const fn page_directory_capacity(page_size: usize) -> usize {
    (page_size - PAGE_DIRECTORY_HEADER_SIZE_BYTES) / size_of::<GrantRef>()
}

pub const GREFS_PER_DIRECTORY_PAGE: usize = page_directory_capacity(PAGE_SIZE);

/// Number of grant references needed to back `size_bytes`.
pub const fn grefs_for_size(size_bytes: usize) -> usize {
    size_bytes.div_ceil(PAGE_SIZE)
}

/// Number of directory pages needed to carry `gref_count` references.
pub const fn directory_pages_for_grefs(gref_count: usize) -> usize {
    gref_count.div_ceil(GREFS_PER_DIRECTORY_PAGE)
}

pub fn read_next_directory(page: &[u8]) -> GrantRef {
    read_u32_le(page, PAGE_DIRECTORY_NEXT_OFFSET)
}

pub fn write_next_directory(page: &mut [u8], next: GrantRef) {
    write_u32_le(page, PAGE_DIRECTORY_NEXT_OFFSET, next);
}

/// Append the first `count` grant references stored in `page` to `out`.
///
/// `count` is clamped to the page capacity.
pub fn read_directory_grefs(page: &[u8], count: usize, out: &mut Vec<GrantRef>) {
    let count = count.min(page_directory_capacity(page.len()));
    out.extend((0..count).map(|i| {
        read_u32_le(page, PAGE_DIRECTORY_REFS_OFFSET + i * size_of::<GrantRef>())
    }));
}

/// Store `grefs` at the start of the page's reference array.
///
/// Returns how many references fit (the remainder belongs on the next directory page).
pub fn write_directory_grefs(page: &mut [u8], grefs: &[GrantRef]) -> usize {
    let count = grefs.len().min(page_directory_capacity(page.len()));
    for (i, gref) in grefs[..count].iter().enumerate() {
        write_u32_le(page, PAGE_DIRECTORY_REFS_OFFSET + i * size_of::<GrantRef>(), *gref);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_matches_4k_layout() {
        assert_eq!(GREFS_PER_DIRECTORY_PAGE, 1023);
        assert_eq!(page_directory_capacity(64), 15);
    }

    #[test]
    fn gref_counts_round_up() {
        assert_eq!(grefs_for_size(0), 0);
        assert_eq!(grefs_for_size(1), 1);
        assert_eq!(grefs_for_size(PAGE_SIZE), 1);
        assert_eq!(grefs_for_size(PAGE_SIZE + 1), 2);

        assert_eq!(directory_pages_for_grefs(0), 0);
        assert_eq!(directory_pages_for_grefs(1023), 1);
        assert_eq!(directory_pages_for_grefs(1024), 2);
    }

    #[test]
    fn write_then_read_stops_at_page_capacity() {
        let mut page = vec![0u8; 64];
        let grefs: Vec<GrantRef> = (100..120).collect();

        write_next_directory(&mut page, 0xabcd);
        assert_eq!(write_directory_grefs(&mut page, &grefs), 15);

        let mut out = Vec::new();
        read_directory_grefs(&page, 40, &mut out);
        assert_eq!(out, (100..115).collect::<Vec<_>>());
        assert_eq!(read_next_directory(&page), 0xabcd);
    }
}
