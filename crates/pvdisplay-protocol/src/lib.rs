//! Wire layouts for the paravirtual display protocol.
//!
//! All records are little-endian and fixed-size. The guest frontend writes 64-byte request records
//! into the shared request ring; the backend answers with 64-byte response records and emits
//! 64-byte asynchronous event records on the event channel.
//!
//! - [`displif`]: request/response/event records and opcodes.
//! - [`directory`]: the grant page-directory layout used to describe multi-page buffers.
//! - [`format`]: scanout pixel formats (DRM fourcc codes).
//! - [`status`]: response status codes for both protocol generations.
#![forbid(unsafe_code)]

pub mod directory;
pub mod displif;
pub mod format;
pub mod status;

/// Opaque reference to one guest page made shareable with the host.
pub type GrantRef = u32;

/// Size of one guest page (and of one grant).
pub const PAGE_SIZE: usize = 4096;

fn read_u16_le(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn read_u64_le(buf: &[u8], offset: usize) -> u64 {
    let lo = read_u32_le(buf, offset) as u64;
    let hi = read_u32_le(buf, offset + 4) as u64;
    (hi << 32) | lo
}

fn write_u16_le(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64_le(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
