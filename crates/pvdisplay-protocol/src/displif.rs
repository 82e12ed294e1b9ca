//! Request, response and event records.
//!
//! Every record is [`DISPLIF_RECORD_SIZE_BYTES`] long. Requests and events share an 8-byte header
//! (`u16 id`, `u8 operation/type`, 5 reserved bytes) followed by an operation-specific payload at
//! [`DISPLIF_PAYLOAD_OFFSET`]. Responses carry `u16 id`, `u8 operation`, 1 reserved byte and an
//! `i32 status`.

use thiserror::Error;

use crate::{
    read_u16_le, read_u32_le, read_u64_le, write_u16_le, write_u32_le, write_u64_le, GrantRef,
};

pub const DISPLIF_RECORD_SIZE_BYTES: usize = 64;
pub const DISPLIF_HEADER_SIZE_BYTES: usize = 8;
pub const DISPLIF_PAYLOAD_OFFSET: usize = DISPLIF_HEADER_SIZE_BYTES;

pub const REQ_ID_OFFSET: usize = 0;
pub const REQ_OPERATION_OFFSET: usize = 2;

pub const RESP_ID_OFFSET: usize = 0;
pub const RESP_OPERATION_OFFSET: usize = 2;
pub const RESP_STATUS_OFFSET: usize = 4;

pub const EVT_ID_OFFSET: usize = 0;
pub const EVT_TYPE_OFFSET: usize = 2;

/// `DBUF_CREATE.flags`: the backend allocates the buffer and writes its grant references back
/// into the guest-provided page directory.
pub const DBUF_FLAG_ALLOC_ON_HOST: u32 = 1 << 0;

pub const DISPLIF_EVT_PG_FLIP: u8 = 0x00;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DisplOpcode {
    DbufCreate = 0x10,
    DbufDestroy = 0x11,
    FbAttach = 0x12,
    FbDetach = 0x13,
    SetConfig = 0x14,
    PgFlip = 0x15,
}

impl DisplOpcode {
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x10 => Some(Self::DbufCreate),
            0x11 => Some(Self::DbufDestroy),
            0x12 => Some(Self::FbAttach),
            0x13 => Some(Self::FbDetach),
            0x14 => Some(Self::SetConfig),
            0x15 => Some(Self::PgFlip),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::DbufCreate => "DBUF_CREATE",
            Self::DbufDestroy => "DBUF_DESTROY",
            Self::FbAttach => "FB_ATTACH",
            Self::FbDetach => "FB_DETACH",
            Self::SetConfig => "SET_CONFIG",
            Self::PgFlip => "PG_FLIP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DisplDecodeError {
    #[error("record too small for a header ({len} bytes)")]
    BufferTooSmall { len: usize },
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("truncated {opcode:?} payload ({len} bytes)")]
    TruncatedPayload { opcode: DisplOpcode, len: usize },
    #[error("unknown event type 0x{0:02x}")]
    UnknownEventType(u8),
}

/// Identity of a request, decodable even when the operation itself is unknown or truncated.
///
/// Responses must echo both fields unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplRequestHeader {
    pub id: u16,
    pub operation: u8,
}

impl DisplRequestHeader {
    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, DisplDecodeError> {
        if buf.len() < DISPLIF_HEADER_SIZE_BYTES {
            return Err(DisplDecodeError::BufferTooSmall { len: buf.len() });
        }
        Ok(Self {
            id: read_u16_le(buf, REQ_ID_OFFSET),
            operation: buf[REQ_OPERATION_OFFSET],
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DbufCreateReq {
    pub dbuf_cookie: u64,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub buffer_sz: u32,
    pub flags: u32,
    pub gref_directory: GrantRef,
}

impl DbufCreateReq {
    pub const DBUF_COOKIE_OFFSET: usize = 8;
    pub const WIDTH_OFFSET: usize = 16;
    pub const HEIGHT_OFFSET: usize = 20;
    pub const BPP_OFFSET: usize = 24;
    pub const BUFFER_SZ_OFFSET: usize = 28;
    pub const FLAGS_OFFSET: usize = 32;
    pub const GREF_DIRECTORY_OFFSET: usize = 36;

    pub fn alloc_on_host(&self) -> bool {
        self.flags & DBUF_FLAG_ALLOC_ON_HOST != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DbufDestroyReq {
    pub dbuf_cookie: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FbAttachReq {
    pub dbuf_cookie: u64,
    pub fb_cookie: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
}

impl FbAttachReq {
    pub const DBUF_COOKIE_OFFSET: usize = 8;
    pub const FB_COOKIE_OFFSET: usize = 16;
    pub const WIDTH_OFFSET: usize = 24;
    pub const HEIGHT_OFFSET: usize = 28;
    pub const PIXEL_FORMAT_OFFSET: usize = 32;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FbDetachReq {
    pub fb_cookie: u64,
}

/// `fb_cookie == 0` asks the backend to disable the output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetConfigReq {
    pub fb_cookie: u64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
}

impl SetConfigReq {
    pub const FB_COOKIE_OFFSET: usize = 8;
    pub const X_OFFSET: usize = 16;
    pub const Y_OFFSET: usize = 20;
    pub const WIDTH_OFFSET: usize = 24;
    pub const HEIGHT_OFFSET: usize = 28;
    pub const BPP_OFFSET: usize = 32;

    pub fn is_release(&self) -> bool {
        self.fb_cookie == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PgFlipReq {
    pub fb_cookie: u64,
}

/// Single-cookie payloads (`DBUF_DESTROY`, `FB_DETACH`, `PG_FLIP`) all keep it here.
pub const COOKIE_PAYLOAD_OFFSET: usize = DISPLIF_PAYLOAD_OFFSET;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplCommand {
    DbufCreate(DbufCreateReq),
    DbufDestroy(DbufDestroyReq),
    FbAttach(FbAttachReq),
    FbDetach(FbDetachReq),
    SetConfig(SetConfigReq),
    PgFlip(PgFlipReq),
}

impl DisplCommand {
    pub fn opcode(&self) -> DisplOpcode {
        match self {
            Self::DbufCreate(_) => DisplOpcode::DbufCreate,
            Self::DbufDestroy(_) => DisplOpcode::DbufDestroy,
            Self::FbAttach(_) => DisplOpcode::FbAttach,
            Self::FbDetach(_) => DisplOpcode::FbDetach,
            Self::SetConfig(_) => DisplOpcode::SetConfig,
            Self::PgFlip(_) => DisplOpcode::PgFlip,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplRequest {
    pub id: u16,
    pub command: DisplCommand,
}

impl DisplRequest {
    pub const SIZE_BYTES: usize = DISPLIF_RECORD_SIZE_BYTES;

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, DisplDecodeError> {
        let hdr = DisplRequestHeader::decode_from_le_bytes(buf)?;
        let opcode = DisplOpcode::from_u8(hdr.operation)
            .ok_or(DisplDecodeError::UnknownOpcode(hdr.operation))?;
        if buf.len() < Self::SIZE_BYTES {
            return Err(DisplDecodeError::TruncatedPayload {
                opcode,
                len: buf.len(),
            });
        }

        let command = match opcode {
            DisplOpcode::DbufCreate => DisplCommand::DbufCreate(DbufCreateReq {
                dbuf_cookie: read_u64_le(buf, DbufCreateReq::DBUF_COOKIE_OFFSET),
                width: read_u32_le(buf, DbufCreateReq::WIDTH_OFFSET),
                height: read_u32_le(buf, DbufCreateReq::HEIGHT_OFFSET),
                bpp: read_u32_le(buf, DbufCreateReq::BPP_OFFSET),
                buffer_sz: read_u32_le(buf, DbufCreateReq::BUFFER_SZ_OFFSET),
                flags: read_u32_le(buf, DbufCreateReq::FLAGS_OFFSET),
                gref_directory: read_u32_le(buf, DbufCreateReq::GREF_DIRECTORY_OFFSET),
            }),
            DisplOpcode::DbufDestroy => DisplCommand::DbufDestroy(DbufDestroyReq {
                dbuf_cookie: read_u64_le(buf, COOKIE_PAYLOAD_OFFSET),
            }),
            DisplOpcode::FbAttach => DisplCommand::FbAttach(FbAttachReq {
                dbuf_cookie: read_u64_le(buf, FbAttachReq::DBUF_COOKIE_OFFSET),
                fb_cookie: read_u64_le(buf, FbAttachReq::FB_COOKIE_OFFSET),
                width: read_u32_le(buf, FbAttachReq::WIDTH_OFFSET),
                height: read_u32_le(buf, FbAttachReq::HEIGHT_OFFSET),
                pixel_format: read_u32_le(buf, FbAttachReq::PIXEL_FORMAT_OFFSET),
            }),
            DisplOpcode::FbDetach => DisplCommand::FbDetach(FbDetachReq {
                fb_cookie: read_u64_le(buf, COOKIE_PAYLOAD_OFFSET),
            }),
            DisplOpcode::SetConfig => DisplCommand::SetConfig(SetConfigReq {
                fb_cookie: read_u64_le(buf, SetConfigReq::FB_COOKIE_OFFSET),
                x: read_u32_le(buf, SetConfigReq::X_OFFSET),
                y: read_u32_le(buf, SetConfigReq::Y_OFFSET),
                width: read_u32_le(buf, SetConfigReq::WIDTH_OFFSET),
                height: read_u32_le(buf, SetConfigReq::HEIGHT_OFFSET),
                bpp: read_u32_le(buf, SetConfigReq::BPP_OFFSET),
            }),
            DisplOpcode::PgFlip => DisplCommand::PgFlip(PgFlipReq {
                fb_cookie: read_u64_le(buf, COOKIE_PAYLOAD_OFFSET),
            }),
        };

        Ok(Self { id: hdr.id, command })
    }

    /// Encode the record the way a guest frontend would place it on the request ring.
    pub fn encode_to_le_bytes(&self) -> [u8; DISPLIF_RECORD_SIZE_BYTES] {
        let mut out = [0u8; DISPLIF_RECORD_SIZE_BYTES];
        write_u16_le(&mut out, REQ_ID_OFFSET, self.id);
        out[REQ_OPERATION_OFFSET] = self.command.opcode() as u8;

        match self.command {
            DisplCommand::DbufCreate(req) => {
                write_u64_le(&mut out, DbufCreateReq::DBUF_COOKIE_OFFSET, req.dbuf_cookie);
                write_u32_le(&mut out, DbufCreateReq::WIDTH_OFFSET, req.width);
                write_u32_le(&mut out, DbufCreateReq::HEIGHT_OFFSET, req.height);
                write_u32_le(&mut out, DbufCreateReq::BPP_OFFSET, req.bpp);
                write_u32_le(&mut out, DbufCreateReq::BUFFER_SZ_OFFSET, req.buffer_sz);
                write_u32_le(&mut out, DbufCreateReq::FLAGS_OFFSET, req.flags);
                write_u32_le(
                    &mut out,
                    DbufCreateReq::GREF_DIRECTORY_OFFSET,
                    req.gref_directory,
                );
            }
            DisplCommand::DbufDestroy(req) => {
                write_u64_le(&mut out, COOKIE_PAYLOAD_OFFSET, req.dbuf_cookie);
            }
            DisplCommand::FbAttach(req) => {
                write_u64_le(&mut out, FbAttachReq::DBUF_COOKIE_OFFSET, req.dbuf_cookie);
                write_u64_le(&mut out, FbAttachReq::FB_COOKIE_OFFSET, req.fb_cookie);
                write_u32_le(&mut out, FbAttachReq::WIDTH_OFFSET, req.width);
                write_u32_le(&mut out, FbAttachReq::HEIGHT_OFFSET, req.height);
                write_u32_le(&mut out, FbAttachReq::PIXEL_FORMAT_OFFSET, req.pixel_format);
            }
            DisplCommand::FbDetach(req) => {
                write_u64_le(&mut out, COOKIE_PAYLOAD_OFFSET, req.fb_cookie);
            }
            DisplCommand::SetConfig(req) => {
                write_u64_le(&mut out, SetConfigReq::FB_COOKIE_OFFSET, req.fb_cookie);
                write_u32_le(&mut out, SetConfigReq::X_OFFSET, req.x);
                write_u32_le(&mut out, SetConfigReq::Y_OFFSET, req.y);
                write_u32_le(&mut out, SetConfigReq::WIDTH_OFFSET, req.width);
                write_u32_le(&mut out, SetConfigReq::HEIGHT_OFFSET, req.height);
                write_u32_le(&mut out, SetConfigReq::BPP_OFFSET, req.bpp);
            }
            DisplCommand::PgFlip(req) => {
                write_u64_le(&mut out, COOKIE_PAYLOAD_OFFSET, req.fb_cookie);
            }
        }

        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplResponse {
    pub id: u16,
    pub operation: u8,
    pub status: i32,
}

impl DisplResponse {
    pub const SIZE_BYTES: usize = DISPLIF_RECORD_SIZE_BYTES;

    pub fn for_request(hdr: DisplRequestHeader, status: i32) -> Self {
        Self {
            id: hdr.id,
            operation: hdr.operation,
            status,
        }
    }

    pub fn encode_to_le_bytes(&self) -> [u8; DISPLIF_RECORD_SIZE_BYTES] {
        let mut out = [0u8; DISPLIF_RECORD_SIZE_BYTES];
        write_u16_le(&mut out, RESP_ID_OFFSET, self.id);
        out[RESP_OPERATION_OFFSET] = self.operation;
        write_u32_le(&mut out, RESP_STATUS_OFFSET, self.status as u32);
        out
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, DisplDecodeError> {
        if buf.len() < RESP_STATUS_OFFSET + 4 {
            return Err(DisplDecodeError::BufferTooSmall { len: buf.len() });
        }
        Ok(Self {
            id: read_u16_le(buf, RESP_ID_OFFSET),
            operation: buf[RESP_OPERATION_OFFSET],
            status: read_u32_le(buf, RESP_STATUS_OFFSET) as i32,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplEventKind {
    PgFlip { fb_cookie: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplEvent {
    pub id: u16,
    pub kind: DisplEventKind,
}

impl DisplEvent {
    pub const SIZE_BYTES: usize = DISPLIF_RECORD_SIZE_BYTES;

    pub fn encode_to_le_bytes(&self) -> [u8; DISPLIF_RECORD_SIZE_BYTES] {
        let mut out = [0u8; DISPLIF_RECORD_SIZE_BYTES];
        write_u16_le(&mut out, EVT_ID_OFFSET, self.id);
        match self.kind {
            DisplEventKind::PgFlip { fb_cookie } => {
                out[EVT_TYPE_OFFSET] = DISPLIF_EVT_PG_FLIP;
                write_u64_le(&mut out, DISPLIF_PAYLOAD_OFFSET, fb_cookie);
            }
        }
        out
    }

    pub fn decode_from_le_bytes(buf: &[u8]) -> Result<Self, DisplDecodeError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(DisplDecodeError::BufferTooSmall { len: buf.len() });
        }
        let kind = match buf[EVT_TYPE_OFFSET] {
            DISPLIF_EVT_PG_FLIP => DisplEventKind::PgFlip {
                fb_cookie: read_u64_le(buf, DISPLIF_PAYLOAD_OFFSET),
            },
            other => return Err(DisplDecodeError::UnknownEventType(other)),
        };
        Ok(Self {
            id: read_u16_le(buf, EVT_ID_OFFSET),
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_from_u8_rejects_gaps() {
        assert_eq!(DisplOpcode::from_u8(0x10), Some(DisplOpcode::DbufCreate));
        assert_eq!(DisplOpcode::from_u8(0x15), Some(DisplOpcode::PgFlip));
        assert_eq!(DisplOpcode::from_u8(0x0f), None);
        assert_eq!(DisplOpcode::from_u8(0x16), None);
        assert_eq!(DisplOpcode::from_u8(0xff), None);
    }

    #[test]
    fn header_decodes_unknown_operations() {
        let mut buf = [0u8; DISPLIF_RECORD_SIZE_BYTES];
        buf[0..2].copy_from_slice(&0x1234u16.to_le_bytes());
        buf[2] = 0x7f;

        let hdr = DisplRequestHeader::decode_from_le_bytes(&buf).unwrap();
        assert_eq!(hdr.id, 0x1234);
        assert_eq!(hdr.operation, 0x7f);
        assert_eq!(
            DisplRequest::decode_from_le_bytes(&buf),
            Err(DisplDecodeError::UnknownOpcode(0x7f))
        );
    }

    #[test]
    fn short_records_are_rejected() {
        assert_eq!(
            DisplRequestHeader::decode_from_le_bytes(&[0u8; 4]),
            Err(DisplDecodeError::BufferTooSmall { len: 4 })
        );

        let mut buf = [0u8; 16];
        buf[2] = DisplOpcode::SetConfig as u8;
        assert_eq!(
            DisplRequest::decode_from_le_bytes(&buf),
            Err(DisplDecodeError::TruncatedPayload {
                opcode: DisplOpcode::SetConfig,
                len: 16
            })
        );
    }

    #[test]
    fn response_status_is_signed() {
        let resp = DisplResponse {
            id: 7,
            operation: DisplOpcode::PgFlip as u8,
            status: -22,
        };
        let bytes = resp.encode_to_le_bytes();
        assert_eq!(&bytes[4..8], &(-22i32).to_le_bytes());
        assert_eq!(DisplResponse::decode_from_le_bytes(&bytes).unwrap(), resp);
    }

    #[test]
    fn event_rejects_unknown_type() {
        let mut buf = [0u8; DISPLIF_RECORD_SIZE_BYTES];
        buf[EVT_TYPE_OFFSET] = 0x42;
        assert_eq!(
            DisplEvent::decode_from_le_bytes(&buf),
            Err(DisplDecodeError::UnknownEventType(0x42))
        );
    }
}
