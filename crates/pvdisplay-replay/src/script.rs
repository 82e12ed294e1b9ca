//! JSON replay scripts.
//!
//! A script describes the host side (a [`SoftwareBackendConfig`]), what the guest has shared
//! before the first request (`pages` and `directories`), and an ordered list of [`Step`]s.

use std::path::Path;

use anyhow::Context;
use pvdisplay_backend::{ConnectorId, EngineId, SoftwareBackendConfig};
use pvdisplay_protocol::displif::{
    DbufCreateReq, DbufDestroyReq, DisplCommand, FbAttachReq, FbDetachReq, PgFlipReq,
    SetConfigReq, DBUF_FLAG_ALLOC_ON_HOST,
};
use pvdisplay_protocol::GrantRef;
use serde::Deserialize;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Script {
    pub backend: SoftwareBackendConfig,
    pub pages: Vec<SharedPage>,
    pub directories: Vec<DirectoryChain>,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading script {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing script {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// One guest page; `fill` is repeated over the page before `bytes` are copied to its start.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedPage {
    pub gref: GrantRef,
    #[serde(default)]
    pub fill: u8,
    #[serde(default)]
    pub bytes: Vec<u8>,
}

/// Directory pages (in chain order) listing `data` as a buffer's grant references.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryChain {
    pub directory: Vec<GrantRef>,
    pub data: Vec<GrantRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    /// Send one request record on a connector's connection.
    Request {
        #[serde(default)]
        connector: ConnectorId,
        id: u16,
        command: ScriptCommand,
    },
    /// Guest write into an already shared page.
    WritePage {
        gref: GrantRef,
        #[serde(default)]
        offset: usize,
        bytes: Vec<u8>,
    },
    /// Signal vblank on one engine, or on every engine with a flip in flight.
    CompleteFlips {
        #[serde(default)]
        engine: Option<EngineId>,
    },
    SetConnected { connector: ConnectorId, connected: bool },
}

/// Request payloads, named after their wire operations.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum ScriptCommand {
    DbufCreate {
        dbuf_cookie: u64,
        width: u32,
        height: u32,
        bpp: u32,
        buffer_sz: u32,
        #[serde(default)]
        alloc_on_host: bool,
        gref_directory: GrantRef,
    },
    DbufDestroy {
        dbuf_cookie: u64,
    },
    FbAttach {
        dbuf_cookie: u64,
        fb_cookie: u64,
        width: u32,
        height: u32,
        /// Four-character code such as `"XR24"`.
        pixel_format: String,
    },
    FbDetach {
        fb_cookie: u64,
    },
    SetConfig {
        fb_cookie: u64,
        #[serde(default)]
        x: u32,
        #[serde(default)]
        y: u32,
        #[serde(default)]
        width: u32,
        #[serde(default)]
        height: u32,
        #[serde(default)]
        bpp: u32,
    },
    PgFlip {
        fb_cookie: u64,
    },
    /// A record with an arbitrary operation byte and an all-zero payload.
    Raw {
        operation: u8,
    },
}

impl ScriptCommand {
    /// The decoded command, or `None` for [`ScriptCommand::Raw`].
    pub fn to_command(&self) -> anyhow::Result<Option<DisplCommand>> {
        let command = match self {
            Self::DbufCreate {
                dbuf_cookie,
                width,
                height,
                bpp,
                buffer_sz,
                alloc_on_host,
                gref_directory,
            } => DisplCommand::DbufCreate(DbufCreateReq {
                dbuf_cookie: *dbuf_cookie,
                width: *width,
                height: *height,
                bpp: *bpp,
                buffer_sz: *buffer_sz,
                flags: if *alloc_on_host {
                    DBUF_FLAG_ALLOC_ON_HOST
                } else {
                    0
                },
                gref_directory: *gref_directory,
            }),
            Self::DbufDestroy { dbuf_cookie } => DisplCommand::DbufDestroy(DbufDestroyReq {
                dbuf_cookie: *dbuf_cookie,
            }),
            Self::FbAttach {
                dbuf_cookie,
                fb_cookie,
                width,
                height,
                pixel_format,
            } => DisplCommand::FbAttach(FbAttachReq {
                dbuf_cookie: *dbuf_cookie,
                fb_cookie: *fb_cookie,
                width: *width,
                height: *height,
                pixel_format: parse_fourcc(pixel_format)?,
            }),
            Self::FbDetach { fb_cookie } => DisplCommand::FbDetach(FbDetachReq {
                fb_cookie: *fb_cookie,
            }),
            Self::SetConfig {
                fb_cookie,
                x,
                y,
                width,
                height,
                bpp,
            } => DisplCommand::SetConfig(SetConfigReq {
                fb_cookie: *fb_cookie,
                x: *x,
                y: *y,
                width: *width,
                height: *height,
                bpp: *bpp,
            }),
            Self::PgFlip { fb_cookie } => DisplCommand::PgFlip(PgFlipReq {
                fb_cookie: *fb_cookie,
            }),
            Self::Raw { .. } => return Ok(None),
        };
        Ok(Some(command))
    }
}

fn parse_fourcc(code: &str) -> anyhow::Result<u32> {
    let bytes: [u8; 4] = code
        .as_bytes()
        .try_into()
        .map_err(|_| anyhow::anyhow!("pixel format {code:?} is not a four-character code"))?;
    Ok(u32::from_le_bytes(bytes))
}
