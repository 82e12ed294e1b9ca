//! Replays scripted guest traffic against an in-memory paravirtual display device.
#![forbid(unsafe_code)]

pub mod config;
pub mod replay;
pub mod script;

pub use config::ReplayConfig;
pub use replay::{run, Replay, ReplayLine};
pub use script::{DirectoryChain, Script, ScriptCommand, SharedPage, Step};
