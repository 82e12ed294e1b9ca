use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use pvdisplay_backend::DisplbackConfig;
use pvdisplay_protocol::status::ProtocolGeneration;

const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProtocolArg {
    Legacy,
    Errno,
}

impl From<ProtocolArg> for ProtocolGeneration {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Legacy => ProtocolGeneration::Legacy,
            ProtocolArg::Errno => ProtocolGeneration::Errno,
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "pvdisplay-replay", version, about)]
pub struct Args {
    /// JSON replay script (backend description, shared pages, steps).
    ///
    /// Environment variable: `PVDISPLAY_SCRIPT`.
    #[arg(long, env = "PVDISPLAY_SCRIPT")]
    pub script: PathBuf,

    /// JSON device configuration; every field is optional.
    ///
    /// Environment variable: `PVDISPLAY_CONFIG`.
    #[arg(long, env = "PVDISPLAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Status encoding to answer with. Overrides the configuration file.
    ///
    /// Environment variable: `PVDISPLAY_PROTOCOL`.
    #[arg(long, env = "PVDISPLAY_PROTOCOL", value_enum)]
    pub protocol: Option<ProtocolArg>,

    /// Log filter (tracing-subscriber EnvFilter syntax). `RUST_LOG` takes precedence.
    ///
    /// Environment variable: `PVDISPLAY_LOG_LEVEL`.
    #[arg(long, env = "PVDISPLAY_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub script: PathBuf,
    pub device: DisplbackConfig,
    pub log_level: String,
}

impl ReplayConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let mut device = match &args.config {
            Some(path) => load_device_config(path)?,
            None => DisplbackConfig::default(),
        };
        if let Some(protocol) = args.protocol {
            device.protocol = protocol.into();
        }

        Ok(Self {
            script: args.script,
            device,
            log_level: args
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }
}

fn load_device_config(path: &Path) -> anyhow::Result<DisplbackConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn args(config: Option<PathBuf>, protocol: Option<ProtocolArg>) -> Args {
        Args {
            script: PathBuf::from("script.json"),
            config,
            protocol,
            log_level: None,
        }
    }

    #[test]
    fn defaults_without_config_file() {
        let config = ReplayConfig::from_args(args(None, None)).unwrap();
        assert_eq!(config.device, DisplbackConfig::default());
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn protocol_flag_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "protocol": "errno", "flip_timeout_ms": 5 }}"#).unwrap();

        let config = ReplayConfig::from_args(args(
            Some(file.path().to_path_buf()),
            Some(ProtocolArg::Legacy),
        ))
        .unwrap();
        assert_eq!(config.device.protocol, ProtocolGeneration::Legacy);
        assert_eq!(config.device.flip_timeout_ms, 5);
    }

    #[test]
    fn bad_config_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "flip_timeout": 5 }}"#).unwrap();
        assert!(ReplayConfig::from_args(args(Some(file.path().to_path_buf()), None)).is_err());
    }

    #[test]
    fn cli_parses_flags() {
        let args = Args::try_parse_from([
            "pvdisplay-replay",
            "--script",
            "s.json",
            "--protocol",
            "legacy",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.protocol, Some(ProtocolArg::Legacy));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }
}
