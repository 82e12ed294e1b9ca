use std::time::Duration;

use pvdisplay_protocol::status::ProtocolGeneration;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FLIP_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_COMPLETION_POLL_MS: u64 = 10;

/// Runtime knobs for one display device and its connections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplbackConfig {
    /// Status encoding the guest frontend was built against.
    pub protocol: ProtocolGeneration,
    /// How long teardown waits for an in-flight flip before abandoning it.
    pub flip_timeout_ms: u64,
    /// Upper bound on one blocking wait of the completion thread.
    pub completion_poll_ms: u64,
    /// Restore the engine's pre-guest configuration on release instead of switching it off.
    pub restore_on_release: bool,
}

impl Default for DisplbackConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolGeneration::default(),
            flip_timeout_ms: DEFAULT_FLIP_TIMEOUT_MS,
            completion_poll_ms: DEFAULT_COMPLETION_POLL_MS,
            restore_on_release: true,
        }
    }
}

impl DisplbackConfig {
    pub fn flip_timeout(&self) -> Duration {
        Duration::from_millis(self.flip_timeout_ms)
    }

    /// Never zero, so the completion thread cannot spin.
    pub fn completion_poll(&self) -> Duration {
        Duration::from_millis(self.completion_poll_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: DisplbackConfig = serde_json::from_str(r#"{"protocol":"legacy"}"#).unwrap();
        assert_eq!(
            cfg,
            DisplbackConfig {
                protocol: ProtocolGeneration::Legacy,
                ..DisplbackConfig::default()
            }
        );
        assert_eq!(cfg.flip_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<DisplbackConfig>(r#"{"flip_timeout":5}"#).is_err());
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let cfg = DisplbackConfig {
            completion_poll_ms: 0,
            ..DisplbackConfig::default()
        };
        assert_eq!(cfg.completion_poll(), Duration::from_millis(1));
    }
}
