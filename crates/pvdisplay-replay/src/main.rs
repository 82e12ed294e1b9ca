use std::io::{self, BufWriter};

use anyhow::Context;
use pvdisplay_replay::{run, ReplayConfig, Script};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config = ReplayConfig::load()?;

    // stdout carries the replay output; logs go to stderr.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let script = Script::load(&config.script)?;
    tracing::info!(
        script = %config.script.display(),
        steps = script.steps.len(),
        protocol = ?config.device.protocol,
        "replaying"
    );

    let stdout = io::stdout();
    run(&script, config.device, BufWriter::new(stdout.lock())).context("replay failed")
}
