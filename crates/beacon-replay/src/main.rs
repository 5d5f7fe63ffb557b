//! # beacon-replay
//!
//! Replays a beacon scenario against the region engine and prints every
//! command result and subscriber event as one JSON line on stdout.
//!
//! ## Running
//!
//! ```bash
//! beacon-replay crates/beacon-replay/scenarios/ranging.json
//! beacon-replay scenario.json --config engine.toml
//! BEACON_ENV=production beacon-replay scenario.json
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use beacon_core::{default_config_path, EngineConfig};
use beacon_replay::{logging, replay, Scenario};
use tracing::info;

struct Args {
    scenario: PathBuf,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut scenario = None;
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                bail!("usage: beacon-replay <scenario.json> [--config <engine.toml>]");
            }
            _ if scenario.is_none() => scenario = Some(PathBuf::from(arg)),
            other => bail!("unexpected argument '{other}'"),
        }
    }
    Ok(Args {
        scenario: scenario.context("missing scenario path")?,
        config,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("BEACON_ENV").is_ok_and(|env| env == "production");
    logging::init(is_production)?;

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::load_or_default(default_config_path())?,
    };
    let scenario = Scenario::load(&args.scenario)?;

    info!(scenario = %args.scenario.display(), "Starting beacon-replay");
    let lines = replay(scenario, &config).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in &lines {
        writeln!(out, "{}", line.to_json_line())?;
    }
    info!(lines = lines.len(), "Replay finished");

    Ok(())
}
