//! LiveUpdate Bootstrapper
//!
//! A tiny launcher step that resolves which bundle the host should load.
//! Run it before the application starts; it never downloads anything.
//!
//! ## Responsibilities
//! 1. Load the config named by `LIVEUPDATE_CONFIG` (or `./liveupdate.config.json`)
//! 2. Count the launch if the active bundle is still provisional
//! 3. Roll back once unconfirmed launches exceed the limit
//! 4. Print the bundle directory to load, or `embedded`

use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use liveupdate_lib::engine::config::LiveUpdateConfig;
use liveupdate_lib::engine::updater::{LaunchOutcome, LiveUpdateEngine};

const CONFIG_ENV: &str = "LIVEUPDATE_CONFIG";

fn main() -> ExitCode {
    init_tracing();

    match run() {
        Ok(target) => {
            println!("{}", target);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            // The embedded bundle is always loadable.
            println!("embedded");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<String> {
    let config_path = env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let config = LiveUpdateConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let engine = LiveUpdateEngine::open(config, None).context("opening bundle store")?;

    match engine.recover_on_launch().context("checking provisional bundle")? {
        LaunchOutcome::Stable => {}
        LaunchOutcome::Provisional {
            bundle_id,
            launch_attempts,
        } => info!(bundle_id = %bundle_id, launch_attempts, "Launching provisional bundle"),
        LaunchOutcome::RolledBack { from, restored } => {
            warn!(from = %from, restored = ?restored, "Too many failed launches, rolled back")
        }
    }

    Ok(match engine.load_path() {
        Some(path) => path.display().to_string(),
        None => "embedded".to_string(),
    })
}

/// Logs go to stderr; stdout carries only the load target
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
