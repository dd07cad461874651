//! presenced - presence-driven OBS source controller
//!
//! This daemon:
//! 1. Connects to obs-websocket (reconnecting with backoff when the link drops)
//! 2. Idles in standby until OBS is streaming or recording
//! 3. Runs face-presence detection while live
//! 4. Shows or hides the configured overlay sources in every non-excluded scene

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use presence_switch::feed::open_feed;
use presence_switch::lifecycle::Activation;
use presence_switch::{ControllerConfig, LifecycleManager, ObsConnector, TargetMode};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (JSON, or TOML when the extension is .toml).
    #[arg(long, env = "PRESENCE_CONFIG")]
    config: Option<PathBuf>,
    /// Run detection whenever OBS is reachable, not only while live.
    #[arg(long)]
    always_on: bool,
    /// Load and validate the configuration, then exit.
    #[arg(long)]
    check_config: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = ControllerConfig::load_from(args.config.as_deref())?;
    if args.always_on {
        config.lifecycle.activation = Activation::Connected;
    }

    log::info!("obs-websocket endpoint: {}", config.obs.url());
    for target in &config.targets {
        let verb = match target.mode {
            TargetMode::Show => "show",
            TargetMode::Hide => "hide",
        };
        log::info!(
            "target '{}': {} on presence, excluded scenes {:?}",
            target.source_name,
            verb,
            target.excluded_scene_names
        );
    }
    log::info!(
        "detection: threshold {:.2}, {} hits / {} misses, every {:?}",
        config.lifecycle.debounce.threshold,
        config.lifecycle.debounce.hit_count,
        config.lifecycle.debounce.grace_misses,
        config.lifecycle.check_interval
    );
    if args.check_config {
        log::info!("configuration ok");
        return Ok(());
    }

    let feed_settings = config.feed.clone();
    let mut manager = LifecycleManager::new(
        ObsConnector::new(config.obs.clone()),
        config.targets.clone(),
        config.lifecycle.clone(),
        move || open_feed(&feed_settings),
    );

    let stop = manager.stop_signal();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, stopping...");
        stop.stop();
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    manager.run()
}
