use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::control::ObsEndpoint;
use crate::error::ConfigurationError;
use crate::feed::{FeedSettings, DEFAULT_MAX_CONSECUTIVE_FRAME_ERRORS};
use crate::lifecycle::{Activation, BackoffPolicy, LifecycleSettings};
use crate::{DebounceConfig, SourceTarget, TargetMode};

const DEFAULT_OBS_HOST: &str = "localhost";
const DEFAULT_OBS_PORT: u16 = 4455;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_CHECK_INTERVAL_MS: u64 = 100;
const DEFAULT_STANDBY_CHECK_INTERVAL_MS: u64 = 5_000;
const DEFAULT_RECONNECT_INITIAL_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 10_000;
const DEFAULT_FEED_RETRY_MS: u64 = 5_000;

#[derive(Debug, Deserialize, Default)]
struct ControllerConfigFile {
    obs: Option<ObsConfigFile>,
    targets: Option<Vec<TargetConfigFile>>,
    detection: Option<DetectionConfigFile>,
    feed: Option<FeedConfigFile>,
    lifecycle: Option<LifecycleConfigFile>,

    // Flat layout written by the setup wizard. Sectioned keys win.
    obs_host: Option<String>,
    obs_port: Option<u16>,
    obs_password: Option<String>,
    show_source_name: Option<String>,
    hide_source_name: Option<String>,
    detection_scene_name: Option<String>,
    face_detection_confidence: Option<f32>,
    /// Seconds.
    check_interval: Option<f64>,
    /// Seconds.
    standby_check_interval: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ObsConfigFile {
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TargetConfigFile {
    source_name: String,
    #[serde(default)]
    excluded_scenes: Vec<String>,
    #[serde(default)]
    mode: TargetMode,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    face_detection_confidence: Option<f32>,
    check_interval_ms: Option<u64>,
    hit_count: Option<u32>,
    grace_misses: Option<u32>,
    max_consecutive_frame_errors: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct FeedConfigFile {
    url: Option<String>,
    command: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct LifecycleConfigFile {
    activation: Option<Activation>,
    standby_check_interval_ms: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconcile_interval_ms: Option<u64>,
    feed_retry_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub obs: ObsEndpoint,
    pub targets: Vec<SourceTarget>,
    pub feed: FeedSettings,
    pub lifecycle: LifecycleSettings,
}

impl ControllerConfig {
    /// File from `PRESENCE_CONFIG` (optional), then environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like `load`, but an explicit `path` takes precedence over `PRESENCE_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("PRESENCE_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ControllerConfigFile) -> Result<Self> {
        let obs_file = file.obs.unwrap_or_default();
        let obs = ObsEndpoint {
            host: obs_file
                .host
                .or(file.obs_host)
                .unwrap_or_else(|| DEFAULT_OBS_HOST.to_string()),
            port: obs_file.port.or(file.obs_port).unwrap_or(DEFAULT_OBS_PORT),
            password: normalize_password(obs_file.password.or(file.obs_password)),
            connect_timeout: Duration::from_millis(
                obs_file
                    .connect_timeout_ms
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            request_timeout: Duration::from_millis(
                obs_file
                    .request_timeout_ms
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
        };

        let targets = match file.targets {
            Some(targets) => targets
                .into_iter()
                .map(|t| {
                    SourceTarget::new(t.source_name)
                        .excluding(t.excluded_scenes)
                        .with_mode(t.mode)
                })
                .collect(),
            None => {
                // The wizard's detection scene only shields the show source; the hide
                // source is toggled everywhere.
                let show = file.show_source_name.map(|name| {
                    SourceTarget::new(name).excluding(file.detection_scene_name.clone())
                });
                let hide = file
                    .hide_source_name
                    .map(|name| SourceTarget::new(name).with_mode(TargetMode::Hide));
                show.into_iter().chain(hide).collect()
            }
        };

        let detection = file.detection.unwrap_or_default();
        let debounce = DebounceConfig {
            threshold: detection
                .face_detection_confidence
                .or(file.face_detection_confidence)
                .unwrap_or(DebounceConfig::default().threshold),
            hit_count: detection
                .hit_count
                .unwrap_or(DebounceConfig::default().hit_count),
            grace_misses: detection
                .grace_misses
                .unwrap_or(DebounceConfig::default().grace_misses),
        };
        let check_interval = match (detection.check_interval_ms, file.check_interval) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, Some(secs)) => seconds("check_interval", secs)?,
            (None, None) => Duration::from_millis(DEFAULT_CHECK_INTERVAL_MS),
        };

        let feed_file = file.feed.unwrap_or_default();
        let feed = FeedSettings {
            url: feed_file.url,
            command: feed_file.command,
            max_consecutive_frame_errors: detection
                .max_consecutive_frame_errors
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FRAME_ERRORS),
        };

        let lifecycle_file = file.lifecycle.unwrap_or_default();
        let standby_check_interval = match (
            lifecycle_file.standby_check_interval_ms,
            file.standby_check_interval,
        ) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, Some(secs)) => seconds("standby_check_interval", secs)?,
            (None, None) => Duration::from_millis(DEFAULT_STANDBY_CHECK_INTERVAL_MS),
        };
        let lifecycle = LifecycleSettings {
            activation: lifecycle_file.activation.unwrap_or_default(),
            debounce,
            check_interval,
            standby_check_interval,
            reconcile_interval: Duration::from_millis(
                lifecycle_file
                    .reconcile_interval_ms
                    .unwrap_or(DEFAULT_RECONCILE_INTERVAL_MS),
            ),
            feed_retry: Duration::from_millis(
                lifecycle_file.feed_retry_ms.unwrap_or(DEFAULT_FEED_RETRY_MS),
            ),
            backoff: BackoffPolicy {
                initial: Duration::from_millis(
                    lifecycle_file
                        .reconnect_initial_ms
                        .unwrap_or(DEFAULT_RECONNECT_INITIAL_MS),
                ),
                max: Duration::from_millis(
                    lifecycle_file
                        .reconnect_max_ms
                        .unwrap_or(DEFAULT_RECONNECT_MAX_MS),
                ),
                ..BackoffPolicy::default()
            },
        };

        Ok(Self {
            obs,
            targets,
            feed,
            lifecycle,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("PRESENCE_OBS_HOST") {
            if !host.trim().is_empty() {
                self.obs.host = host.trim().to_string();
            }
        }
        if let Ok(port) = std::env::var("PRESENCE_OBS_PORT") {
            self.obs.port = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("PRESENCE_OBS_PORT must be a port number"))?;
        }
        if let Ok(password) = std::env::var("PRESENCE_OBS_PASSWORD") {
            self.obs.password = normalize_password(Some(password));
        }
        if let Ok(source) = std::env::var("PRESENCE_SOURCE_NAME") {
            let source = source.trim();
            if !source.is_empty() {
                match self.targets.first_mut() {
                    Some(target) => target.source_name = source.to_string(),
                    None => self.targets.push(SourceTarget::new(source)),
                }
            }
        }
        if let Ok(scenes) = std::env::var("PRESENCE_EXCLUDED_SCENES") {
            let parsed: BTreeSet<String> = split_csv(&scenes).into_iter().collect();
            if let Some(target) = self.targets.first_mut() {
                target.excluded_scene_names = parsed;
            }
        }
        if let Ok(confidence) = std::env::var("PRESENCE_CONFIDENCE") {
            self.lifecycle.debounce.threshold = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("PRESENCE_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Ok(interval) = std::env::var("PRESENCE_CHECK_INTERVAL_MS") {
            let ms: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("PRESENCE_CHECK_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.lifecycle.check_interval = Duration::from_millis(ms);
        }
        if let Ok(url) = std::env::var("PRESENCE_FEED_URL") {
            if !url.trim().is_empty() {
                self.feed.url = Some(url.trim().to_string());
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.obs.host.trim().is_empty() {
            return Err(ConfigurationError::Missing("obs.host"));
        }
        if self.obs.port == 0 {
            return Err(invalid("obs.port", "must not be 0"));
        }
        if self.obs.connect_timeout.is_zero() || self.obs.request_timeout.is_zero() {
            return Err(invalid("obs.request_timeout_ms", "timeouts must be greater than zero"));
        }

        if self.targets.is_empty() {
            return Err(ConfigurationError::Missing("targets"));
        }
        let mut seen = BTreeSet::new();
        for target in &self.targets {
            if target.source_name.trim().is_empty() {
                return Err(invalid("targets.source_name", "must not be empty"));
            }
            if !seen.insert(target.source_name.as_str()) {
                return Err(invalid(
                    "targets.source_name",
                    &format!("'{}' is listed twice", target.source_name),
                ));
            }
        }

        self.lifecycle.debounce.validate()?;
        if self.lifecycle.check_interval.is_zero() {
            return Err(invalid("detection.check_interval_ms", "must be greater than zero"));
        }
        if self.lifecycle.standby_check_interval.is_zero() {
            return Err(invalid(
                "lifecycle.standby_check_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.lifecycle.reconcile_interval.is_zero() {
            return Err(invalid("lifecycle.reconcile_interval_ms", "must be greater than zero"));
        }
        let backoff = &self.lifecycle.backoff;
        if backoff.initial.is_zero() {
            return Err(invalid("lifecycle.reconnect_initial_ms", "must be greater than zero"));
        }
        if backoff.max < backoff.initial {
            return Err(invalid(
                "lifecycle.reconnect_max_ms",
                "must not be below reconnect_initial_ms",
            ));
        }
        if self.feed.max_consecutive_frame_errors == 0 {
            return Err(invalid(
                "detection.max_consecutive_frame_errors",
                "must be greater than zero",
            ));
        }

        let has_command = self.feed.command.as_ref().is_some_and(|c| !c.is_empty());
        match self.feed.url.as_deref() {
            _ if has_command => {}
            Some(url) if url.starts_with("stub://") => {}
            Some(url) => {
                return Err(invalid(
                    "feed.url",
                    &format!("unsupported source '{}'; use stub:// or feed.command", url),
                ))
            }
            None => return Err(ConfigurationError::Missing("feed.url or feed.command")),
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigurationError {
    ConfigurationError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

fn seconds(key: &'static str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| invalid(key, &format!("{} is not a valid number of seconds", secs)).into())
}

fn normalize_password(password: Option<String>) -> Option<String> {
    password.filter(|p| !p.is_empty())
}

fn read_config_file(path: &Path) -> Result<ControllerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
