use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use presence_switch::config::ControllerConfig;
use presence_switch::lifecycle::Activation;
use presence_switch::TargetMode;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PRESENCE_CONFIG",
        "PRESENCE_OBS_HOST",
        "PRESENCE_OBS_PORT",
        "PRESENCE_OBS_PASSWORD",
        "PRESENCE_SOURCE_NAME",
        "PRESENCE_EXCLUDED_SCENES",
        "PRESENCE_CONFIDENCE",
        "PRESENCE_CHECK_INTERVAL_MS",
        "PRESENCE_FEED_URL",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "obs": {
            "host": "studio.local",
            "port": 4460,
            "password": "hunter2",
            "request_timeout_ms": 1500
        },
        "targets": [
            {"source_name": "Face Cam", "excluded_scenes": ["Detection"]},
            {"source_name": "Be Right Back", "excluded_scenes": ["Detection"], "mode": "hide"}
        ],
        "detection": {
            "face_detection_confidence": 0.8,
            "check_interval_ms": 50,
            "hit_count": 4,
            "grace_misses": 10,
            "max_consecutive_frame_errors": 12
        },
        "feed": {"url": "stub://desk"},
        "lifecycle": {
            "activation": "connected",
            "standby_check_interval_ms": 2000,
            "reconnect_initial_ms": 250,
            "reconnect_max_ms": 8000,
            "reconcile_interval_ms": 3000,
            "feed_retry_ms": 1000
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("PRESENCE_CONFIG", file.path());
    std::env::set_var("PRESENCE_OBS_PORT", "4470");
    std::env::set_var("PRESENCE_EXCLUDED_SCENES", "Detection, Setup ,");
    std::env::set_var("PRESENCE_CONFIDENCE", "0.65");

    let cfg = ControllerConfig::load().expect("load config");

    assert_eq!(cfg.obs.host, "studio.local");
    assert_eq!(cfg.obs.port, 4470);
    assert_eq!(cfg.obs.password.as_deref(), Some("hunter2"));
    assert_eq!(cfg.obs.request_timeout, Duration::from_millis(1500));
    assert_eq!(cfg.targets.len(), 2);
    assert_eq!(cfg.targets[0].source_name, "Face Cam");
    assert!(cfg.targets[0].is_excluded("Setup"));
    assert!(cfg.targets[0].is_excluded("Detection"));
    assert!(!cfg.targets[1].is_excluded("Setup"));
    assert_eq!(cfg.targets[1].mode, TargetMode::Hide);
    assert_eq!(cfg.lifecycle.debounce.threshold, 0.65);
    assert_eq!(cfg.lifecycle.debounce.hit_count, 4);
    assert_eq!(cfg.lifecycle.debounce.grace_misses, 10);
    assert_eq!(cfg.lifecycle.check_interval, Duration::from_millis(50));
    assert_eq!(cfg.lifecycle.activation, Activation::Connected);
    assert_eq!(cfg.lifecycle.standby_check_interval, Duration::from_secs(2));
    assert_eq!(cfg.lifecycle.backoff.initial, Duration::from_millis(250));
    assert_eq!(cfg.lifecycle.backoff.max, Duration::from_secs(8));
    assert_eq!(cfg.lifecycle.reconcile_interval, Duration::from_secs(3));
    assert_eq!(cfg.lifecycle.feed_retry, Duration::from_secs(1));
    assert_eq!(cfg.feed.url.as_deref(), Some("stub://desk"));
    assert_eq!(cfg.feed.max_consecutive_frame_errors, 12);

    clear_env();
}

#[test]
fn env_alone_is_enough_for_a_single_target() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PRESENCE_SOURCE_NAME", "Face Cam");
    std::env::set_var("PRESENCE_EXCLUDED_SCENES", "Detection");
    std::env::set_var("PRESENCE_FEED_URL", "stub://present");
    std::env::set_var("PRESENCE_CHECK_INTERVAL_MS", "40");

    let cfg = ControllerConfig::load().expect("load config");
    assert_eq!(cfg.obs.host, "localhost");
    assert_eq!(cfg.obs.port, 4455);
    assert_eq!(cfg.targets.len(), 1);
    assert_eq!(cfg.targets[0].mode, TargetMode::Show);
    assert!(cfg.targets[0].is_excluded("Detection"));
    assert_eq!(cfg.lifecycle.check_interval, Duration::from_millis(40));
    assert_eq!(cfg.feed.url.as_deref(), Some("stub://present"));

    clear_env();
}

#[test]
fn toml_files_are_read_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [obs]
        host = "10.0.0.7"

        [[targets]]
        source_name = "Face Cam"
        excluded_scenes = ["Detection"]

        [feed]
        command = ["face-helper", "--camera", "0"]
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = ControllerConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.obs.host, "10.0.0.7");
    assert_eq!(cfg.targets[0].source_name, "Face Cam");
    assert_eq!(
        cfg.feed.command,
        Some(vec![
            "face-helper".to_string(),
            "--camera".to_string(),
            "0".to_string()
        ])
    );

    clear_env();
}

#[test]
fn invalid_settings_are_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PRESENCE_SOURCE_NAME", "Face Cam");
    std::env::set_var("PRESENCE_FEED_URL", "stub://present");

    std::env::set_var("PRESENCE_OBS_PORT", "not-a-port");
    assert!(ControllerConfig::load().is_err());
    std::env::remove_var("PRESENCE_OBS_PORT");

    std::env::set_var("PRESENCE_CONFIDENCE", "1.5");
    assert!(ControllerConfig::load().is_err());
    std::env::remove_var("PRESENCE_CONFIDENCE");

    std::env::set_var("PRESENCE_CHECK_INTERVAL_MS", "0");
    assert!(ControllerConfig::load().is_err());
    std::env::remove_var("PRESENCE_CHECK_INTERVAL_MS");

    std::env::remove_var("PRESENCE_SOURCE_NAME");
    assert!(ControllerConfig::load().is_err());

    std::env::set_var("PRESENCE_CONFIG", "/nonexistent/presence.json");
    assert!(ControllerConfig::load().is_err());

    clear_env();
}
