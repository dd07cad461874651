//! demo - end-to-end synthetic run of the presence controller
//!
//! Drives the real lifecycle manager against an in-memory OBS and a synthetic camera,
//! then prints the overlay visibility left in each scene.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use presence_switch::control::{InMemoryConnector, InMemoryControlPlane};
use presence_switch::feed::{open_feed, FeedSettings};
use presence_switch::lifecycle::{Activation, BackoffPolicy, LifecycleSettings};
use presence_switch::{DebounceConfig, LifecycleEvent, LifecycleManager, SourceTarget, TargetMode};

const FACE_CAM: &str = "Face Cam";
const BRB: &str = "Be Right Back";
const DETECTION_SCENE: &str = "Detection";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Duration in seconds of the live period.
    #[arg(long, default_value_t = 4)]
    seconds: u64,
    /// Synthetic camera pattern.
    #[arg(long, default_value = "stub://desk?present=25&absent=25")]
    feed: String,
    /// Detection interval in milliseconds.
    #[arg(long, default_value_t = 20)]
    interval_ms: u64,
    /// Drop the control-plane link halfway through to show reconnection.
    #[arg(long)]
    drop_link: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let plane = InMemoryControlPlane::new()
        .with_scene("Main", &[FACE_CAM, BRB, "Game Capture"])
        .with_scene("Just Chatting", &[FACE_CAM, BRB])
        .with_scene(DETECTION_SCENE, &[FACE_CAM, "Webcam"]);
    let connector = InMemoryConnector::new(plane.clone());

    let targets = vec![
        SourceTarget::new(FACE_CAM).excluding([DETECTION_SCENE]),
        SourceTarget::new(BRB)
            .excluding([DETECTION_SCENE])
            .with_mode(TargetMode::Hide),
    ];
    let interval = Duration::from_millis(args.interval_ms.max(1));
    let settings = LifecycleSettings {
        activation: Activation::Live,
        debounce: DebounceConfig::default(),
        check_interval: interval,
        standby_check_interval: Duration::from_millis(250),
        reconcile_interval: Duration::from_secs(1),
        feed_retry: Duration::from_millis(250),
        backoff: BackoffPolicy {
            initial: Duration::from_millis(50),
            max: Duration::from_millis(400),
            ..BackoffPolicy::default()
        },
    };
    let feed_settings = FeedSettings {
        url: Some(args.feed.clone()),
        ..FeedSettings::default()
    };

    let (events_tx, events_rx) = mpsc::channel();
    let mut manager = LifecycleManager::new(connector, targets, settings, move || {
        open_feed(&feed_settings)
    })
    .with_events(events_tx);
    let stop = manager.stop_signal();
    let handle = std::thread::spawn(move || manager.run());

    println!("standby: waiting for OBS to go live");
    print_events(&events_rx, Duration::from_millis(300));

    println!("streaming started");
    plane.set_streaming(true);
    let live = Duration::from_secs(args.seconds.max(1));
    if args.drop_link {
        print_events(&events_rx, live / 2);
        println!("dropping control-plane link");
        plane.drop_link();
        print_events(&events_rx, Duration::from_millis(300));
        plane.restore_link();
        print_events(&events_rx, live / 2);
    } else {
        print_events(&events_rx, live);
    }

    println!("streaming stopped");
    plane.set_streaming(false);
    print_events(&events_rx, Duration::from_millis(300));

    stop.stop();
    handle
        .join()
        .map_err(|_| anyhow!("controller thread panicked"))??;
    print_events(&events_rx, Duration::from_millis(10));

    println!();
    println!("final overlay visibility:");
    for scene in ["Main", "Just Chatting", DETECTION_SCENE] {
        for source in [FACE_CAM, BRB] {
            if let Some(visible) = plane.visibility(scene, source) {
                println!(
                    "  {:<14} {:<14} {}",
                    scene,
                    source,
                    if visible { "visible" } else { "hidden" }
                );
            }
        }
    }
    println!("visibility commands issued: {}", plane.mutations().len());
    Ok(())
}

fn print_events(events: &mpsc::Receiver<LifecycleEvent>, window: Duration) {
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match events.recv_timeout(remaining) {
            Ok(event) => println!("  {:?}", event),
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
