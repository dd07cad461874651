use std::io::{BufRead, BufReader, Read};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use super::{FeedPull, PresenceFeed};
use crate::PresenceSample;

/// How long release waits for the reader thread once the helper is killed.
const READER_EXIT_GRACE: Duration = Duration::from_millis(500);

enum Origin {
    Command(Vec<String>),
    Reader(Option<Box<dyn Read + Send>>),
}

/// Push-style feed: one confidence per line, e.g. `0.93` or `face 0.93`.
///
/// Malformed lines count as bad frames. Blank lines are ignored. When the producer
/// exits, the stream ends.
pub struct SignalFeed {
    name: String,
    origin: Origin,
    child: Option<Child>,
    lines: Option<Receiver<String>>,
    reader: Option<JoinHandle<()>>,
    max_consecutive_errors: u32,
    consecutive_errors: u32,
}

impl SignalFeed {
    /// Spawn `argv` on acquire and read its stdout.
    pub fn command(argv: Vec<String>, max_consecutive_errors: u32) -> Self {
        let name = argv.first().cloned().unwrap_or_default();
        Self::with_origin(name, Origin::Command(argv), max_consecutive_errors)
    }

    /// Read lines from an in-process reader instead of a child process.
    pub fn from_reader<R>(name: &str, reader: R, max_consecutive_errors: u32) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::with_origin(
            name.to_string(),
            Origin::Reader(Some(Box::new(reader))),
            max_consecutive_errors,
        )
    }

    fn with_origin(name: String, origin: Origin, max_consecutive_errors: u32) -> Self {
        Self {
            name,
            origin,
            child: None,
            lines: None,
            reader: None,
            max_consecutive_errors: max_consecutive_errors.max(1),
            consecutive_errors: 0,
        }
    }

    fn spawn_reader(&mut self, input: Box<dyn Read + Send>) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name("presence-signal".to_string())
            .spawn(move || {
                for line in BufReader::new(input).lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            log::debug!("{}: signal read failed: {}", name, err);
                            break;
                        }
                    }
                }
            })
            .context("spawn signal reader")?;
        self.lines = Some(rx);
        self.reader = Some(handle);
        Ok(())
    }
}

/// Confidence carried by one signal line. The value is the last token; a label may
/// precede it (`face 0.93`, `confidence=0.93`).
pub fn parse_signal_line(line: &str) -> Option<f32> {
    line.rsplit(|c: char| c.is_whitespace() || c == '=' || c == ':')
        .find(|token| !token.is_empty())
        .and_then(|token| token.parse::<f32>().ok())
}

impl PresenceFeed for SignalFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&mut self) -> Result<()> {
        self.consecutive_errors = 0;
        let input: Box<dyn Read + Send> = match &mut self.origin {
            Origin::Command(argv) => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| anyhow!("empty detector command"))?;
                let mut command = Command::new(program);
                command
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit());
                // Own process group, so release also reaches anything the helper forked.
                #[cfg(unix)]
                command.process_group(0);
                let mut child = command
                    .spawn()
                    .with_context(|| format!("spawn detector '{}'", program))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| anyhow!("detector '{}' has no stdout", program))?;
                self.child = Some(child);
                Box::new(stdout)
            }
            Origin::Reader(reader) => reader
                .take()
                .ok_or_else(|| anyhow!("{}: signal reader already consumed", self.name))?,
        };
        self.spawn_reader(input)
    }

    fn next(&mut self, wait: Duration) -> FeedPull {
        let Some(lines) = &self.lines else {
            return FeedPull::EndOfStream;
        };
        let line = match lines.recv_timeout(wait) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => return FeedPull::Idle,
            Err(RecvTimeoutError::Disconnected) => {
                log::info!("{}: signal ended", self.name);
                return FeedPull::EndOfStream;
            }
        };
        let now = Instant::now();
        if line.trim().is_empty() {
            return FeedPull::Idle;
        }
        match parse_signal_line(&line) {
            Some(confidence) => {
                self.consecutive_errors = 0;
                FeedPull::Sample(PresenceSample::new(confidence, now))
            }
            None => {
                self.consecutive_errors += 1;
                if self.consecutive_errors >= self.max_consecutive_errors {
                    log::warn!(
                        "{}: {} malformed lines in a row, ending stream",
                        self.name,
                        self.consecutive_errors
                    );
                    return FeedPull::EndOfStream;
                }
                log::debug!("{}: malformed signal line {:?}", self.name, line);
                FeedPull::Sample(PresenceSample::zero(now))
            }
        }
    }

    fn release(&mut self) {
        self.lines = None;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = kill_detector(&mut child) {
                log::debug!("{}: kill detector: {}", self.name, err);
            }
            let _ = child.wait();
            if let Some(reader) = self.reader.take() {
                join_within(reader, READER_EXIT_GRACE, &self.name);
            }
        }
        // In-process readers may block forever; their thread is left to finish alone.
        self.reader = None;
    }

    fn self_paced(&self) -> bool {
        true
    }
}

#[cfg(unix)]
fn kill_detector(child: &mut Child) -> std::io::Result<()> {
    let group = child.id() as libc::pid_t;
    let rc = unsafe { libc::kill(-group, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    log::debug!(
        "kill process group {}: {}",
        group,
        std::io::Error::last_os_error()
    );
    child.kill()
}

#[cfg(not(unix))]
fn kill_detector(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

/// Join `reader` if it exits within `grace`; otherwise leave it detached. A process
/// outside the helper's group can keep the pipe open indefinitely.
fn join_within(reader: JoinHandle<()>, grace: Duration, name: &str) {
    let deadline = Instant::now() + grace;
    while !reader.is_finished() {
        if Instant::now() >= deadline {
            log::warn!(
                "{}: signal reader still blocked after {:?}; detaching it",
                name,
                grace
            );
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let _ = reader.join();
}

impl Drop for SignalFeed {
    fn drop(&mut self) {
        self.release();
    }
}
