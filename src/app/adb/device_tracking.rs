use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::adb::track_devices::{TrackDevicesStreamParser, TrackSnapshot};
use crate::app::config::TrackerSettings;

/// Builds the command whose stdout carries the track-devices stream.
pub type TrackCommandFactory = Arc<dyn Fn() -> Command + Send + Sync>;
pub type SnapshotListener = Arc<dyn Fn(TrackSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Starting,
    Streaming,
    Restarting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerOptions {
    pub not_found_backoff: Duration,
    pub failure_backoff: Duration,
    pub stop_timeout: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self::from(&TrackerSettings::default())
    }
}

impl From<&TrackerSettings> for TrackerOptions {
    fn from(settings: &TrackerSettings) -> Self {
        Self {
            not_found_backoff: Duration::from_millis(settings.not_found_backoff_ms),
            failure_backoff: Duration::from_millis(settings.failure_backoff_ms),
            stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
        }
    }
}

pub fn adb_track_command(adb_program: impl Into<String>) -> TrackCommandFactory {
    let adb_program = adb_program.into();
    Arc::new(move || {
        let mut command = Command::new(&adb_program);
        command.arg("track-devices");
        command
    })
}

type ChildSlot = Arc<Mutex<Option<Child>>>;
type StateSlot = Arc<Mutex<TrackerState>>;

/// Owns the long-lived `adb track-devices` child on a dedicated thread and
/// restarts it after failures until stopped.
pub struct TrackDevicesWorker {
    trace_id: String,
    stop_flag: Arc<AtomicBool>,
    child: ChildSlot,
    state: StateSlot,
    exit_rx: Mutex<Option<Receiver<()>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    stop_timeout: Duration,
}

impl TrackDevicesWorker {
    pub fn start(
        command_factory: TrackCommandFactory,
        listener: SnapshotListener,
        options: TrackerOptions,
        trace_id: impl Into<String>,
    ) -> Self {
        let trace_id = trace_id.into();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let child: ChildSlot = Arc::new(Mutex::new(None));
        let state: StateSlot = Arc::new(Mutex::new(TrackerState::Starting));
        let (exit_tx, exit_rx) = mpsc::channel::<()>();

        let context = TrackerLoop {
            trace_id: trace_id.clone(),
            stop_flag: Arc::clone(&stop_flag),
            child: Arc::clone(&child),
            state: Arc::clone(&state),
            command_factory,
            listener,
            options,
        };
        let join = thread::Builder::new()
            .name("adb-track-devices".to_string())
            .spawn(move || {
                context.run();
                let _ = exit_tx.send(());
            });
        let join = match join {
            Ok(join) => Some(join),
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "failed to spawn device tracker thread");
                set_state(&state, TrackerState::Stopped);
                None
            }
        };

        Self {
            trace_id,
            stop_flag,
            child,
            state,
            exit_rx: Mutex::new(Some(exit_rx)),
            join: Mutex::new(join),
            stop_timeout: options.stop_timeout,
        }
    }

    pub fn state(&self) -> TrackerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idempotent. Kills the child, then waits up to the stop timeout for the
    /// reader thread before giving up on it.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        kill_child(&self.child);

        let exit_rx = self.exit_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(exit_rx) = exit_rx else {
            return;
        };
        match exit_rx.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = join.join();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    trace_id = %self.trace_id,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "device tracker did not stop in time; detaching"
                );
            }
        }
        set_state(&self.state, TrackerState::Stopped);
        info!(trace_id = %self.trace_id, "device tracker stopped");
    }
}

impl Drop for TrackDevicesWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

enum StreamEnd {
    Eof,
    ReadError(std::io::Error),
    Stopped,
}

struct TrackerLoop {
    trace_id: String,
    stop_flag: Arc<AtomicBool>,
    child: ChildSlot,
    state: StateSlot,
    command_factory: TrackCommandFactory,
    listener: SnapshotListener,
    options: TrackerOptions,
}

impl TrackerLoop {
    fn stopped(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    fn run(self) {
        let mut parser = TrackDevicesStreamParser::new();
        while !self.stopped() {
            set_state(&self.state, TrackerState::Starting);
            let mut command = (self.command_factory)();
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(err) => {
                    let backoff = if err.kind() == ErrorKind::NotFound {
                        self.options.not_found_backoff
                    } else {
                        self.options.failure_backoff
                    };
                    warn!(
                        trace_id = %self.trace_id,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "failed to spawn adb device tracker"
                    );
                    self.restart_after(backoff);
                    continue;
                }
            };

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            {
                let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(mut previous) = guard.replace(child) {
                    let _ = previous.kill();
                    let _ = previous.wait();
                }
            }
            // stop() may have run between the flag check and storing the child.
            if self.stopped() {
                kill_child(&self.child);
                break;
            }

            let stderr_join = stderr.map(|stderr| self.drain_stderr(stderr));
            let outcome = match stdout {
                Some(stdout) => {
                    set_state(&self.state, TrackerState::Streaming);
                    info!(trace_id = %self.trace_id, "device tracker streaming");
                    self.pump(stdout, &mut parser)
                }
                None => StreamEnd::ReadError(std::io::Error::new(ErrorKind::BrokenPipe, "tracker stdout unavailable")),
            };

            kill_child(&self.child);
            if let Some(join) = stderr_join {
                let _ = join.join();
            }
            if parser.reset_stream() {
                warn!(trace_id = %self.trace_id, "device tracker stream ended mid-frame");
            }

            match outcome {
                StreamEnd::Stopped => break,
                StreamEnd::Eof => {
                    warn!(trace_id = %self.trace_id, "device tracker exited");
                }
                StreamEnd::ReadError(err) => {
                    warn!(trace_id = %self.trace_id, error = %err, "failed to read device tracker stdout");
                }
            }
            if self.stopped() {
                break;
            }
            self.restart_after(self.options.failure_backoff);
        }
        set_state(&self.state, TrackerState::Stopped);
    }

    fn restart_after(&self, backoff: Duration) {
        set_state(&self.state, TrackerState::Restarting);
        sleep_with_stop(backoff, &self.stop_flag);
    }

    fn pump(&self, mut stdout: impl Read, parser: &mut TrackDevicesStreamParser) -> StreamEnd {
        let mut buffer = [0u8; 4096];
        loop {
            if self.stopped() {
                return StreamEnd::Stopped;
            }
            let count = match stdout.read(&mut buffer) {
                Ok(0) => return if self.stopped() { StreamEnd::Stopped } else { StreamEnd::Eof },
                Ok(count) => count,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return if self.stopped() {
                        StreamEnd::Stopped
                    } else {
                        StreamEnd::ReadError(err)
                    };
                }
            };
            for snapshot in parser.push_bytes(&buffer[..count], &self.trace_id) {
                if self.stopped() {
                    return StreamEnd::Stopped;
                }
                debug!(trace_id = %self.trace_id, devices = snapshot.len(), "device tracker snapshot");
                (self.listener)(snapshot);
            }
        }
    }

    fn drain_stderr(&self, stderr: impl Read + Send + 'static) -> JoinHandle<()> {
        let trace_id = self.trace_id.clone();
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                let Ok(line) = line else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                warn!(trace_id = %trace_id, stderr = %line.trim(), "adb device tracker stderr");
            }
        })
    }
}

fn set_state(state: &StateSlot, next: TrackerState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

fn kill_child(slot: &ChildSlot) {
    let child = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(mut child) = child {
        let _ = child.kill();
        let _ = child.wait();
    }
}

pub(crate) fn sleep_with_stop(duration: Duration, stop_flag: &AtomicBool) {
    let mut remaining = duration;
    let chunk = Duration::from_millis(50);
    while !remaining.is_zero() {
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        let step = remaining.min(chunk);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}
