//! Discovery coordinator.
//!
//! A single coordinator thread owns the device cache, the serial alias table,
//! the tracked statuses and the pending-request slot. Requests, worker events,
//! tracker snapshots and run completions all arrive over one channel; timers
//! are driven by `recv_timeout`. Callers read a snapshot the coordinator
//! republishes after every message.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::adb::backend::{AdbBackend, DeviceBackend};
use crate::app::adb::device_tracking::{
    adb_track_command, SnapshotListener, TrackCommandFactory, TrackDevicesWorker, TrackerOptions, TrackerState,
};
use crate::app::adb::track_devices::TrackSnapshot;
use crate::app::config::{clamp_refresh_interval_secs, validate_config, DiscoveryConfig};
use crate::app::discovery::aliases::SerialAliasTable;
use crate::app::discovery::cache::DeviceCache;
use crate::app::discovery::worker::{
    AsyncDeviceWorker, WorkerEmitter, WorkerEvent, WorkerRequest, WorkerSummary, PROBE_READY_STATE,
};
use crate::app::dispatcher::{TaskContext, TaskDispatcher, TaskHandle, TaskSignals};
use crate::app::error::AppError;
use crate::app::models::{DeviceLoadProgress, DeviceRecord};
use crate::app::scheduler::TaskScheduler;

pub const READY_STATUSES: [&str; 5] = ["device", "unauthorized", "recovery", "bootloader", "sideload"];
pub const REMOVAL_STATUSES: [&str; 1] = ["offline"];
pub const UNAUTHORIZED_STATUS: &str = "unauthorized";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Ready,
    Removal,
    Transient,
}

pub fn classify_status(status: &str) -> StatusClass {
    let normalized = status.trim().to_ascii_lowercase();
    if READY_STATUSES.contains(&normalized.as_str()) {
        StatusClass::Ready
    } else if REMOVAL_STATUSES.contains(&normalized.as_str()) {
        StatusClass::Removal
    } else {
        StatusClass::Transient
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// Re-probe detail even for devices that are already fully loaded.
    pub force_reload: bool,
    pub load_detailed: bool,
    /// Restrict the run to these serials; `None` enumerates everything.
    pub serials: Option<Vec<String>>,
}

impl Default for DiscoveryRequest {
    fn default() -> Self {
        Self {
            force_reload: false,
            load_detailed: true,
            serials: None,
        }
    }
}

/// Outbound notifications. Device payloads are copies of the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    DiscoveryStarted { trace_id: String, refresh: bool },
    BasicLoaded { serial: String, record: DeviceRecord },
    DetailedLoaded { serial: String, record: DeviceRecord },
    LoadFailed { serial: String, reason: String },
    Progress { current: usize, total: usize },
    BasicDevicesReady { devices: Vec<DeviceRecord> },
    AllDevicesReady { devices: Vec<DeviceRecord> },
    UnauthorizedDevicesDetected { serials: Vec<String> },
}

pub type EventEmitter = Arc<dyn Fn(DiscoveryEvent) + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct SharedView {
    devices: Vec<DeviceRecord>,
    progress: HashMap<String, DeviceLoadProgress>,
    tracked: BTreeMap<String, String>,
    aliases: BTreeMap<String, String>,
    loading: bool,
    refresh_interval_secs: u64,
    auto_refresh: bool,
}

enum Command {
    Start(DiscoveryRequest),
    StopLoading,
    SetRefreshInterval(u64),
    SetAutoRefresh(bool),
    RefreshNow,
    ClearCache,
    Tracker(TrackSnapshot),
    Worker { run_id: u64, event: WorkerEvent },
    RunFailed { run_id: u64, error: AppError },
    RunEnded { run_id: u64 },
    Shutdown,
}

pub struct AsyncDeviceManager {
    commands: Sender<Command>,
    shared: Arc<RwLock<SharedView>>,
    tracker: Mutex<Option<TrackDevicesWorker>>,
    tracker_options: TrackerOptions,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    trace_id: String,
}

impl AsyncDeviceManager {
    pub fn new(
        config: &DiscoveryConfig,
        backend: Arc<dyn DeviceBackend>,
        dispatcher: Arc<TaskDispatcher>,
        emitter: EventEmitter,
    ) -> Result<Self, AppError> {
        let config = validate_config(config.clone());
        let trace_id = Uuid::new_v4().to_string();
        let (commands, receiver) = mpsc::channel::<Command>();
        let shared = Arc::new(RwLock::new(SharedView::default()));

        let coordinator = Coordinator::new(
            &config,
            backend,
            dispatcher,
            emitter,
            commands.clone(),
            Arc::clone(&shared),
            trace_id.clone(),
        );
        coordinator.publish();
        let join = thread::Builder::new()
            .name("device-coordinator".to_string())
            .spawn(move || coordinator.run(receiver))
            .map_err(|err| AppError::system(format!("Failed to spawn device coordinator: {err}"), &trace_id))?;
        info!(trace_id = %trace_id, "device manager started");

        Ok(Self {
            commands,
            shared,
            tracker: Mutex::new(None),
            tracker_options: TrackerOptions::from(&config.tracker),
            coordinator: Mutex::new(Some(join)),
            shutting_down: AtomicBool::new(false),
            trace_id,
        })
    }

    /// Wires the real adb backend and, when enabled, the track-devices listener.
    pub fn with_adb(config: &DiscoveryConfig, emitter: EventEmitter) -> Result<Self, AppError> {
        let config = validate_config(config.clone());
        let program = config.adb_program();
        let scheduler = Arc::new(TaskScheduler::new(
            config.dispatcher.max_threads.max(config.device.max_concurrent_details),
        ));
        let backend: Arc<dyn DeviceBackend> = Arc::new(AdbBackend::new(program.clone(), scheduler));
        let dispatcher = Arc::new(TaskDispatcher::new(config.dispatcher.max_threads));
        let manager = Self::new(&config, backend, dispatcher, emitter)?;
        if config.device.enable_tracker {
            manager.start_tracker(adb_track_command(program));
        }
        Ok(manager)
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Returns `false` when a tracker is already running or after shutdown.
    pub fn start_tracker(&self, command_factory: TrackCommandFactory) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let mut slot = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        let commands = self.commands.clone();
        let listener: SnapshotListener = Arc::new(move |snapshot: TrackSnapshot| {
            let _ = commands.send(Command::Tracker(snapshot));
        });
        *slot = Some(TrackDevicesWorker::start(
            command_factory,
            listener,
            self.tracker_options,
            self.trace_id.clone(),
        ));
        true
    }

    pub fn stop_tracker(&self) {
        let tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tracker) = tracker {
            tracker.stop();
        }
    }

    pub fn tracker_state(&self) -> Option<TrackerState> {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(TrackDevicesWorker::state)
    }

    pub fn start_discovery(&self, request: DiscoveryRequest) {
        self.send(Command::Start(request));
    }

    pub fn stop_current_loading(&self) {
        self.send(Command::StopLoading);
    }

    /// Returns the interval actually applied.
    pub fn set_refresh_interval(&self, secs: u64) -> u64 {
        let secs = clamp_refresh_interval_secs(secs);
        self.send(Command::SetRefreshInterval(secs));
        secs
    }

    pub fn set_auto_refresh_enabled(&self, enabled: bool) {
        self.send(Command::SetAutoRefresh(enabled));
    }

    /// Runs the periodic refresh now instead of waiting for the timer.
    pub fn refresh_now(&self) {
        self.send(Command::RefreshNow);
    }

    pub fn clear_cache(&self) {
        self.send(Command::ClearCache);
    }

    /// Feeds a snapshot as if it came from the tracker.
    pub fn ingest_tracker_snapshot(&self, snapshot: TrackSnapshot) {
        self.send(Command::Tracker(snapshot));
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.view().devices.clone()
    }

    pub fn device(&self, serial: &str) -> Option<DeviceRecord> {
        self.view().devices.iter().find(|record| record.serial == serial).cloned()
    }

    pub fn load_progress(&self, serial: &str) -> Option<DeviceLoadProgress> {
        self.view().progress.get(serial).cloned()
    }

    /// Latest tracker status per canonical serial.
    pub fn tracked_statuses(&self) -> BTreeMap<String, String> {
        self.view().tracked.clone()
    }

    pub fn serial_aliases(&self) -> BTreeMap<String, String> {
        self.view().aliases.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.view().loading
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.view().refresh_interval_secs)
    }

    pub fn is_auto_refresh_enabled(&self) -> bool {
        self.view().auto_refresh
    }

    /// Stops the tracker, cancels the active run and clears all state.
    /// Later requests are ignored.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(trace_id = %self.trace_id, "device manager shutting down");
        self.stop_tracker();
        let _ = self.commands.send(Command::Shutdown);
        let join = self.coordinator.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(join) = join {
            if join.join().is_err() {
                warn!(trace_id = %self.trace_id, "device coordinator panicked");
            }
        }
    }

    fn send(&self, command: Command) {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!(trace_id = %self.trace_id, "device manager is shut down; request ignored");
            return;
        }
        if self.commands.send(command).is_err() {
            warn!(trace_id = %self.trace_id, "device coordinator is gone; request dropped");
        }
    }

    fn view(&self) -> std::sync::RwLockReadGuard<'_, SharedView> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AsyncDeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone)]
enum RunKind {
    Discovery(DiscoveryRequest),
    Refresh,
}

struct ActiveRun {
    run_id: u64,
    kind: RunKind,
    trace_id: String,
    handle: TaskHandle<WorkerSummary>,
    /// Fully loaded serials this run does not re-probe.
    skip_detail: HashSet<String>,
    cancelled: bool,
    failure: Option<AppError>,
}

struct Coordinator {
    backend: Arc<dyn DeviceBackend>,
    dispatcher: Arc<TaskDispatcher>,
    emitter: EventEmitter,
    commands: Sender<Command>,
    shared: Arc<RwLock<SharedView>>,
    gone: Arc<Mutex<HashSet<String>>>,
    trace_id: String,

    cache: DeviceCache,
    aliases: SerialAliasTable,
    /// Observed serial -> normalized status from the latest snapshot.
    /// Published keyed by canonical serial.
    tracked: BTreeMap<String, String>,
    tracked_seen: bool,
    tracked_ready: BTreeSet<String>,
    unauthorized: BTreeSet<String>,
    last_discovered_ready: BTreeSet<String>,

    active: Option<ActiveRun>,
    pending: Option<DiscoveryRequest>,
    next_run_id: u64,

    load_detailed: bool,
    max_concurrent: usize,
    refresh_interval: Duration,
    auto_refresh: bool,
    pending_retry: Duration,
    enumeration_retry: Duration,
    pending_retry_at: Option<Instant>,
    enumeration_retry_at: Option<Instant>,
    next_refresh_at: Option<Instant>,
}

impl Coordinator {
    fn new(
        config: &DiscoveryConfig,
        backend: Arc<dyn DeviceBackend>,
        dispatcher: Arc<TaskDispatcher>,
        emitter: EventEmitter,
        commands: Sender<Command>,
        shared: Arc<RwLock<SharedView>>,
        trace_id: String,
    ) -> Self {
        let refresh_interval = config.refresh_interval();
        let auto_refresh = config.device.auto_refresh;
        Self {
            backend,
            dispatcher,
            emitter,
            commands,
            shared,
            gone: Arc::new(Mutex::new(HashSet::new())),
            trace_id,
            cache: DeviceCache::new(),
            aliases: SerialAliasTable::new(),
            tracked: BTreeMap::new(),
            tracked_seen: false,
            tracked_ready: BTreeSet::new(),
            unauthorized: BTreeSet::new(),
            last_discovered_ready: BTreeSet::new(),
            active: None,
            pending: None,
            next_run_id: 1,
            load_detailed: config.device.load_detailed,
            max_concurrent: config.device.max_concurrent_details,
            refresh_interval,
            auto_refresh,
            pending_retry: Duration::from_millis(config.coordinator.pending_retry_ms),
            enumeration_retry: Duration::from_millis(config.coordinator.enumeration_retry_ms),
            pending_retry_at: None,
            enumeration_retry_at: None,
            next_refresh_at: auto_refresh.then(|| Instant::now() + refresh_interval),
        }
    }

    fn run(mut self, receiver: Receiver<Command>) {
        loop {
            let command = match self.next_deadline() {
                Some(deadline) => match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match receiver.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };
            if let Some(command) = command {
                if !self.handle(command) {
                    self.publish();
                    break;
                }
            }
            self.fire_due_timers(Instant::now());
            self.publish();
        }
        debug!(trace_id = %self.trace_id, "device coordinator exited");
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start(request) => self.request_discovery(request, "request"),
            Command::StopLoading => self.stop_loading(),
            Command::SetRefreshInterval(secs) => {
                self.refresh_interval = Duration::from_secs(clamp_refresh_interval_secs(secs));
                if self.auto_refresh {
                    self.next_refresh_at = Some(Instant::now() + self.refresh_interval);
                }
                info!(trace_id = %self.trace_id, secs = self.refresh_interval.as_secs(), "refresh interval updated");
            }
            Command::SetAutoRefresh(enabled) => {
                self.auto_refresh = enabled;
                self.next_refresh_at = enabled.then(|| Instant::now() + self.refresh_interval);
                info!(trace_id = %self.trace_id, enabled, "auto refresh toggled");
            }
            Command::RefreshNow => self.periodic_refresh(),
            Command::ClearCache => {
                self.cache.clear();
                self.aliases.clear();
                self.last_discovered_ready.clear();
                info!(trace_id = %self.trace_id, "device cache cleared");
            }
            Command::Tracker(snapshot) => self.on_tracker_snapshot(snapshot),
            Command::Worker { run_id, event } => self.on_worker_event(run_id, event),
            Command::RunFailed { run_id, error } => {
                if let Some(run) = self.active.as_mut().filter(|run| run.run_id == run_id) {
                    run.failure = Some(error);
                }
            }
            Command::RunEnded { run_id } => self.on_run_ended(run_id),
            Command::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.pending_retry_at, self.enumeration_retry_at, self.next_refresh_at]
            .into_iter()
            .flatten()
            .min()
    }

    fn fire_due_timers(&mut self, now: Instant) {
        if self.pending_retry_at.is_some_and(|at| now >= at) {
            self.pending_retry_at = None;
            if self.active.is_some() {
                self.pending_retry_at = Some(now + self.pending_retry);
            } else if let Some(request) = self.pending.take() {
                debug!(trace_id = %self.trace_id, "starting queued discovery");
                self.launch(RunKind::Discovery(request));
            }
        }

        if self.enumeration_retry_at.is_some_and(|at| now >= at) {
            self.enumeration_retry_at = None;
            if self.active.is_none() && self.pending.is_none() {
                info!(trace_id = %self.trace_id, "retrying device enumeration");
                self.launch(RunKind::Discovery(DiscoveryRequest {
                    force_reload: true,
                    load_detailed: self.load_detailed,
                    serials: None,
                }));
            }
        }

        if self.next_refresh_at.is_some_and(|at| now >= at) {
            self.next_refresh_at = Some(now + self.refresh_interval);
            self.periodic_refresh();
        }
    }

    fn request_discovery(&mut self, request: DiscoveryRequest, origin: &'static str) {
        if self.active.is_some() {
            if self.pending.replace(request).is_some() {
                debug!(trace_id = %self.trace_id, origin, "replaced queued discovery request");
            } else {
                info!(trace_id = %self.trace_id, origin, "discovery already running; request queued");
            }
            if self.pending_retry_at.is_none() {
                self.pending_retry_at = Some(Instant::now() + self.pending_retry);
            }
            return;
        }
        self.launch(RunKind::Discovery(request));
    }

    fn periodic_refresh(&mut self) {
        if self.active.is_some() {
            debug!(trace_id = %self.trace_id, "skipping refresh while a run is active");
            return;
        }
        if self.cache.is_empty() {
            self.launch(RunKind::Discovery(DiscoveryRequest {
                force_reload: false,
                load_detailed: self.load_detailed,
                serials: None,
            }));
        } else {
            self.launch(RunKind::Refresh);
        }
    }

    fn stop_loading(&mut self) {
        if let Some(run) = self.active.as_mut() {
            if !run.cancelled {
                run.cancelled = true;
                run.handle.cancel();
                info!(trace_id = %run.trace_id, "device loading stopped");
            }
        }
        if self.pending.take().is_some() {
            debug!(trace_id = %self.trace_id, "dropped queued discovery request");
        }
        self.pending_retry_at = None;
    }

    fn launch(&mut self, kind: RunKind) {
        let run_id = self.next_run_id;
        self.next_run_id += 1;
        self.enumeration_retry_at = None;

        let (name, request) = match &kind {
            RunKind::Discovery(request) => {
                let skip_detail = if request.force_reload {
                    HashSet::new()
                } else {
                    self.cache
                        .serials()
                        .into_iter()
                        .filter(|serial| self.cache.is_fully_loaded(serial))
                        .collect()
                };
                let serials = request.serials.clone().unwrap_or_default();
                for serial in serials.iter().filter(|serial| !skip_detail.contains(*serial)) {
                    self.cache.mark_discovering(serial);
                }
                let worker_request = WorkerRequest {
                    serials,
                    load_basic: true,
                    load_detailed: request.load_detailed,
                    skip_detail,
                };
                ("device_discovery", worker_request)
            }
            RunKind::Refresh => {
                let serials = self
                    .cache
                    .snapshot()
                    .into_iter()
                    .filter(|record| record.state == PROBE_READY_STATE)
                    .map(|record| record.serial)
                    .collect();
                let worker_request = WorkerRequest {
                    serials,
                    load_basic: false,
                    load_detailed: true,
                    skip_detail: HashSet::new(),
                };
                ("device_refresh", worker_request)
            }
        };

        let context = TaskContext::new(name).with_category("discovery");
        let trace_id = context.trace_id.clone();
        info!(trace_id = %trace_id, run_id, kind = name, "device load started");
        self.emit(DiscoveryEvent::DiscoveryStarted {
            trace_id: trace_id.clone(),
            refresh: matches!(kind, RunKind::Refresh),
        });

        let gone = Arc::clone(&self.gone);
        let skip_detail = request.skip_detail.clone();
        let worker = AsyncDeviceWorker::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.dispatcher),
            Arc::new(move |serial: &str| {
                !gone
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains(serial)
            }),
        )
        .with_max_concurrent(self.max_concurrent);

        let failed_tx = self.commands.clone();
        let finished_tx = self.commands.clone();
        let signals = TaskSignals::new()
            .on_failed(move |error| {
                let _ = failed_tx.send(Command::RunFailed { run_id, error });
            })
            .on_finished(move || {
                let _ = finished_tx.send(Command::RunEnded { run_id });
            });

        let events = self.commands.clone();
        let emit: WorkerEmitter = Arc::new(move |event: WorkerEvent| {
            let _ = events.send(Command::Worker { run_id, event });
        });
        let task_trace_id = trace_id.clone();
        let handle = self.dispatcher.submit(context, signals, move |control| {
            worker.run(&request, control, &task_trace_id, &emit)
        });

        self.active = Some(ActiveRun {
            run_id,
            kind,
            trace_id,
            handle,
            skip_detail,
            cancelled: false,
            failure: None,
        });
    }

    fn on_worker_event(&mut self, run_id: u64, event: WorkerEvent) {
        let Some((kind, skip_detail)) = self
            .active
            .as_ref()
            .filter(|run| run.run_id == run_id && !run.cancelled)
            .map(|run| (run.kind.clone(), run.skip_detail.contains(event_serial(&event))))
        else {
            debug!(trace_id = %self.trace_id, run_id, "discarding event from a stale run");
            return;
        };

        match event {
            WorkerEvent::BasicLoaded { serial, record } => {
                self.mark_present(&serial);
                let merged = if skip_detail {
                    self.cache.apply_basic_keeping_detail(&record)
                } else {
                    self.cache.apply_basic(&record)
                };
                if merged.state != UNAUTHORIZED_STATUS {
                    self.unauthorized.remove(&serial);
                }
                self.emit(DiscoveryEvent::BasicLoaded { serial, record: merged });
            }
            WorkerEvent::DetailedLoaded { serial, detail } => match self.cache.apply_detail(&serial, &detail) {
                Some(record) => self.emit(DiscoveryEvent::DetailedLoaded { serial, record }),
                None => debug!(trace_id = %self.trace_id, serial = %serial, "device left before its detail arrived"),
            },
            WorkerEvent::LoadFailed { serial, reason } => {
                if !self.cache.contains(&serial) {
                    return;
                }
                warn!(trace_id = %self.trace_id, serial = %serial, reason = %reason, "device detail load failed");
                self.cache.record_failure(&serial, &reason);
                self.emit(DiscoveryEvent::LoadFailed { serial, reason });
            }
            WorkerEvent::Progress { done, total } => {
                self.emit(DiscoveryEvent::Progress { current: done, total });
            }
            WorkerEvent::BasicPhaseComplete {
                serials,
                detail_targets,
            } => self.on_basic_phase_complete(&kind, serials, detail_targets),
            WorkerEvent::DetailedPhaseComplete => {
                self.emit(DiscoveryEvent::AllDevicesReady {
                    devices: self.cache.snapshot(),
                });
            }
        }
    }

    fn on_basic_phase_complete(&mut self, kind: &RunKind, serials: Vec<String>, detail_targets: Vec<String>) {
        for target in &detail_targets {
            self.cache.mark_detail_loading(target);
        }

        if let RunKind::Discovery(request) = kind {
            match &request.serials {
                None => {
                    for serial in self.cache.retain_serials(&serials) {
                        self.purge_device(&serial);
                    }
                    self.last_discovered_ready = serials
                        .iter()
                        .filter(|serial| {
                            self.cache
                                .get(serial)
                                .is_some_and(|record| classify_status(&record.state) == StatusClass::Ready)
                        })
                        .cloned()
                        .collect();
                    self.resolve_tracked_aliases(&serials);
                }
                Some(requested) => {
                    for serial in requested.iter().filter(|serial| !serials.contains(serial)) {
                        self.cache.record_failure(serial, "device not found during enumeration");
                    }
                }
            }

            let unauthorized: Vec<String> = serials
                .iter()
                .filter(|serial| {
                    self.cache
                        .get(serial)
                        .is_some_and(|record| record.state == UNAUTHORIZED_STATUS)
                })
                .cloned()
                .collect();
            self.notify_unauthorized(unauthorized);
            self.emit(DiscoveryEvent::BasicDevicesReady {
                devices: self.cache.snapshot(),
            });
        }

        if detail_targets.is_empty() {
            self.emit(DiscoveryEvent::AllDevicesReady {
                devices: self.cache.snapshot(),
            });
        }
    }

    fn on_run_ended(&mut self, run_id: u64) {
        if self.active.as_ref().map(|run| run.run_id) != Some(run_id) {
            return;
        }
        let Some(run) = self.active.take() else {
            return;
        };

        if let Some(error) = run.failure {
            match run.kind {
                RunKind::Discovery(_) if error.is_dependency() => {
                    warn!(
                        trace_id = %run.trace_id,
                        error = %error,
                        retry_ms = self.enumeration_retry.as_millis() as u64,
                        "device enumeration failed; keeping cached devices"
                    );
                    self.emit(DiscoveryEvent::BasicDevicesReady {
                        devices: self.cache.snapshot(),
                    });
                    if self.pending.is_none() {
                        self.enumeration_retry_at = Some(Instant::now() + self.enumeration_retry);
                    }
                }
                _ => {
                    warn!(trace_id = %run.trace_id, error = %error, "device load failed");
                    self.emit(DiscoveryEvent::AllDevicesReady {
                        devices: self.cache.snapshot(),
                    });
                }
            }
        } else {
            debug!(trace_id = %run.trace_id, cancelled = run.cancelled, "device load ended");
        }
        let settled = self.cache.settle_interrupted();
        if settled > 0 {
            debug!(trace_id = %run.trace_id, settled, "reset progress left mid-load");
        }

        if let Some(request) = self.pending.take() {
            self.pending_retry_at = None;
            self.launch(RunKind::Discovery(request));
        }
    }

    fn on_tracker_snapshot(&mut self, snapshot: TrackSnapshot) {
        let current: BTreeMap<String, String> = snapshot
            .into_iter()
            .map(|entry| (entry.serial.trim().to_string(), entry.status.trim().to_ascii_lowercase()))
            .filter(|(serial, _)| !serial.is_empty())
            .collect();
        if self.tracked_seen && current == self.tracked {
            debug!(trace_id = %self.trace_id, "tracker snapshot unchanged");
            return;
        }

        // Departures are resolved through the aliases known before this snapshot.
        let mut removed: BTreeSet<String> = self
            .tracked
            .keys()
            .filter(|observed| !current.contains_key(*observed))
            .map(|observed| self.aliases.canonical(observed))
            .collect();

        let cached = self.cache.serials();
        let unclaimed: Vec<String> = cached
            .iter()
            .filter(|serial| !current.contains_key(*serial))
            .cloned()
            .collect();
        let mut canonical_status: BTreeMap<String, String> = BTreeMap::new();
        let mut unexpected = false;
        for (observed, status) in &current {
            let canonical = if cached.contains(observed) {
                observed.clone()
            } else {
                self.aliases
                    .resolve(observed, &unclaimed)
                    .unwrap_or_else(|| observed.clone())
            };
            match classify_status(status) {
                StatusClass::Removal => {
                    removed.insert(canonical.clone());
                }
                StatusClass::Transient => unexpected = true,
                StatusClass::Ready => {}
            }
            canonical_status.insert(canonical, status.clone());
        }

        let ready: BTreeSet<String> = canonical_status
            .iter()
            .filter(|(_, status)| classify_status(status) == StatusClass::Ready)
            .map(|(serial, _)| serial.clone())
            .collect();
        removed.retain(|serial| !ready.contains(serial));
        for serial in &removed {
            self.purge_device(serial);
        }
        if !removed.is_empty() {
            self.emit(DiscoveryEvent::BasicDevicesReady {
                devices: self.cache.snapshot(),
            });
        }

        let new_ready: Vec<String> = ready
            .iter()
            .filter(|serial| !self.cache.contains(serial) && !self.tracked_ready.contains(*serial))
            .cloned()
            .collect();
        for serial in &ready {
            self.mark_present(serial);
        }

        let unauthorized: Vec<String> = canonical_status
            .iter()
            .filter(|(_, status)| status.as_str() == UNAUTHORIZED_STATUS)
            .map(|(serial, _)| serial.clone())
            .collect();
        self.unauthorized.retain(|serial| unauthorized.contains(serial));
        self.notify_unauthorized(unauthorized);

        let ready_changed = ready != self.last_discovered_ready;
        self.tracked = current;
        self.tracked_seen = true;
        self.tracked_ready = ready;

        let needs_discovery = !removed.is_empty() || !new_ready.is_empty() || ready_changed || unexpected;
        debug!(
            trace_id = %self.trace_id,
            removed = removed.len(),
            new_ready = new_ready.len(),
            ready_changed,
            unexpected,
            "tracker snapshot reconciled"
        );
        if needs_discovery {
            self.request_discovery(
                DiscoveryRequest {
                    force_reload: true,
                    load_detailed: self.load_detailed,
                    serials: None,
                },
                "tracker",
            );
        }
    }

    /// Maps tracked serials that enumeration does not know onto enumerated ones.
    fn resolve_tracked_aliases(&mut self, enumerated: &[String]) {
        let unclaimed: Vec<String> = enumerated
            .iter()
            .filter(|serial| !self.tracked.contains_key(*serial))
            .cloned()
            .collect();
        let observed: Vec<String> = self
            .tracked
            .keys()
            .filter(|observed| !enumerated.contains(observed))
            .cloned()
            .collect();
        for observed in observed {
            self.aliases.resolve(&observed, &unclaimed);
        }
        self.tracked_ready = self
            .tracked
            .iter()
            .filter(|(_, status)| classify_status(status) == StatusClass::Ready)
            .map(|(observed, _)| self.aliases.canonical(observed))
            .collect();
    }

    fn purge_device(&mut self, canonical: &str) {
        let had_entry = self.cache.remove(canonical);
        let aliases = self.aliases.purge_canonical(canonical);
        self.unauthorized.remove(canonical);
        self.last_discovered_ready.remove(canonical);
        self.gone
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(canonical.to_string());
        self.backend.forget_device(canonical);
        info!(
            trace_id = %self.trace_id,
            serial = %canonical,
            cached = had_entry,
            aliases = aliases.len(),
            "device removed"
        );
    }

    fn mark_present(&self, serial: &str) {
        self.gone
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(serial);
    }

    fn notify_unauthorized(&mut self, serials: Vec<String>) {
        let fresh: Vec<String> = serials
            .into_iter()
            .filter(|serial| self.unauthorized.insert(serial.clone()))
            .collect();
        if !fresh.is_empty() {
            info!(trace_id = %self.trace_id, serials = ?fresh, "unauthorized devices detected");
            self.emit(DiscoveryEvent::UnauthorizedDevicesDetected { serials: fresh });
        }
    }

    fn shutdown(&mut self) {
        self.next_refresh_at = None;
        self.pending_retry_at = None;
        self.enumeration_retry_at = None;
        self.pending = None;
        if let Some(run) = self.active.take() {
            run.handle.cancel();
        }
        self.cache.clear();
        self.aliases.clear();
        self.tracked.clear();
        self.tracked_ready.clear();
        self.unauthorized.clear();
        self.last_discovered_ready.clear();
        self.gone.lock().unwrap_or_else(PoisonError::into_inner).clear();
        info!(trace_id = %self.trace_id, "device coordinator stopped");
    }

    fn emit(&self, event: DiscoveryEvent) {
        (self.emitter)(event);
    }

    fn publish(&self) {
        let mut view = self.shared.write().unwrap_or_else(PoisonError::into_inner);
        view.devices = self.cache.snapshot();
        view.progress = self.cache.progress_snapshot();
        view.tracked = self
            .tracked
            .iter()
            .map(|(observed, status)| (self.aliases.canonical(observed), status.clone()))
            .collect();
        view.aliases = self.aliases.entries();
        view.loading = self.active.is_some();
        view.refresh_interval_secs = self.refresh_interval.as_secs();
        view.auto_refresh = self.auto_refresh;
    }
}

fn event_serial(event: &WorkerEvent) -> &str {
    match event {
        WorkerEvent::BasicLoaded { serial, .. }
        | WorkerEvent::DetailedLoaded { serial, .. }
        | WorkerEvent::LoadFailed { serial, .. } => serial,
        _ => "",
    }
}
