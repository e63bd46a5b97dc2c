//! Two-phase device loading: one bulk enumeration that yields basic records,
//! then bounded-concurrency detail enrichment per device.
//!
//! Phase 2 runs as lanes on the [`TaskDispatcher`]: the calling task drives one
//! lane itself and submits up to `max_concurrent - 1` helper lanes. Lanes pull
//! serials from a shared cursor, so a helper that only starts once the cursor
//! is exhausted exits at once and the caller never waits on queued work.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::adb::backend::DeviceBackend;
use crate::app::config::DEFAULT_MAX_CONCURRENT_DETAILS;
use crate::app::dispatcher::{TaskContext, TaskControl, TaskDispatcher, TaskSignals};
use crate::app::error::AppError;
use crate::app::models::{DeviceDetail, DeviceRecord};

/// Only devices in this state answer shell probes.
pub const PROBE_READY_STATE: &str = "device";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    BasicLoaded { serial: String, record: DeviceRecord },
    DetailedLoaded { serial: String, detail: DeviceDetail },
    LoadFailed { serial: String, reason: String },
    Progress { done: usize, total: usize },
    /// `serials` is everything phase 1 produced; `detail_targets` is what
    /// phase 2 will enrich.
    BasicPhaseComplete {
        serials: Vec<String>,
        detail_targets: Vec<String>,
    },
    DetailedPhaseComplete,
}

/// Parameters of a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerRequest {
    /// Restricts the run to these serials; empty means everything enumerated.
    pub serials: Vec<String>,
    /// `false` skips enumeration and enriches `serials` directly.
    pub load_basic: bool,
    pub load_detailed: bool,
    /// Serials whose detail is already complete and need no re-probe.
    pub skip_detail: HashSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub enumerated: usize,
    pub detailed: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub type TrackedPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type WorkerEmitter = Arc<dyn Fn(WorkerEvent) + Send + Sync>;

pub struct AsyncDeviceWorker {
    backend: Arc<dyn DeviceBackend>,
    dispatcher: Arc<TaskDispatcher>,
    is_tracked: TrackedPredicate,
    max_concurrent: usize,
}

impl AsyncDeviceWorker {
    pub fn new(backend: Arc<dyn DeviceBackend>, dispatcher: Arc<TaskDispatcher>, is_tracked: TrackedPredicate) -> Self {
        Self {
            backend,
            dispatcher,
            is_tracked,
            max_concurrent: DEFAULT_MAX_CONCURRENT_DETAILS,
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Runs phase 1 on the calling thread, then phase 2 with at most
    /// `max_concurrent` devices in flight. A cancelled run returns
    /// `AppError::cancelled` once in-flight devices have settled.
    pub fn run(
        &self,
        request: &WorkerRequest,
        control: &TaskControl,
        trace_id: &str,
        emit: &WorkerEmitter,
    ) -> Result<WorkerSummary, AppError> {
        let mut summary = WorkerSummary::default();
        let (serials, detail_targets) = if request.load_basic {
            self.load_basic(request, control, trace_id, emit, &mut summary)?
        } else {
            let targets: Vec<String> = request
                .serials
                .iter()
                .filter(|serial| !request.skip_detail.contains(*serial))
                .cloned()
                .collect();
            (request.serials.clone(), targets)
        };

        let detail_targets = if request.load_detailed { detail_targets } else { Vec::new() };
        emit(WorkerEvent::BasicPhaseComplete {
            serials,
            detail_targets: detail_targets.clone(),
        });

        if detail_targets.is_empty() {
            return Ok(summary);
        }
        self.load_details(detail_targets, control, trace_id, emit, &mut summary)?;
        emit(WorkerEvent::DetailedPhaseComplete);
        info!(
            trace_id = %trace_id,
            enumerated = summary.enumerated,
            detailed = summary.detailed,
            failed = summary.failed,
            skipped = summary.skipped,
            "device load finished"
        );
        Ok(summary)
    }

    fn load_basic(
        &self,
        request: &WorkerRequest,
        control: &TaskControl,
        trace_id: &str,
        emit: &WorkerEmitter,
        summary: &mut WorkerSummary,
    ) -> Result<(Vec<String>, Vec<String>), AppError> {
        let devices = self.backend.list_devices(trace_id)?;
        debug!(trace_id = %trace_id, count = devices.len(), "enumerated devices");

        let mut serials = Vec::new();
        let mut detail_targets = Vec::new();
        for summary_row in devices {
            if !request.serials.is_empty() && !request.serials.contains(&summary_row.serial) {
                continue;
            }
            if control.is_cancelled() {
                return Err(AppError::cancelled("device load cancelled", trace_id));
            }
            let record = DeviceRecord::from_summary(&summary_row);
            if record.state == PROBE_READY_STATE && !request.skip_detail.contains(&record.serial) {
                detail_targets.push(record.serial.clone());
            }
            serials.push(record.serial.clone());
            summary.enumerated += 1;
            emit(WorkerEvent::BasicLoaded {
                serial: record.serial.clone(),
                record,
            });
        }
        Ok((serials, detail_targets))
    }

    fn load_details(
        &self,
        targets: Vec<String>,
        control: &TaskControl,
        trace_id: &str,
        emit: &WorkerEmitter,
        summary: &mut WorkerSummary,
    ) -> Result<(), AppError> {
        let total = targets.len();
        emit(WorkerEvent::Progress { done: 0, total });

        let helpers = self.max_concurrent.min(total).saturating_sub(1);
        let lanes = Arc::new(DetailLanes {
            targets,
            backend: Arc::clone(&self.backend),
            is_tracked: Arc::clone(&self.is_tracked),
            control: control.clone(),
            trace_id: trace_id.to_string(),
            emit: Arc::clone(emit),
            state: Mutex::new(LaneState::default()),
            settled: Condvar::new(),
        });
        for lane in 0..helpers {
            let lanes = Arc::clone(&lanes);
            let context = TaskContext::new(format!("device_detail_lane_{lane}"))
                .with_category("discovery")
                .with_trace_id(trace_id);
            self.dispatcher
                .submit_detached(context, TaskSignals::<()>::new(), move |_: &TaskControl| {
                    lanes.drive();
                    Ok(())
                });
        }
        lanes.drive();
        let settled = lanes.close_and_wait();

        summary.detailed += settled.detailed;
        summary.failed += settled.failed;
        summary.skipped += settled.skipped;
        if control.is_cancelled() {
            info!(trace_id = %trace_id, done = settled.done, total, "device detail load cancelled");
            return Err(AppError::cancelled("device load cancelled", trace_id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LaneState {
    next: usize,
    in_flight: usize,
    closed: bool,
    done: usize,
    detailed: usize,
    failed: usize,
    skipped: usize,
}

/// Shared phase-2 work list. Every emit happens while a claim is held, so
/// nothing is emitted once `close_and_wait` has returned.
struct DetailLanes {
    targets: Vec<String>,
    backend: Arc<dyn DeviceBackend>,
    is_tracked: TrackedPredicate,
    control: TaskControl,
    trace_id: String,
    emit: WorkerEmitter,
    state: Mutex<LaneState>,
    settled: Condvar,
}

impl DetailLanes {
    fn lock(&self) -> std::sync::MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self) -> Option<Claim<'_>> {
        let mut state = self.lock();
        if state.closed || self.control.is_cancelled() || state.next >= self.targets.len() {
            return None;
        }
        let index = state.next;
        state.next += 1;
        state.in_flight += 1;
        Some(Claim {
            lanes: self,
            index,
            tally: None,
        })
    }

    fn drive(&self) {
        while let Some(mut claim) = self.claim() {
            let serial = &self.targets[claim.index];
            claim.tally = match self.load_one(serial) {
                DetailOutcome::Loaded(detail) => {
                    (self.emit)(WorkerEvent::DetailedLoaded {
                        serial: serial.clone(),
                        detail,
                    });
                    Some(Tally::Detailed)
                }
                DetailOutcome::Failed(reason) => {
                    (self.emit)(WorkerEvent::LoadFailed {
                        serial: serial.clone(),
                        reason,
                    });
                    Some(Tally::Failed)
                }
                DetailOutcome::Skipped => Some(Tally::Skipped),
                DetailOutcome::Discarded => None,
            };
        }
    }

    /// Stops further claims and blocks until every claimed device has settled.
    fn close_and_wait(&self) -> LaneState {
        let mut state = self.lock();
        state.closed = true;
        while state.in_flight > 0 {
            state = self.settled.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        *state
    }

    fn load_one(&self, serial: &str) -> DetailOutcome {
        if !(self.is_tracked)(serial) {
            debug!(trace_id = %self.trace_id, serial = %serial, "device no longer tracked; skipping detail");
            return DetailOutcome::Skipped;
        }
        let loaded = panic::catch_unwind(AssertUnwindSafe(|| self.backend.load_detail(serial, &self.trace_id)));
        if self.control.is_cancelled() {
            return DetailOutcome::Discarded;
        }
        match loaded {
            Ok(detail) if detail.known_field_count() > 0 => DetailOutcome::Loaded(detail),
            Ok(_) => DetailOutcome::Failed("no device properties could be read".to_string()),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(trace_id = %self.trace_id, serial = %serial, reason = %reason, "device detail probe panicked");
                DetailOutcome::Failed(reason)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Tally {
    Detailed,
    Failed,
    Skipped,
}

/// One device being enriched. Settles on drop, unwinding included.
struct Claim<'a> {
    lanes: &'a DetailLanes,
    index: usize,
    tally: Option<Tally>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut state = self.lanes.lock();
        if let Some(tally) = self.tally {
            match tally {
                Tally::Detailed => state.detailed += 1,
                Tally::Failed => state.failed += 1,
                Tally::Skipped => state.skipped += 1,
            }
            state.done += 1;
            (self.lanes.emit)(WorkerEvent::Progress {
                done: state.done,
                total: self.lanes.targets.len(),
            });
        }
        state.in_flight -= 1;
        self.lanes.settled.notify_all();
    }
}

enum DetailOutcome {
    Loaded(DeviceDetail),
    Failed(String),
    Skipped,
    Discarded,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return format!("detail load panicked: {message}");
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return format!("detail load panicked: {message}");
    }
    "detail load panicked".to_string()
}
