use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::app::adb::parse::{
    detail_from_getprop, parse_adb_devices, parse_audio_summary, parse_bluetooth_manager_state,
    parse_dumpsys_version_name, parse_getprop_map, parse_settings_bool, GMS_PACKAGE,
};
use crate::app::adb::runner::{run_command_with_timeout, CommandOutput};
use crate::app::error::AppError;
use crate::app::models::{DeviceDetail, DeviceSummary, Probe};
use crate::app::scheduler::TaskScheduler;

/// The device-facing side of discovery: one bulk listing call plus
/// independent per-device property probes.
pub trait DeviceBackend: Send + Sync {
    /// `Ok(vec![])` means no devices; `Err` means the listing itself failed.
    fn list_devices(&self, trace_id: &str) -> Result<Vec<DeviceSummary>, AppError>;

    /// Never fails as a whole: a probe that fails leaves its field `Unknown`.
    fn load_detail(&self, serial: &str, trace_id: &str) -> DeviceDetail;

    /// Called when a device leaves so per-device resources can be released.
    fn forget_device(&self, _serial: &str) {}
}

pub struct AdbBackend {
    program: String,
    scheduler: Arc<TaskScheduler>,
    list_timeout: Duration,
    probe_timeout: Duration,
}

impl AdbBackend {
    pub fn new(program: impl Into<String>, scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            program: program.into(),
            scheduler,
            list_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn shell(&self, serial: &str, step: &'static str, command: &[&str], trace_id: &str) -> Result<CommandOutput, AppError> {
        let mut args = vec!["-s".to_string(), serial.to_string(), "shell".to_string()];
        args.extend(command.iter().map(|part| part.to_string()));

        let started = Instant::now();
        let result = self.scheduler.with_device(serial, || {
            run_command_with_timeout(&self.program, &args, self.probe_timeout, trace_id)
        });
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) if output.success() => {
                debug!(trace_id = %trace_id, serial = %serial, step, elapsed_ms, "adb probe finished");
                Ok(output)
            }
            Ok(output) => {
                debug!(
                    trace_id = %trace_id,
                    serial = %serial,
                    step,
                    elapsed_ms,
                    exit_code = ?output.exit_code,
                    "adb probe exited non-zero"
                );
                Err(AppError::dependency(
                    format!("{step} failed: {}", output.stderr.trim()),
                    trace_id,
                ))
            }
            Err(err) => {
                warn!(trace_id = %trace_id, serial = %serial, step, elapsed_ms, error = %err, "adb probe failed");
                Err(err)
            }
        }
    }
}

impl DeviceBackend for AdbBackend {
    fn list_devices(&self, trace_id: &str) -> Result<Vec<DeviceSummary>, AppError> {
        let args = vec!["devices".to_string(), "-l".to_string()];
        let output = run_command_with_timeout(&self.program, &args, self.list_timeout, trace_id)?;
        if !output.success() {
            return Err(AppError::dependency(
                format!("adb devices failed: {}", output.stderr.trim()),
                trace_id,
            ));
        }
        Ok(parse_adb_devices(&output.stdout))
    }

    fn load_detail(&self, serial: &str, trace_id: &str) -> DeviceDetail {
        let mut detail = match self.shell(serial, "getprop", &["getprop"], trace_id) {
            Ok(output) => detail_from_getprop(&parse_getprop_map(&output.stdout)),
            Err(_) => DeviceDetail {
                android_version: Some(Probe::Unknown),
                api_level: Some(Probe::Unknown),
                build_fingerprint: Some(Probe::Unknown),
                ..DeviceDetail::default()
            },
        };

        let wifi = self
            .shell(serial, "wifi", &["settings", "get", "global", "wifi_on"], trace_id)
            .ok()
            .and_then(|output| parse_settings_bool(&output.stdout));
        detail.wifi_is_on = Some(Probe::from_option(wifi));

        let bluetooth = self
            .shell(serial, "bluetooth", &["settings", "get", "global", "bluetooth_on"], trace_id)
            .ok()
            .and_then(|output| parse_settings_bool(&output.stdout))
            .or_else(|| {
                self.shell(serial, "bluetooth_manager", &["cmd", "bluetooth_manager", "get-state"], trace_id)
                    .ok()
                    .and_then(|output| parse_bluetooth_manager_state(&output.stdout))
                    .map(|state| state.contains("ON"))
            });
        detail.bt_is_on = Some(Probe::from_option(bluetooth));

        let gms = self
            .shell(serial, "gms", &["dumpsys", "package", GMS_PACKAGE], trace_id)
            .ok()
            .and_then(|output| parse_dumpsys_version_name(&output.stdout));
        detail.gms_version = Some(Probe::from_option(gms));

        let audio = self
            .shell(serial, "audio", &["dumpsys", "audio"], trace_id)
            .ok()
            .and_then(|output| parse_audio_summary(&output.stdout));
        detail.audio_state = Some(Probe::from_option(audio));

        detail
    }

    fn forget_device(&self, serial: &str) {
        self.scheduler.forget_device(serial);
    }
}
