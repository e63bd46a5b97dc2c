use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lazy_blacktea_devices_lib::app::config::load_config;
use lazy_blacktea_devices_lib::app::logging::init_logging_with_default;
use lazy_blacktea_devices_lib::app::models::{DeviceRecord, Probe};
use lazy_blacktea_devices_lib::{AsyncDeviceManager, DiscoveryEvent, DiscoveryRequest, EventEmitter};
use serde::Serialize;

#[derive(Debug, Clone)]
struct Args {
    duration_secs: u64,
    load_detailed: bool,
    tracker: bool,
    refresh_secs: Option<u64>,
    json: bool,
}

#[derive(Serialize)]
struct WatchSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    adb_program: String,
    events: usize,
    devices: Vec<DeviceRecord>,
}

const USAGE: &str = "Usage: cargo run --bin device_watch -- [--duration-secs N] [--no-detail] [--no-tracker] [--refresh-secs N] [--json]\n";

fn parse_args() -> Result<Args, String> {
    let mut duration_secs: u64 = 60;
    let mut load_detailed = true;
    let mut tracker = true;
    let mut refresh_secs: Option<u64> = None;
    let mut json = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--duration-secs" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--duration-secs requires a value".to_string())?;
                duration_secs = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| "--duration-secs must be a number".to_string())?;
            }
            "--refresh-secs" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--refresh-secs requires a value".to_string())?;
                refresh_secs = Some(
                    value
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| "--refresh-secs must be a number".to_string())?,
                );
            }
            "--no-detail" => load_detailed = false,
            "--no-tracker" => tracker = false,
            "--json" => json = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}\n{USAGE}")),
        }
    }

    Ok(Args {
        duration_secs: duration_secs.max(1),
        load_detailed,
        tracker,
        refresh_secs,
        json,
    })
}

fn probe_text<T: ToString>(probe: &Option<Probe<T>>) -> String {
    match probe {
        Some(Probe::Known(value)) => value.to_string(),
        Some(Probe::Unknown) => "unknown".to_string(),
        None => "-".to_string(),
    }
}

fn describe(record: &DeviceRecord) -> String {
    format!(
        "{} [{}] model={} android={} api={} wifi={} bt={}",
        record.serial,
        record.state,
        record.model.as_deref().unwrap_or("-"),
        probe_text(&record.detail.android_version),
        probe_text(&record.detail.api_level),
        probe_text(&record.detail.wifi_is_on),
        probe_text(&record.detail.bt_is_on),
    )
}

fn print_human(event: &DiscoveryEvent) {
    match event {
        DiscoveryEvent::DiscoveryStarted { trace_id, refresh } => {
            let kind = if *refresh { "refresh" } else { "discovery" };
            println!("{kind} started ({trace_id})");
        }
        DiscoveryEvent::BasicLoaded { record, .. } => println!("  basic    {}", describe(record)),
        DiscoveryEvent::DetailedLoaded { record, .. } => println!("  detail   {}", describe(record)),
        DiscoveryEvent::LoadFailed { serial, reason } => println!("  failed   {serial}: {reason}"),
        DiscoveryEvent::Progress { current, total } => println!("  progress {current}/{total}"),
        DiscoveryEvent::BasicDevicesReady { devices } => println!("basic info ready: {} device(s)", devices.len()),
        DiscoveryEvent::AllDevicesReady { devices } => {
            println!("all devices ready: {} device(s)", devices.len());
            for record in devices {
                println!("  {}", describe(record));
            }
        }
        DiscoveryEvent::UnauthorizedDevicesDetected { serials } => {
            println!("unauthorized: {} (accept the USB debugging prompt)", serials.join(", "));
        }
    }
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };
    init_logging_with_default("warn");

    let mut config = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to load config: {err}");
            std::process::exit(1);
        }
    };
    config.device.load_detailed = args.load_detailed;
    config.device.enable_tracker = args.tracker;
    if let Some(secs) = args.refresh_secs {
        config.device.refresh_interval_secs = secs;
        config.device.auto_refresh = true;
    }
    let adb_program = config.adb_program();

    let (tx, rx) = mpsc::channel::<DiscoveryEvent>();
    let tx = Mutex::new(tx);
    let emitter: EventEmitter = Arc::new(move |event: DiscoveryEvent| {
        let sender = tx.lock().unwrap_or_else(|p| p.into_inner());
        let _ = sender.send(event);
    });

    let manager = match AsyncDeviceManager::with_adb(&config, emitter) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("Failed to start device manager: {err}");
            std::process::exit(1);
        }
    };
    manager.start_discovery(DiscoveryRequest {
        force_reload: true,
        load_detailed: args.load_detailed,
        serials: None,
    });

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut events = 0usize;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match rx.recv_timeout(remaining) {
            Ok(event) => {
                events += 1;
                if args.json {
                    println!("{}", serde_json::to_string(&event).unwrap_or_default());
                } else {
                    print_human(&event);
                }
            }
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let devices = manager.devices();
    let summary = WatchSummary {
        tool: "lazy_blacktea_device_watch",
        status: "pass",
        trace_id: manager.trace_id().to_string(),
        adb_program,
        events,
        devices,
    };
    manager.shutdown();

    if args.json {
        println!("{}", serde_json::to_string(&summary).unwrap_or_default());
    } else {
        println!(
            "status: {}\nevents: {}\ndevices: {}\n",
            summary.status,
            summary.events,
            summary.devices.len()
        );
    }
}
