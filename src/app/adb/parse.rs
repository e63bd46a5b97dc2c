use std::collections::HashMap;

use regex::Regex;

use crate::app::models::{DeviceDetail, DeviceSummary, Probe};

pub const GMS_PACKAGE: &str = "com.google.android.gms";

/// Parses `adb devices [-l]`. Banner and daemon (`* ...`) lines are skipped.
pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('*') && !line.starts_with('#'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?;
            let state = tokens.next()?;
            let mut summary = DeviceSummary::new(serial, state);
            for token in tokens {
                let Some((key, value)) = token.split_once(':') else {
                    continue;
                };
                let value = Some(value.to_string());
                match key {
                    "usb" => summary.usb = value,
                    "product" => summary.product = value,
                    "model" => summary.model = value,
                    "device" => summary.device = value,
                    "transport_id" => summary.transport_id = value,
                    _ => {}
                }
            }
            Some(summary)
        })
        .collect()
}

pub fn parse_getprop_map(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            continue;
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            continue;
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// Fills the getprop-backed fields; the rest stay unobserved.
pub fn detail_from_getprop(getprop_map: &HashMap<String, String>) -> DeviceDetail {
    let probe = |key: &str| Some(Probe::from_option(getprop_map.get(key).cloned()));
    DeviceDetail {
        android_version: probe("ro.build.version.release"),
        api_level: probe("ro.build.version.sdk"),
        build_fingerprint: probe("ro.build.fingerprint"),
        ..DeviceDetail::default()
    }
}

pub fn parse_settings_bool(output: &str) -> Option<bool> {
    let value = output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())?;
    if let Ok(num) = value.parse::<i32>() {
        return Some(num != 0);
    }
    match value.to_lowercase().as_str() {
        "true" | "on" | "enabled" => Some(true),
        "false" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

pub fn parse_bluetooth_manager_state(output: &str) -> Option<String> {
    let state_re = Regex::new(r"(?i)state\s*[:=]\s*([A-Za-z_]+)").ok()?;
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| state_re.captures(line).map(|caps| caps[1].to_uppercase()))
}

pub fn parse_audio_summary(output: &str) -> Option<String> {
    let patterns = [
        ("mode", r"(?i)^\s*mode\s*[:=]\s*([A-Za-z_]+)"),
        ("ringer", r"(?i)ringer\s+mode\s*[:=]\s*([A-Za-z_]+)"),
        ("music_active", r"(?i)music\s+active\s*[:=]\s*([A-Za-z_]+)"),
    ];
    let compiled = patterns
        .iter()
        .map(|(label, pattern)| Regex::new(pattern).map(|re| (*label, re)))
        .collect::<Result<Vec<_>, _>>()
        .ok()?;

    let mut found: Vec<Option<String>> = vec![None; compiled.len()];
    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        for (index, (_, re)) in compiled.iter().enumerate() {
            if found[index].is_some() {
                continue;
            }
            if let Some(caps) = re.captures(line) {
                found[index] = Some(caps[1].to_string());
                break;
            }
        }
        if found.iter().all(Option::is_some) {
            break;
        }
    }

    let parts = compiled
        .iter()
        .zip(found)
        .filter_map(|((label, _), value)| value.map(|value| format!("{label}={value}")))
        .collect::<Vec<_>>();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

pub fn parse_dumpsys_version_name(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.split_once("versionName=").map(|(_, tail)| tail))
        .and_then(|tail| tail.split_whitespace().next())
        .map(|value| value.trim_matches(['"', '\'']).to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_adb_devices_long_output() {
        let output = "* daemon started successfully\nList of devices attached\n0123456789ABCDEF device usb:1-1 product:panther model:Pixel_7 device:panther transport_id:1\nemulator-5554\tunauthorized\n\n";
        let parsed = parse_adb_devices(output);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].serial, "0123456789ABCDEF");
        assert_eq!(parsed[0].state, "device");
        assert_eq!(parsed[0].usb.as_deref(), Some("1-1"));
        assert_eq!(parsed[0].product.as_deref(), Some("panther"));
        assert_eq!(parsed[0].model.as_deref(), Some("Pixel_7"));
        assert_eq!(parsed[0].transport_id.as_deref(), Some("1"));
        assert_eq!(parsed[1].serial, "emulator-5554");
        assert_eq!(parsed[1].state, "unauthorized");
        assert_eq!(parsed[1].model, None);
    }

    #[test]
    fn empty_listing_yields_no_devices() {
        assert!(parse_adb_devices("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn builds_detail_from_getprop() {
        let output = "[ro.build.version.release]: [14]\n[ro.build.version.sdk]: [34]\n[ro.build.fingerprint]: []\n";
        let detail = detail_from_getprop(&parse_getprop_map(output));
        assert_eq!(detail.android_version, Some(Probe::Known("14".to_string())));
        assert_eq!(detail.api_level, Some(Probe::Known("34".to_string())));
        assert_eq!(detail.build_fingerprint, Some(Probe::Unknown));
        assert_eq!(detail.gms_version, None);
    }

    #[test]
    fn parses_settings_bool() {
        assert_eq!(parse_settings_bool("1"), Some(true));
        assert_eq!(parse_settings_bool("0\n"), Some(false));
        assert_eq!(parse_settings_bool("disabled"), Some(false));
        assert_eq!(parse_settings_bool("null"), None);
        assert_eq!(parse_settings_bool(""), None);
    }

    #[test]
    fn parses_bluetooth_manager_state() {
        assert_eq!(parse_bluetooth_manager_state("State: ON\n").as_deref(), Some("ON"));
        assert_eq!(parse_bluetooth_manager_state("garbage"), None);
    }

    #[test]
    fn parses_audio_summary() {
        let output = "  mode: IN_COMMUNICATION\nringer mode: NORMAL\nmusic active: true\n";
        assert_eq!(
            parse_audio_summary(output).as_deref(),
            Some("mode=IN_COMMUNICATION | ringer=NORMAL | music_active=true")
        );
        assert_eq!(parse_audio_summary("nothing here"), None);
    }

    #[test]
    fn parses_gms_version_name() {
        let output = "Packages:\n  Package [com.google.android.gms]\n    versionName=24.08.12 (190400-608507424)\n";
        assert_eq!(parse_dumpsys_version_name(output).as_deref(), Some("24.08.12"));
        assert_eq!(parse_dumpsys_version_name("Unable to find package"), None);
    }
}
