use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker adb tooling prints (or we substitute) when a property could not be read.
pub const UNKNOWN_VALUE: &str = "Unknown";

/// One row of `adb devices -l`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
    pub usb: Option<String>,
    pub product: Option<String>,
    pub model: Option<String>,
    pub device: Option<String>,
    pub transport_id: Option<String>,
}

impl DeviceSummary {
    pub fn new(serial: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: state.into(),
            usb: None,
            product: None,
            model: None,
            device: None,
            transport_id: None,
        }
    }
}

/// Outcome of a single detail probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Probe<T> {
    Known(T),
    Unknown,
}

pub trait ProbeValue: Clone {
    fn is_informative(&self) -> bool {
        true
    }
}

impl ProbeValue for String {
    fn is_informative(&self) -> bool {
        let trimmed = self.trim();
        !trimmed.is_empty()
            && !trimmed.eq_ignore_ascii_case(UNKNOWN_VALUE)
            && !trimmed.eq_ignore_ascii_case("none")
    }
}

impl ProbeValue for bool {}

impl<T: ProbeValue> Probe<T> {
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) if value.is_informative() => Probe::Known(value),
            _ => Probe::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Probe::Known(value) if value.is_informative())
    }

    pub fn known(&self) -> Option<&T> {
        match self {
            Probe::Known(value) => Some(value),
            Probe::Unknown => None,
        }
    }
}

/// Expensive per-device fields. `None` means the field was never observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceDetail {
    pub android_version: Option<Probe<String>>,
    pub api_level: Option<Probe<String>>,
    pub gms_version: Option<Probe<String>>,
    pub build_fingerprint: Option<Probe<String>>,
    pub wifi_is_on: Option<Probe<bool>>,
    pub bt_is_on: Option<Probe<bool>>,
    pub audio_state: Option<Probe<String>>,
}

impl DeviceDetail {
    /// Every field set to `Unknown`; what a failed detail load reports.
    pub fn unknown() -> Self {
        Self {
            android_version: Some(Probe::Unknown),
            api_level: Some(Probe::Unknown),
            gms_version: Some(Probe::Unknown),
            build_fingerprint: Some(Probe::Unknown),
            wifi_is_on: Some(Probe::Unknown),
            bt_is_on: Some(Probe::Unknown),
            audio_state: Some(Probe::Unknown),
        }
    }

    /// Field-wise sticky merge: a known incoming value wins, anything else keeps
    /// the current value and only fills an unset field with `Unknown`.
    pub fn merge_from(&mut self, incoming: &DeviceDetail) {
        merge_probe(&mut self.android_version, &incoming.android_version);
        merge_probe(&mut self.api_level, &incoming.api_level);
        merge_probe(&mut self.gms_version, &incoming.gms_version);
        merge_probe(&mut self.build_fingerprint, &incoming.build_fingerprint);
        merge_probe(&mut self.wifi_is_on, &incoming.wifi_is_on);
        merge_probe(&mut self.bt_is_on, &incoming.bt_is_on);
        merge_probe(&mut self.audio_state, &incoming.audio_state);
    }

    pub fn known_field_count(&self) -> usize {
        fn known<T: ProbeValue>(slot: &Option<Probe<T>>) -> usize {
            usize::from(slot.as_ref().is_some_and(Probe::is_known))
        }
        known(&self.android_version)
            + known(&self.api_level)
            + known(&self.gms_version)
            + known(&self.build_fingerprint)
            + known(&self.wifi_is_on)
            + known(&self.bt_is_on)
            + known(&self.audio_state)
    }
}

fn merge_probe<T: ProbeValue>(slot: &mut Option<Probe<T>>, incoming: &Option<Probe<T>>) {
    match incoming {
        Some(Probe::Known(value)) if value.is_informative() => {
            *slot = Some(Probe::Known(value.clone()));
        }
        _ => {
            if slot.is_none() {
                *slot = Some(Probe::Unknown);
            }
        }
    }
}

/// Cached view of one device, keyed by its canonical serial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRecord {
    pub serial: String,
    pub state: String,
    pub usb: Option<String>,
    pub product: Option<String>,
    pub model: Option<String>,
    pub detail: DeviceDetail,
}

impl DeviceRecord {
    pub fn from_summary(summary: &DeviceSummary) -> Self {
        Self {
            serial: summary.serial.clone(),
            state: summary.state.clone(),
            usb: summary.usb.clone(),
            product: summary.product.clone(),
            model: summary.model.clone(),
            detail: DeviceDetail::default(),
        }
    }

    /// Basic fields always follow the latest enumeration; detail is untouched.
    pub fn apply_basic(&mut self, basic: &DeviceRecord) {
        self.state = basic.state.clone();
        self.usb = basic.usb.clone();
        self.product = basic.product.clone();
        self.model = basic.model.clone();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceLoadStatus {
    Discovering,
    BasicLoaded,
    DetailedLoading,
    FullyLoaded,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceLoadProgress {
    pub serial: String,
    pub status: DeviceLoadStatus,
    pub basic: Option<DeviceRecord>,
    pub detail: Option<DeviceDetail>,
    pub error_message: Option<String>,
    pub loaded_at: DateTime<Utc>,
}

impl DeviceLoadProgress {
    pub fn new(serial: impl Into<String>, status: DeviceLoadStatus) -> Self {
        Self {
            serial: serial.into(),
            status,
            basic: None,
            detail: None,
            error_message: None,
            loaded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(value: &str) -> Option<Probe<String>> {
        Some(Probe::Known(value.to_string()))
    }

    #[test]
    fn probe_treats_sentinels_as_unknown() {
        assert_eq!(Probe::from_option(Some("Unknown".to_string())), Probe::Unknown);
        assert_eq!(Probe::from_option(Some("  ".to_string())), Probe::Unknown);
        assert_eq!(Probe::from_option(Some("None".to_string())), Probe::Unknown);
        assert_eq!(Probe::<String>::from_option(None), Probe::Unknown);
        assert_eq!(
            Probe::from_option(Some("14".to_string())),
            Probe::Known("14".to_string())
        );
        assert!(Probe::Known(false).is_known());
    }

    #[test]
    fn merge_keeps_known_values_over_unknown() {
        let mut current = DeviceDetail {
            android_version: known("14"),
            wifi_is_on: Some(Probe::Known(true)),
            ..DeviceDetail::default()
        };
        current.merge_from(&DeviceDetail::unknown());

        assert_eq!(current.android_version, known("14"));
        assert_eq!(current.wifi_is_on, Some(Probe::Known(true)));
        assert_eq!(current.api_level, Some(Probe::Unknown));
    }

    #[test]
    fn merge_replaces_with_newer_known_values() {
        let mut current = DeviceDetail {
            android_version: known("13"),
            bt_is_on: Some(Probe::Known(true)),
            ..DeviceDetail::default()
        };
        let incoming = DeviceDetail {
            android_version: known("14"),
            bt_is_on: Some(Probe::Known(false)),
            gms_version: known(""),
            ..DeviceDetail::default()
        };
        current.merge_from(&incoming);

        assert_eq!(current.android_version, known("14"));
        assert_eq!(current.bt_is_on, Some(Probe::Known(false)));
        assert_eq!(current.gms_version, Some(Probe::Unknown));
    }

    #[test]
    fn merge_never_regresses_in_any_order() {
        let updates = [
            DeviceDetail {
                api_level: known("34"),
                ..DeviceDetail::default()
            },
            DeviceDetail::unknown(),
            DeviceDetail {
                api_level: known("Unknown"),
                build_fingerprint: known("google/panther"),
                ..DeviceDetail::default()
            },
            DeviceDetail::default(),
        ];

        let mut detail = DeviceDetail::default();
        for update in updates.iter() {
            let before = detail.known_field_count();
            detail.merge_from(update);
            assert!(detail.known_field_count() >= before);
        }
        assert_eq!(detail.api_level, known("34"));
        assert_eq!(detail.build_fingerprint, known("google/panther"));
    }

    #[test]
    fn apply_basic_preserves_detail() {
        let mut record = DeviceRecord::from_summary(&DeviceSummary::new("A", "device"));
        record.detail.android_version = known("14");

        let mut newer = DeviceSummary::new("A", "unauthorized");
        newer.model = Some("Pixel_8".to_string());
        record.apply_basic(&DeviceRecord::from_summary(&newer));

        assert_eq!(record.state, "unauthorized");
        assert_eq!(record.model.as_deref(), Some("Pixel_8"));
        assert_eq!(record.detail.android_version, known("14"));
    }
}
