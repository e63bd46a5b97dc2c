use std::collections::{BTreeMap, HashMap};

use chrono::Utc;

use crate::app::models::{DeviceDetail, DeviceLoadProgress, DeviceLoadStatus, DeviceRecord};

/// Device records plus their per-serial load progress. Owned by the
/// coordinator; everyone else sees clones.
#[derive(Debug, Default)]
pub struct DeviceCache {
    records: BTreeMap<String, DeviceRecord>,
    progress: HashMap<String, DeviceLoadProgress>,
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.records.contains_key(serial)
    }

    pub fn get(&self, serial: &str) -> Option<&DeviceRecord> {
        self.records.get(serial)
    }

    pub fn serials(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.records.values().cloned().collect()
    }

    pub fn progress(&self, serial: &str) -> Option<&DeviceLoadProgress> {
        self.progress.get(serial)
    }

    pub fn progress_snapshot(&self) -> HashMap<String, DeviceLoadProgress> {
        self.progress.clone()
    }

    pub fn is_fully_loaded(&self, serial: &str) -> bool {
        self.progress
            .get(serial)
            .is_some_and(|progress| progress.status == DeviceLoadStatus::FullyLoaded)
    }

    pub fn mark_discovering(&mut self, serial: &str) {
        self.set_status(serial, DeviceLoadStatus::Discovering);
    }

    pub fn mark_detail_loading(&mut self, serial: &str) {
        self.set_status(serial, DeviceLoadStatus::DetailedLoading);
    }

    /// Inserts or updates the basic tier. Previously learned detail survives.
    pub fn apply_basic(&mut self, basic: &DeviceRecord) -> DeviceRecord {
        let record = self
            .records
            .entry(basic.serial.clone())
            .and_modify(|existing| existing.apply_basic(basic))
            .or_insert_with(|| DeviceRecord {
                detail: DeviceDetail::default(),
                ..basic.clone()
            })
            .clone();

        let progress = self.progress_entry(&basic.serial);
        progress.status = DeviceLoadStatus::BasicLoaded;
        progress.basic = Some(record.clone());
        progress.error_message = None;
        progress.loaded_at = Utc::now();
        record
    }

    /// Basic update for a device whose detail this run does not re-probe:
    /// a fully loaded device stays fully loaded.
    pub fn apply_basic_keeping_detail(&mut self, basic: &DeviceRecord) -> DeviceRecord {
        let was_loaded = self.is_fully_loaded(&basic.serial);
        let record = self.apply_basic(basic);
        if was_loaded {
            self.set_status(&basic.serial, DeviceLoadStatus::FullyLoaded);
        }
        record
    }

    /// Sticky merge of the detail tier. `None` when the serial is no longer cached.
    pub fn apply_detail(&mut self, serial: &str, detail: &DeviceDetail) -> Option<DeviceRecord> {
        let record = self.records.get_mut(serial)?;
        record.detail.merge_from(detail);
        let record = record.clone();

        let progress = self.progress_entry(serial);
        progress.status = DeviceLoadStatus::FullyLoaded;
        progress.basic = Some(record.clone());
        progress.detail = Some(record.detail.clone());
        progress.error_message = None;
        progress.loaded_at = Utc::now();
        Some(record)
    }

    /// Unset detail fields become `Unknown`; known ones are kept.
    pub fn record_failure(&mut self, serial: &str, reason: &str) {
        if let Some(record) = self.records.get_mut(serial) {
            record.detail.merge_from(&DeviceDetail::unknown());
        }
        let progress = self.progress_entry(serial);
        progress.status = DeviceLoadStatus::Error;
        progress.error_message = Some(reason.to_string());
        progress.loaded_at = Utc::now();
    }

    /// Drops the record and its progress together.
    pub fn remove(&mut self, serial: &str) -> bool {
        let had_record = self.records.remove(serial).is_some();
        let had_progress = self.progress.remove(serial).is_some();
        had_record || had_progress
    }

    /// Removes every serial not in `keep`; returns what was removed.
    pub fn retain_serials(&mut self, keep: &[String]) -> Vec<String> {
        let stale: Vec<String> = self
            .records
            .keys()
            .chain(self.progress.keys())
            .filter(|serial| !keep.contains(serial))
            .cloned()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for serial in &stale {
            self.remove(serial);
        }
        stale
    }

    /// Resolves progress an interrupted run left at `Discovering` or
    /// `DetailedLoading`: cached devices fall back to the tier they hold,
    /// uncached ones lose their entry. Returns how many entries changed.
    pub fn settle_interrupted(&mut self) -> usize {
        let records = &self.records;
        let mut settled = 0;
        self.progress.retain(|serial, progress| {
            if !matches!(
                progress.status,
                DeviceLoadStatus::Discovering | DeviceLoadStatus::DetailedLoading
            ) {
                return true;
            }
            settled += 1;
            if !records.contains_key(serial) {
                return false;
            }
            progress.status = if progress.detail.is_some() {
                DeviceLoadStatus::FullyLoaded
            } else {
                DeviceLoadStatus::BasicLoaded
            };
            progress.loaded_at = Utc::now();
            true
        });
        settled
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.progress.clear();
    }

    fn set_status(&mut self, serial: &str, status: DeviceLoadStatus) {
        let progress = self.progress_entry(serial);
        progress.status = status;
        progress.loaded_at = Utc::now();
    }

    fn progress_entry(&mut self, serial: &str) -> &mut DeviceLoadProgress {
        self.progress
            .entry(serial.to_string())
            .or_insert_with(|| DeviceLoadProgress::new(serial, DeviceLoadStatus::Discovering))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::{DeviceSummary, Probe};

    fn basic(serial: &str, state: &str, model: &str) -> DeviceRecord {
        let mut summary = DeviceSummary::new(serial, state);
        summary.model = Some(model.to_string());
        DeviceRecord::from_summary(&summary)
    }

    fn version(value: &str) -> DeviceDetail {
        DeviceDetail {
            android_version: Some(Probe::Known(value.to_string())),
            ..DeviceDetail::default()
        }
    }

    #[test]
    fn basic_update_keeps_detail() {
        let mut cache = DeviceCache::new();
        cache.apply_basic(&basic("A", "device", "Pixel_7"));
        cache.apply_detail("A", &version("14")).expect("cached");

        let record = cache.apply_basic(&basic("A", "device", "Pixel_7a"));
        assert_eq!(record.model.as_deref(), Some("Pixel_7a"));
        assert_eq!(record.detail.android_version, Some(Probe::Known("14".to_string())));
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.progress("A").map(|progress| progress.status),
            Some(DeviceLoadStatus::BasicLoaded)
        );
    }

    #[test]
    fn detail_for_unknown_serial_is_ignored() {
        let mut cache = DeviceCache::new();
        assert!(cache.apply_detail("gone", &version("14")).is_none());
        assert!(cache.progress("gone").is_none());
    }

    #[test]
    fn detail_never_regresses_through_events() {
        let mut cache = DeviceCache::new();
        cache.apply_basic(&basic("A", "device", "M"));
        cache.apply_detail("A", &version("14"));
        cache.record_failure("A", "probe timed out");
        cache.apply_detail("A", &DeviceDetail::unknown());
        cache.apply_basic(&basic("A", "device", "M"));

        let record = cache.get("A").expect("cached");
        assert_eq!(record.detail.android_version, Some(Probe::Known("14".to_string())));
        assert_eq!(record.detail.wifi_is_on, Some(Probe::Unknown));
    }

    #[test]
    fn failure_is_recorded_in_progress() {
        let mut cache = DeviceCache::new();
        cache.apply_basic(&basic("A", "device", "M"));
        cache.record_failure("A", "no properties");
        let progress = cache.progress("A").expect("progress");
        assert_eq!(progress.status, DeviceLoadStatus::Error);
        assert_eq!(progress.error_message.as_deref(), Some("no properties"));
        assert!(!cache.is_fully_loaded("A"));
    }

    #[test]
    fn remove_clears_record_and_progress() {
        let mut cache = DeviceCache::new();
        cache.apply_basic(&basic("A", "device", "M"));
        cache.apply_basic(&basic("B", "device", "M"));
        cache.mark_discovering("C");

        assert!(cache.remove("A"));
        assert!(cache.get("A").is_none());
        assert!(cache.progress("A").is_none());

        let removed = cache.retain_serials(&["B".to_string()]);
        assert_eq!(removed, vec!["C".to_string()]);
        assert_eq!(cache.serials(), vec!["B".to_string()]);
    }

    #[test]
    fn keeping_detail_preserves_fully_loaded() {
        let mut cache = DeviceCache::new();
        cache.apply_basic(&basic("A", "device", "M"));
        cache.apply_detail("A", &version("14"));
        cache.apply_basic(&basic("B", "device", "M"));

        cache.apply_basic_keeping_detail(&basic("A", "device", "M2"));
        cache.apply_basic_keeping_detail(&basic("B", "device", "M2"));
        assert!(cache.is_fully_loaded("A"));
        assert_eq!(cache.get("A").and_then(|record| record.model.clone()).as_deref(), Some("M2"));
        assert_eq!(
            cache.progress("B").map(|progress| progress.status),
            Some(DeviceLoadStatus::BasicLoaded)
        );
    }

    #[test]
    fn interrupted_progress_falls_back_to_loaded_tier() {
        let mut cache = DeviceCache::new();
        cache.apply_basic(&basic("A", "device", "M"));
        cache.apply_detail("A", &version("14"));
        cache.apply_basic(&basic("B", "device", "M"));
        cache.apply_basic(&basic("C", "device", "M"));
        cache.mark_discovering("A");
        cache.mark_detail_loading("B");
        cache.mark_discovering("Z");

        assert_eq!(cache.settle_interrupted(), 3);
        let status = |serial: &str| cache.progress(serial).map(|progress| progress.status);
        assert_eq!(status("A"), Some(DeviceLoadStatus::FullyLoaded));
        assert_eq!(status("B"), Some(DeviceLoadStatus::BasicLoaded));
        assert_eq!(status("C"), Some(DeviceLoadStatus::BasicLoaded));
        assert_eq!(status("Z"), None);
    }
}
