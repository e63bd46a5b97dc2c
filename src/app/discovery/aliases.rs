//! Maps serials reported by the tracker stream onto the canonical serials
//! used by bulk enumeration.
//!
//! Correlation is by suffix or substring containment. Two unrelated devices
//! whose serials contain one another can be conflated; callers only consult
//! the heuristic once an exact match has failed.

use std::collections::BTreeMap;

use tracing::{debug, info};

#[derive(Debug, Default, Clone)]
pub struct SerialAliasTable {
    observed_to_canonical: BTreeMap<String, String>,
}

impl SerialAliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.observed_to_canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observed_to_canonical.is_empty()
    }

    pub fn get(&self, observed: &str) -> Option<&str> {
        self.observed_to_canonical.get(observed).map(String::as_str)
    }

    /// The canonical serial for `observed`, or `observed` itself.
    pub fn canonical(&self, observed: &str) -> String {
        self.get(observed).unwrap_or(observed).to_string()
    }

    /// Records `observed -> canonical`. Identity mappings are not stored.
    pub fn insert(&mut self, observed: &str, canonical: &str) {
        if observed == canonical {
            return;
        }
        match self
            .observed_to_canonical
            .insert(observed.to_string(), canonical.to_string())
        {
            Some(previous) if previous != canonical => {
                info!(observed = %observed, previous = %previous, canonical = %canonical, "serial alias re-pointed");
            }
            Some(_) => {}
            None => {
                info!(observed = %observed, canonical = %canonical, "serial alias learned");
            }
        }
    }

    /// Matches `observed` against `candidates`: exact match first, then a
    /// previously learned alias, then the containment heuristic. A heuristic
    /// hit is remembered.
    pub fn resolve(&mut self, observed: &str, candidates: &[String]) -> Option<String> {
        if candidates.iter().any(|candidate| candidate == observed) {
            return Some(observed.to_string());
        }
        if let Some(known) = self.get(observed) {
            if candidates.iter().any(|candidate| candidate == known) {
                return Some(known.to_string());
            }
        }

        let matched = candidates
            .iter()
            .filter_map(|candidate| correlation_rank(observed, candidate).map(|rank| (rank, candidate)))
            .max_by(|(left_rank, left), (right_rank, right)| {
                left_rank
                    .cmp(right_rank)
                    .then_with(|| left.len().cmp(&right.len()))
                    .then_with(|| right.cmp(left))
            })
            .map(|(_, candidate)| candidate.clone())?;
        debug!(observed = %observed, canonical = %matched, "serial correlated by containment");
        self.insert(observed, &matched);
        Some(matched)
    }

    /// Drops every alias pointing at `canonical` (and any entry keyed by it).
    pub fn purge_canonical(&mut self, canonical: &str) -> Vec<String> {
        let removed: Vec<String> = self
            .observed_to_canonical
            .iter()
            .filter(|(observed, target)| target.as_str() == canonical || observed.as_str() == canonical)
            .map(|(observed, _)| observed.clone())
            .collect();
        for observed in &removed {
            self.observed_to_canonical.remove(observed);
        }
        removed
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        self.observed_to_canonical.clone()
    }

    pub fn clear(&mut self) {
        self.observed_to_canonical.clear();
    }
}

/// Suffix matches outrank plain containment. `None` when unrelated.
fn correlation_rank(observed: &str, canonical: &str) -> Option<u8> {
    if observed.is_empty() || canonical.is_empty() || observed == canonical {
        return None;
    }
    if observed.ends_with(canonical) || canonical.ends_with(observed) {
        return Some(2);
    }
    if observed.contains(canonical) || canonical.contains(observed) {
        return Some(1);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serials(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn exact_match_needs_no_alias() {
        let mut table = SerialAliasTable::new();
        assert_eq!(table.resolve("A1", &serials(&["A1", "B2"])).as_deref(), Some("A1"));
        assert!(table.is_empty());
    }

    #[test]
    fn containment_learns_alias() {
        let mut table = SerialAliasTable::new();
        let canonical = serials(&["0123ABCD", "FFFF0000"]);
        let resolved = table.resolve("adb-0123ABCD-xyz._adb-tls-connect._tcp", &canonical);
        assert_eq!(resolved.as_deref(), Some("0123ABCD"));
        assert_eq!(table.get("adb-0123ABCD-xyz._adb-tls-connect._tcp"), Some("0123ABCD"));

        // Learned alias is reused without another heuristic pass.
        assert_eq!(
            table.resolve("adb-0123ABCD-xyz._adb-tls-connect._tcp", &canonical).as_deref(),
            Some("0123ABCD")
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn suffix_beats_containment() {
        let mut table = SerialAliasTable::new();
        let resolved = table.resolve("usb-XY99", &serials(&["XY9", "XY99"]));
        assert_eq!(resolved.as_deref(), Some("XY99"));
    }

    #[test]
    fn unrelated_serial_is_unresolved() {
        let mut table = SerialAliasTable::new();
        assert_eq!(table.resolve("emulator-5556", &serials(&["0123ABCD"])), None);
        assert!(table.is_empty());
    }

    #[test]
    fn one_canonical_per_observed_serial() {
        let mut table = SerialAliasTable::new();
        table.insert("obs", "first");
        table.insert("obs", "second");
        assert_eq!(table.get("obs"), Some("second"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn purge_removes_every_alias_of_canonical() {
        let mut table = SerialAliasTable::new();
        table.insert("tls-A1", "A1");
        table.insert("usb-A1", "A1");
        table.insert("tls-B2", "B2");

        let mut removed = table.purge_canonical("A1");
        removed.sort();
        assert_eq!(removed, serials(&["tls-A1", "usb-A1"]));
        assert_eq!(table.canonical("tls-A1"), "tls-A1");
        assert_eq!(table.get("tls-B2"), Some("B2"));
    }
}
