// src/delta/mod.rs

//! Delta calculation for package synchronization
//!
//! Pure set difference between the identifiers a distribution server
//! advertises and the identifiers already present locally. Keeping this free
//! of I/O and shared state makes the "download only what is missing"
//! property provable independently of the store's behavior.
//!
//! Invoked once per sync cycle per country, separately for day-granularity
//! manifests (weeks of history) and hour-granularity manifests (today only).

use chrono::NaiveDate;
use std::collections::BTreeSet;

/// Identifiers advertised remotely but absent locally. Derived, never
/// persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaCalculationResult {
    pub missing_days: BTreeSet<NaiveDate>,
    pub missing_hours: BTreeSet<u8>,
}

impl DeltaCalculationResult {
    /// Nothing to download.
    pub fn is_empty(&self) -> bool {
        self.missing_days.is_empty() && self.missing_hours.is_empty()
    }
}

/// Pure remote-minus-local set difference.
pub struct DeltaCalculator;

impl DeltaCalculator {
    /// Days advertised remotely that the local store does not have.
    pub fn missing_days(
        remote: &BTreeSet<NaiveDate>,
        local: &BTreeSet<NaiveDate>,
    ) -> BTreeSet<NaiveDate> {
        remote.difference(local).copied().collect()
    }

    /// Hours advertised remotely that the local store does not have.
    pub fn missing_hours(remote: &BTreeSet<u8>, local: &BTreeSet<u8>) -> BTreeSet<u8> {
        remote.difference(local).copied().collect()
    }

    /// Combined day/hour delta for one country and one sync cycle.
    pub fn calculate(
        remote_days: &BTreeSet<NaiveDate>,
        local_days: &BTreeSet<NaiveDate>,
        remote_hours: &BTreeSet<u8>,
        local_hours: &BTreeSet<u8>,
    ) -> DeltaCalculationResult {
        DeltaCalculationResult {
            missing_days: Self::missing_days(remote_days, local_days),
            missing_hours: Self::missing_hours(remote_hours, local_hours),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn days(strs: &[&str]) -> BTreeSet<NaiveDate> {
        strs.iter().map(|s| day(s)).collect()
    }

    #[test]
    fn test_missing_days_is_remote_minus_local() {
        // Local store has 2021-01-01..03, remote advertises ..05
        let local = days(&["2021-01-01", "2021-01-02", "2021-01-03"]);
        let remote = days(&[
            "2021-01-01",
            "2021-01-02",
            "2021-01-03",
            "2021-01-04",
            "2021-01-05",
        ]);

        let missing = DeltaCalculator::missing_days(&remote, &local);
        assert_eq!(missing, days(&["2021-01-04", "2021-01-05"]));
    }

    #[test]
    fn test_remote_subset_of_local_is_empty() {
        let local = days(&["2021-01-01", "2021-01-02", "2021-01-03"]);
        let remote = days(&["2021-01-02"]);

        assert!(DeltaCalculator::missing_days(&remote, &local).is_empty());
    }

    #[test]
    fn test_disjoint_sets_return_whole_remote() {
        let local = days(&["2021-01-01"]);
        let remote = days(&["2021-02-01", "2021-02-02"]);

        let missing = DeltaCalculator::missing_days(&remote, &local);
        assert_eq!(missing, remote);
    }

    #[test]
    fn test_local_surplus_is_ignored() {
        // Extra local data (e.g. remotely expired days) never shows up as missing
        let local = days(&["2020-12-01", "2021-01-01"]);
        let remote = days(&["2021-01-01", "2021-01-02"]);

        let missing = DeltaCalculator::missing_days(&remote, &local);
        assert_eq!(missing, days(&["2021-01-02"]));
    }

    #[test]
    fn test_missing_hours() {
        let local: BTreeSet<u8> = [0, 1, 2].into_iter().collect();
        let remote: BTreeSet<u8> = [0, 1, 2, 3, 4].into_iter().collect();

        let missing = DeltaCalculator::missing_hours(&remote, &local);
        assert_eq!(missing, [3, 4].into_iter().collect());
    }

    #[test]
    fn test_calculate_combines_both_granularities() {
        let result = DeltaCalculator::calculate(
            &days(&["2021-01-01", "2021-01-02"]),
            &days(&["2021-01-01"]),
            &[10, 11].into_iter().collect(),
            &[10].into_iter().collect(),
        );

        assert_eq!(result.missing_days, days(&["2021-01-02"]));
        assert_eq!(result.missing_hours, [11].into_iter().collect());
        assert!(!result.is_empty());

        let empty = DeltaCalculator::calculate(
            &BTreeSet::new(),
            &days(&["2021-01-01"]),
            &BTreeSet::new(),
            &BTreeSet::new(),
        );
        assert!(empty.is_empty());
    }
}
