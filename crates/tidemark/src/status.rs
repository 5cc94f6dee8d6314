//! Migration status reporting.
//!
//! Status is derived by joining the known units with the tracking table. A
//! unit is `Applied` iff a record exists for its version. `Failed` is never
//! stored: a caller marks it on the report for the unit whose apply or
//! rollback just returned an error.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::unit::MigrationUnit;

/// A persisted record of an applied unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Unit version.
    pub version: String,
    /// Unit name at the time it was applied.
    pub name: String,
    /// When the unit was applied.
    pub applied_at: DateTime<Utc>,
}

/// Derived state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Not yet applied.
    Pending,
    /// A tracking record exists.
    Applied,
    /// The last attempt on this unit failed in the current process.
    Failed,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status of one known unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Unit version.
    pub version: String,
    /// Unit name.
    pub name: String,
    /// Derived status.
    pub status: MigrationStatus,
    /// When the unit was applied, if it is.
    pub applied_at: Option<DateTime<Utc>>,
}

/// Status of every known unit, ascending by version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// One entry per known unit.
    pub entries: Vec<StatusEntry>,
    /// Applied records that match no known unit.
    pub orphaned: Vec<MigrationRecord>,
}

impl StatusReport {
    /// Builds a report from the known units and the tracking records.
    #[must_use]
    pub fn build(units: &[MigrationUnit], records: &[MigrationRecord]) -> Self {
        let mut applied: BTreeMap<&str, &MigrationRecord> =
            records.iter().map(|r| (r.version.as_str(), r)).collect();

        let mut sorted: Vec<&MigrationUnit> = units.iter().collect();
        sorted.sort();

        let entries = sorted
            .into_iter()
            .map(|unit| {
                let record = applied.remove(unit.version());
                StatusEntry {
                    version: unit.version().to_string(),
                    name: unit.name().to_string(),
                    status: if record.is_some() {
                        MigrationStatus::Applied
                    } else {
                        MigrationStatus::Pending
                    },
                    applied_at: record.map(|r| r.applied_at),
                }
            })
            .collect();

        Self {
            entries,
            orphaned: applied.into_values().cloned().collect(),
        }
    }

    /// Marks the entry for `version` as failed. Returns false if no such
    /// entry exists.
    pub fn mark_failed(&mut self, version: &str) -> bool {
        match self.entries.iter_mut().find(|e| e.version == version) {
            Some(entry) => {
                entry.status = MigrationStatus::Failed;
                true
            }
            None => false,
        }
    }

    /// Returns the entry for `version`.
    #[must_use]
    pub fn get(&self, version: &str) -> Option<&StatusEntry> {
        self.entries.iter().find(|e| e.version == version)
    }

    /// Returns the versions that are still pending.
    #[must_use]
    pub fn pending(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.status == MigrationStatus::Pending)
            .map(|e| e.version.as_str())
            .collect()
    }
}
