//! Per-pass results: one entry per listed object plus the summary counters.

use serde::Serialize;

/// Why an object was left alone this pass.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// Another worker holds the lock. `until` is the advertised expiry, if known.
    LockedByOther { until: Option<String> },
    /// Another task in this process is already working on the same name.
    InFlight,
    /// Listed, but removed before it could be locked (typically moved by
    /// another worker).
    Gone,
    /// Key does not start with the source prefix.
    Malformed,
    /// Folder placeholder (`name/`), nothing to move.
    DirectoryMarker,
}

/// Step at which processing of an object stopped.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Lock,
    Copy,
    Delete,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ObjectOutcome {
    Moved {
        destination: String,
    },
    Skipped {
        #[serde(flatten)]
        reason: SkipReason,
    },
    Failed {
        stage: FailureStage,
        error: String,
        /// Set when the copy landed but the source could not be removed:
        /// the object now exists at both source and destination.
        duplicate_risk: bool,
        lock_released: bool,
    },
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ObjectReport {
    pub key: String,
    #[serde(flatten)]
    pub outcome: ObjectOutcome,
}

/// Summary of one migration pass.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub entries: Vec<ObjectReport>,
}

impl Report {
    pub fn record(&mut self, key: impl Into<String>, outcome: ObjectOutcome) {
        match &outcome {
            ObjectOutcome::Moved { .. } => self.processed += 1,
            ObjectOutcome::Skipped { .. } => self.skipped += 1,
            ObjectOutcome::Failed { .. } => self.failed += 1,
        }
        self.entries.push(ObjectReport {
            key: key.into(),
            outcome,
        });
    }

    /// Look up the entry recorded for `key`.
    pub fn entry(&self, key: &str) -> Option<&ObjectOutcome> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| &entry.outcome)
    }

    /// Objects that were copied but could not be removed from the source.
    pub fn duplicate_risk(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| {
                matches!(
                    entry.outcome,
                    ObjectOutcome::Failed {
                        duplicate_risk: true,
                        ..
                    }
                )
            })
            .map(|entry| entry.key.as_str())
            .collect()
    }

    /// Objects skipped because their key did not match the source prefix.
    pub fn malformed(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| {
                matches!(
                    entry.outcome,
                    ObjectOutcome::Skipped {
                        reason: SkipReason::Malformed
                    }
                )
            })
            .map(|entry| entry.key.as_str())
            .collect()
    }

    /// Process exit status for this pass: 0 clean, 2 failures, 3 duplicates.
    pub fn exit_code(&self) -> i32 {
        if !self.duplicate_risk().is_empty() {
            3
        } else if self.failed > 0 {
            2
        } else {
            0
        }
    }
}

/// Outcome of clearing expired metadata leases under a scope.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired fields removed.
    pub cleared: usize,
    /// Fields still in the future, left alone.
    pub active: usize,
    /// Objects whose sweep failed (unreadable field or backend error).
    pub failed: usize,
}

/// One row of a dry run.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PlannedMove {
    pub key: String,
    /// `None` when the key cannot be mapped (malformed or directory marker).
    pub destination: Option<String>,
    pub locked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(duplicate_risk: bool) -> ObjectOutcome {
        ObjectOutcome::Failed {
            stage: if duplicate_risk {
                FailureStage::Delete
            } else {
                FailureStage::Copy
            },
            error: "boom".into(),
            duplicate_risk,
            lock_released: true,
        }
    }

    #[test]
    fn counters_follow_outcomes() {
        let mut report = Report::default();
        report.record(
            "a",
            ObjectOutcome::Moved {
                destination: "dst/a".into(),
            },
        );
        report.record(
            "b",
            ObjectOutcome::Skipped {
                reason: SkipReason::Malformed,
            },
        );
        report.record("c", failed(false));

        assert_eq!((report.processed, report.skipped, report.failed), (1, 1, 1));
        assert_eq!(report.malformed(), vec!["b"]);
        assert!(report.duplicate_risk().is_empty());
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn duplicate_risk_dominates_exit_code() {
        let mut report = Report::default();
        report.record("c", failed(false));
        report.record("d", failed(true));

        assert_eq!(report.duplicate_risk(), vec!["d"]);
        assert_eq!(report.exit_code(), 3);
    }

    #[test]
    fn json_shape_is_flat() {
        let mut report = Report::default();
        report.record(
            "x",
            ObjectOutcome::Skipped {
                reason: SkipReason::LockedByOther {
                    until: Some("2030-01-01T00:00:00".into()),
                },
            },
        );
        let value = serde_json::to_value(&report).expect("report serializes");
        let entry = &value["entries"][0];
        assert_eq!(entry["key"], "x");
        assert_eq!(entry["status"], "skipped");
        assert_eq!(entry["reason"], "locked_by_other");
        assert_eq!(entry["until"], "2030-01-01T00:00:00");
    }
}
