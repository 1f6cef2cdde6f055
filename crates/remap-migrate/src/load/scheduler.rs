//! Fixed-point load loop.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, warn};

use super::{quarantine, LoadFile, LoadOrder, LoadOutcome, LoadTarget, RetryInPlace};
use crate::error::Result;

/// Where a scheduler run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Pending,
    Looping { iteration: usize },
    /// Nothing left to try.
    Done,
    /// A full iteration loaded nothing while files were still pending.
    Stuck,
}

/// What a load run achieved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub state: SchedulerState,
    pub iterations: usize,
    /// Tables loaded, in load order.
    pub imported: Vec<String>,
    /// Tables still pending when the loop stopped.
    pub remaining: Vec<String>,
    /// Tables that failed with an unclassified error, with the message.
    pub failed: BTreeMap<String, String>,
    /// Columns the target reported missing, per table.
    pub missing_columns: BTreeMap<String, BTreeSet<String>>,
    /// Tables each table was seen waiting for.
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl LoadReport {
    /// True when every file was loaded.
    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty() && self.failed.is_empty()
    }

    /// Tables not loaded, pending or failed.
    pub fn unresolved(&self) -> Vec<String> {
        let mut tables = self.remaining.clone();
        tables.extend(self.failed.keys().cloned());
        tables
    }
}

/// Loads files in repeated passes until everything is loaded or a pass
/// makes no progress.
///
/// The store's own foreign-key checks act as the dependency oracle: a file
/// whose rows point at a table not loaded yet fails, stays pending and is
/// retried in the next pass.
#[derive(Debug, Default)]
pub struct Scheduler<O = RetryInPlace> {
    order: O,
    state: SchedulerState,
}

impl Scheduler<RetryInPlace> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<O: LoadOrder> Scheduler<O> {
    pub fn with_order(order: O) -> Self {
        Self {
            order,
            state: SchedulerState::Pending,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub async fn run(&mut self, files: Vec<LoadFile>, target: &mut dyn LoadTarget) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let mut pending = files;
        self.state = SchedulerState::Pending;

        while !pending.is_empty() {
            let iteration = report.iterations + 1;
            report.iterations = iteration;
            self.state = SchedulerState::Looping { iteration };
            info!("Import loop #{} ({} files pending)", iteration, pending.len());

            let before = pending.len();
            let attempt = self.order.order(std::mem::take(&mut pending), &report);
            for file in attempt {
                match target.load(&file).await? {
                    LoadOutcome::Loaded { rows } => {
                        info!("Imported {} ({} rows)", file.table, rows);
                        report.imported.push(file.table);
                    }
                    LoadOutcome::ForeignKeyViolation { depends_on, message } => {
                        warn!("{} not loaded yet: {}", file.table, message);
                        if let Some(depends_on) = depends_on {
                            report
                                .dependencies
                                .entry(file.table.clone())
                                .or_default()
                                .insert(depends_on);
                        }
                        pending.push(file);
                    }
                    LoadOutcome::MissingColumn { column, message } => {
                        warn!("{}: {}", file.table, message);
                        if let Some(column) = column {
                            report
                                .missing_columns
                                .entry(file.table.clone())
                                .or_default()
                                .insert(column);
                        }
                        pending.push(file);
                    }
                    LoadOutcome::Failed { message } => {
                        error!("Failed to import {}: {}", file.table, message);
                        quarantine(&file).await?;
                        report.failed.insert(file.table, message);
                    }
                }
            }

            if pending.len() == before {
                self.state = SchedulerState::Stuck;
                break;
            }
        }

        if self.state == SchedulerState::Stuck {
            error!(
                "Import made no progress, giving up on: {}",
                pending
                    .iter()
                    .map(|f| f.table.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            for file in &pending {
                quarantine(file).await?;
            }
        } else {
            self.state = SchedulerState::Done;
        }

        report.state = self.state;
        report.remaining = pending.into_iter().map(|f| f.table).collect();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeTarget {
        loaded: HashSet<String>,
        depends_on: HashMap<String, String>,
        missing: HashMap<String, String>,
        broken: HashSet<String>,
        attempts: Vec<String>,
    }

    #[async_trait]
    impl LoadTarget for FakeTarget {
        async fn load(&mut self, file: &LoadFile) -> Result<LoadOutcome> {
            self.attempts.push(file.table.clone());
            if self.broken.contains(&file.table) {
                return Ok(LoadOutcome::Failed {
                    message: "invalid input syntax".into(),
                });
            }
            if let Some(column) = self.missing.get(&file.table) {
                return Ok(LoadOutcome::MissingColumn {
                    column: Some(column.clone()),
                    message: format!("column \"{}\" does not exist", column),
                });
            }
            if let Some(dependency) = self.depends_on.get(&file.table) {
                if !self.loaded.contains(dependency) {
                    return Ok(LoadOutcome::ForeignKeyViolation {
                        depends_on: Some(dependency.clone()),
                        message: "violates foreign key constraint".into(),
                    });
                }
            }
            self.loaded.insert(file.table.clone());
            Ok(LoadOutcome::Loaded { rows: 1 })
        }
    }

    fn files(dir: &Path, tables: &[&str]) -> Vec<LoadFile> {
        tables
            .iter()
            .map(|t| {
                let file = LoadFile::for_table(dir, t);
                if let Some(companion) = &file.companion {
                    std::fs::write(companion, "id\n").unwrap();
                }
                file
            })
            .collect()
    }

    #[tokio::test]
    async fn test_independent_files_done_in_one_iteration() {
        let dir = TempDir::new().unwrap();
        let mut target = FakeTarget::default();
        let mut scheduler = Scheduler::new();

        let report = scheduler
            .run(files(dir.path(), &["a", "b", "c"]), &mut target)
            .await
            .unwrap();

        assert_eq!(report.state, SchedulerState::Done);
        assert_eq!(scheduler.state(), SchedulerState::Done);
        assert_eq!(report.iterations, 1);
        assert_eq!(report.imported, vec!["a", "b", "c"]);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_dependency_loaded_later_lets_file_succeed() {
        let dir = TempDir::new().unwrap();
        let mut target = FakeTarget::default();
        target.depends_on.insert("a".into(), "b".into());

        let report = Scheduler::new()
            .run(files(dir.path(), &["a", "b"]), &mut target)
            .await
            .unwrap();

        assert_eq!(report.state, SchedulerState::Done);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.imported, vec!["b", "a"]);
        assert!(report.dependencies["a"].contains("b"));
        assert_eq!(target.attempts, vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_missing_dependency_gets_stuck_and_quarantines() {
        let dir = TempDir::new().unwrap();
        let mut target = FakeTarget::default();
        target.depends_on.insert("a".into(), "never".into());
        target.missing.insert("c".into(), "fax".into());

        let input = files(dir.path(), &["a", "b", "c"]);
        let n = input.len();
        let report = Scheduler::new().run(input, &mut target).await.unwrap();

        assert_eq!(report.state, SchedulerState::Stuck);
        assert!(report.iterations <= n);
        assert_eq!(report.remaining, vec!["a", "c"]);
        assert!(report.missing_columns["c"].contains("fax"));
        assert_eq!(report.unresolved(), vec!["a", "c"]);
        assert!(dir.path().join("a.update2.csv.disabled").exists());
        assert!(dir.path().join("c.update2.csv.disabled").exists());
        assert!(dir.path().join("b.update2.csv").exists());
    }

    #[tokio::test]
    async fn test_unclassified_failure_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let mut target = FakeTarget::default();
        target.broken.insert("a".into());

        let report = Scheduler::new()
            .run(files(dir.path(), &["a", "b"]), &mut target)
            .await
            .unwrap();

        assert_eq!(report.state, SchedulerState::Done);
        assert_eq!(report.imported, vec!["b"]);
        assert!(report.remaining.is_empty());
        assert!(!report.is_complete());
        assert_eq!(report.unresolved(), vec!["a"]);
        assert_eq!(target.attempts, vec!["a", "b"]);
        assert!(dir.path().join("a.update2.csv.disabled").exists());
    }

    struct Reversed;

    impl LoadOrder for Reversed {
        fn order(&mut self, mut pending: Vec<LoadFile>, _report: &LoadReport) -> Vec<LoadFile> {
            pending.reverse();
            pending
        }
    }

    #[tokio::test]
    async fn test_custom_order() {
        let dir = TempDir::new().unwrap();
        let mut target = FakeTarget::default();
        target.depends_on.insert("a".into(), "b".into());

        let report = Scheduler::with_order(Reversed)
            .run(files(dir.path(), &["a", "b"]), &mut target)
            .await
            .unwrap();

        assert_eq!(report.iterations, 1);
        assert_eq!(target.attempts, vec!["b", "a"]);
    }
}
