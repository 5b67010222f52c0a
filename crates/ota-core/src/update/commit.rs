//! Operator calls: commit, revert and status.

use ota_common::record::backup_name;
use ota_common::{Error, FilePair, UpdateRecord, UpdateStatus};
use serde::Serialize;
use tracing::{info, warn};

use super::swap::SlotLayout;
use super::{RollbackReason, Updater};
use crate::logging::{event_names, Stage};

/// Result of [`Updater::revert`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RevertOutcome {
    /// Backups restored; a restart has been requested.
    RolledBack {
        restored: Vec<String>,
        skipped: Vec<String>,
    },
    /// The pending update had not been activated yet; it was dropped.
    Discarded { files: Vec<FilePair> },
}

/// Snapshot of update state for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub schema_version: String,
    pub status: UpdateStatus,
    pub files: Vec<FilePair>,
    pub active_image: String,
    pub active_present: bool,
    pub backup_present: bool,
    pub watchdog_armed: bool,
    pub update_in_flight: bool,
}

impl Updater<'_> {
    /// Confirm the running image. Idempotent; never restarts.
    pub fn commit(&self) -> Result<(), Error> {
        self.records().save(&UpdateRecord::committed())?;
        info!(
            target: event_names::COMMIT_RECORDED,
            stage = %Stage::Commit,
            "update committed"
        );
        Ok(())
    }

    /// Roll back the pending update on request.
    ///
    /// An update that is recorded but not yet activated (every pair still
    /// staged) is dropped without touching any image.
    pub fn revert(&self) -> Result<RevertOutcome, Error> {
        let record = self.records().load()?;
        if !record.is_pending() || record.files.is_empty() {
            return Err(Error::NothingToRevert);
        }

        info!(
            target: event_names::REVERT_REQUESTED,
            stage = %Stage::Rollback,
            files = record.files.len() as u64,
            "revert requested"
        );

        let swapper = self.swapper();
        let mut all_staged = true;
        for pair in &record.files {
            all_staged &= swapper.inspect(pair)? == SlotLayout::Staged;
        }
        if all_staged {
            warn!(
                target: event_names::REVERT_DISCARDED,
                stage = %Stage::Rollback,
                "pending update not yet activated, discarding it"
            );
            self.records().save(&UpdateRecord::committed())?;
            return Ok(RevertOutcome::Discarded {
                files: record.files,
            });
        }

        let summary = self
            .roll_back(&record, RollbackReason::Operator)
            .map_err(|err| Error::RollbackFailed(err.to_string()))?;
        Ok(RevertOutcome::RolledBack {
            restored: summary.restored,
            skipped: summary.skipped,
        })
    }

    /// Re-read the record and describe the current state.
    pub fn status(&self) -> Result<StatusReport, Error> {
        let record = self.records().load()?;
        let store = self.host().store;
        let active_image = self.settings().active_image.clone();
        Ok(StatusReport {
            schema_version: ota_common::SCHEMA_VERSION.to_string(),
            status: record.status,
            files: record.files,
            active_present: store.exists(&active_image)?,
            backup_present: store.exists(&backup_name(&active_image))?,
            active_image,
            watchdog_armed: self.watchdog_handle().is_some(),
            update_in_flight: self.update_in_flight(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{capture_events, events_named, TestRig};

    #[test]
    fn test_commit_is_idempotent_and_silent() {
        let rig = TestRig::staged("v1", "v2");
        let updater = rig.updater();
        updater.commit().unwrap();
        updater.commit().unwrap();
        assert_eq!(rig.stored_record(), UpdateRecord::committed());
        assert!(rig.rebooter.calls().is_empty());
        assert_eq!(rig.store.get_string("app.new").as_deref(), Some("v2"));
    }

    #[test]
    fn test_revert_after_activation_restores_backup() {
        let rig = TestRig::staged("v1", "v2");
        let updater = rig.updater();
        updater.boot().unwrap();

        let outcome = updater.revert().unwrap();
        assert_eq!(
            outcome,
            RevertOutcome::RolledBack {
                restored: vec!["app".to_string()],
                skipped: vec![],
            }
        );
        assert_eq!(rig.store.get_string("app").as_deref(), Some("v1"));
        assert_eq!(rig.rebooter.calls().len(), 1);
    }

    #[test]
    fn test_revert_before_activation_discards() {
        let rig = TestRig::staged("v1", "v2");
        let mut outcome = None;
        let lines = capture_events(|| outcome = Some(rig.updater().revert().unwrap()));
        assert!(matches!(outcome, Some(RevertOutcome::Discarded { .. })));
        assert_eq!(events_named(&lines, event_names::REVERT_DISCARDED).count(), 1);
        assert_eq!(rig.store.get_string("app").as_deref(), Some("v1"));
        assert!(rig.stored_record().is_committed());
        assert!(rig.rebooter.calls().is_empty());
    }

    #[test]
    fn test_revert_with_nothing_pending() {
        let rig = TestRig::new();
        let err = rig.updater().revert().unwrap_err();
        assert!(matches!(err, Error::NothingToRevert));
    }

    #[test]
    fn test_status_reflects_trial() {
        let rig = TestRig::staged("v1", "v2");
        let updater = rig.updater();
        updater.boot().unwrap();

        let report = updater.status().unwrap();
        assert_eq!(report.status, UpdateStatus::Pending);
        assert!(report.watchdog_armed);
        assert!(report.active_present);
        assert!(report.backup_present);
        assert!(!report.update_in_flight);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["files"][0]["originalName"], "app");
    }
}
