//! Confirmation watchdog.
//!
//! Armed once by boot reconciliation after a successful swap. When it fires
//! the record is re-read: a commit in the meantime keeps the new image,
//! anything else rolls it back. It is never re-armed.

use ota_common::{Error, FilePair, UpdateRecord, UpdateStatus};
use ota_config::CommitDetection;
use tracing::{error, info, warn};

use super::{RollbackReason, Updater};
use crate::host::{Deferred, TimerHandle};
use crate::logging::{event_names, Stage};

/// Decision taken when the confirmation window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    Confirmed,
    RollBack,
}

/// Decide the fate of the trial image from the record read at expiry.
pub fn verdict(record: &UpdateRecord, detection: CommitDetection) -> WatchdogVerdict {
    match detection {
        CommitDetection::Never => WatchdogVerdict::RollBack,
        CommitDetection::RecordStatus => match record.status {
            UpdateStatus::Committed => WatchdogVerdict::Confirmed,
            UpdateStatus::Pending | UpdateStatus::Unrecognized => WatchdogVerdict::RollBack,
        },
    }
}

impl Updater<'_> {
    pub(crate) fn arm_watchdog(&self, files: Vec<FilePair>) -> TimerHandle {
        let delay = self.settings().watchdog_delay;
        let handle = self.host().scheduler.schedule(
            delay,
            false,
            Deferred::ConfirmationWatchdog { files },
        );
        self.watchdog.set(Some(handle));
        info!(
            target: event_names::WATCHDOG_ARMED,
            stage = %Stage::Watchdog,
            delay_secs = delay.as_secs(),
            detection = %self.settings().commit_detection,
            "confirmation watchdog armed"
        );
        handle
    }

    pub(crate) fn on_watchdog_expired(&self, armed: Vec<FilePair>) -> WatchdogVerdict {
        self.watchdog.set(None);

        let record = match self.records().load() {
            Ok(record) => record,
            Err(err) => {
                error!(
                    target: event_names::WATCHDOG_EXPIRED,
                    stage = %Stage::Watchdog,
                    error = %err,
                    "update record unreadable at expiry, assuming unconfirmed"
                );
                UpdateRecord {
                    status: UpdateStatus::Pending,
                    files: armed.clone(),
                }
            }
        };

        let decision = verdict(&record, self.settings().commit_detection);
        match decision {
            WatchdogVerdict::Confirmed => {
                info!(
                    target: event_names::WATCHDOG_CONFIRMED,
                    stage = %Stage::Watchdog,
                    "update confirmed"
                );
            }
            WatchdogVerdict::RollBack => {
                let err = Error::UnconfirmedUpdate {
                    seconds: self.settings().watchdog_delay.as_secs(),
                };
                warn!(
                    target: event_names::WATCHDOG_EXPIRED,
                    stage = %Stage::Watchdog,
                    code = err.code(),
                    status = %record.status,
                    error = %err,
                    "rolling back unconfirmed update"
                );
                let target = if record.files.is_empty() {
                    UpdateRecord {
                        status: record.status,
                        files: armed,
                    }
                } else {
                    record
                };
                // Failures are logged and followed by a restart inside roll_back.
                let _ = self.roll_back(&target, RollbackReason::WatchdogExpired);
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestRig;
    use std::time::Duration;

    #[test]
    fn test_verdict_table() {
        let committed = UpdateRecord::committed();
        let pending = UpdateRecord::pending_for("app");
        let unknown = UpdateRecord {
            status: UpdateStatus::Unrecognized,
            files: vec![],
        };

        assert_eq!(
            verdict(&committed, CommitDetection::RecordStatus),
            WatchdogVerdict::Confirmed
        );
        assert_eq!(
            verdict(&pending, CommitDetection::RecordStatus),
            WatchdogVerdict::RollBack
        );
        assert_eq!(
            verdict(&unknown, CommitDetection::RecordStatus),
            WatchdogVerdict::RollBack
        );
        assert_eq!(
            verdict(&committed, CommitDetection::Never),
            WatchdogVerdict::RollBack
        );
    }

    #[test]
    fn test_expiry_without_commit_rolls_back() {
        let rig = TestRig::staged("v1", "v2");
        let updater = rig.updater();
        updater.boot().unwrap();

        let due = rig.scheduler.advance(Duration::from_secs(10));
        assert_eq!(due.len(), 1);
        for task in due {
            updater.on_deferred(task);
        }

        assert_eq!(rig.store.get_string("app").as_deref(), Some("v1"));
        assert!(rig.store.get("app.bak").is_none());
        assert!(rig.stored_record().is_committed());
        assert_eq!(rig.rebooter.calls(), vec![Duration::from_secs(5)]);
        assert_eq!(updater.watchdog_handle(), None);
    }

    #[test]
    fn test_commit_before_expiry_keeps_update() {
        let rig = TestRig::staged("v1", "v2");
        let updater = rig.updater();
        updater.boot().unwrap();
        updater.commit().unwrap();

        for task in rig.scheduler.advance(Duration::from_secs(10)) {
            updater.on_deferred(task);
        }

        assert_eq!(rig.store.get_string("app").as_deref(), Some("v2"));
        assert!(rig.rebooter.calls().is_empty());
    }

    #[test]
    fn test_never_mode_rolls_back_even_after_commit() {
        let rig = TestRig::staged("v1", "v2").with_detection(CommitDetection::Never);
        let updater = rig.updater();
        updater.boot().unwrap();
        updater.commit().unwrap();

        let Deferred::ConfirmationWatchdog { files } = rig
            .scheduler
            .advance(Duration::from_secs(10))
            .remove(0);
        let decision = updater.on_watchdog_expired(files);

        assert_eq!(decision, WatchdogVerdict::RollBack);
        assert_eq!(rig.store.get_string("app").as_deref(), Some("v1"));
        assert_eq!(rig.rebooter.calls().len(), 1);
    }

    #[test]
    fn test_does_not_fire_early() {
        let rig = TestRig::staged("v1", "v2");
        let updater = rig.updater();
        updater.boot().unwrap();

        assert!(rig.scheduler.advance(Duration::from_secs(9)).is_empty());
        assert_eq!(rig.store.get_string("app").as_deref(), Some("v2"));
    }
}
