//! Boot-time reconciliation.
//!
//! Runs once per process start, before the RPC surface is reachable. It
//! finishes or undoes whatever the previous process left behind and decides
//! between loading the active image as-is and activating a staged update
//! under the confirmation watchdog.

use ota_common::{Error, SwapMarker, UpdateRecord, UpdateStatus};
use tracing::{error, info, warn};

use super::swap::SlotLayout;
use super::{RollbackReason, Updater};
use crate::host::TimerHandle;
use crate::logging::{event_names, Stage};

/// What boot reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    /// Nothing pending; the active image was loaded.
    Committed { image_started: bool },
    /// A staged update was activated and is on trial.
    Trial {
        watchdog: TimerHandle,
        image_started: bool,
    },
    /// Activation failed; the swap was undone and the update dropped.
    Abandoned { image_started: bool },
    /// The pending update was rolled back; a restart is requested.
    RolledBack { reason: RollbackReason },
    /// Slot state could not be resolved; a restart is requested to retry.
    RestartRequired,
}

impl BootOutcome {
    /// Whether boot ended with a restart request instead of a running image.
    pub fn restart_requested(&self) -> bool {
        matches!(
            self,
            BootOutcome::RolledBack { .. } | BootOutcome::RestartRequired
        )
    }
}

impl Updater<'_> {
    /// Reconcile the record against the slot files and start the active image.
    ///
    /// Errors only when the store cannot be read at all.
    pub fn boot(&self) -> Result<BootOutcome, Error> {
        info!(
            target: event_names::BOOT_STARTED,
            stage = %Stage::Boot,
            active_image = %self.settings().active_image,
            "reconciling update state"
        );

        let records = self.records();
        let record = records.load()?;

        if let Some(marker) = records.load_marker()? {
            let marker = if marker.files.is_empty() {
                SwapMarker::new(record.files.clone(), marker.started_at)
            } else {
                marker
            };
            warn!(
                target: event_names::SWAP_MARKER_FOUND,
                stage = %Stage::Boot,
                started_at = %marker.started_at,
                files = marker.files.len() as u64,
                "previous swap was interrupted, undoing"
            );
            if let Err(err) = self.swapper().undo_interrupted(&marker) {
                return Ok(self.request_retry(&err));
            }
        }

        match record.status {
            UpdateStatus::Committed => {
                info!(
                    target: event_names::BOOT_COMMITTED,
                    stage = %Stage::Boot,
                    "no pending update"
                );
                Ok(BootOutcome::Committed {
                    image_started: self.load_active(),
                })
            }
            UpdateStatus::Unrecognized => {
                warn!(
                    target: event_names::BOOT_UNRECOGNIZED_STATUS,
                    stage = %Stage::Boot,
                    "update record status not recognized, treating as committed"
                );
                Ok(BootOutcome::Committed {
                    image_started: self.load_active(),
                })
            }
            UpdateStatus::Pending => self.boot_pending(record),
        }
    }

    fn boot_pending(&self, record: UpdateRecord) -> Result<BootOutcome, Error> {
        if let Err(reason) = record.check_invariants() {
            warn!(
                target: event_names::BOOT_EMPTY_PENDING,
                stage = %Stage::Boot,
                reason = %reason,
                "pending record is unusable, resetting to committed"
            );
            if let Err(err) = self.records().save(&UpdateRecord::committed()) {
                error!(
                    target: event_names::RECORD_WRITE_FAILED,
                    stage = %Stage::Boot,
                    error = %err,
                    "failed to reset update record"
                );
            }
            return Ok(BootOutcome::Committed {
                image_started: self.load_active(),
            });
        }

        let swapper = self.swapper();
        let layouts = record
            .files
            .iter()
            .map(|pair| swapper.inspect(pair))
            .collect::<std::io::Result<Vec<_>>>()?;

        if layouts.iter().all(|l| *l == SlotLayout::Staged) {
            return Ok(self.activate_pending(&record));
        }

        let reason = if layouts.iter().all(|l| *l == SlotLayout::Swapped) {
            warn!(
                target: event_names::BOOT_TRIAL_INTERRUPTED,
                stage = %Stage::Boot,
                "restarted during the confirmation window, update unconfirmed"
            );
            RollbackReason::TrialInterrupted
        } else {
            warn!(
                target: event_names::BOOT_INCONSISTENT_SLOTS,
                stage = %Stage::Boot,
                layouts = ?layouts,
                "slot files do not match the pending update"
            );
            RollbackReason::InconsistentSlots
        };

        Ok(match self.roll_back(&record, reason) {
            Ok(_) => BootOutcome::RolledBack { reason },
            Err(_) => BootOutcome::RestartRequired,
        })
    }

    fn activate_pending(&self, record: &UpdateRecord) -> BootOutcome {
        info!(
            target: event_names::BOOT_ACTIVATING,
            stage = %Stage::Swap,
            files = record.files.len() as u64,
            "pending update found, activating"
        );

        let swapper = self.swapper();
        match swapper.activate(record) {
            Ok(()) => {
                let watchdog = self.arm_watchdog(record.files.clone());
                BootOutcome::Trial {
                    watchdog,
                    image_started: self.load_active(),
                }
            }
            Err(err) => {
                let err = Error::from(err);
                error!(
                    target: event_names::SWAP_ABANDONED,
                    stage = %Stage::Swap,
                    code = err.code(),
                    error = %err,
                    "activation failed, undoing and abandoning update"
                );
                let marker = SwapMarker::new(record.files.clone(), "");
                if let Err(undo_err) = swapper.undo_interrupted(&marker) {
                    return self.request_retry(&undo_err);
                }
                if let Err(save_err) = self.records().save(&UpdateRecord::committed()) {
                    error!(
                        target: event_names::RECORD_WRITE_FAILED,
                        stage = %Stage::Swap,
                        error = %save_err,
                        "failed to record abandoned update"
                    );
                }
                BootOutcome::Abandoned {
                    image_started: self.load_active(),
                }
            }
        }
    }

    fn request_retry(&self, err: &dyn std::fmt::Display) -> BootOutcome {
        error!(
            target: event_names::SWAP_UNDO_FAILED,
            stage = %Stage::Boot,
            error = %err,
            "could not undo interrupted swap, restarting to retry"
        );
        self.host().rebooter.reboot(self.settings().reboot_grace);
        BootOutcome::RestartRequired
    }

    /// Start the active image; failures are logged, not propagated.
    fn load_active(&self) -> bool {
        let name = &self.settings().active_image;
        match self.host().loader.load(name) {
            Ok(()) => {
                info!(
                    target: event_names::IMAGE_LOADED,
                    stage = %Stage::Boot,
                    image = %name,
                    "active image started"
                );
                true
            }
            Err(err) => {
                error!(
                    target: event_names::IMAGE_LOAD_FAILED,
                    stage = %Stage::Boot,
                    image = %name,
                    error = %err,
                    "failed to start active image"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::KvStore;
    use crate::test_utils::{capture_events, events_named, TestRig};
    use ota_common::{FilePair, MARKER_KEY};

    #[test]
    fn test_first_boot_defaults_and_loads() {
        let rig = TestRig::new();
        rig.store.put("app", b"v1");
        let outcome = rig.updater().boot().unwrap();
        assert_eq!(outcome, BootOutcome::Committed { image_started: true });
        assert_eq!(rig.stored_record(), UpdateRecord::committed());
        assert_eq!(rig.loader.loaded(), vec!["app".to_string()]);
        assert!(rig.scheduler.pending().is_empty());
    }

    #[test]
    fn test_pending_boot_swaps_and_arms_watchdog() {
        let rig = TestRig::staged("v1", "v2");
        let updater = rig.updater();
        let outcome = updater.boot().unwrap();

        let BootOutcome::Trial { watchdog, image_started } = outcome else {
            panic!("expected trial, got {:?}", outcome);
        };
        assert!(image_started);
        assert_eq!(updater.watchdog_handle(), Some(watchdog));
        assert_eq!(rig.store.get_string("app").as_deref(), Some("v2"));
        assert_eq!(rig.store.get_string("app.bak").as_deref(), Some("v1"));
        assert_eq!(rig.scheduler.pending().len(), 1);
        assert!(rig.stored_record().is_pending());
    }

    #[test]
    fn test_unrecognized_status_fails_open() {
        let rig = TestRig::new();
        rig.store.put("app", b"v1");
        rig.store.put("app.new", b"v2");
        rig.store
            .put(ota_common::RECORD_KEY, br#"{"status":"COMMIED_OK","files":[{"originalName":"app","newName":"app.new"}]}"#);

        let outcome = rig.updater().boot().unwrap();
        assert_eq!(outcome, BootOutcome::Committed { image_started: true });
        assert_eq!(rig.store.get_string("app").as_deref(), Some("v1"));
        assert!(rig.scheduler.pending().is_empty());
    }

    #[test]
    fn test_empty_pending_resets_to_committed() {
        let rig = TestRig::new();
        rig.store.put("app", b"v1");
        rig.store
            .put(ota_common::RECORD_KEY, br#"{"status":"PENDING","files":[]}"#);

        let outcome = rig.updater().boot().unwrap();
        assert_eq!(outcome, BootOutcome::Committed { image_started: true });
        assert_eq!(rig.stored_record(), UpdateRecord::committed());
    }

    #[test]
    fn test_restart_during_trial_rolls_back() {
        let rig = TestRig::staged("v1", "v2");
        rig.updater().boot().unwrap();

        let rig = rig.restart();
        let outcome = rig.updater().boot().unwrap();

        assert_eq!(
            outcome,
            BootOutcome::RolledBack {
                reason: RollbackReason::TrialInterrupted
            }
        );
        assert_eq!(rig.store.get_string("app").as_deref(), Some("v1"));
        assert!(rig.stored_record().is_committed());
        assert_eq!(rig.rebooter.calls().len(), 1);
        assert!(rig.loader.loaded().is_empty());
    }

    #[test]
    fn test_marker_without_files_falls_back_to_record() {
        let rig = TestRig::staged("v1", "v2");
        rig.store.rename("app", "app.bak").unwrap();
        rig.store.put(MARKER_KEY, b"not json");

        let outcome = rig.updater().boot().unwrap();
        assert!(matches!(outcome, BootOutcome::Trial { .. }));
        assert_eq!(rig.store.get_string("app").as_deref(), Some("v2"));
        assert_eq!(rig.store.get_string("app.bak").as_deref(), Some("v1"));
    }

    #[test]
    fn test_failed_undo_requests_restart() {
        let rig = TestRig::staged("v1", "v2");
        rig.store.rename("app", "app.bak").unwrap();
        let marker = SwapMarker::new(vec![FilePair::staged("app")], "");
        rig.store.put(MARKER_KEY, &serde_json::to_vec(&marker).unwrap());
        rig.store.fail_renames_from("app.bak");

        let mut outcome = None;
        let lines = capture_events(|| outcome = Some(rig.updater().boot().unwrap()));
        assert_eq!(outcome, Some(BootOutcome::RestartRequired));
        assert_eq!(events_named(&lines, event_names::SWAP_UNDO_FAILED).count(), 1);
        assert!(rig.store.get(MARKER_KEY).is_some());
        assert_eq!(rig.rebooter.calls().len(), 1);
    }

    #[test]
    fn test_unreadable_store_is_an_error() {
        let rig = TestRig::new();
        rig.store.fail_reads_of(ota_common::RECORD_KEY);
        assert!(rig.updater().boot().is_err());
    }
}
