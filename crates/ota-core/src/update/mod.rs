//! The update state machine.
//!
//! [`Updater`] owns the in-process view of update state and is the only thing
//! that mutates the persisted record. Its entry points are split by concern:
//!
//! - [`boot`](Updater::boot): reconcile the record against the slots at start
//! - [`request_update`](Updater::request_update) /
//!   [`request_file_download`](Updater::request_file_download): fetch-driven
//!   entry points, resumed by [`on_fetch_complete`](Updater::on_fetch_complete)
//! - [`on_deferred`](Updater::on_deferred): timer continuations
//!   (the confirmation watchdog)
//! - [`commit`](Updater::commit), [`revert`](Updater::revert),
//!   [`status`](Updater::status): operator calls
//!
//! Every entry point reloads the record from the store before acting. All of
//! them run on the event-loop thread, so no locking is involved.

pub mod boot;
pub mod commit;
pub mod initiator;
pub mod record_store;
pub mod swap;
pub mod watchdog;

pub use boot::BootOutcome;
pub use commit::{RevertOutcome, StatusReport};
pub use initiator::Ack;
pub use record_store::{RecordOrigin, RecordStore, StoreError};
pub use swap::{RollbackSummary, SlotLayout, SwapError, SwapExecutor, UndoReport};
pub use watchdog::WatchdogVerdict;

use ota_common::UpdateRecord;
use ota_config::{CommitDetection, OtaConfig};
use std::cell::Cell;
use std::time::Duration;
use tracing::error;

use crate::host::{Deferred, FetchCompletion, FetchPurpose, Host, TimerHandle};
use crate::logging::{event_names, Stage};

/// Tunables of the state machine, taken from [`OtaConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterSettings {
    pub record_key: String,
    pub marker_key: String,
    pub active_image: String,
    pub watchdog_delay: Duration,
    pub reboot_grace: Duration,
    pub commit_detection: CommitDetection,
}

impl From<&OtaConfig> for UpdaterSettings {
    fn from(config: &OtaConfig) -> Self {
        UpdaterSettings {
            record_key: config.record_key.clone(),
            marker_key: config.marker_key.clone(),
            active_image: config.active_image.clone(),
            watchdog_delay: config.watchdog_delay(),
            reboot_grace: config.reboot_grace(),
            commit_detection: config.commit_detection,
        }
    }
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        UpdaterSettings::from(&OtaConfig::default())
    }
}

/// Why a rollback was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// The confirmation window passed without a commit.
    WatchdogExpired,
    /// The device restarted during the confirmation window.
    TrialInterrupted,
    /// Slot files did not match the pending record.
    InconsistentSlots,
    /// An operator asked for it.
    Operator,
}

impl std::fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackReason::WatchdogExpired => write!(f, "watchdog_expired"),
            RollbackReason::TrialInterrupted => write!(f, "trial_interrupted"),
            RollbackReason::InconsistentSlots => write!(f, "inconsistent_slots"),
            RollbackReason::Operator => write!(f, "operator"),
        }
    }
}

/// The update state machine.
pub struct Updater<'a> {
    host: Host<'a>,
    settings: UpdaterSettings,
    update_in_flight: Cell<bool>,
    watchdog: Cell<Option<TimerHandle>>,
}

impl<'a> Updater<'a> {
    pub fn new(host: Host<'a>, settings: UpdaterSettings) -> Self {
        Updater {
            host,
            settings,
            update_in_flight: Cell::new(false),
            watchdog: Cell::new(None),
        }
    }

    pub fn settings(&self) -> &UpdaterSettings {
        &self.settings
    }

    /// Handle of the armed confirmation watchdog, if any.
    pub fn watchdog_handle(&self) -> Option<TimerHandle> {
        self.watchdog.get()
    }

    /// Whether an update fetch has been started and not yet completed.
    pub fn update_in_flight(&self) -> bool {
        self.update_in_flight.get()
    }

    /// Resume a timer continuation.
    pub fn on_deferred(&self, task: Deferred) {
        match task {
            Deferred::ConfirmationWatchdog { files } => {
                self.on_watchdog_expired(files);
            }
        }
    }

    /// Resume a fetch started by one of the request entry points.
    pub fn on_fetch_complete(&self, completion: FetchCompletion) {
        match &completion.request.purpose {
            FetchPurpose::Update { name, size } => {
                self.finish_update(name, *size, &completion)
            }
            FetchPurpose::Download { name } => self.finish_download(name, &completion),
        }
    }

    pub(crate) fn records(&self) -> RecordStore<'_> {
        RecordStore::new(
            self.host.store,
            &self.settings.record_key,
            &self.settings.marker_key,
        )
    }

    pub(crate) fn swapper(&self) -> SwapExecutor<'_> {
        SwapExecutor::new(
            self.host.store,
            self.records(),
            self.host.rebooter,
            self.settings.reboot_grace,
        )
    }

    pub(crate) fn host(&self) -> &Host<'a> {
        &self.host
    }

    /// Run the rollback path.
    ///
    /// A rollback that fails part-way still requests a restart: the record is
    /// left `PENDING`, so the next boot sees the same update and retries.
    pub(crate) fn roll_back(
        &self,
        record: &UpdateRecord,
        reason: RollbackReason,
    ) -> Result<RollbackSummary, SwapError> {
        let result = self.swapper().rollback(record);
        if let Err(err) = &result {
            error!(
                target: event_names::ROLLBACK_FAILED,
                stage = %Stage::Rollback,
                reason = %reason,
                error = %err,
                "rollback failed, restarting to retry"
            );
            self.host.rebooter.reboot(self.settings.reboot_grace);
        }
        result
    }
}
