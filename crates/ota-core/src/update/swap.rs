//! Image swap and rollback.
//!
//! Activation renames `app -> app.bak` then `app.new -> app` for every pair,
//! bracketed by the swap marker so a swap cut short is visible at the next
//! boot. Rollback restores `app.bak -> app`.
//!
//! Slot layouts per pair (`O` active, `N` staged, `B` backup present):
//!
//! | layout        | O | N | B |
//! |---------------|---|---|---|
//! | `Staged`      | y | y | * |
//! | `Swapped`     | y | n | y |
//! | `Interrupted` | n | y | y |
//! | `Broken`      | anything else |

use ota_common::{FilePair, SwapMarker, UpdateRecord};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use super::record_store::{RecordStore, StoreError};
use crate::host::{KvStore, Rebooter};
use crate::logging::{event_names, Stage};

/// Swap executor errors.
#[derive(Debug, Error)]
pub enum SwapError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("rename {from} -> {to} failed: {source}")]
    Rename {
        from: String,
        to: String,
        #[source]
        source: io::Error,
    },

    /// The backup rename succeeded but the staged image could not be moved
    /// into place: the active name is now empty.
    #[error("{original} moved to backup but {new_name} could not replace it: {reason}")]
    Partial {
        original: String,
        new_name: String,
        reason: String,
    },

    #[error("slot check failed: {0}")]
    Io(#[from] io::Error),
}

impl From<SwapError> for ota_common::Error {
    fn from(err: SwapError) -> Self {
        match err {
            SwapError::Partial {
                original, reason, ..
            } => ota_common::Error::SwapPartialFailure { original, reason },
            other => ota_common::Error::SwapFailed(other.to_string()),
        }
    }
}

/// On-storage layout of one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotLayout {
    /// Staged image present next to the active one; ready to activate.
    Staged,
    /// Activation completed; backup holds the previous image.
    Swapped,
    /// Backup rename done, staged image not yet moved into place.
    Interrupted,
    /// No recognizable layout.
    Broken {
        original: bool,
        staged: bool,
        backup: bool,
    },
}

/// Result of a rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    /// Active names restored from their backups.
    pub restored: Vec<String>,
    /// Active names left as-is because no backup existed.
    pub skipped: Vec<String>,
}

/// Result of undoing an interrupted swap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UndoReport {
    /// Pairs returned to the staged layout.
    pub undone: usize,
    /// Active names whose layout could not be recognized.
    pub broken: Vec<String>,
}

/// Performs the rename sequences on a [`KvStore`].
pub struct SwapExecutor<'s> {
    kv: &'s dyn KvStore,
    records: RecordStore<'s>,
    rebooter: &'s dyn Rebooter,
    reboot_grace: Duration,
}

impl<'s> SwapExecutor<'s> {
    pub fn new(
        kv: &'s dyn KvStore,
        records: RecordStore<'s>,
        rebooter: &'s dyn Rebooter,
        reboot_grace: Duration,
    ) -> Self {
        SwapExecutor {
            kv,
            records,
            rebooter,
            reboot_grace,
        }
    }

    /// Classify the on-storage state of one pair.
    pub fn inspect(&self, pair: &FilePair) -> io::Result<SlotLayout> {
        let original = self.kv.exists(&pair.original_name)?;
        let staged = self.kv.exists(&pair.new_name)?;
        let backup = self.kv.exists(&pair.backup_name())?;
        Ok(match (original, staged, backup) {
            (true, true, _) => SlotLayout::Staged,
            (true, false, true) => SlotLayout::Swapped,
            (false, true, true) => SlotLayout::Interrupted,
            _ => SlotLayout::Broken {
                original,
                staged,
                backup,
            },
        })
    }

    /// Promote every staged image to active, keeping the previous image as
    /// backup.
    ///
    /// The caller undoes a failed activation with [`undo_interrupted`]; the
    /// marker stays in place on error for that purpose.
    ///
    /// [`undo_interrupted`]: Self::undo_interrupted
    pub fn activate(&self, record: &UpdateRecord) -> Result<(), SwapError> {
        let marker = SwapMarker::new(record.files.clone(), chrono::Utc::now().to_rfc3339());
        self.records.save_marker(&marker)?;

        for pair in &record.files {
            let backup = pair.backup_name();
            self.rename(&pair.original_name, &backup)?;
            if let Err(err) = self.kv.rename(&pair.new_name, &pair.original_name) {
                error!(
                    target: event_names::SWAP_PARTIAL_FAILURE,
                    stage = %Stage::Swap,
                    original = %pair.original_name,
                    new_name = %pair.new_name,
                    error = %err,
                    "staged image could not be moved into place"
                );
                return Err(SwapError::Partial {
                    original: pair.original_name.clone(),
                    new_name: pair.new_name.clone(),
                    reason: err.to_string(),
                });
            }
            info!(
                target: event_names::SWAP_ACTIVATED,
                stage = %Stage::Swap,
                original = %pair.original_name,
                backup = %backup,
                "staged image activated"
            );
        }

        self.records.clear_marker()?;
        Ok(())
    }

    /// Return every pair named by `marker` to the staged layout and clear the
    /// marker.
    ///
    /// Pairs in an unrecognizable layout are reported, not touched; the normal
    /// reconciliation path deals with them once the marker is gone. A rename
    /// failure aborts with the marker still in place.
    pub fn undo_interrupted(&self, marker: &SwapMarker) -> Result<UndoReport, SwapError> {
        let mut report = UndoReport::default();

        for pair in &marker.files {
            let backup = pair.backup_name();
            match self.inspect(pair)? {
                SlotLayout::Staged => {}
                SlotLayout::Interrupted => {
                    self.rename(&backup, &pair.original_name)?;
                    report.undone += 1;
                }
                SlotLayout::Swapped => {
                    self.rename(&pair.original_name, &pair.new_name)?;
                    self.rename(&backup, &pair.original_name)?;
                    report.undone += 1;
                }
                SlotLayout::Broken {
                    original,
                    staged,
                    backup,
                } => {
                    warn!(
                        target: event_names::SWAP_PAIR_BROKEN,
                        stage = %Stage::Swap,
                        original_name = %pair.original_name,
                        original,
                        staged,
                        backup,
                        "interrupted swap left an unrecognized layout"
                    );
                    report.broken.push(pair.original_name.clone());
                    continue;
                }
            }
            info!(
                target: event_names::SWAP_PAIR_UNDONE,
                stage = %Stage::Swap,
                original = %pair.original_name,
                "pair returned to staged layout"
            );
        }

        self.records.clear_marker()?;
        Ok(report)
    }

    /// Restore every backed-up image, record the update as resolved and
    /// request a restart.
    ///
    /// A pair without a backup keeps its current active image. The record is
    /// rewritten `{files: [], COMMITTED}`.
    pub fn rollback(&self, record: &UpdateRecord) -> Result<RollbackSummary, SwapError> {
        info!(
            target: event_names::ROLLBACK_STARTED,
            stage = %Stage::Rollback,
            files = record.files.len() as u64,
            "restoring previous images"
        );

        let mut summary = RollbackSummary::default();
        for pair in &record.files {
            let backup = pair.backup_name();
            if !self.kv.exists(&backup)? {
                warn!(
                    target: event_names::ROLLBACK_PAIR_SKIPPED,
                    stage = %Stage::Rollback,
                    original = %pair.original_name,
                    "no backup to restore, keeping current image"
                );
                summary.skipped.push(pair.original_name.clone());
                continue;
            }
            self.kv.remove(&pair.original_name)?;
            self.rename(&backup, &pair.original_name)?;
            info!(
                target: event_names::ROLLBACK_PAIR_RESTORED,
                stage = %Stage::Rollback,
                original = %pair.original_name,
                "previous image restored"
            );
            summary.restored.push(pair.original_name.clone());
        }

        self.records.save(&UpdateRecord::committed())?;
        self.records.clear_marker()?;

        info!(
            target: event_names::ROLLBACK_FINISHED,
            stage = %Stage::Rollback,
            restored = summary.restored.len() as u64,
            skipped = summary.skipped.len() as u64,
            "rollback complete, restarting"
        );
        self.rebooter.reboot(self.reboot_grace);
        Ok(summary)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), SwapError> {
        self.kv.rename(from, to).map_err(|source| SwapError::Rename {
            from: from.to_string(),
            to: to.to_string(),
            source,
        })
    }
}
