//! The persisted update record and swap marker.
//!
//! The record is the single source of truth for update state. It is stored as
//! JSON under one canonical key:
//!
//! ```json
//! {
//!   "status": "PENDING",
//!   "files": [{ "originalName": "app", "newName": "app.new" }]
//! }
//! ```
//!
//! Image slot names are derived from each [`FilePair`]: the active image lives
//! under `originalName`, the backup under `originalName.bak`, and the staged
//! download under `newName` (conventionally `originalName.new`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical storage key of the update record.
pub const RECORD_KEY: &str = "updater_data.json";

/// Storage key of the swap-in-progress marker.
pub const MARKER_KEY: &str = "swap_in_progress.json";

/// Suffix appended to an active image name to form its backup name.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Suffix appended to an active image name to form its staged name.
pub const STAGED_SUFFIX: &str = ".new";

/// Backup name for an active image.
pub fn backup_name(original: &str) -> String {
    format!("{}{}", original, BACKUP_SUFFIX)
}

/// Staged (downloaded, not yet activated) name for an active image.
pub fn staged_name(original: &str) -> String {
    format!("{}{}", original, STAGED_SUFFIX)
}

/// Check that a slot name is a plain file name.
///
/// Names are keys into a flat store, so separators, parent references and
/// control characters are rejected.
pub fn is_valid_slot_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control)
}

/// Update state as persisted on storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    /// Active image is confirmed good; no swap outstanding.
    Committed,
    /// A swap has been (or is about to be) performed and awaits confirmation.
    Pending,
    /// Any status string this build does not know.
    #[serde(other)]
    Unrecognized,
}

impl UpdateStatus {
    /// Stable lowercase name for logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Committed => "committed",
            UpdateStatus::Pending => "pending",
            UpdateStatus::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One replaced active-slot file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePair {
    /// Active name of the image.
    pub original_name: String,
    /// Name the replacement image is staged under.
    pub new_name: String,
}

impl FilePair {
    /// Pair for an image staged under the conventional `.new` name.
    pub fn staged(original: impl Into<String>) -> Self {
        let original_name = original.into();
        let new_name = staged_name(&original_name);
        FilePair {
            original_name,
            new_name,
        }
    }

    /// Backup name for this pair's active image.
    pub fn backup_name(&self) -> String {
        backup_name(&self.original_name)
    }

    /// Whether both names are acceptable slot names.
    pub fn is_valid(&self) -> bool {
        is_valid_slot_name(&self.original_name)
            && is_valid_slot_name(&self.new_name)
            && self.original_name != self.new_name
    }
}

impl fmt::Display for FilePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.original_name, self.new_name)
    }
}

/// The persisted update record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub status: UpdateStatus,
    #[serde(default)]
    pub files: Vec<FilePair>,
}

impl UpdateRecord {
    /// `{files: [], status: Committed}`: the first-boot and post-commit value.
    pub fn committed() -> Self {
        UpdateRecord {
            status: UpdateStatus::Committed,
            files: Vec::new(),
        }
    }

    /// Pending record for a single image staged under `name.new`.
    pub fn pending_for(name: impl Into<String>) -> Self {
        UpdateRecord {
            status: UpdateStatus::Pending,
            files: vec![FilePair::staged(name)],
        }
    }

    pub fn is_committed(&self) -> bool {
        self.status == UpdateStatus::Committed
    }

    pub fn is_pending(&self) -> bool {
        self.status == UpdateStatus::Pending
    }

    /// Check the structural invariants of a record.
    ///
    /// A pending record must name at least one file, and every pair must use
    /// valid, distinct slot names.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.is_pending() && self.files.is_empty() {
            return Err("pending record has no files".to_string());
        }
        if let Some(bad) = self.files.iter().find(|p| !p.is_valid()) {
            return Err(format!("invalid file pair: {}", bad));
        }
        Ok(())
    }

    /// Serialize to the on-storage JSON form.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse the on-storage JSON form.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl Default for UpdateRecord {
    fn default() -> Self {
        Self::committed()
    }
}

/// Journal entry bracketing a swap in progress.
///
/// Written before the first rename of a swap and removed after the last, so
/// that a swap cut short by power loss is visible at the next boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapMarker {
    pub files: Vec<FilePair>,
    /// RFC 3339 timestamp of when the swap began.
    #[serde(default)]
    pub started_at: String,
}

impl SwapMarker {
    pub fn new(files: Vec<FilePair>, started_at: impl Into<String>) -> Self {
        SwapMarker {
            files,
            started_at: started_at.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_committed_wire_format() {
        let json = String::from_utf8(UpdateRecord::committed().to_bytes().unwrap()).unwrap();
        assert_eq!(json, r#"{"status":"COMMITTED","files":[]}"#);
    }

    #[test]
    fn test_pending_wire_format() {
        let json = String::from_utf8(UpdateRecord::pending_for("app").to_bytes().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"status":"PENDING","files":[{"originalName":"app","newName":"app.new"}]}"#
        );
    }

    #[test]
    fn test_unknown_status_parses_as_unrecognized() {
        let record = UpdateRecord::from_bytes(br#"{"status":"COMMIED_OK","files":[]}"#).unwrap();
        assert_eq!(record.status, UpdateStatus::Unrecognized);
        assert!(!record.is_committed());
        assert!(!record.is_pending());
    }

    #[test]
    fn test_missing_files_defaults_to_empty() {
        let record = UpdateRecord::from_bytes(br#"{"status":"COMMITTED"}"#).unwrap();
        assert_eq!(record, UpdateRecord::committed());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(UpdateRecord::from_bytes(b"{\"status\":").is_err());
        assert!(UpdateRecord::from_bytes(b"").is_err());
    }

    #[test]
    fn test_derived_names() {
        let pair = FilePair::staged("worker.js");
        assert_eq!(pair.new_name, "worker.js.new");
        assert_eq!(pair.backup_name(), "worker.js.bak");
    }

    #[test]
    fn test_invariants() {
        assert!(UpdateRecord::committed().check_invariants().is_ok());
        assert!(UpdateRecord::pending_for("app").check_invariants().is_ok());

        let empty_pending = UpdateRecord {
            status: UpdateStatus::Pending,
            files: vec![],
        };
        assert!(empty_pending.check_invariants().is_err());

        let bad_name = UpdateRecord {
            status: UpdateStatus::Pending,
            files: vec![FilePair::staged("../etc/passwd")],
        };
        assert!(bad_name.check_invariants().is_err());
    }

    #[test]
    fn test_slot_name_validation() {
        assert!(is_valid_slot_name("app"));
        assert!(is_valid_slot_name("worker.js.new"));
        assert!(!is_valid_slot_name(""));
        assert!(!is_valid_slot_name(".."));
        assert!(!is_valid_slot_name("a/b"));
        assert!(!is_valid_slot_name("a\\b"));
        assert!(!is_valid_slot_name("a\nb"));
    }

    #[test]
    fn test_marker_wire_format() {
        let marker = SwapMarker::new(vec![FilePair::staged("app")], "2026-01-01T00:00:00Z");
        let json = serde_json::to_string(&marker).unwrap();
        assert!(json.contains(r#""startedAt":"2026-01-01T00:00:00Z""#));
        let back: SwapMarker = serde_json::from_str(&json).unwrap();
        assert_eq!(back, marker);
    }
}
