//! Load and save of the update record and the swap marker.
//!
//! An absent or unparsable record is never fatal: it is replaced with the
//! committed default and that default is written back immediately, so the
//! device self-heals to "nothing pending".

use ota_common::{SwapMarker, UpdateRecord};
use std::io;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::host::KvStore;
use crate::logging::{event_names, Stage};

/// Record store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<StoreError> for ota_common::Error {
    fn from(err: StoreError) -> Self {
        ota_common::Error::Storage(err.to_string())
    }
}

fn corrupt_record(key: &str, reason: &dyn std::fmt::Display) -> ota_common::Error {
    ota_common::Error::StorageCorrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Where a loaded record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrigin {
    /// Parsed from storage.
    Stored,
    /// No record existed; the default was written.
    Defaulted,
    /// The stored record was unparsable; the default replaced it.
    Repaired,
}

/// Typed access to the record and marker keys of a [`KvStore`].
#[derive(Clone, Copy)]
pub struct RecordStore<'s> {
    kv: &'s dyn KvStore,
    record_key: &'s str,
    marker_key: &'s str,
}

impl<'s> RecordStore<'s> {
    pub fn new(kv: &'s dyn KvStore, record_key: &'s str, marker_key: &'s str) -> Self {
        RecordStore {
            kv,
            record_key,
            marker_key,
        }
    }

    /// Load the record, defaulting and persisting when absent or corrupt.
    pub fn load(&self) -> Result<UpdateRecord, StoreError> {
        self.load_with_origin().map(|(record, _)| record)
    }

    /// Like [`load`](Self::load), also reporting whether a default was used.
    ///
    /// Only a failing read is an error; a failing write-back of the default
    /// is logged and the default is still returned.
    pub fn load_with_origin(&self) -> Result<(UpdateRecord, RecordOrigin), StoreError> {
        let bytes = self
            .kv
            .read(self.record_key)
            .map_err(|source| StoreError::Read {
                key: self.record_key.to_string(),
                source,
            })?;

        let origin = match bytes {
            None => {
                debug!(
                    target: event_names::RECORD_DEFAULTED,
                    stage = %Stage::Boot,
                    key = self.record_key,
                    "no update record, using committed default"
                );
                RecordOrigin::Defaulted
            }
            Some(bytes) => match UpdateRecord::from_bytes(&bytes) {
                Ok(record) => return Ok((record, RecordOrigin::Stored)),
                Err(parse_err) => {
                    let err = corrupt_record(self.record_key, &parse_err);
                    warn!(
                        target: event_names::RECORD_CORRUPT,
                        stage = %Stage::Boot,
                        key = self.record_key,
                        code = err.code(),
                        error = %err,
                        bytes = bytes.len() as u64,
                        "update record unparsable, resetting to committed"
                    );
                    RecordOrigin::Repaired
                }
            },
        };

        let record = UpdateRecord::default();
        if let Err(err) = self.save(&record) {
            error!(
                target: event_names::RECORD_WRITE_FAILED,
                stage = %Stage::Boot,
                error = %err,
                "failed to persist default update record"
            );
        }
        Ok((record, origin))
    }

    /// Serialize and durably write the record.
    pub fn save(&self, record: &UpdateRecord) -> Result<(), StoreError> {
        let bytes = record.to_bytes().map_err(|source| StoreError::Encode {
            key: self.record_key.to_string(),
            source,
        })?;
        debug!(
            target: event_names::RECORD_WRITTEN,
            key = self.record_key,
            record = %String::from_utf8_lossy(&bytes),
            "writing update record"
        );
        self.kv
            .write(self.record_key, &bytes)
            .map_err(|source| StoreError::Write {
                key: self.record_key.to_string(),
                source,
            })
    }

    /// Load the swap marker, if one is present.
    ///
    /// An unparsable marker still means a swap was interrupted; it comes back
    /// with no files so the caller falls back to the record's pairs.
    pub fn load_marker(&self) -> Result<Option<SwapMarker>, StoreError> {
        let bytes = self
            .kv
            .read(self.marker_key)
            .map_err(|source| StoreError::Read {
                key: self.marker_key.to_string(),
                source,
            })?;
        Ok(bytes.map(|bytes| {
            serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(
                    target: event_names::RECORD_CORRUPT,
                    stage = %Stage::Boot,
                    key = self.marker_key,
                    error = %err,
                    "swap marker unparsable"
                );
                SwapMarker::new(Vec::new(), "")
            })
        }))
    }

    pub fn save_marker(&self, marker: &SwapMarker) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(marker).map_err(|source| StoreError::Encode {
            key: self.marker_key.to_string(),
            source,
        })?;
        self.kv
            .write(self.marker_key, &bytes)
            .map_err(|source| StoreError::Write {
                key: self.marker_key.to_string(),
                source,
            })
    }

    pub fn clear_marker(&self) -> Result<(), StoreError> {
        self.kv
            .remove(self.marker_key)
            .map_err(|source| StoreError::Write {
                key: self.marker_key.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{capture_events, events_named, MemStore};
    use ota_common::{FilePair, UpdateStatus, MARKER_KEY, RECORD_KEY};

    fn store(kv: &MemStore) -> RecordStore<'_> {
        RecordStore::new(kv, RECORD_KEY, MARKER_KEY)
    }

    #[test]
    fn test_absent_record_defaults_and_persists() {
        let kv = MemStore::new();
        let (record, origin) = store(&kv).load_with_origin().unwrap();
        assert_eq!(record, UpdateRecord::committed());
        assert_eq!(origin, RecordOrigin::Defaulted);
        assert_eq!(
            kv.get_string(RECORD_KEY).as_deref(),
            Some(r#"{"status":"COMMITTED","files":[]}"#)
        );
    }

    #[test]
    fn test_corrupt_record_is_repaired() {
        let kv = MemStore::new();
        kv.put(RECORD_KEY, b"{\"status\":\"PEND");
        let (record, origin) = store(&kv).load_with_origin().unwrap();
        assert!(record.is_committed());
        assert_eq!(origin, RecordOrigin::Repaired);
        let persisted = UpdateRecord::from_bytes(&kv.get(RECORD_KEY).unwrap()).unwrap();
        assert!(persisted.is_committed());
    }

    #[test]
    fn test_corrupt_record_logs_code_and_write_failure() {
        let kv = MemStore::new();
        kv.put(RECORD_KEY, b"not json");
        kv.fail_writes_of(RECORD_KEY);
        let lines = capture_events(|| {
            let (record, origin) = store(&kv).load_with_origin().unwrap();
            assert!(record.is_committed());
            assert_eq!(origin, RecordOrigin::Repaired);
        });

        let corrupt: Vec<_> = events_named(&lines, event_names::RECORD_CORRUPT).collect();
        assert_eq!(corrupt.len(), 1);
        assert_eq!(corrupt[0]["fields"]["code"], 20);
        assert_eq!(events_named(&lines, event_names::RECORD_WRITE_FAILED).count(), 1);
    }

    #[test]
    fn test_corrupt_record_error_is_storage_corrupt() {
        let err = corrupt_record(RECORD_KEY, &"EOF while parsing");
        assert!(matches!(
            &err,
            ota_common::Error::StorageCorrupt { key, reason }
                if key == RECORD_KEY && reason == "EOF while parsing"
        ));
        assert_eq!(err.code(), 20);
        assert_eq!(err.category(), ota_common::ErrorCategory::Storage);
    }

    #[test]
    fn test_stored_record_round_trips() {
        let kv = MemStore::new();
        let pending = UpdateRecord::pending_for("app");
        store(&kv).save(&pending).unwrap();
        let (record, origin) = store(&kv).load_with_origin().unwrap();
        assert_eq!(record, pending);
        assert_eq!(origin, RecordOrigin::Stored);
    }

    #[test]
    fn test_unrecognized_status_is_kept_verbatim() {
        let kv = MemStore::new();
        kv.put(RECORD_KEY, br#"{"status":"COMMIED_OK","files":[]}"#);
        let record = store(&kv).load().unwrap();
        assert_eq!(record.status, UpdateStatus::Unrecognized);
        assert_eq!(
            kv.get_string(RECORD_KEY).as_deref(),
            Some(r#"{"status":"COMMIED_OK","files":[]}"#)
        );
    }

    #[test]
    fn test_read_failure_is_an_error() {
        let kv = MemStore::new();
        kv.fail_reads_of(RECORD_KEY);
        assert!(matches!(store(&kv).load(), Err(StoreError::Read { .. })));
        assert!(kv.get(RECORD_KEY).is_none());
    }

    #[test]
    fn test_failed_default_write_still_returns_default() {
        let kv = MemStore::new();
        kv.fail_writes_of(RECORD_KEY);
        let record = store(&kv).load().unwrap();
        assert!(record.is_committed());
    }

    #[test]
    fn test_marker_lifecycle() {
        let kv = MemStore::new();
        let records = store(&kv);
        assert!(records.load_marker().unwrap().is_none());

        let marker = SwapMarker::new(vec![FilePair::staged("app")], "2026-01-01T00:00:00Z");
        records.save_marker(&marker).unwrap();
        assert_eq!(records.load_marker().unwrap(), Some(marker));

        records.clear_marker().unwrap();
        assert!(records.load_marker().unwrap().is_none());
        records.clear_marker().unwrap();
    }

    #[test]
    fn test_unparsable_marker_is_present_but_empty() {
        let kv = MemStore::new();
        kv.put(MARKER_KEY, b"garbage");
        let marker = store(&kv).load_marker().unwrap().unwrap();
        assert!(marker.files.is_empty());
    }
}
