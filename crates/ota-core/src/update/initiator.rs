//! Request-driven update and download entry points.
//!
//! Both return an acknowledgement immediately and continue in
//! [`Updater::on_fetch_complete`] once the fetch finishes.

use ota_common::record::is_valid_slot_name;
use ota_common::{Error, FilePair, UpdateRecord};
use serde::Serialize;
use tracing::{error, info, warn};

use super::Updater;
use crate::host::{FetchCompletion, FetchPurpose, FetchRequest};
use crate::logging::{event_names, Stage};

/// Acknowledgement returned to the caller of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub result: String,
    #[serde(skip)]
    pub accepted: bool,
}

impl Ack {
    fn accepted(result: &str) -> Self {
        Ack {
            result: result.to_string(),
            accepted: true,
        }
    }

    fn rejected(what: &str, err: &Error) -> Self {
        Ack {
            result: format!("{} rejected: {}", what, err),
            accepted: false,
        }
    }
}

impl Updater<'_> {
    /// Fetch `url` as the staged image for `name`, then mark it pending and
    /// restart.
    ///
    /// `size` is the announced image size; it is only compared against the
    /// bytes received for logging.
    pub fn request_update(&self, url: &str, size: u64, name: &str) -> Ack {
        info!(
            target: event_names::UPDATE_REQUESTED,
            stage = %Stage::Update,
            url = %url,
            size,
            name = %name,
            "update requested"
        );

        let pair = FilePair::staged(name);
        if let Err(err) = self.check_update_allowed(&pair) {
            warn!(
                target: event_names::UPDATE_REJECTED,
                stage = %Stage::Update,
                code = err.code(),
                error = %err,
                "update rejected"
            );
            return Ack::rejected("Update", &err);
        }

        if let Err(err) = self.host().store.remove(&pair.new_name) {
            let err = Error::Storage(format!("could not clear {}: {}", pair.new_name, err));
            warn!(
                target: event_names::UPDATE_REJECTED,
                stage = %Stage::Update,
                error = %err,
                "update rejected"
            );
            return Ack::rejected("Update", &err);
        }

        self.update_in_flight.set(true);
        self.host().fetcher.fetch(FetchRequest {
            url: url.to_string(),
            destination: pair.new_name,
            purpose: FetchPurpose::Update {
                name: name.to_string(),
                size,
            },
        });
        Ack::accepted("Update started")
    }

    /// Replace `name` with the content of `url`, then restart whatever the
    /// outcome.
    pub fn request_file_download(&self, url: &str, name: &str) -> Ack {
        info!(
            target: event_names::DOWNLOAD_REQUESTED,
            stage = %Stage::Download,
            url = %url,
            name = %name,
            "file download requested"
        );

        if let Err(err) = self.check_name(name) {
            warn!(
                target: event_names::DOWNLOAD_FAILED,
                stage = %Stage::Download,
                error = %err,
                "download rejected"
            );
            return Ack::rejected("Download", &err);
        }

        if let Err(err) = self.host().store.remove(name) {
            warn!(
                target: event_names::DOWNLOAD_FAILED,
                stage = %Stage::Download,
                name = %name,
                error = %err,
                "could not remove existing file"
            );
        }

        self.host().fetcher.fetch(FetchRequest {
            url: url.to_string(),
            destination: name.to_string(),
            purpose: FetchPurpose::Download {
                name: name.to_string(),
            },
        });
        Ack::accepted("Download started")
    }

    pub(crate) fn finish_update(&self, name: &str, size: u64, completion: &FetchCompletion) {
        self.update_in_flight.set(false);

        match &completion.outcome {
            Ok(receipt) => {
                if size != 0 && receipt.bytes_written != size {
                    warn!(
                        target: event_names::UPDATE_STAGED,
                        stage = %Stage::Update,
                        expected = size,
                        received = receipt.bytes_written,
                        "staged image size differs from announced size"
                    );
                }
                match self.records().save(&UpdateRecord::pending_for(name)) {
                    Ok(()) => {
                        info!(
                            target: event_names::UPDATE_STAGED,
                            stage = %Stage::Update,
                            name = %name,
                            bytes = receipt.bytes_written,
                            "update staged, restarting to activate"
                        );
                        self.host().rebooter.reboot(self.settings().reboot_grace);
                    }
                    Err(err) => {
                        error!(
                            target: event_names::UPDATE_RECORD_FAILED,
                            stage = %Stage::Update,
                            error = %err,
                            "could not record pending update"
                        );
                    }
                }
            }
            Err(fetch_err) => {
                let err = Error::FetchFailed {
                    url: completion.request.url.clone(),
                    reason: fetch_err.to_string(),
                };
                warn!(
                    target: event_names::UPDATE_FETCH_FAILED,
                    stage = %Stage::Update,
                    code = err.code(),
                    url = %completion.request.url,
                    error = %err,
                    "update fetch failed, nothing changed"
                );
                // Partial downloads are never activated; drop them.
                let _ = self.host().store.remove(&completion.request.destination);
            }
        }
    }

    pub(crate) fn finish_download(&self, name: &str, completion: &FetchCompletion) {
        match &completion.outcome {
            Ok(receipt) => info!(
                target: event_names::DOWNLOAD_FINISHED,
                stage = %Stage::Download,
                name = %name,
                bytes = receipt.bytes_written,
                "file downloaded, restarting"
            ),
            Err(err) => warn!(
                target: event_names::DOWNLOAD_FAILED,
                stage = %Stage::Download,
                name = %name,
                url = %completion.request.url,
                error = %err,
                "file download failed, restarting"
            ),
        }
        self.host().rebooter.reboot(self.settings().reboot_grace);
    }

    fn check_update_allowed(&self, pair: &FilePair) -> Result<(), Error> {
        self.check_name(&pair.original_name)?;
        self.check_name(&pair.new_name)?;
        if self.update_in_flight.get() {
            return Err(Error::UpdateInProgress);
        }
        if self.records().load()?.is_pending() {
            return Err(Error::UpdatePending);
        }
        Ok(())
    }

    /// Slot names must be plain and must not shadow the updater's own keys.
    fn check_name(&self, name: &str) -> Result<(), Error> {
        let settings = self.settings();
        let reserved = name == settings.record_key
            || name == settings.marker_key
            || name.ends_with(ota_common::record::BACKUP_SUFFIX);
        if !is_valid_slot_name(name) || reserved {
            return Err(Error::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FetchError;
    use crate::test_utils::TestRig;
    use std::time::Duration;

    #[test]
    fn test_update_stages_into_new_name() {
        let rig = TestRig::new();
        rig.store.put("app", b"v1");
        rig.store.put("app.new", b"stale");
        let updater = rig.updater();

        let ack = updater.request_update("http://fw/app-v2", 2, "app");
        assert_eq!(ack.result, "Update started");
        assert!(ack.accepted);
        assert!(updater.update_in_flight());
        assert!(rig.store.get("app.new").is_none());

        let completion = rig.fetcher.complete_next(&rig.store, b"v2");
        assert_eq!(completion.request.destination, "app.new");
        updater.on_fetch_complete(completion);

        assert!(!updater.update_in_flight());
        assert_eq!(rig.store.get_string("app").as_deref(), Some("v1"));
        assert_eq!(rig.store.get_string("app.new").as_deref(), Some("v2"));
        assert_eq!(rig.stored_record(), UpdateRecord::pending_for("app"));
        assert_eq!(rig.rebooter.calls(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn test_failed_fetch_changes_nothing() {
        let rig = TestRig::new();
        rig.store.put("app", b"v1");
        let updater = rig.updater();
        updater.commit().unwrap();
        let before = rig.store.get(ota_common::RECORD_KEY);

        updater.request_update("http://fw/missing", 10, "app");
        updater.on_fetch_complete(rig.fetcher.fail_next(FetchError::Status(404)));

        assert_eq!(rig.store.get(ota_common::RECORD_KEY), before);
        assert!(rig.rebooter.calls().is_empty());
        assert!(rig.store.get("app.new").is_none());
        assert!(!updater.update_in_flight());
    }

    #[test]
    fn test_update_rejected_while_pending() {
        let rig = TestRig::staged("v1", "v2");
        let ack = rig.updater().request_update("http://fw/x", 1, "app");
        assert!(!ack.accepted);
        assert!(ack.result.starts_with("Update rejected"));
        assert!(rig.fetcher.requests().is_empty());
    }

    #[test]
    fn test_update_rejected_while_in_flight() {
        let rig = TestRig::new();
        let updater = rig.updater();
        assert!(updater.request_update("http://fw/a", 1, "app").accepted);
        let second = updater.request_update("http://fw/b", 1, "app");
        assert!(!second.accepted);
        assert!(second.result.contains("already in progress"));
        assert_eq!(rig.fetcher.requests().len(), 1);
    }

    #[test]
    fn test_reserved_and_invalid_names_rejected() {
        let rig = TestRig::new();
        let updater = rig.updater();
        for name in ["", "../app", ota_common::RECORD_KEY, "app.bak"] {
            assert!(!updater.request_update("http://fw/a", 1, name).accepted, "{}", name);
            assert!(!updater.request_file_download("http://fw/a", name).accepted, "{}", name);
        }
        assert!(rig.fetcher.requests().is_empty());
    }

    #[test]
    fn test_download_always_restarts() {
        let rig = TestRig::new();
        rig.store.put("config.json", b"old");
        let updater = rig.updater();

        let ack = updater.request_file_download("http://fw/config", "config.json");
        assert_eq!(ack.result, "Download started");
        assert!(rig.store.get("config.json").is_none());
        updater.on_fetch_complete(rig.fetcher.fail_next(FetchError::Transport("reset".into())));
        assert_eq!(rig.rebooter.calls().len(), 1);

        updater.request_file_download("http://fw/config", "config.json");
        updater.on_fetch_complete(rig.fetcher.complete_next(&rig.store, b"new"));
        assert_eq!(rig.store.get_string("config.json").as_deref(), Some("new"));
        assert_eq!(rig.rebooter.calls().len(), 2);
        assert_eq!(rig.stored_record_raw(), None);
    }
}
