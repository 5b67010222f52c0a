//! Collaborator seams between the update state machine and the device.
//!
//! The core never touches the filesystem, clock, network or process table
//! directly. It calls these traits, which the daemon implements with the
//! host adapters in this module and tests implement with in-memory doubles.
//!
//! Contracts the core relies on:
//! - [`KvStore::read`] of a missing key returns `Ok(None)`, never an error.
//! - [`KvStore::remove`] of a missing key succeeds.
//! - [`KvStore::rename`] is as atomic as the medium allows and replaces an
//!   existing destination.
//! - [`KvStore::write`] is visible entirely or not at all.
//! - Code after [`Rebooter::reboot`] is not relied upon to run.
//! - [`Fetcher::fetch`] returns immediately; its completion is delivered later
//!   on the event loop as a [`FetchCompletion`].

pub mod dir_store;
pub mod http_fetch;
pub mod launcher;

pub use dir_store::DirStore;
pub use http_fetch::HttpFetcher;
pub use launcher::ProcessLauncher;

use ota_common::FilePair;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Durable key/value file store holding images, the record and the marker.
pub trait KvStore {
    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>>;
    fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()>;
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;
    fn remove(&self, name: &str) -> io::Result<()>;
    fn exists(&self, name: &str) -> io::Result<bool>;
}

/// Process restart primitive.
pub trait Rebooter {
    /// Schedule a cold restart of the process after `delay`.
    fn reboot(&self, delay: Duration);
}

/// Handle of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

/// Work the core defers to a later turn of the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferred {
    /// Decide commit vs. rollback for the pairs swapped at boot.
    ConfirmationWatchdog { files: Vec<FilePair> },
}

/// Deferred/periodic scheduler.
pub trait Scheduler {
    fn schedule(&self, delay: Duration, repeat: bool, task: Deferred) -> TimerHandle;
    /// Returns false if the handle was unknown or already fired.
    fn cancel(&self, handle: TimerHandle) -> bool;
}

/// Why a fetch was started; routes its completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPurpose {
    /// Staged image for an update of `name`.
    Update { name: String, size: u64 },
    /// Plain download into `name`, followed by a restart.
    Download { name: String },
}

/// A fetch of `url` into the store under `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub destination: String,
    pub purpose: FetchPurpose,
}

/// Successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReceipt {
    pub bytes_written: u64,
}

/// Failed fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("could not store download: {0}")]
    Storage(String),
}

pub type FetchOutcome = Result<FetchReceipt, FetchError>;

/// A fetch result handed back to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCompletion {
    pub request: FetchRequest,
    pub outcome: FetchOutcome,
}

/// Asynchronous fetch.
pub trait Fetcher {
    fn fetch(&self, request: FetchRequest);
}

/// Errors starting the active image.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("image {name} not found")]
    NotFound { name: String },
    #[error("failed to start image {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Starts the active image.
pub trait ImageLoader {
    fn load(&self, name: &str) -> Result<(), LoadError>;
}

/// The set of collaborators the core runs against.
#[derive(Clone, Copy)]
pub struct Host<'a> {
    pub store: &'a dyn KvStore,
    pub scheduler: &'a dyn Scheduler,
    pub rebooter: &'a dyn Rebooter,
    pub fetcher: &'a dyn Fetcher,
    pub loader: &'a dyn ImageLoader,
}
