//! In-memory collaborators for exercising the state machine.
//!
//! Available to unit tests and, with the `test-utils` feature, to the
//! integration tests under `tests/`:
//! - [`MemStore`]: key/value store with per-key fault injection
//! - [`ManualScheduler`]: timers driven by an explicit clock
//! - [`RecordingRebooter`], [`RecordingLoader`]: record what was asked of them
//! - [`ScriptedFetcher`]: holds fetches until the test completes them
//! - [`TestRig`]: all of the above wired into an [`Updater`]
//! - [`capture_events`]: JSONL log lines emitted while a closure runs

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ota_common::{FilePair, UpdateRecord, RECORD_KEY};
use ota_config::CommitDetection;

use crate::host::{
    Deferred, FetchCompletion, FetchError, FetchReceipt, FetchRequest, Fetcher, Host,
    ImageLoader, KvStore, LoadError, Rebooter, Scheduler, TimerHandle,
};
use crate::logging::layer::JsonlLayer;
use crate::update::{Updater, UpdaterSettings};

#[derive(Default)]
struct Faults {
    reads: BTreeSet<String>,
    writes: BTreeSet<String>,
    renames_from: BTreeSet<String>,
}

/// Key/value store backed by a map.
#[derive(Default)]
pub struct MemStore {
    files: RefCell<BTreeMap<String, Vec<u8>>>,
    faults: RefCell<Faults>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: &str, bytes: &[u8]) {
        self.files
            .borrow_mut()
            .insert(name.to_string(), bytes.to_vec());
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(name).cloned()
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn fail_reads_of(&self, name: &str) {
        self.faults.borrow_mut().reads.insert(name.to_string());
    }

    pub fn fail_writes_of(&self, name: &str) {
        self.faults.borrow_mut().writes.insert(name.to_string());
    }

    pub fn fail_renames_from(&self, name: &str) {
        self.faults
            .borrow_mut()
            .renames_from
            .insert(name.to_string());
    }

    pub fn clear_faults(&self) {
        *self.faults.borrow_mut() = Faults::default();
    }

    fn injected(op: &str, name: &str) -> io::Error {
        io::Error::other(format!("injected {} failure on {}", op, name))
    }
}

impl KvStore for MemStore {
    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        if self.faults.borrow().reads.contains(name) {
            return Err(Self::injected("read", name));
        }
        Ok(self.get(name))
    }

    fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        if self.faults.borrow().writes.contains(name) {
            return Err(Self::injected("write", name));
        }
        self.put(name, bytes);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        if self.faults.borrow().renames_from.contains(from) {
            return Err(Self::injected("rename", from));
        }
        let mut files = self.files.borrow_mut();
        let bytes = files
            .remove(from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, from.to_string()))?;
        files.insert(to.to_string(), bytes);
        Ok(())
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        self.files.borrow_mut().remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> io::Result<bool> {
        Ok(self.files.borrow().contains_key(name))
    }
}

struct ManualTimer {
    handle: TimerHandle,
    due: Duration,
    period: Option<Duration>,
    task: Deferred,
}

/// Scheduler whose clock only moves when [`advance`](Self::advance) is called.
#[derive(Default)]
pub struct ManualScheduler {
    now: Cell<Duration>,
    next_id: Cell<u64>,
    timers: RefCell<Vec<ManualTimer>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduled timers as (handle, time remaining, task), soonest first.
    pub fn pending(&self) -> Vec<(TimerHandle, Duration, Deferred)> {
        let now = self.now.get();
        let mut out: Vec<_> = self
            .timers
            .borrow()
            .iter()
            .map(|t| (t.handle, t.due.saturating_sub(now), t.task.clone()))
            .collect();
        out.sort_by_key(|(handle, remaining, _)| (*remaining, *handle));
        out
    }

    /// Move the clock forward and return the tasks that became due, in order.
    pub fn advance(&self, by: Duration) -> Vec<Deferred> {
        let now = self.now.get() + by;
        self.now.set(now);

        let mut fired = Vec::new();
        let mut timers = self.timers.borrow_mut();
        loop {
            let next = timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.due <= now)
                .min_by_key(|(_, t)| (t.due, t.handle))
                .map(|(i, _)| i);
            let Some(index) = next else { break };
            let mut timer = timers.remove(index);
            fired.push(timer.task.clone());
            if let Some(period) = timer.period.filter(|p| !p.is_zero()) {
                timer.due += period;
                timers.push(timer);
            }
        }
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, repeat: bool, task: Deferred) -> TimerHandle {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        let handle = TimerHandle(id);
        self.timers.borrow_mut().push(ManualTimer {
            handle,
            due: self.now.get() + delay,
            period: repeat.then_some(delay),
            task,
        });
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut timers = self.timers.borrow_mut();
        let before = timers.len();
        timers.retain(|t| t.handle != handle);
        timers.len() != before
    }
}

/// Records restart requests instead of restarting.
#[derive(Default)]
pub struct RecordingRebooter {
    calls: RefCell<Vec<Duration>>,
}

impl RecordingRebooter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.borrow().clone()
    }
}

impl Rebooter for RecordingRebooter {
    fn reboot(&self, delay: Duration) {
        self.calls.borrow_mut().push(delay);
    }
}

/// Holds fetch requests until the test completes them.
#[derive(Default)]
pub struct ScriptedFetcher {
    queued: RefCell<VecDeque<FetchRequest>>,
    seen: RefCell<Vec<FetchRequest>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request ever made, in order.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.seen.borrow().clone()
    }

    /// Complete the oldest outstanding fetch by writing `bytes` to its
    /// destination.
    pub fn complete_next(&self, store: &MemStore, bytes: &[u8]) -> FetchCompletion {
        let request = self.take_next();
        store.put(&request.destination, bytes);
        FetchCompletion {
            request,
            outcome: Ok(FetchReceipt {
                bytes_written: bytes.len() as u64,
            }),
        }
    }

    /// Fail the oldest outstanding fetch.
    pub fn fail_next(&self, error: FetchError) -> FetchCompletion {
        FetchCompletion {
            request: self.take_next(),
            outcome: Err(error),
        }
    }

    fn take_next(&self) -> FetchRequest {
        self.queued
            .borrow_mut()
            .pop_front()
            .expect("no outstanding fetch")
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, request: FetchRequest) {
        self.seen.borrow_mut().push(request.clone());
        self.queued.borrow_mut().push_back(request);
    }
}

/// Records which images were started.
#[derive(Default)]
pub struct RecordingLoader {
    loaded: RefCell<Vec<String>>,
    fail: Cell<bool>,
}

impl RecordingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loaded(&self) -> Vec<String> {
        self.loaded.borrow().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.set(fail);
    }
}

impl ImageLoader for RecordingLoader {
    fn load(&self, name: &str) -> Result<(), LoadError> {
        if self.fail.get() {
            return Err(LoadError::NotFound {
                name: name.to_string(),
            });
        }
        self.loaded.borrow_mut().push(name.to_string());
        Ok(())
    }
}

/// A full set of doubles plus settings, for building an [`Updater`].
pub struct TestRig {
    pub store: MemStore,
    pub scheduler: ManualScheduler,
    pub rebooter: RecordingRebooter,
    pub fetcher: ScriptedFetcher,
    pub loader: RecordingLoader,
    pub settings: UpdaterSettings,
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRig {
    /// Empty store, default settings (10 s watchdog, 5 s grace, image `app`).
    pub fn new() -> Self {
        Self::with_store(MemStore::new())
    }

    /// `app` holds `active`, `app.new` holds `staged`, record is pending.
    pub fn staged(active: &str, staged: &str) -> Self {
        let rig = Self::new();
        rig.store.put("app", active.as_bytes());
        rig.store.put("app.new", staged.as_bytes());
        let record = UpdateRecord::pending_for("app");
        rig.store.put(
            RECORD_KEY,
            &record.to_bytes().expect("record serializes"),
        );
        rig
    }

    fn with_store(store: MemStore) -> Self {
        TestRig {
            store,
            scheduler: ManualScheduler::new(),
            rebooter: RecordingRebooter::new(),
            fetcher: ScriptedFetcher::new(),
            loader: RecordingLoader::new(),
            settings: UpdaterSettings {
                active_image: "app".to_string(),
                ..UpdaterSettings::default()
            },
        }
    }

    pub fn with_detection(mut self, detection: CommitDetection) -> Self {
        self.settings.commit_detection = detection;
        self
    }

    /// Same store, fresh process: new timers, loader, rebooter and fetcher.
    pub fn restart(self) -> Self {
        let settings = self.settings;
        TestRig {
            settings,
            ..Self::with_store(self.store)
        }
    }

    pub fn host(&self) -> Host<'_> {
        Host {
            store: &self.store,
            scheduler: &self.scheduler,
            rebooter: &self.rebooter,
            fetcher: &self.fetcher,
            loader: &self.loader,
        }
    }

    pub fn updater(&self) -> Updater<'_> {
        Updater::new(self.host(), self.settings.clone())
    }

    pub fn stored_record_raw(&self) -> Option<Vec<u8>> {
        self.store.get(&self.settings.record_key)
    }

    pub fn stored_record(&self) -> UpdateRecord {
        let bytes = self.stored_record_raw().expect("record written");
        UpdateRecord::from_bytes(&bytes).expect("record parses")
    }

    /// Pairs the armed watchdog will roll back, if one is scheduled.
    pub fn armed_files(&self) -> Option<Vec<FilePair>> {
        self.scheduler
            .pending()
            .into_iter()
            .map(|(_, _, task)| match task {
                Deferred::ConfirmationWatchdog { files } => files,
            })
            .next()
    }
}

struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log buffer poisoned").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` under a JSONL subscriber and return the parsed lines.
pub fn capture_events(f: impl FnOnce()) -> Vec<serde_json::Value> {
    use tracing_subscriber::layer::SubscriberExt;

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber =
        tracing_subscriber::registry().with(JsonlLayer::new(SharedBuf(buffer.clone())));
    tracing::subscriber::with_default(subscriber, f);

    let output = buffer.lock().expect("log buffer poisoned");
    String::from_utf8_lossy(&output)
        .lines()
        .map(|line| serde_json::from_str(line).expect("jsonl line parses"))
        .collect()
}

/// Events in `lines` whose `event` field equals `name`.
pub fn events_named<'a>(
    lines: &'a [serde_json::Value],
    name: &'a str,
) -> impl Iterator<Item = &'a serde_json::Value> + 'a {
    lines.iter().filter(move |line| line["event"] == name)
}
