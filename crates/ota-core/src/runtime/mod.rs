//! Single-threaded cooperative event loop.
//!
//! The loop thread is the only thread that calls into the [`Updater`]. Fetch
//! workers and the RPC server thread post [`LoopEvent`]s onto a channel; timers
//! live in a [`TimerQueue`] owned by the loop. A restart request latches a
//! deadline: from then on timers and fetch completions are dropped, new RPCs
//! are refused, and the loop returns when the deadline passes.

pub mod timers;

pub use timers::TimerQueue;

use std::cell::Cell;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use ota_common::Error;
use tracing::{debug, info};

use crate::host::{FetchCompletion, Rebooter};
use crate::logging::{event_names, Stage};
use crate::rpc::{self, RpcCall, RpcResponse};
use crate::update::Updater;

/// Messages posted to the loop from other threads.
#[derive(Debug)]
pub enum LoopEvent {
    FetchDone(FetchCompletion),
    Rpc(RpcCall),
    Shutdown,
}

/// Handle other threads use to post events.
pub type LoopSender = Sender<LoopEvent>;

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A restart was requested and its grace delay elapsed.
    Restart,
    /// Shutdown was requested or every event source went away.
    Shutdown,
}

/// [`Rebooter`] that records the restart deadline for the loop to honor.
#[derive(Debug, Default)]
pub struct RestartLatch {
    deadline: Cell<Option<Instant>>,
}

impl RestartLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.get()
    }

    pub fn is_requested(&self) -> bool {
        self.deadline.get().is_some()
    }
}

impl Rebooter for RestartLatch {
    fn reboot(&self, delay: Duration) {
        let at = Instant::now() + delay;
        let deadline = match self.deadline.get() {
            Some(existing) if existing <= at => existing,
            _ => at,
        };
        self.deadline.set(Some(deadline));
        info!(
            target: event_names::REBOOT_REQUESTED,
            stage = %Stage::Runtime,
            delay_ms = delay.as_millis() as u64,
            "restart requested"
        );
    }
}

/// The event loop.
pub struct EventLoop<'a> {
    events: Receiver<LoopEvent>,
    timers: &'a TimerQueue,
    latch: &'a RestartLatch,
}

impl<'a> EventLoop<'a> {
    pub fn new(events: Receiver<LoopEvent>, timers: &'a TimerQueue, latch: &'a RestartLatch) -> Self {
        EventLoop {
            events,
            timers,
            latch,
        }
    }

    /// Dispatch events to `updater` until a restart is due or shutdown.
    pub fn run(&self, updater: &Updater<'_>) -> LoopExit {
        loop {
            let now = Instant::now();
            if let Some(deadline) = self.latch.deadline() {
                if now >= deadline {
                    info!(
                        target: event_names::REBOOT_DUE,
                        stage = %Stage::Runtime,
                        "restart deadline reached"
                    );
                    return LoopExit::Restart;
                }
            } else {
                for (handle, task) in self.timers.pop_due(now) {
                    debug!(
                        target: event_names::TIMER_FIRED,
                        stage = %Stage::Runtime,
                        timer = handle.0,
                        "timer fired"
                    );
                    updater.on_deferred(task);
                    if self.latch.is_requested() {
                        break;
                    }
                }
            }

            let wake_at = match self.latch.deadline() {
                Some(deadline) => Some(deadline),
                None => self.timers.next_deadline(),
            };
            let event = match wake_at {
                Some(at) => self
                    .events
                    .recv_timeout(at.saturating_duration_since(Instant::now())),
                None => self
                    .events
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match event {
                Ok(LoopEvent::FetchDone(completion)) => {
                    if self.latch.is_requested() {
                        debug!(
                            target: event_names::FETCH_DROPPED,
                            stage = %Stage::Runtime,
                            url = %completion.request.url,
                            "restart pending, dropping fetch completion"
                        );
                    } else {
                        updater.on_fetch_complete(completion);
                    }
                }
                Ok(LoopEvent::Rpc(call)) => {
                    let response = if self.latch.is_requested() {
                        RpcResponse::from_error(&Error::RestartPending)
                    } else {
                        rpc::dispatch(updater, &call.method, &call.body)
                    };
                    // The caller may have given up waiting.
                    let _ = call.reply.send(response);
                }
                Ok(LoopEvent::Shutdown) => return LoopExit::Shutdown,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Nothing can post anymore; only a latched restart remains.
                    let Some(deadline) = self.latch.deadline() else {
                        return LoopExit::Shutdown;
                    };
                    std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    return LoopExit::Restart;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::test_utils::{MemStore, RecordingLoader, ScriptedFetcher};
    use crate::update::UpdaterSettings;
    use ota_common::{UpdateRecord, RECORD_KEY};
    use std::sync::mpsc;

    fn settings() -> UpdaterSettings {
        UpdaterSettings {
            active_image: "app".to_string(),
            watchdog_delay: Duration::from_millis(20),
            reboot_grace: Duration::ZERO,
            ..UpdaterSettings::default()
        }
    }

    fn staged_store() -> MemStore {
        let store = MemStore::new();
        store.put("app", b"v1");
        store.put("app.new", b"v2");
        store.put(RECORD_KEY, &UpdateRecord::pending_for("app").to_bytes().unwrap());
        store
    }

    #[test]
    fn test_latch_keeps_earliest_deadline() {
        let latch = RestartLatch::new();
        latch.reboot(Duration::from_secs(60));
        let first = latch.deadline().unwrap();
        latch.reboot(Duration::from_secs(120));
        assert_eq!(latch.deadline(), Some(first));
        latch.reboot(Duration::ZERO);
        assert!(latch.deadline().unwrap() < first);
    }

    #[test]
    fn test_watchdog_expiry_ends_in_restart() {
        let store = staged_store();
        let timers = TimerQueue::new();
        let latch = RestartLatch::new();
        let fetcher = ScriptedFetcher::new();
        let loader = RecordingLoader::new();
        let host = Host {
            store: &store,
            scheduler: &timers,
            rebooter: &latch,
            fetcher: &fetcher,
            loader: &loader,
        };
        let updater = Updater::new(host, settings());
        updater.boot().unwrap();
        assert_eq!(store.get_string("app").as_deref(), Some("v2"));

        let (_tx, rx) = mpsc::channel();
        let exit = EventLoop::new(rx, &timers, &latch).run(&updater);

        assert_eq!(exit, LoopExit::Restart);
        assert_eq!(store.get_string("app").as_deref(), Some("v1"));
    }

    #[test]
    fn test_commit_over_rpc_beats_watchdog() {
        let store = staged_store();
        let timers = TimerQueue::new();
        let latch = RestartLatch::new();
        let fetcher = ScriptedFetcher::new();
        let loader = RecordingLoader::new();
        let host = Host {
            store: &store,
            scheduler: &timers,
            rebooter: &latch,
            fetcher: &fetcher,
            loader: &loader,
        };
        let updater = Updater::new(host, settings());
        updater.boot().unwrap();

        let (tx, rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        tx.send(LoopEvent::Rpc(RpcCall {
            method: "Commit".to_string(),
            body: Vec::new(),
            reply: reply_tx,
        }))
        .unwrap();
        let stopper = tx.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let _ = stopper.send(LoopEvent::Shutdown);
        });

        let exit = EventLoop::new(rx, &timers, &latch).run(&updater);
        handle.join().unwrap();

        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(reply_rx.recv().unwrap().status, 200);
        assert_eq!(store.get_string("app").as_deref(), Some("v2"));
        assert!(!latch.is_requested());
    }

    #[test]
    fn test_rpc_refused_while_restart_pending() {
        let store = MemStore::new();
        let timers = TimerQueue::new();
        let latch = RestartLatch::new();
        let fetcher = ScriptedFetcher::new();
        let loader = RecordingLoader::new();
        let host = Host {
            store: &store,
            scheduler: &timers,
            rebooter: &latch,
            fetcher: &fetcher,
            loader: &loader,
        };
        let updater = Updater::new(host, settings());
        latch.reboot(Duration::from_millis(50));

        let (tx, rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        tx.send(LoopEvent::Rpc(RpcCall {
            method: "GetStatus".to_string(),
            body: Vec::new(),
            reply: reply_tx,
        }))
        .unwrap();

        let exit = EventLoop::new(rx, &timers, &latch).run(&updater);
        assert_eq!(exit, LoopExit::Restart);
        let response = reply_rx.recv().unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(response.body["code"], 45);
    }
}
