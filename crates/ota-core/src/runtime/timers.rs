//! Wall-clock timer queue backing [`Scheduler`] on the event loop.

use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};

use crate::host::{Deferred, Scheduler, TimerHandle};

struct Entry {
    handle: TimerHandle,
    due: Instant,
    period: Option<Duration>,
    task: Deferred,
}

/// Timers owned by the loop thread.
#[derive(Default)]
pub struct TimerQueue {
    next_id: Cell<u64>,
    entries: RefCell<Vec<Entry>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest due time, if any timer is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.borrow().iter().map(|e| e.due).min()
    }

    /// Remove and return every task due at `now`, earliest first.
    ///
    /// Repeating timers are rescheduled one period after their due time and
    /// fire at most once per call.
    pub fn pop_due(&self, now: Instant) -> Vec<(TimerHandle, Deferred)> {
        let mut entries = self.entries.borrow_mut();
        let (mut due, rest): (Vec<Entry>, Vec<Entry>) =
            entries.drain(..).partition(|e| e.due <= now);
        *entries = rest;
        due.sort_by_key(|e| (e.due, e.handle));

        let mut fired = Vec::with_capacity(due.len());
        for mut entry in due {
            fired.push((entry.handle, entry.task.clone()));
            if let Some(period) = entry.period {
                entry.due += period;
                entries.push(entry);
            }
        }
        fired
    }
}

impl Scheduler for TimerQueue {
    fn schedule(&self, delay: Duration, repeat: bool, task: Deferred) -> TimerHandle {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        let handle = TimerHandle(id);
        self.entries.borrow_mut().push(Entry {
            handle,
            due: Instant::now() + delay,
            // A zero period would fire on every turn of the loop.
            period: (repeat && !delay.is_zero()).then_some(delay),
            task,
        });
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|e| e.handle != handle);
        entries.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Deferred {
        Deferred::ConfirmationWatchdog { files: vec![] }
    }

    #[test]
    fn test_one_shot_fires_once() {
        let timers = TimerQueue::new();
        let handle = timers.schedule(Duration::ZERO, false, task());
        let now = Instant::now();

        let fired = timers.pop_due(now);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, handle);
        assert!(timers.pop_due(now).is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn test_not_due_yet() {
        let timers = TimerQueue::new();
        timers.schedule(Duration::from_secs(60), false, task());
        assert!(timers.pop_due(Instant::now()).is_empty());
        assert!(timers.next_deadline().is_some());
    }

    #[test]
    fn test_repeating_is_rescheduled() {
        let timers = TimerQueue::new();
        timers.schedule(Duration::from_millis(10), true, task());
        let later = Instant::now() + Duration::from_millis(15);

        assert_eq!(timers.pop_due(later).len(), 1);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.pop_due(later + Duration::from_millis(10)).len(), 1);
    }

    #[test]
    fn test_cancel() {
        let timers = TimerQueue::new();
        let handle = timers.schedule(Duration::ZERO, false, task());
        assert!(timers.cancel(handle));
        assert!(!timers.cancel(handle));
        assert!(timers.pop_due(Instant::now()).is_empty());
    }

    #[test]
    fn test_fires_in_due_order() {
        let timers = TimerQueue::new();
        let late = timers.schedule(Duration::from_millis(5), false, task());
        let early = timers.schedule(Duration::ZERO, false, task());
        let fired = timers.pop_due(Instant::now() + Duration::from_millis(10));
        let order: Vec<_> = fired.into_iter().map(|(h, _)| h).collect();
        assert_eq!(order, vec![early, late]);
    }
}
