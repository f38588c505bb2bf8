//! The pump thread's view of pending work: a bounded, mutex-protected deque of due messages plus
//! an auto-reset trigger event, in the same shape as `IOQueues` (a `VecDeque`-of-pending-work
//! guarded by a lock, woken by an external signal) -- here the unit of work is "an
//! `SmtpMsgToSend` whose attempt is due" rather than a node-to-node wire message.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration as StdDuration;

use crucible_store::ObjId;

/// One message ready for a worker to attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WorkItem {
    pub msg_id: ObjId,
}

#[derive(Default)]
struct Inner {
    items: VecDeque<WorkItem>,
    triggered: bool,
}

/// A bounded work queue the pump thread fills and workers drain, plus the auto-reset
/// `pumpTrigger` event the pump thread's sleep multi-waits on.
pub struct WorkQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> WorkQueue {
        WorkQueue {
            capacity,
            inner: Mutex::new(Inner::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Blocks until there's room, then enqueues. Returns `false` if `stop` fires first.
    pub fn push(&self, item: WorkItem, stop: &crucible_store::StopSignal) -> bool {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if stop.is_cancelled() {
                return false;
            }
            if guard.items.len() < self.capacity {
                guard.items.push_back(item);
                self.not_empty.notify_one();
                return true;
            }
            let (g, _) = self.not_full.wait_timeout(guard, StdDuration::from_millis(100)).unwrap();
            guard = g;
        }
    }

    /// Blocks until an item is available or `stop` fires; `None` means stop.
    pub fn pop(&self, stop: &crucible_store::StopSignal) -> Option<WorkItem> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(item) = guard.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if stop.is_cancelled() {
                return None;
            }
            let (g, _) = self.not_empty.wait_timeout(guard, StdDuration::from_millis(100)).unwrap();
            guard = g;
        }
    }

    /// Signals the pump trigger (a new message was inserted, or a prior attempt finished and
    /// might free up a scan slot); auto-resets on the next `wait_trigger`.
    pub fn signal_pump(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.triggered = true;
        self.not_empty.notify_all();
    }

    /// Waits up to `timeout` for the pump trigger, consuming it if set (auto-reset semantics).
    /// Returns `true` if the trigger fired (rather than the timeout simply elapsing).
    pub fn wait_trigger(&self, timeout: StdDuration, stop: &crucible_store::StopSignal) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if guard.triggered {
            guard.triggered = false;
            return true;
        }
        if stop.is_cancelled() {
            return false;
        }
        let (mut g, _) = self.not_empty.wait_timeout(guard, timeout).unwrap();
        if g.triggered {
            g.triggered = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crucible_store::StopSignal;
    use std::sync::Arc;

    #[test]
    fn push_then_pop_round_trips() {
        let q = WorkQueue::new(4);
        let stop = StopSignal::new();
        let item = WorkItem { msg_id: ObjId::from_u128(7) };
        assert!(q.push(item, &stop));
        assert_eq!(q.pop(&stop), Some(item));
    }

    #[test]
    fn pop_returns_none_after_stop() {
        let q = Arc::new(WorkQueue::new(4));
        let stop = Arc::new(StopSignal::new());
        let q2 = q.clone();
        let stop2 = stop.clone();
        let handle = std::thread::spawn(move || q2.pop(&stop2));
        std::thread::sleep(StdDuration::from_millis(50));
        stop.cancel();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn trigger_auto_resets() {
        let q = WorkQueue::new(4);
        let stop = StopSignal::new();
        q.signal_pump();
        assert!(q.wait_trigger(StdDuration::from_millis(10), &stop));
        assert!(!q.wait_trigger(StdDuration::from_millis(10), &stop));
    }
}
