//! [C7] Task queue: FIFO deque plus a deferred deque plus a monotonic id
//! counter, grounded 1:1 on `server-queue.h`'s `server_queue` (spec.md §4.5).
//! Single consumer (the scheduler loop); producers are HTTP worker threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::task::Task;

struct Inner {
    queue: VecDeque<Task>,
    deferred: VecDeque<Task>,
}

pub struct TaskQueue {
    inner: Mutex<Inner>,
    cv: Condvar,
    next_id: AtomicI64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { queue: VecDeque::new(), deferred: VecDeque::new() }),
            cv: Condvar::new(),
            next_id: AtomicI64::new(0),
        }
    }

    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Post a task, assigning an id if unset. `front` gives priority
    /// insertion (used for Cancel/Metrics control tasks, spec.md §4.7).
    pub fn post(&self, mut task: Task, front: bool) -> i64 {
        if task.id < 0 {
            task.id = self.next_id();
        }
        let id = task.id;
        let mut g = self.inner.lock().unwrap();
        if front {
            g.queue.push_front(task);
        } else {
            g.queue.push_back(task);
        }
        drop(g);
        self.cv.notify_all();
        id
    }

    /// Cancel-before-start: scan both deques and drop any task matching
    /// `id_target`, so a client that disconnects before the scheduler even
    /// looked at its task never gets processed at all.
    pub fn remove_task(&self, id_target: i64) -> bool {
        let mut g = self.inner.lock().unwrap();
        let before = g.queue.len() + g.deferred.len();
        g.queue.retain(|t| t.id != id_target);
        g.deferred.retain(|t| t.id != id_target);
        g.queue.len() + g.deferred.len() != before
    }

    pub fn defer(&self, task: Task) {
        let mut g = self.inner.lock().unwrap();
        g.deferred.push_back(task);
    }

    /// Promote a deferred task to the front of the main queue, preferring
    /// one whose `id_slot` matches the slot that just freed up (spec.md
    /// §4.5 `pop_deferred_task`).
    pub fn pop_deferred_task(&self, id_slot: i64) {
        let mut g = self.inner.lock().unwrap();
        if g.deferred.is_empty() {
            return;
        }
        let idx = g.deferred.iter().position(|t| t.id_slot == id_slot).unwrap_or(0);
        let task = g.deferred.remove(idx).unwrap();
        g.queue.push_front(task);
        drop(g);
        self.cv.notify_all();
    }

    /// Drain everything currently queued (not deferred) for the scheduler
    /// to process this iteration.
    pub fn drain(&self) -> Vec<Task> {
        let mut g = self.inner.lock().unwrap();
        g.queue.drain(..).collect()
    }

    pub fn is_idle(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.queue.is_empty() && g.deferred.is_empty()
    }

    /// Wait up to one second for activity, so the scheduler can re-check
    /// idle-sleep state even with nothing posted (spec.md §4.5 "the
    /// scheduler's consumer loop waits up to one second at a time").
    pub fn wait_for_activity(&self) {
        let g = self.inner.lock().unwrap();
        if !g.queue.is_empty() {
            return;
        }
        let _ = self.cv.wait_timeout(g, Duration::from_secs(1)).unwrap();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskParams, TaskType};
    use crate::token_buf::TokenBuf;

    fn task() -> Task {
        Task::new(TaskType::Completion, TaskParams::default(), TokenBuf::new(false))
    }

    #[test]
    fn post_assigns_id_and_preserves_order() {
        let q = TaskQueue::new();
        let id1 = q.post(task(), false);
        let id2 = q.post(task(), false);
        assert!(id2 > id1);
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, id1);
        assert_eq!(drained[1].id, id2);
    }

    #[test]
    fn front_priority_insertion_jumps_the_queue() {
        let q = TaskQueue::new();
        let back_id = q.post(task(), false);
        let front_id = q.post(task(), true);
        let drained = q.drain();
        assert_eq!(drained[0].id, front_id);
        assert_eq!(drained[1].id, back_id);
    }

    #[test]
    fn remove_task_cancels_before_start() {
        let q = TaskQueue::new();
        let id = q.post(task(), false);
        assert!(q.remove_task(id));
        assert!(q.drain().is_empty());
        assert!(!q.remove_task(id), "removing twice should report nothing found");
    }

    #[test]
    fn pop_deferred_task_prefers_matching_slot() {
        let q = TaskQueue::new();
        let mut a = task();
        a.id_slot = 1;
        let mut b = task();
        b.id_slot = 2;
        q.defer(a);
        q.defer(b);
        q.pop_deferred_task(2);
        let drained = q.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id_slot, 2);
    }

    #[test]
    fn is_idle_reflects_both_deques() {
        let q = TaskQueue::new();
        assert!(q.is_idle());
        q.defer(task());
        assert!(!q.is_idle());
    }
}
