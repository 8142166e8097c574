use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

/// Why a push did not happen. The job is handed back.
#[derive(Debug)]
pub(crate) enum PushError<J> {
    Full(J),
    Closed(J),
}

#[derive(Debug)]
struct QueueInner<J> {
    items: VecDeque<J>,
    closed: bool,
}

/// A worker's local double-ended queue.
///
/// The owner pops from the front; thieves take batches from the back. Both
/// ends share one mutex; steal batches are small, so contention on a busy
/// queue stays at one lock round-trip per batch. `ready` parks the owner
/// thread, `space` wakes async producers waiting on a full queue.
#[derive(Debug)]
pub(crate) struct WorkerQueue<J> {
    inner: Mutex<QueueInner<J>>,
    ready: Condvar,
    space: Notify,
    capacity: usize,
    depth: AtomicUsize,
}

impl<J> WorkerQueue<J> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            space: Notify::new(),
            capacity: capacity.max(1),
            depth: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<J>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn sync_depth(&self, inner: &QueueInner<J>) {
        self.depth.store(inner.items.len(), Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free approximate length.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Bounded push to the back.
    pub fn try_push(&self, job: J) -> Result<(), PushError<J>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(PushError::Closed(job));
        }
        if inner.items.len() >= self.capacity {
            return Err(PushError::Full(job));
        }
        inner.items.push_back(job);
        self.sync_depth(&inner);
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Append ignoring capacity, preserving order. Used when work is moved
    /// between queues and must not be refused. Returns the jobs if closed.
    pub fn push_all(&self, jobs: Vec<J>) -> Result<(), Vec<J>> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock();
        if inner.closed {
            return Err(jobs);
        }
        inner.items.extend(jobs);
        self.sync_depth(&inner);
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<J> {
        let mut inner = self.lock();
        let job = inner.items.pop_front();
        self.sync_depth(&inner);
        drop(inner);
        if job.is_some() {
            self.space.notify_one();
        }
        job
    }

    /// Block the owner for up to `timeout` until work arrives or the queue closes.
    pub fn park(&self, timeout: Duration) {
        let inner = self.lock();
        if !inner.items.is_empty() || inner.closed {
            return;
        }
        let _ = self
            .ready
            .wait_timeout(inner, timeout)
            .unwrap_or_else(|p| p.into_inner());
    }

    /// Take up to `max` items from the back, oldest first. Refuses queues
    /// holding fewer than two items and never takes more than half.
    pub fn steal(&self, max: usize) -> Vec<J> {
        let mut inner = self.lock();
        let len = inner.items.len();
        if len < 2 || inner.closed {
            return Vec::new();
        }
        let n = max.min(len / 2).max(1);
        let stolen: Vec<J> = inner.items.split_off(len - n).into();
        self.sync_depth(&inner);
        drop(inner);
        for _ in 0..stolen.len() {
            self.space.notify_one();
        }
        stolen
    }

    /// Remove every item matching `pred`, preserving relative order.
    pub fn extract(&self, mut pred: impl FnMut(&J) -> bool) -> Vec<J> {
        let mut inner = self.lock();
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(inner.items.len());
        for job in inner.items.drain(..) {
            if pred(&job) {
                taken.push(job);
            } else {
                kept.push_back(job);
            }
        }
        inner.items = kept;
        self.sync_depth(&inner);
        drop(inner);
        for _ in 0..taken.len() {
            self.space.notify_one();
        }
        taken
    }

    /// Refuse further pushes and hand back everything still queued.
    pub fn close(&self) -> Vec<J> {
        let mut inner = self.lock();
        inner.closed = true;
        let rest: Vec<J> = inner.items.drain(..).collect();
        self.sync_depth(&inner);
        drop(inner);
        self.ready.notify_all();
        self.space.notify_waiters();
        rest
    }

    /// Resolves once an item has left the queue since the last push attempt.
    pub async fn space_available(&self) {
        self.space.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[test]
    fn owner_pops_fifo() {
        let q = WorkerQueue::new(8);
        for i in 0..3 {
            q.try_push(i).unwrap();
        }
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn bounded_capacity() {
        let q = WorkerQueue::new(2);
        q.try_push(1).unwrap();
        q.try_push(2).unwrap();
        assert!(matches!(q.try_push(3), Err(PushError::Full(3))));
        q.push_all(vec![3, 4]).unwrap();
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn steal_takes_from_back_and_refuses_small_queues() {
        let q = WorkerQueue::new(16);
        q.try_push(1).unwrap();
        assert!(q.steal(4).is_empty());

        for i in 2..=8 {
            q.try_push(i).unwrap();
        }
        assert_eq!(q.steal(3), vec![6, 7, 8]);
        // Never more than half.
        assert_eq!(q.steal(10), vec![4, 5]);
        assert_eq!(q.pop(), Some(1));
    }

    #[test]
    fn extract_preserves_order() {
        let q = WorkerQueue::new(16);
        for i in 0..6 {
            q.try_push(i).unwrap();
        }
        assert_eq!(q.extract(|i| i % 2 == 0), vec![0, 2, 4]);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn close_drains_and_refuses() {
        let q = WorkerQueue::new(4);
        q.try_push(1).unwrap();
        assert_eq!(q.close(), vec![1]);
        assert!(q.is_closed());
        assert!(matches!(q.try_push(2), Err(PushError::Closed(2))));
        assert!(q.push_all(vec![3]).is_err());
    }

    #[test]
    fn park_wakes_on_push() {
        let q = Arc::new(WorkerQueue::new(4));
        let pusher = {
            let q = q.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                q.try_push(9).unwrap();
            })
        };
        let start = Instant::now();
        while q.len() == 0 && start.elapsed() < Duration::from_secs(5) {
            q.park(Duration::from_secs(1));
        }
        assert_eq!(q.pop(), Some(9));
        pusher.join().unwrap();
    }

    #[tokio::test]
    async fn producer_is_woken_when_space_frees() {
        let q = Arc::new(WorkerQueue::new(1));
        q.try_push(1).unwrap();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move {
                q.space_available().await;
                q.try_push(2).is_ok()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.pop(), Some(1));
        assert!(waiter.await.unwrap());
    }
}
