use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use tokio::sync::Mutex;

use crate::{Job, JobId};

#[derive(Debug)]
struct Entry {
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Jobs waiting for their dependencies and a dispatch slot.
///
/// Every operation runs under one exclusive section and never awaits while
/// holding it, so callers always observe a fully applied mutation.
#[derive(Debug, Default)]
pub struct SchedulingQueue {
    inner: Mutex<Inner>,
}

impl SchedulingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, job: Job) {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry { seq, job });
    }

    /// Removes the most urgent job, or `None` when the queue is empty.
    pub async fn dequeue(&self) -> Option<Job> {
        self.inner.lock().await.heap.pop().map(|entry| entry.job)
    }

    /// Copies the queued jobs in dispatch order.
    pub async fn snapshot(&self) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<&Entry> = inner.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|entry| entry.job.clone()).collect()
    }

    /// Removes every queued entry whose id is in `ids` and returns them in
    /// dispatch order. Ids no longer queued are skipped.
    pub async fn take_ready(&self, ids: &HashSet<JobId>) -> Vec<Job> {
        if ids.is_empty() {
            return Vec::new();
        }
        let mut inner = self.inner.lock().await;
        let (mut ready, rest): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut inner.heap)
            .into_vec()
            .into_iter()
            .partition(|entry| ids.contains(&entry.job.id));
        inner.heap = BinaryHeap::from(rest);
        ready.sort_by(|a, b| b.cmp(a));
        ready.into_iter().map(|entry| entry.job).collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.lock().await.heap.iter().any(|entry| entry.job.id == id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.heap.is_empty()
    }
}
