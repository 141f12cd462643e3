//! In-memory priority queue keyed by `(priority, submitted_at)`.
//!
//! Order relation: a heap keyed so that critical jobs dequeue first and,
//! at equal priority, older jobs win (spec §4.6). Implemented as a
//! `BinaryHeap` (max-heap) over an entry whose `Ord` impl encodes both
//! rules plus a monotonic sequence number to make ties fully deterministic.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::model::JobPriority;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority_rank: u8,
    submitted_at: Reverse<DateTime<Utc>>,
    seq: Reverse<u64>,
    job_id: Uuid,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority_rank, self.submitted_at, self.seq).cmp(&(
            other.priority_rank,
            other.submitted_at,
            other.seq,
        ))
    }
}

/// Bounded priority queue of job ids. The job table itself lives in the
/// manager; this queue only orders ids for dequeue.
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
    max_queue_size: usize,
    next_seq: AtomicU64,
}

impl PriorityQueue {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            max_queue_size,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Enqueue a job id. Fails with `ErrQueueFull` at capacity.
    pub fn enqueue(
        &mut self,
        job_id: Uuid,
        priority: JobPriority,
        submitted_at: DateTime<Utc>,
    ) -> Result<()> {
        if self.heap.len() >= self.max_queue_size {
            return Err(CoreError::QueueFull);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.heap.push(QueueEntry {
            priority_rank: priority.rank(),
            submitted_at: Reverse(submitted_at),
            seq: Reverse(seq),
            job_id,
        });
        Ok(())
    }

    /// Dequeue the highest-priority, oldest-submitted job id.
    /// `ErrEmpty` when nothing is available; production workers instead
    /// block on the manager's notify channel rather than poll this.
    pub fn dequeue(&mut self) -> Result<Uuid> {
        self.heap.pop().map(|e| e.job_id).ok_or(CoreError::QueueEmpty)
    }

    /// Remove a specific pending job id from the queue in place.
    /// O(n) rebuild; cancellations of pending jobs are rare (spec §4.6).
    pub fn remove(&mut self, job_id: Uuid) -> bool {
        let before = self.heap.len();
        let remaining: Vec<QueueEntry> = self.heap.drain().filter(|e| e.job_id != job_id).collect();
        let removed = remaining.len() != before;
        self.heap = remaining.into_iter().collect();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(offset_ms: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(offset_ms)
    }

    #[test]
    fn critical_dequeues_before_lower_priorities() {
        let mut q = PriorityQueue::new(100);
        let low = Uuid::new_v4();
        let critical = Uuid::new_v4();
        let normal = Uuid::new_v4();
        let high = Uuid::new_v4();
        q.enqueue(low, JobPriority::Low, t(0)).unwrap();
        q.enqueue(critical, JobPriority::Critical, t(1)).unwrap();
        q.enqueue(normal, JobPriority::Normal, t(2)).unwrap();
        q.enqueue(high, JobPriority::High, t(3)).unwrap();

        assert_eq!(q.dequeue().unwrap(), critical);
        assert_eq!(q.dequeue().unwrap(), high);
        assert_eq!(q.dequeue().unwrap(), normal);
        assert_eq!(q.dequeue().unwrap(), low);
    }

    #[test]
    fn fifo_within_equal_priority() {
        let mut q = PriorityQueue::new(100);
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            q.enqueue(*id, JobPriority::Normal, t(i as i64)).unwrap();
        }
        for id in ids {
            assert_eq!(q.dequeue().unwrap(), id);
        }
    }

    #[test]
    fn enqueue_fails_when_full() {
        let mut q = PriorityQueue::new(1);
        q.enqueue(Uuid::new_v4(), JobPriority::Normal, t(0)).unwrap();
        let err = q.enqueue(Uuid::new_v4(), JobPriority::Normal, t(1)).unwrap_err();
        assert!(matches!(err, CoreError::QueueFull));
    }

    #[test]
    fn dequeue_empty_returns_err() {
        let mut q = PriorityQueue::new(10);
        assert!(matches!(q.dequeue(), Err(CoreError::QueueEmpty)));
    }

    #[test]
    fn remove_pending_job_in_place() {
        let mut q = PriorityQueue::new(10);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.enqueue(a, JobPriority::Normal, t(0)).unwrap();
        q.enqueue(b, JobPriority::Normal, t(1)).unwrap();
        assert!(q.remove(a));
        assert_eq!(q.dequeue().unwrap(), b);
    }
}
