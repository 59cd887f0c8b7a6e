//! Admission queue and concurrency limiter.
//!
//! Pure bookkeeping with no I/O. The engine keeps it behind one mutex, so a
//! pop-and-admit or a queue removal is a single atomic step and the same id
//! can never be both admitted and cancelled out of the queue.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::supervisor::RunReport;
use crate::error::EngineError;

/// A request waiting for a slot.
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub request_id: Uuid,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Caller side of an admitted run: cancel it and observe how it ended.
#[derive(Clone)]
pub struct RunHandle {
    pub cancel: CancellationToken,
    pub report: watch::Receiver<Option<RunReport>>,
}

/// Supervisor side of an admitted run.
pub struct RunControl {
    pub entry: QueuedEntry,
    pub cancel: CancellationToken,
    pub report: watch::Sender<Option<RunReport>>,
}

/// Queue position as reported to callers (1-based).
#[derive(Debug, Clone, Serialize)]
pub struct QueuedPosition {
    pub request_id: Uuid,
    pub description: String,
    pub position: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub running_count: usize,
    pub queued_count: usize,
    pub queued: Vec<QueuedPosition>,
}

pub struct AdmissionQueue {
    pending: VecDeque<QueuedEntry>,
    running: HashMap<Uuid, RunHandle>,
    /// Submissions that passed the capacity check but are not persisted yet.
    reserved: usize,
    max_running: usize,
    max_queue: usize,
}

impl AdmissionQueue {
    pub fn new(max_running: usize, max_queue: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            running: HashMap::new(),
            reserved: 0,
            max_running,
            max_queue,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_running + self.max_queue
    }

    /// Claim room for one submission, or fail with `CapacityExceeded`.
    pub fn reserve(&mut self) -> Result<(), EngineError> {
        let queued = self.pending.len() + self.reserved;
        if queued + self.running.len() >= self.capacity() {
            return Err(EngineError::CapacityExceeded {
                running: self.running.len(),
                queued,
                limit: self.capacity(),
            });
        }
        self.reserved += 1;
        Ok(())
    }

    /// Give back a reservation whose submission was abandoned.
    pub fn release_reservation(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// Turn a reservation into a queue entry. Returns its 1-based position.
    pub fn commit(&mut self, entry: QueuedEntry) -> usize {
        self.release_reservation();
        self.push(entry)
    }

    /// Enqueue without a reservation (startup recovery).
    pub fn push(&mut self, entry: QueuedEntry) -> usize {
        self.pending.push_back(entry);
        self.pending.len()
    }

    /// Pop and admit entries while a slot is free, oldest first.
    pub fn admit_ready(&mut self) -> Vec<RunControl> {
        let mut admitted = Vec::new();
        while self.running.len() < self.max_running {
            let Some(entry) = self.pending.pop_front() else {
                break;
            };
            let cancel = CancellationToken::new();
            let (report_tx, report_rx) = watch::channel(None);
            self.running.insert(
                entry.request_id,
                RunHandle {
                    cancel: cancel.clone(),
                    report: report_rx,
                },
            );
            admitted.push(RunControl {
                entry,
                cancel,
                report: report_tx,
            });
        }
        admitted
    }

    /// Remove a still-queued request. `None` if it was not queued.
    pub fn remove_queued(&mut self, request_id: Uuid) -> Option<QueuedEntry> {
        let index = self
            .pending
            .iter()
            .position(|e| e.request_id == request_id)?;
        self.pending.remove(index)
    }

    pub fn running_handle(&self, request_id: Uuid) -> Option<RunHandle> {
        self.running.get(&request_id).cloned()
    }

    pub fn is_queued(&self, request_id: Uuid) -> bool {
        self.pending.iter().any(|e| e.request_id == request_id)
    }

    /// Release the slot held by `request_id`. `false` if it held none.
    pub fn complete(&mut self, request_id: Uuid) -> bool {
        self.running.remove(&request_id).is_some()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.pending.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            running_count: self.running.len(),
            queued_count: self.pending.len(),
            queued: self
                .pending
                .iter()
                .enumerate()
                .map(|(i, e)| QueuedPosition {
                    request_id: e.request_id,
                    description: e.description.clone(),
                    position: i + 1,
                    created_at: e.created_at,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> QueuedEntry {
        QueuedEntry {
            request_id: Uuid::new_v4(),
            description: "work".into(),
            created_at: Utc::now(),
        }
    }

    fn submit(q: &mut AdmissionQueue) -> Result<Uuid, EngineError> {
        q.reserve()?;
        let e = entry();
        let id = e.request_id;
        q.commit(e);
        Ok(id)
    }

    #[test]
    fn admits_up_to_limit_in_fifo_order() {
        let mut q = AdmissionQueue::new(2, 10);
        let ids: Vec<_> = (0..5).map(|_| submit(&mut q).unwrap()).collect();

        let admitted: Vec<_> = q.admit_ready().into_iter().map(|c| c.entry.request_id).collect();
        assert_eq!(admitted, ids[..2]);
        assert_eq!(q.running_count(), 2);
        assert_eq!(q.queued_count(), 3);

        // Nothing more until a slot frees.
        assert!(q.admit_ready().is_empty());

        assert!(q.complete(ids[1]));
        let next: Vec<_> = q.admit_ready().into_iter().map(|c| c.entry.request_id).collect();
        assert_eq!(next, vec![ids[2]]);
        assert_eq!(q.running_count(), 2);
    }

    #[test]
    fn capacity_counts_running_queued_and_reserved() {
        let mut q = AdmissionQueue::new(1, 2);
        submit(&mut q).unwrap();
        q.admit_ready();
        submit(&mut q).unwrap();
        q.reserve().unwrap();

        match q.reserve() {
            Err(EngineError::CapacityExceeded { running, queued, limit }) => {
                assert_eq!((running, queued, limit), (1, 2, 3));
            }
            other => panic!("expected capacity error, got {other:?}"),
        }

        q.release_reservation();
        assert!(q.reserve().is_ok());
    }

    #[test]
    fn remove_queued_only_touches_pending() {
        let mut q = AdmissionQueue::new(1, 5);
        let running = submit(&mut q).unwrap();
        let waiting = submit(&mut q).unwrap();
        q.admit_ready();

        assert!(q.remove_queued(running).is_none());
        assert!(q.remove_queued(waiting).is_some());
        assert!(q.remove_queued(waiting).is_none());
        assert!(!q.is_queued(waiting));
        assert!(q.running_handle(running).is_some());
    }

    #[test]
    fn complete_is_counted_once() {
        let mut q = AdmissionQueue::new(1, 1);
        let id = submit(&mut q).unwrap();
        q.admit_ready();
        assert!(q.complete(id));
        assert!(!q.complete(id));
        assert_eq!(q.running_count(), 0);
    }

    #[test]
    fn snapshot_positions_are_one_based() {
        let mut q = AdmissionQueue::new(1, 5);
        for _ in 0..3 {
            submit(&mut q).unwrap();
        }
        q.admit_ready();
        let snap = q.snapshot();
        assert_eq!(snap.running_count, 1);
        assert_eq!(snap.queued_count, 2);
        let positions: Vec<_> = snap.queued.iter().map(|p| p.position).collect();
        assert_eq!(positions, vec![1, 2]);
    }

    #[test]
    fn running_never_exceeds_limit() {
        let mut q = AdmissionQueue::new(3, 20);
        let mut live = Vec::new();
        for round in 0..50 {
            if submit(&mut q).is_ok() {
                live.extend(q.admit_ready().into_iter().map(|c| c.entry.request_id));
            }
            assert!(q.running_count() <= 3);
            if round % 3 == 0 {
                if let Some(id) = live.pop() {
                    q.complete(id);
                    live.extend(q.admit_ready().into_iter().map(|c| c.entry.request_id));
                }
            }
            assert!(q.running_count() <= 3);
        }
    }
}
