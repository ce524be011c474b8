//! Write-behind queue for operations that could not run immediately.
//!
//! Entries are drained in two passes per tick: priority ≥ [`HIGH_PRIORITY`]
//! first, then the rest. Within a pass higher priorities go first and equal
//! priorities keep insertion order. An entry that keeps failing moves to a
//! bounded dead-letter list after `max_attempts` tries.
//!
//! At most one entry per player is pending. A newer operation for the same
//! external id replaces the queued one, so replay never lets an older write
//! land after a newer one.

use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use tokio::sync::watch;

use player_stats::StatisticsRecord;

use crate::error::PersistenceError;
use crate::lifecycle::ConnectionState;

pub const HIGH_PRIORITY: i32 = 5;
pub const NORMAL_PRIORITY: i32 = 1;

/// A deferred repository call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingOperation {
    SaveStats {
        external_id: String,
        display_name: String,
        record: StatisticsRecord,
    },
    DeleteStats {
        external_id: String,
    },
}

impl PendingOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            PendingOperation::SaveStats { .. } => "save_stats",
            PendingOperation::DeleteStats { .. } => "delete_stats",
        }
    }

    pub fn external_id(&self) -> &str {
        match self {
            PendingOperation::SaveStats { external_id, .. }
            | PendingOperation::DeleteStats { external_id } => external_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingEntry {
    pub seq: u64,
    pub operation: PendingOperation,
    pub priority: i32,
    pub attempts: u32,
    /// Unix millis of the last attempt.
    pub last_attempt: Option<u64>,
    pub last_error: Option<String>,
}

/// Outcome of one drain tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub executed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// The tick did not run because persistence was not ready.
    pub skipped: bool,
}

pub struct PendingQueue {
    entries: Vec<PendingEntry>,
    dead_letters: VecDeque<PendingEntry>,
    capacity: usize,
    max_attempts: u32,
    next_seq: u64,
    state: watch::Receiver<ConnectionState>,
}

impl PendingQueue {
    pub fn new(
        capacity: usize,
        max_attempts: u32,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            entries: Vec::new(),
            dead_letters: VecDeque::new(),
            capacity,
            max_attempts: max_attempts.max(1),
            next_seq: 0,
            state,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[PendingEntry] {
        &self.entries
    }

    pub fn dead_letters(&self) -> impl Iterator<Item = &PendingEntry> {
        self.dead_letters.iter()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.len()
    }

    fn position_of_player(&self, external_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.operation.external_id() == external_id)
    }

    /// Queue an operation. A pending operation for the same player is
    /// replaced and the higher of the two priorities kept. Otherwise a full
    /// queue drops it.
    pub fn enqueue(
        &mut self,
        operation: PendingOperation,
        priority: i32,
    ) -> Result<u64, PersistenceError> {
        let superseded = self.position_of_player(operation.external_id());
        if superseded.is_none() && self.entries.len() >= self.capacity {
            tracing::warn!(
                kind = operation.kind(),
                external_id = %operation.external_id(),
                capacity = self.capacity,
                "Pending queue full; dropping operation"
            );
            return Err(PersistenceError::QueueFull {
                capacity: self.capacity,
            });
        }
        let priority = match superseded {
            Some(index) => {
                let old = self.entries.remove(index);
                tracing::debug!(
                    seq = old.seq,
                    kind = old.operation.kind(),
                    external_id = %old.operation.external_id(),
                    "Superseded pending operation"
                );
                priority.max(old.priority)
            }
            None => priority,
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        tracing::debug!(
            seq,
            priority,
            kind = operation.kind(),
            external_id = %operation.external_id(),
            "Queued operation"
        );
        self.entries.push(PendingEntry {
            seq,
            operation,
            priority,
            attempts: 0,
            last_attempt: None,
            last_error: None,
        });
        Ok(seq)
    }

    /// Sequence numbers in execution order: the high pass, then the normal
    /// pass, each by descending priority with ties in insertion order.
    fn drain_order(&self) -> Vec<u64> {
        let (mut high, mut normal): (Vec<&PendingEntry>, Vec<&PendingEntry>) = self
            .entries
            .iter()
            .partition(|e| e.priority >= HIGH_PRIORITY);
        // `entries` is in insertion order and the sort is stable.
        high.sort_by_key(|e| std::cmp::Reverse(e.priority));
        normal.sort_by_key(|e| std::cmp::Reverse(e.priority));
        high.into_iter().chain(normal).map(|e| e.seq).collect()
    }

    fn position(&self, seq: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.seq == seq)
    }

    /// Run one drain tick through `execute`. Stops early if persistence
    /// leaves `Ready` or an operation reports `NotReady`; those entries keep
    /// their attempt count.
    pub async fn drain<F, Fut>(&mut self, mut execute: F) -> DrainReport
    where
        F: FnMut(PendingOperation) -> Fut,
        Fut: Future<Output = Result<(), PersistenceError>>,
    {
        let mut report = DrainReport::default();
        if self.entries.is_empty() {
            return report;
        }
        if !self.state.borrow().accepts_operations() {
            report.skipped = true;
            return report;
        }

        for seq in self.drain_order() {
            if !self.state.borrow().accepts_operations() {
                break;
            }
            let Some(index) = self.position(seq) else {
                continue;
            };
            let operation = self.entries[index].operation.clone();
            let result = execute(operation).await;

            let Some(index) = self.position(seq) else {
                continue;
            };
            match result {
                Ok(()) => {
                    self.entries.remove(index);
                    report.executed += 1;
                }
                Err(PersistenceError::NotReady(state)) => {
                    tracing::debug!(%state, "Stopping drain: persistence not ready");
                    break;
                }
                Err(e) => {
                    report.failed += 1;
                    let entry = &mut self.entries[index];
                    entry.attempts += 1;
                    entry.last_attempt = Some(crate::now_millis());
                    entry.last_error = Some(e.to_string());
                    tracing::warn!(
                        seq,
                        kind = entry.operation.kind(),
                        external_id = %entry.operation.external_id(),
                        attempts = entry.attempts,
                        "Pending operation failed: {}",
                        e
                    );
                    if entry.attempts >= self.max_attempts {
                        let entry = self.entries.remove(index);
                        self.dead_letter(entry);
                        report.dead_lettered += 1;
                    }
                }
            }
        }

        if report.executed > 0 || report.failed > 0 {
            tracing::info!(
                executed = report.executed,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                remaining = self.entries.len(),
                "Drained pending queue"
            );
        }
        report
    }

    fn dead_letter(&mut self, entry: PendingEntry) {
        tracing::error!(
            seq = entry.seq,
            kind = entry.operation.kind(),
            external_id = %entry.operation.external_id(),
            attempts = entry.attempts,
            last_error = entry.last_error.as_deref().unwrap_or(""),
            "Giving up on pending operation; moved to dead letters"
        );
        if self.dead_letters.len() >= self.capacity {
            if let Some(evicted) = self.dead_letters.pop_front() {
                tracing::warn!(seq = evicted.seq, "Dead-letter list full; evicting oldest");
            }
        }
        self.dead_letters.push_back(entry);
    }

    /// Move dead letters back into the queue with a fresh attempt count, as
    /// far as capacity allows. Returns how many were requeued.
    pub fn requeue_dead_letters(&mut self) -> usize {
        let mut requeued = 0;
        while self.entries.len() < self.capacity {
            let Some(mut entry) = self.dead_letters.pop_front() else {
                break;
            };
            if self.position_of_player(entry.operation.external_id()).is_some() {
                tracing::info!(
                    seq = entry.seq,
                    external_id = %entry.operation.external_id(),
                    "Discarding dead letter superseded by a newer pending operation"
                );
                continue;
            }
            entry.attempts = 0;
            entry.seq = self.next_seq;
            self.next_seq += 1;
            self.entries.push(entry);
            requeued += 1;
        }
        if requeued > 0 {
            tracing::info!(requeued, "Requeued dead-lettered operations");
        }
        requeued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn queue(capacity: usize, max_attempts: u32) -> (PendingQueue, watch::Sender<ConnectionState>) {
        let (tx, rx) = watch::channel(ConnectionState::Ready);
        (PendingQueue::new(capacity, max_attempts, rx), tx)
    }

    fn delete(id: &str) -> PendingOperation {
        PendingOperation::DeleteStats {
            external_id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let (mut q, _state) = queue(10, 3);
        for (id, priority) in [("a", 1), ("b", 3), ("c", 1), ("d", 5)] {
            q.enqueue(delete(id), priority).unwrap();
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let report = q
            .drain(|op| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(op.external_id().to_string());
                    Ok(())
                }
            })
            .await;

        assert_eq!(report.executed, 4);
        assert!(q.is_empty());
        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["d", "b", "a", "c"]);
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("d") < pos("b"));
        assert!(pos("b") < pos("a") && pos("b") < pos("c"));
        assert!(pos("a") < pos("c"));
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let (mut q, _state) = queue(2, 3);
        q.enqueue(delete("a"), 1).unwrap();
        q.enqueue(delete("b"), 1).unwrap();
        let err = q.enqueue(delete("c"), 9).unwrap_err();
        assert!(matches!(err, PersistenceError::QueueFull { capacity: 2 }));
        assert_eq!(q.len(), 2);
    }

    fn save(id: &str, kills: u32) -> PendingOperation {
        PendingOperation::SaveStats {
            external_id: id.to_string(),
            display_name: "Alice".to_string(),
            record: StatisticsRecord {
                kills,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_newer_save_for_same_player_replaces_pending_one() {
        let (mut q, _state) = queue(2, 3);
        q.enqueue(save("p1", 1), NORMAL_PRIORITY).unwrap();
        q.enqueue(delete("p2"), NORMAL_PRIORITY).unwrap();
        // The queue is full, but replacing does not grow it.
        q.enqueue(save("p1", 2), HIGH_PRIORITY).unwrap();
        q.enqueue(save("p1", 3), NORMAL_PRIORITY).unwrap();
        assert_eq!(q.len(), 2);

        let replayed = Arc::new(Mutex::new(Vec::new()));
        q.drain(|op| {
            let replayed = replayed.clone();
            async move {
                replayed.lock().unwrap().push(op);
                Ok(())
            }
        })
        .await;

        let replayed = replayed.lock().unwrap().clone();
        assert_eq!(replayed, vec![save("p1", 3), delete("p2")]);
    }

    #[tokio::test]
    async fn test_requeue_skips_dead_letters_superseded_by_pending() {
        let (mut q, _state) = queue(10, 1);
        q.enqueue(save("p1", 1), NORMAL_PRIORITY).unwrap();
        q.drain(|_| async { Err(PersistenceError::TransactionFailed("nope".into())) })
            .await;
        assert_eq!(q.dead_letter_count(), 1);

        q.enqueue(save("p1", 2), NORMAL_PRIORITY).unwrap();
        assert_eq!(q.requeue_dead_letters(), 0);
        assert_eq!(q.dead_letter_count(), 0);
        assert_eq!(q.entries()[0].operation, save("p1", 2));
    }

    #[tokio::test]
    async fn test_failure_records_attempt_and_keeps_entry() {
        let (mut q, _state) = queue(10, 3);
        q.enqueue(delete("a"), 1).unwrap();
        let report = q
            .drain(|_| async { Err(PersistenceError::ConnectionLost("gone".into())) })
            .await;
        assert_eq!(report.failed, 1);
        let entry = &q.entries()[0];
        assert_eq!(entry.attempts, 1);
        assert!(entry.last_attempt.is_some());
        assert!(entry.last_error.as_deref().unwrap().contains("gone"));
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts_and_requeue() {
        let (mut q, _state) = queue(10, 2);
        q.enqueue(delete("a"), 1).unwrap();
        for _ in 0..2 {
            q.drain(|_| async { Err(PersistenceError::TransactionFailed("nope".into())) })
                .await;
        }
        assert!(q.is_empty());
        assert_eq!(q.dead_letter_count(), 1);

        assert_eq!(q.requeue_dead_letters(), 1);
        assert_eq!(q.len(), 1);
        assert_eq!(q.entries()[0].attempts, 0);
        assert_eq!(q.dead_letter_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_skipped_when_not_ready() {
        let (mut q, state) = queue(10, 3);
        q.enqueue(delete("a"), 1).unwrap();
        state.send_replace(ConnectionState::Recovering);
        let report = q.drain(|_| async { Ok(()) }).await;
        assert!(report.skipped);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn test_not_ready_mid_drain_keeps_attempts() {
        let (mut q, _state) = queue(10, 3);
        q.enqueue(delete("a"), 1).unwrap();
        q.enqueue(delete("b"), 1).unwrap();
        let report = q
            .drain(|_| async { Err(PersistenceError::NotReady(ConnectionState::Degraded)) })
            .await;
        assert_eq!(report.executed, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(q.len(), 2);
        assert!(q.entries().iter().all(|e| e.attempts == 0));
    }
}
