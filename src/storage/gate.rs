//! Piece concurrency gate
//!
//! Bounds how many pieces are requested from the swarm at once. A slot is
//! taken for a piece before it is dispatched and handed back by the assembly
//! task once that piece is verified and stored, so acquire and release
//! happen in different tasks. Slots are keyed by piece index: a piece that
//! completes before it was ever dispatched never consumes a slot, and a
//! piece can only give back the slot it holds.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::trace;

use crate::error::TorrentError;

#[derive(Debug, Default)]
struct Ledger {
    held: HashSet<u32>,
    completed: HashSet<u32>,
    peak: usize,
}

#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Semaphore,
    capacity: usize,
    ledger: Mutex<Ledger>,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for a free slot and assign it to `index`.
    ///
    /// Returns `false` without holding a slot if the piece already
    /// completed.
    pub async fn acquire(&self, index: u32) -> Result<bool> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| TorrentError::protocol_error_with_source("Piece gate closed", e.to_string()))?;
        permit.forget();

        let mut ledger = self.ledger();
        if ledger.completed.contains(&index) || !ledger.held.insert(index) {
            drop(ledger);
            self.semaphore.add_permits(1);
            trace!("Piece {} needs no gate slot", index);
            return Ok(false);
        }

        let now = ledger.held.len();
        ledger.peak = ledger.peak.max(now);
        trace!("Gate slot taken for piece {}, {} of {} in flight", index, now, self.capacity);
        Ok(true)
    }

    /// Record `index` as complete and hand back its slot if it holds one
    pub fn release(&self, index: u32) -> bool {
        let mut ledger = self.ledger();
        ledger.completed.insert(index);
        if !ledger.held.remove(&index) {
            trace!("Piece {} completed without holding a gate slot", index);
            return false;
        }
        let now = ledger.held.len();
        drop(ledger);

        self.semaphore.add_permits(1);
        trace!("Gate slot released by piece {}, {} of {} in flight", index, now, self.capacity);
        true
    }

    /// Stop handing out slots; pending and future acquires fail
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.ledger().held.len()
    }

    /// Highest number of simultaneously held slots observed
    pub fn peak(&self) -> usize {
        self.ledger().peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let gate = ConcurrencyGate::new(2);
        assert!(gate.acquire(0).await.unwrap());
        assert!(gate.acquire(1).await.unwrap());
        assert_eq!(gate.in_flight(), 2);

        let third = tokio::time::timeout(Duration::from_millis(50), gate.acquire(2)).await;
        assert!(third.is_err());

        assert!(gate.release(0));
        let third = tokio::time::timeout(Duration::from_millis(50), gate.acquire(2)).await;
        assert!(third.unwrap().unwrap());
        assert_eq!(gate.peak(), 2);
    }

    #[tokio::test]
    async fn test_release_from_another_task() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        gate.acquire(0).await.unwrap();

        let releaser = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            releaser.release(0);
        });

        let next = tokio::time::timeout(Duration::from_secs(1), gate.acquire(1)).await;
        assert!(next.unwrap().unwrap());
        assert_eq!(gate.peak(), 1);
    }

    #[tokio::test]
    async fn test_peak_never_exceeds_capacity() {
        let gate = Arc::new(ConcurrencyGate::new(3));
        let mut handles = Vec::new();
        for index in 0..20u32 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.acquire(index).await.unwrap();
                tokio::task::yield_now().await;
                gate.release(index);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(gate.peak() <= 3);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_early_completion_holds_no_slot() {
        let gate = ConcurrencyGate::new(1);
        assert!(!gate.release(5));
        assert!(!gate.acquire(5).await.unwrap());
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.acquire(6).await.unwrap());
    }

    #[tokio::test]
    async fn test_double_release_is_ignored() {
        let gate = ConcurrencyGate::new(1);
        gate.acquire(0).await.unwrap();
        assert!(gate.release(0));
        assert!(!gate.release(0));
        assert!(gate.acquire(1).await.unwrap());
        let blocked = tokio::time::timeout(Duration::from_millis(50), gate.acquire(2)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_closed_gate_fails_acquire() {
        let gate = ConcurrencyGate::new(1);
        gate.close();
        assert!(gate.acquire(0).await.is_err());
    }
}
