//! Per-transfer bookkeeping and cancellation
//!
//! Every transfer owns a [`TransferControl`]; cancelling one transfer only
//! flips its own signal, which the transfer loop checks at each chunk
//! boundary. Siblings on the same file channel keep running.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use super::types::{TransferRecord, TransferState};

/// Cancellation signal for one transfer
#[derive(Debug)]
pub struct TransferControl {
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Receiver for waiting on cancellation inside `select!`
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

struct Slot {
    record: TransferRecord,
    control: Arc<TransferControl>,
}

/// Map of in-flight transfers for one Transfer Session
#[derive(Default)]
pub struct TransferTable {
    slots: RwLock<HashMap<String, Slot>>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new transfer and hand back its control.
    pub fn register(&self, record: TransferRecord) -> Arc<TransferControl> {
        let control = Arc::new(TransferControl::new());
        debug!("Registered transfer {}", record.id);
        self.slots.write().insert(
            record.id.clone(),
            Slot {
                record,
                control: control.clone(),
            },
        );
        control
    }

    /// Apply `f` to the record if it is still tracked.
    pub fn update<F>(&self, transfer_id: &str, f: F)
    where
        F: FnOnce(&mut TransferRecord),
    {
        if let Some(slot) = self.slots.write().get_mut(transfer_id) {
            f(&mut slot.record);
        }
    }

    /// Record progress. The stored total never drops below `transferred`.
    pub fn advance(&self, transfer_id: &str, transferred: u64) {
        self.update(transfer_id, |record| {
            record.transferred_bytes = record.transferred_bytes.max(transferred);
            record.total_bytes = record.total_bytes.max(record.transferred_bytes);
            record.state = TransferState::Active;
        });
    }

    pub fn unregister(&self, transfer_id: &str) -> Option<TransferRecord> {
        let removed = self.slots.write().remove(transfer_id).map(|slot| slot.record);
        if removed.is_some() {
            debug!("Unregistered transfer {}", transfer_id);
        }
        removed
    }

    /// Returns false when no such transfer is tracked.
    pub fn cancel(&self, transfer_id: &str) -> bool {
        match self.slots.read().get(transfer_id) {
            Some(slot) => {
                slot.control.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let slots = self.slots.read();
        for slot in slots.values() {
            slot.control.cancel();
        }
        slots.len()
    }

    pub fn get(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.slots.read().get(transfer_id).map(|slot| slot.record.clone())
    }

    pub fn records(&self) -> Vec<TransferRecord> {
        let mut records: Vec<_> = self
            .slots
            .read()
            .values()
            .map(|slot| slot.record.clone())
            .collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the transfer from its table on every exit path.
pub struct TransferGuard {
    table: Arc<TransferTable>,
    transfer_id: String,
}

impl TransferGuard {
    pub fn new(table: Arc<TransferTable>, transfer_id: String) -> Self {
        Self { table, transfer_id }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.table.unregister(&self.transfer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::types::TransferDirection;

    fn record(id: &str, total: u64) -> TransferRecord {
        TransferRecord {
            id: id.to_string(),
            direction: TransferDirection::Upload,
            local_path: "/tmp/a".into(),
            remote_path: "/srv/a".into(),
            total_bytes: total,
            transferred_bytes: 0,
            started_at: chrono::Utc::now(),
            state: TransferState::Starting,
            error_detail: None,
        }
    }

    #[test]
    fn test_cancel_is_per_transfer() {
        let table = TransferTable::new();
        let a = table.register(record("a", 10));
        let b = table.register(record("b", 10));

        assert!(table.cancel("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!table.cancel("missing"));
    }

    #[test]
    fn test_advance_is_monotonic_and_bounded() {
        let table = TransferTable::new();
        table.register(record("a", 100));

        table.advance("a", 60);
        table.advance("a", 40);
        let r = table.get("a").unwrap();
        assert_eq!(r.transferred_bytes, 60);
        assert_eq!(r.state, TransferState::Active);

        table.advance("a", 150);
        let r = table.get("a").unwrap();
        assert_eq!(r.transferred_bytes, 150);
        assert_eq!(r.total_bytes, 150);
    }

    #[test]
    fn test_guard_unregisters_on_drop() {
        let table = Arc::new(TransferTable::new());
        table.register(record("a", 1));
        {
            let _guard = TransferGuard::new(table.clone(), "a".into());
            assert_eq!(table.len(), 1);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let table = TransferTable::new();
        let a = table.register(record("a", 1));
        let b = table.register(record("b", 1));
        assert_eq!(table.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
