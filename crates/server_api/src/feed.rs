use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::Serialize;
use shared::{
    domain::SessionId,
    protocol::{ChangeEvent, ChangeKind, Table},
};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Fan-out of committed row changes.
///
/// Writers hold [`ChangeFeed::write_guard`] across commit and publish, so the
/// order subscribers observe on a stream is the order rows were committed.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
    seq: Arc<AtomicU64>,
    write_lock: Arc<Mutex<()>>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub async fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub fn publish<R: Serialize>(
        &self,
        session_id: SessionId,
        table: Table,
        kind: ChangeKind,
        row: &R,
    ) -> Option<ChangeEvent> {
        let row = match serde_json::to_value(row) {
            Ok(row) => row,
            Err(error) => {
                warn!(%session_id, table = table.as_str(), %error, "failed to encode change row");
                return None;
            }
        };
        let event = ChangeEvent {
            session_id,
            table,
            kind,
            row,
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
        };
        // No receivers is fine: nobody is watching this board right now.
        let receivers = self.tx.send(event.clone()).unwrap_or(0);
        debug!(
            %session_id,
            table = table.as_str(),
            kind = ?kind,
            seq = event.seq,
            receivers,
            "published change"
        );
        Some(event)
    }
}
