//! Change-notification subscriptions.
//!
//! A subscription is scoped to one `(session, table)` pair. Delivery is
//! at-least-once and in commit order within that stream; there is no replay
//! buffer, so every transition to [`ConnectionStatus::Connected`] must be
//! followed by a full refetch on the consumer side.

use std::sync::Arc;

use shared::{
    domain::SessionId,
    protocol::{ChangeEvent, ChangeKind, Table},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
}

/// Receives the events of a single subscription.
pub trait ChangeHandler: Send + Sync + 'static {
    fn on_insert(&self, event: ChangeEvent);
    fn on_update(&self, event: ChangeEvent);
    fn on_delete(&self, event: ChangeEvent);
    fn on_status(&self, _table: Table, _status: ConnectionStatus) {}
}

pub fn dispatch(handler: &dyn ChangeHandler, event: ChangeEvent) {
    match event.kind {
        ChangeKind::Insert => handler.on_insert(event),
        ChangeKind::Update => handler.on_update(event),
        ChangeKind::Delete => handler.on_delete(event),
    }
}

/// What a [`ChannelHandler`] forwards to its consumer.
#[derive(Debug, Clone)]
pub enum TransportMessage {
    Change(ChangeEvent),
    Status { table: Table, status: ConnectionStatus },
}

/// Funnels every subscription into one queue so a single task can apply
/// events in arrival order.
#[derive(Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<TransportMessage>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::UnboundedSender<TransportMessage>) -> Self {
        Self { tx }
    }

    fn forward(&self, message: TransportMessage) {
        // The receiver is gone only once the controller shut down.
        let _ = self.tx.send(message);
    }
}

impl ChangeHandler for ChannelHandler {
    fn on_insert(&self, event: ChangeEvent) {
        self.forward(TransportMessage::Change(event));
    }

    fn on_update(&self, event: ChangeEvent) {
        self.forward(TransportMessage::Change(event));
    }

    fn on_delete(&self, event: ChangeEvent) {
        self.forward(TransportMessage::Change(event));
    }

    fn on_status(&self, table: Table, status: ConnectionStatus) {
        self.forward(TransportMessage::Status { table, status });
    }
}

/// Keeps a subscription alive. Dropping it unsubscribes.
pub struct SubscriptionHandle {
    session_id: SessionId,
    table: Table,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(session_id: SessionId, table: Table, task: JoinHandle<()>) -> Self {
        Self {
            session_id,
            table,
            task,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
        debug!(session_id = %self.session_id, table = self.table.as_str(), "unsubscribed");
    }
}

/// Source of change notifications. Must be called from within a tokio
/// runtime; each subscription runs on its own task.
pub trait EventTransport: Send + Sync {
    fn subscribe(
        &self,
        session_id: SessionId,
        table: Table,
        handler: Arc<dyn ChangeHandler>,
    ) -> SubscriptionHandle;
}

pub fn subscribe_cards(
    transport: &dyn EventTransport,
    session_id: SessionId,
    handler: Arc<dyn ChangeHandler>,
) -> SubscriptionHandle {
    transport.subscribe(session_id, Table::Cards, handler)
}

pub fn subscribe_votes(
    transport: &dyn EventTransport,
    session_id: SessionId,
    handler: Arc<dyn ChangeHandler>,
) -> SubscriptionHandle {
    transport.subscribe(session_id, Table::Votes, handler)
}

pub fn subscribe_session(
    transport: &dyn EventTransport,
    session_id: SessionId,
    handler: Arc<dyn ChangeHandler>,
) -> SubscriptionHandle {
    transport.subscribe(session_id, Table::Sessions, handler)
}

/// In-process transport over a tokio broadcast channel.
///
/// Used when the record store lives in the same process, and by tests.
/// [`LocalEventTransport::disconnect_all`] forces every subscription through a
/// `Connecting` → `Connected` cycle.
#[derive(Clone)]
pub struct LocalEventTransport {
    tx: broadcast::Sender<ChangeEvent>,
    generation: Arc<watch::Sender<u64>>,
}

impl LocalEventTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        let (generation, _) = watch::channel(0);
        Self {
            tx,
            generation: Arc::new(generation),
        }
    }

    /// Returns how many subscriptions received the event.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn disconnect_all(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }
}

impl EventTransport for LocalEventTransport {
    fn subscribe(
        &self,
        session_id: SessionId,
        table: Table,
        handler: Arc<dyn ChangeHandler>,
    ) -> SubscriptionHandle {
        // The first receiver exists before `subscribe` returns, so nothing
        // published afterwards is missed.
        let mut first = Some(self.tx.subscribe());
        let tx = self.tx.clone();
        let mut generation = self.generation.subscribe();

        let task = tokio::spawn(async move {
            loop {
                handler.on_status(table, ConnectionStatus::Connecting);
                let mut rx = first.take().unwrap_or_else(|| tx.subscribe());
                let _ = generation.borrow_and_update();
                handler.on_status(table, ConnectionStatus::Connected);

                loop {
                    tokio::select! {
                        changed = generation.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            debug!(%session_id, table = table.as_str(), "local transport reset");
                            break;
                        }
                        received = rx.recv() => match received {
                            Ok(event) => {
                                if event.session_id == session_id && event.table == table {
                                    dispatch(handler.as_ref(), event);
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(%session_id, table = table.as_str(), skipped, "subscriber lagged; resubscribing");
                                break;
                            }
                            Err(RecvError::Closed) => return,
                        }
                    }
                }
            }
        });

        SubscriptionHandle::new(session_id, table, task)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
