use super::*;
use std::time::Duration;

use tokio::time::timeout;

fn change(session_id: SessionId, table: Table, kind: ChangeKind, seq: u64) -> ChangeEvent {
    ChangeEvent {
        session_id,
        table,
        kind,
        row: serde_json::json!({ "seq": seq }),
        seq,
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<TransportMessage>) -> TransportMessage {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message in time")
        .expect("channel open")
}

async fn expect_status(rx: &mut mpsc::UnboundedReceiver<TransportMessage>, expected: ConnectionStatus) {
    match next(rx).await {
        TransportMessage::Status { status, .. } => assert_eq!(status, expected),
        other => panic!("expected status, got {other:?}"),
    }
}

#[tokio::test]
async fn local_transport_delivers_only_matching_stream_in_order() {
    let transport = LocalEventTransport::new(16);
    let session_id = SessionId::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = subscribe_cards(&transport, session_id, Arc::new(ChannelHandler::new(tx)));

    expect_status(&mut rx, ConnectionStatus::Connecting).await;
    expect_status(&mut rx, ConnectionStatus::Connected).await;

    transport.publish(change(SessionId::new(), Table::Cards, ChangeKind::Insert, 1));
    transport.publish(change(session_id, Table::Votes, ChangeKind::Insert, 2));
    transport.publish(change(session_id, Table::Cards, ChangeKind::Insert, 3));
    transport.publish(change(session_id, Table::Cards, ChangeKind::Delete, 4));

    let TransportMessage::Change(first) = next(&mut rx).await else {
        panic!("expected change");
    };
    let TransportMessage::Change(second) = next(&mut rx).await else {
        panic!("expected change");
    };
    assert_eq!((first.seq, first.kind), (3, ChangeKind::Insert));
    assert_eq!((second.seq, second.kind), (4, ChangeKind::Delete));
}

#[tokio::test]
async fn disconnect_cycles_status_and_keeps_delivering() {
    let transport = LocalEventTransport::new(16);
    let session_id = SessionId::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = subscribe_session(&transport, session_id, Arc::new(ChannelHandler::new(tx)));
    expect_status(&mut rx, ConnectionStatus::Connecting).await;
    expect_status(&mut rx, ConnectionStatus::Connected).await;

    transport.disconnect_all();
    expect_status(&mut rx, ConnectionStatus::Connecting).await;
    expect_status(&mut rx, ConnectionStatus::Connected).await;

    transport.publish(change(session_id, Table::Sessions, ChangeKind::Update, 9));
    let TransportMessage::Change(event) = next(&mut rx).await else {
        panic!("expected change");
    };
    assert_eq!(event.seq, 9);
}

#[tokio::test]
async fn unsubscribed_handler_receives_nothing() {
    let transport = LocalEventTransport::new(16);
    let session_id = SessionId::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = subscribe_votes(&transport, session_id, Arc::new(ChannelHandler::new(tx)));
    assert_eq!(handle.table(), Table::Votes);
    handle.unsubscribe();

    transport.publish(change(session_id, Table::Votes, ChangeKind::Insert, 1));
    // The aborted task drops its sender, so the queue drains and closes.
    let drained = timeout(Duration::from_secs(2), async {
        let mut changes = 0;
        while let Some(message) = rx.recv().await {
            if matches!(message, TransportMessage::Change(_)) {
                changes += 1;
            }
        }
        changes
    })
    .await
    .expect("channel closes after unsubscribe");
    assert_eq!(drained, 0);
}
