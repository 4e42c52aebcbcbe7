//! Background workers end to end: the events iterator fans new events out
//! to per-destination federation senders, which drain the backlog through
//! the sync engine and the federation transport.

mod common;

use std::time::Duration;

use common::*;
use parlor::database::Versionstamp;
use parlor::ruma::events::TimelineEventType;
use serde_json::json;

#[tokio::test]
async fn test_events_flow_to_remote_server() {
    let harness = harness();
    let remote = RemoteServer::new(REMOTE_SERVER);
    let alice = user("alice");
    let bob = remote_user("bob");

    // Room with a resident remote server
    let room_id = harness.services.rooms.generate_room_id();
    let batch = creation_batch(
        &room_id,
        &alice,
        "public",
        json!({alice.as_str(): 100}),
        json!({}),
    );
    let created = harness
        .services
        .rooms
        .send_local_events(&room_id, batch, Default::default())
        .await
        .unwrap();
    let create_id = owned_id(find_event(&created.allowed, &TimelineEventType::RoomCreate, ""));
    let pl_id = owned_id(find_event(
        &created.allowed,
        &TimelineEventType::RoomPowerLevels,
        "",
    ));
    let jr_id = owned_id(find_event(
        &created.allowed,
        &TimelineEventType::RoomJoinRules,
        "",
    ));
    let last_id = owned_id(created.allowed.last().unwrap());

    let join = remote.build_event(
        &room_id,
        &bob,
        TimelineEventType::RoomMember,
        Some(bob.as_str()),
        json!({"membership": "join"}),
        6,
        &[last_id],
        &[create_id, pl_id, jr_id],
    );
    harness
        .services
        .rooms
        .send_federated_events(&room_id, vec![join], Default::default())
        .await
        .unwrap();

    let workers = harness.services.start_workers();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A local event while the remote server is resident
    harness
        .services
        .rooms
        .send_local_events(
            &room_id,
            vec![message_event(&room_id, &alice, json!({"body": "fan out"}))],
            Default::default(),
        )
        .await
        .unwrap();

    // The sender should push a transaction to the destination
    let mut delivered = None;
    for _ in 0..100 {
        let sent = harness.transport.sent_transactions();
        if let Some(transaction) = sent.iter().find(|txn| {
            txn.pdus.iter().any(|pdu| {
                serde_json::from_str::<serde_json::Value>(pdu.get())
                    .map(|value| value["content"]["body"] == "fan out")
                    .unwrap_or(false)
            })
        }) {
            delivered = Some(transaction.clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let transaction = delivered.expect("transaction reached the destination");
    assert_eq!(transaction.destination, remote.name);
    assert_eq!(transaction.origin.as_str(), LOCAL_SERVER);
    assert!(!transaction.transaction_id.is_empty());

    // PDUs travel in wire format: no event_id, no internal fields
    for pdu in &transaction.pdus {
        let value: serde_json::Value = serde_json::from_str(pdu.get()).unwrap();
        assert!(value.get("event_id").is_none());
        assert!(value.get("soft_failed").is_none());
        assert!(value.get("room_version").is_none());
    }

    // The iterator advanced its persisted position under its lease
    let mut advanced = false;
    for _ in 0..100 {
        if harness
            .services
            .rooms
            .get_events_iterator_position()
            .await
            .unwrap()
            != Versionstamp::ZERO
        {
            advanced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(advanced, "iterator position advanced");

    // The destination's sync position advanced too, so a fresh sender
    // would not resend the backlog
    let positions = harness
        .services
        .rooms
        .get_server_positions(&remote.name)
        .await
        .unwrap();
    assert!(positions.get(parlor::types::ROOMS_STREAM).is_some());

    workers.stop().await;
    harness.services.shutdown().await;
}

#[tokio::test]
async fn test_workers_stop_cleanly_without_traffic() {
    let harness = harness();
    let workers = harness.services.start_workers();
    tokio::time::sleep(Duration::from_millis(50)).await;
    workers.stop().await;
    harness.services.shutdown().await;
}
