//! Local send pipeline: room creation, batch self-authorization, reaction
//! dedup and extremity maintenance.

mod common;

use common::*;
use parlor::ruma::events::TimelineEventType;
use parlor::Error;
use serde_json::json;

#[tokio::test]
async fn test_create_room_batch() {
    let harness = harness();
    let alice = user("alice");

    let room_id = harness.services.rooms.generate_room_id();
    let batch = creation_batch(
        &room_id,
        &alice,
        "invite",
        json!({alice.as_str(): 100}),
        json!({}),
    );
    let result = harness
        .services
        .rooms
        .send_local_events(&room_id, batch, Default::default())
        .await
        .unwrap();

    assert_eq!(result.allowed.len(), 6);
    assert!(result.rejected.is_empty());
    assert!(result.version.is_some());

    // The room summary reflects the create batch
    let room = harness
        .services
        .rooms
        .get_room(&room_id)
        .await
        .unwrap()
        .expect("room exists");
    assert_eq!(room.member_count, 1);
    assert_eq!(
        room.version,
        Some(parlor::ruma::RoomVersionId::V10)
    );
    assert!(room.federated);

    // Full current state is exactly the six events
    let state = harness
        .services
        .rooms
        .get_current_room_state_events(&room_id)
        .await
        .unwrap();
    assert_eq!(state.len(), 6);

    // The creator is a joined member
    let members = harness
        .services
        .rooms
        .get_current_room_members(&room_id)
        .await
        .unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].0, alice);

    // Depth rises monotonically through the batch
    let depths: Vec<u64> = result.allowed.iter().map(|ev| ev.depth.into()).collect();
    assert_eq!(depths, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_send_to_unknown_room_requires_create() {
    let harness = harness();
    let alice = user("alice");
    let room_id = harness.services.rooms.generate_room_id();

    let result = harness
        .services
        .rooms
        .send_local_events(
            &room_id,
            vec![message_event(&room_id, &alice, json!({"body": "hello?"}))],
            Default::default(),
        )
        .await;

    assert!(matches!(result, Err(Error::NotInRoom)));
}

#[tokio::test]
async fn test_batch_authorizes_itself_in_order() {
    let harness = harness();
    let alice = user("alice");
    let bob = user("bob");

    // Room where the name requires level 75 and bob starts at 50
    let room_id = harness.services.rooms.generate_room_id();
    let batch = creation_batch(
        &room_id,
        &alice,
        "public",
        json!({alice.as_str(): 100, bob.as_str(): 50}),
        json!({"m.room.name": 75}),
    );
    harness
        .services
        .rooms
        .send_local_events(&room_id, batch, Default::default())
        .await
        .unwrap();
    let join = state_event(
        &room_id,
        TimelineEventType::RoomMember,
        bob.as_str(),
        &bob,
        json!({"membership": "join"}),
    );
    let result = harness
        .services
        .rooms
        .send_local_events(&room_id, vec![join], Default::default())
        .await
        .unwrap();
    assert!(result.rejected.is_empty());

    let raise_bob = state_event(
        &room_id,
        TimelineEventType::RoomPowerLevels,
        "",
        &alice,
        json!({
            "users": {alice.as_str(): 100, bob.as_str(): 75},
            "events": {"m.room.name": 75},
            "users_default": 0,
            "events_default": 0,
            "state_default": 50,
        }),
    );
    let set_name = state_event(
        &room_id,
        TimelineEventType::RoomName,
        "",
        &bob,
        json!({"name": "the war room"}),
    );

    // Granting first: the second event sees the just-authorized power
    // levels and is accepted.
    let result = harness
        .services
        .rooms
        .send_local_events(
            &room_id,
            vec![raise_bob.clone(), set_name.clone()],
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.allowed.len(), 2);
    assert!(result.rejected.is_empty());

    // Reversed in a fresh room: the name change runs against the old
    // levels and is rejected while the grant still lands.
    let room_id = harness.services.rooms.generate_room_id();
    let batch = creation_batch(
        &room_id,
        &alice,
        "public",
        json!({alice.as_str(): 100, bob.as_str(): 50}),
        json!({"m.room.name": 75}),
    );
    harness
        .services
        .rooms
        .send_local_events(&room_id, batch, Default::default())
        .await
        .unwrap();
    let join = state_event(
        &room_id,
        TimelineEventType::RoomMember,
        bob.as_str(),
        &bob,
        json!({"membership": "join"}),
    );
    harness
        .services
        .rooms
        .send_local_events(&room_id, vec![join], Default::default())
        .await
        .unwrap();

    let set_name = state_event(
        &room_id,
        TimelineEventType::RoomName,
        "",
        &bob,
        json!({"name": "the war room"}),
    );
    let raise_bob = state_event(
        &room_id,
        TimelineEventType::RoomPowerLevels,
        "",
        &alice,
        json!({
            "users": {alice.as_str(): 100, bob.as_str(): 75},
            "events": {"m.room.name": 75},
            "users_default": 0,
            "events_default": 0,
            "state_default": 50,
        }),
    );
    let result = harness
        .services
        .rooms
        .send_local_events(&room_id, vec![set_name, raise_bob], Default::default())
        .await
        .unwrap();
    assert_eq!(result.allowed.len(), 1);
    assert_eq!(result.rejected.len(), 1);
    assert_eq!(
        result.rejected[0].event.kind,
        TimelineEventType::RoomName
    );
}

#[tokio::test]
async fn test_duplicate_reaction_is_rejected() {
    let harness = harness();
    let alice = user("alice");
    let (room_id, _) = create_public_room(&harness, &alice).await;

    let message = harness
        .services
        .rooms
        .send_local_events(
            &room_id,
            vec![message_event(&room_id, &alice, json!({"body": "nice"}))],
            Default::default(),
        )
        .await
        .unwrap();
    let parent = owned_id(&message.allowed[0]);

    let reaction = |room_id, alice: &parlor::ruma::OwnedUserId| {
        parlor::types::PartialEvent::new(
            room_id,
            TimelineEventType::Reaction,
            None,
            alice.clone(),
            &json!({
                "m.relates_to": {
                    "rel_type": "m.annotation",
                    "event_id": parent,
                    "key": "👍",
                }
            }),
        )
    };

    let first = harness
        .services
        .rooms
        .send_local_events(&room_id, vec![reaction(room_id.clone(), &alice)], Default::default())
        .await
        .unwrap();
    assert_eq!(first.allowed.len(), 1);
    assert!(first.rejected.is_empty());

    let second = harness
        .services
        .rooms
        .send_local_events(&room_id, vec![reaction(room_id.clone(), &alice)], Default::default())
        .await
        .unwrap();
    assert!(second.allowed.is_empty());
    assert_eq!(second.rejected.len(), 1);
    assert!(matches!(
        second.rejected[0].error,
        Error::DuplicateAnnotation
    ));
}

#[tokio::test]
async fn test_single_local_event_collapses_extremities() {
    let harness = harness();
    let alice = user("alice");
    let (room_id, _) = create_public_room(&harness, &alice).await;

    let result = harness
        .services
        .rooms
        .send_local_events(
            &room_id,
            vec![message_event(&room_id, &alice, json!({"body": "tip"}))],
            Default::default(),
        )
        .await
        .unwrap();
    let tip = owned_id(&result.allowed[0]);

    let extrems = harness
        .services
        .rooms
        .get_current_room_extrems(&room_id)
        .await
        .unwrap();
    assert_eq!(extrems, vec![tip]);
}

#[tokio::test]
async fn test_event_round_trips_through_storage() {
    let harness = harness();
    let alice = user("alice");
    let (room_id, events) = create_public_room(&harness, &alice).await;

    let create = find_event(&events, &TimelineEventType::RoomCreate, "");
    let fetched = harness
        .services
        .rooms
        .get_event(&create.event_id)
        .await
        .unwrap()
        .expect("create event stored");

    assert_eq!(fetched.event_id, create.event_id);
    assert_eq!(fetched.room_id, room_id);
    assert_eq!(fetched.kind, TimelineEventType::RoomCreate);
    assert!(fetched.hashes.is_some());
    assert!(fetched.signatures.is_some());
    assert!(!fetched.soft_failed && !fetched.outlier);

    // ID determinism: the stored event re-hashes to its own ID
    let reference = harness
        .services
        .rooms
        .codec()
        .reference_hash(&fetched)
        .unwrap();
    assert_eq!(format!("${reference}"), fetched.event_id.as_str());
}
