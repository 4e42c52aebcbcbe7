//! Shared harness for the integration suites: services over the in-memory
//! engine, a recording federation transport, and a helper impersonating a
//! remote homeserver so federated events arrive properly signed.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once};

use parlor::database::MemoryEngine;
use parlor::ruma::{
    events::TimelineEventType, signatures::Ed25519KeyPair, CanonicalJsonObject,
    MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId,
    RoomVersionId, UInt,
};
use parlor::service::codec::EventCodec;
use parlor::service::federation::{
    FederationTransport, JoinTemplate, ServerKeys, Transaction, TransactionResult,
};
use parlor::service::notifier::MemoryChangeBus;
use parlor::types::{Event, PartialEvent};
use parlor::{Config, Result, Services};

use async_trait::async_trait;
use serde_json::{json, value::RawValue as RawJsonValue};

pub const LOCAL_SERVER: &str = "parlor.test";
pub const REMOTE_SERVER: &str = "remote.test";

/// Recording transport: serves registered server keys and collects sent
/// transactions for assertions.
pub struct MockTransport {
    keys: Mutex<BTreeMap<OwnedServerName, ServerKeys>>,
    pub sent: Mutex<Vec<Transaction>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            keys: Mutex::new(BTreeMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn register_server_keys(&self, keys: ServerKeys) {
        self.keys
            .lock()
            .unwrap()
            .insert(keys.server_name.clone(), keys);
    }

    pub fn sent_transactions(&self) -> Vec<Transaction> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl FederationTransport for MockTransport {
    async fn get_server_keys(&self, server_name: &OwnedServerName) -> Result<ServerKeys> {
        self.keys
            .lock()
            .unwrap()
            .get(server_name)
            .cloned()
            .ok_or_else(|| parlor::Error::Transport(format!("no keys for {server_name}")))
    }

    async fn get_event(
        &self,
        _destination: &OwnedServerName,
        _event_id: &OwnedEventId,
    ) -> Result<Box<RawJsonValue>> {
        Err(parlor::Error::Transport("get_event not mocked".to_owned()))
    }

    async fn make_join(
        &self,
        _destination: &OwnedServerName,
        _room_id: &OwnedRoomId,
        _user_id: &OwnedUserId,
    ) -> Result<JoinTemplate> {
        Err(parlor::Error::Transport("make_join not mocked".to_owned()))
    }

    async fn send_join(
        &self,
        _destination: &OwnedServerName,
        _room_id: &OwnedRoomId,
        _event: &CanonicalJsonObject,
    ) -> Result<()> {
        Ok(())
    }

    async fn send_invite_v2(
        &self,
        _destination: &OwnedServerName,
        _room_id: &OwnedRoomId,
        event: &CanonicalJsonObject,
    ) -> Result<CanonicalJsonObject> {
        Ok(event.clone())
    }

    async fn send_transaction(&self, transaction: Transaction) -> Result<TransactionResult> {
        let mut result = TransactionResult::default();
        self.sent.lock().unwrap().push(transaction);
        result.pdus = BTreeMap::new();
        Ok(result)
    }
}

pub struct Harness {
    pub services: Services,
    pub transport: Arc<MockTransport>,
}

pub fn test_config() -> Config {
    let der = Ed25519KeyPair::generate().expect("can generate keypair");
    let config_json = json!({
        "server_name": LOCAL_SERVER,
        "signing_key": base64_encode(&der),
        "allow_federated_room_creates": false,
    });
    serde_json::from_value(config_json).expect("config deserializes")
}

fn base64_encode(bytes: &[u8]) -> String {
    parlor::utils::base64_encode(bytes)
}

static TRACING: Once = Once::new();

/// Install a tracing subscriber once per test binary so failing suites
/// can be inspected with `RUST_LOG`.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn harness() -> Harness {
    harness_with_config(test_config())
}

pub fn harness_with_config(config: Config) -> Harness {
    init_tracing();
    let transport = Arc::new(MockTransport::new());
    let services = Services::build(
        config,
        Arc::new(MemoryEngine::new()),
        Arc::new(MemoryChangeBus::new()),
        transport.clone(),
    )
    .expect("services build");
    Harness {
        services,
        transport,
    }
}

pub fn user(local: &str) -> OwnedUserId {
    format!("@{local}:{LOCAL_SERVER}").try_into().unwrap()
}

pub fn remote_user(local: &str) -> OwnedUserId {
    format!("@{local}:{REMOTE_SERVER}").try_into().unwrap()
}

pub fn state_event(
    room_id: &OwnedRoomId,
    kind: TimelineEventType,
    state_key: &str,
    sender: &OwnedUserId,
    content: serde_json::Value,
) -> PartialEvent {
    PartialEvent::new(
        room_id.clone(),
        kind,
        Some(state_key.to_owned()),
        sender.clone(),
        &content,
    )
}

pub fn message_event(
    room_id: &OwnedRoomId,
    sender: &OwnedUserId,
    content: serde_json::Value,
) -> PartialEvent {
    PartialEvent::new(
        room_id.clone(),
        TimelineEventType::RoomMessage,
        None,
        sender.clone(),
        &content,
    )
}

/// The standard creation batch: create, creator join, power levels, join
/// rules, history visibility, guest access.
pub fn creation_batch(
    room_id: &OwnedRoomId,
    creator: &OwnedUserId,
    join_rule: &str,
    power_users: serde_json::Value,
    power_events: serde_json::Value,
) -> Vec<PartialEvent> {
    vec![
        state_event(
            room_id,
            TimelineEventType::RoomCreate,
            "",
            creator,
            json!({"creator": creator, "room_version": "10"}),
        ),
        state_event(
            room_id,
            TimelineEventType::RoomMember,
            creator.as_str(),
            creator,
            json!({"membership": "join"}),
        ),
        state_event(
            room_id,
            TimelineEventType::RoomPowerLevels,
            "",
            creator,
            json!({
                "users": power_users,
                "events": power_events,
                "users_default": 0,
                "events_default": 0,
                "state_default": 50,
            }),
        ),
        state_event(
            room_id,
            TimelineEventType::RoomJoinRules,
            "",
            creator,
            json!({"join_rule": join_rule}),
        ),
        state_event(
            room_id,
            TimelineEventType::RoomHistoryVisibility,
            "",
            creator,
            json!({"history_visibility": "shared"}),
        ),
        state_event(
            room_id,
            TimelineEventType::RoomGuestAccess,
            "",
            creator,
            json!({"guest_access": "can_join"}),
        ),
    ]
}

/// Create a public room owned by `creator` and return its ID plus the six
/// committed events.
pub async fn create_public_room(
    harness: &Harness,
    creator: &OwnedUserId,
) -> (OwnedRoomId, Vec<Event>) {
    let room_id = harness.services.rooms.generate_room_id();
    let batch = creation_batch(
        &room_id,
        creator,
        "public",
        json!({creator.as_str(): 100}),
        json!({}),
    );
    let result = harness
        .services
        .rooms
        .send_local_events(&room_id, batch, Default::default())
        .await
        .expect("room creation succeeds");
    assert!(
        result.rejected.is_empty(),
        "creation batch fully accepted: {:?}",
        result.rejected.iter().map(|r| r.error.to_string()).collect::<Vec<_>>(),
    );
    (room_id, result.allowed)
}

/// A fake remote homeserver: its own signing identity plus an event
/// builder producing correctly hashed and signed federation events.
pub struct RemoteServer {
    pub name: OwnedServerName,
    pub codec: EventCodec,
    pub keys: ServerKeys,
}

impl RemoteServer {
    pub fn new(name: &str) -> Self {
        let name: OwnedServerName = name.try_into().unwrap();
        let der = Ed25519KeyPair::generate().expect("can generate keypair");
        let keypair = Ed25519KeyPair::from_der(&der, "1".to_owned()).expect("valid DER");

        let mut verify_keys = BTreeMap::new();
        verify_keys.insert(
            "ed25519:1".to_owned(),
            base64_encode(keypair.public_key()),
        );
        let keys = ServerKeys {
            server_name: name.clone(),
            valid_until_ts: MilliSecondsSinceUnixEpoch(
                UInt::try_from(u64::MAX >> 12).expect("fits"),
            ),
            verify_keys,
        };

        let keypair = Ed25519KeyPair::from_der(&der, "1".to_owned()).expect("valid DER");
        RemoteServer {
            codec: EventCodec::new(name.clone(), keypair),
            name,
            keys,
        }
    }

    /// Build a signed federation event with explicit DAG placement.
    #[allow(clippy::too_many_arguments)]
    pub fn build_event(
        &self,
        room_id: &OwnedRoomId,
        sender: &OwnedUserId,
        kind: TimelineEventType,
        state_key: Option<&str>,
        content: serde_json::Value,
        depth: u32,
        prev_events: &[OwnedEventId],
        auth_events: &[OwnedEventId],
    ) -> Event {
        let partial = PartialEvent::new(
            room_id.clone(),
            kind,
            state_key.map(str::to_owned),
            sender.clone(),
            &content,
        );
        let mut event = Event::from_partial(partial);
        event.origin = Some(self.name.clone());
        event.origin_server_ts = UInt::try_from(1_700_000_000_000u64).expect("fits");
        event.depth = UInt::from(depth);
        event.room_version = RoomVersionId::V10;
        event.prev_events = prev_events.iter().map(|id| (&**id).into()).collect();
        event.auth_events = auth_events.iter().map(|id| (&**id).into()).collect();
        self.codec
            .hash_and_sign_event(&mut event)
            .expect("remote event signs");
        event
    }
}

/// Pull the event ID of the current state event at (type, state_key) out
/// of a committed creation batch.
pub fn find_event<'e>(
    events: &'e [Event],
    kind: &TimelineEventType,
    state_key: &str,
) -> &'e Event {
    events
        .iter()
        .find(|event| &event.kind == kind && event.state_key.as_deref() == Some(state_key))
        .unwrap_or_else(|| panic!("no {kind} event in batch"))
}

pub fn owned_id(event: &Event) -> OwnedEventId {
    (*event.event_id).to_owned()
}
