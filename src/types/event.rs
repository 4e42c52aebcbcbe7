// =============================================================================
// Parlor - Event Types
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   The immutable room DAG event record, the partial event accepted from
//   local senders, and the accessors the authorization and indexing paths
//   need. Events are stored as JSON with internal bookkeeping fields that
//   are stripped again for the federation wire format.
//
// =============================================================================

use std::sync::Arc;

use ruma::{
    events::room::member::MembershipState,
    events::TimelineEventType,
    room_version_rules::RoomVersionRules,
    state_res, CanonicalJsonObject, EventId, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId,
    OwnedServerName, OwnedUserId, RoomId, RoomVersionId, UInt, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;

use super::tuples::{EventIdTup, MembershipTup, StateTup, StateTupWithId};
use crate::{utils, Error, Result};

/// Fields internal to this server, stored beside the event but never part
/// of the signed federation JSON.
const INTERNAL_FIELDS: &[&str] = &["room_version", "soft_failed", "outlier", "redacted"];

/// Content hashes of an event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventHash {
    /// The SHA-256 hash, unpadded base64.
    pub sha256: String,
}

/// A client-supplied event before the server fills in the DAG placement,
/// hashes and signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartialEvent {
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    #[serde(rename = "type")]
    pub kind: TimelineEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub content: Box<RawJsonValue>,
    /// Redaction target, carried top-level in pre-v11 rooms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,
}

impl PartialEvent {
    pub fn new(
        room_id: OwnedRoomId,
        kind: TimelineEventType,
        state_key: Option<String>,
        sender: OwnedUserId,
        content: &serde_json::Value,
    ) -> Self {
        PartialEvent {
            room_id,
            sender,
            kind,
            state_key,
            content: serde_json::value::to_raw_value(content).expect("content is valid JSON"),
            redacts: None,
        }
    }
}

fn placeholder_event_id() -> OwnedEventId {
    ruma::event_id!("$thiswillbefilledinlater").into()
}

fn default_room_version() -> RoomVersionId {
    RoomVersionId::V10
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// The reference hash. Not part of the stored or wire JSON; populated
    /// from the key at fetch or by the codec at signing.
    #[serde(skip, default = "placeholder_event_id")]
    pub event_id: OwnedEventId,

    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    #[serde(rename = "type")]
    pub kind: TimelineEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub content: Box<RawJsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacts: Option<OwnedEventId>,

    /// Absent only on redacted copies in room versions that strip it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<OwnedServerName>,
    pub origin_server_ts: UInt,
    pub depth: UInt,

    pub prev_events: Vec<OwnedEventId>,
    pub auth_events: Vec<OwnedEventId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<EventHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Box<RawJsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Box<RawJsonValue>>,

    /// Internal copy of the room version so we don't need to look it up.
    #[serde(default = "default_room_version")]
    pub room_version: RoomVersionId,
    /// Accepted for DAG linkage but hidden from clients and current state.
    #[serde(default)]
    pub soft_failed: bool,
    /// Known only as a pending membership; not linked into the room DAG.
    #[serde(default)]
    pub outlier: bool,
    /// The stored content is *not* redacted, only flagged.
    #[serde(default)]
    pub redacted: bool,
}

impl Event {
    pub fn from_partial(partial: PartialEvent) -> Self {
        let PartialEvent {
            room_id,
            sender,
            kind,
            state_key,
            content,
            redacts,
        } = partial;
        Event {
            event_id: placeholder_event_id(),
            room_id,
            sender,
            kind,
            state_key,
            content,
            redacts,
            origin: None,
            origin_server_ts: UInt::default(),
            depth: UInt::default(),
            prev_events: Vec::new(),
            auth_events: Vec::new(),
            hashes: None,
            signatures: None,
            unsigned: None,
            room_version: default_room_version(),
            soft_failed: false,
            outlier: false,
            redacted: false,
        }
    }

    /// Decode a stored event, attaching the ID from its key.
    pub fn from_bytes(bytes: &[u8], event_id: &EventId) -> Result<Self> {
        let mut event: Event = serde_json::from_slice(bytes)?;
        event.event_id = event_id.into();
        Ok(event)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("event serializes")
    }

    /// The canonical JSON this event hashes, signs and federates as:
    /// everything stored minus the internal fields, without `event_id`.
    pub fn to_wire_json(&self) -> Result<CanonicalJsonObject> {
        let mut object = utils::to_canonical_object(self)?;
        for field in INTERNAL_FIELDS {
            object.remove(*field);
        }
        Ok(object)
    }

    pub fn room_version_rules(&self) -> Result<RoomVersionRules> {
        self.room_version
            .rules()
            .ok_or_else(|| Error::UnknownRoomVersion(self.room_version.to_string()))
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn state_tup(&self) -> StateTup {
        match &self.state_key {
            Some(state_key) => StateTup {
                kind: self.kind.to_string().into(),
                state_key: state_key.clone(),
            },
            None => panic!("not a state event"),
        }
    }

    pub fn state_tup_with_id(&self) -> StateTupWithId {
        StateTupWithId {
            tup: self.state_tup(),
            event_id: (*self.event_id).to_owned(),
        }
    }

    pub fn event_id_tup(&self) -> EventIdTup {
        EventIdTup {
            event_id: (*self.event_id).to_owned(),
            room_id: self.room_id.clone(),
        }
    }

    pub fn membership_tup(&self) -> MembershipTup {
        if self.kind != TimelineEventType::RoomMember {
            panic!("not a member event");
        }
        MembershipTup {
            event_id: (*self.event_id).to_owned(),
            room_id: self.room_id.clone(),
            membership: self.membership(),
        }
    }

    /// The `membership` field of a member event's content.
    pub fn membership(&self) -> MembershipState {
        #[derive(Deserialize)]
        struct Extract {
            membership: MembershipState,
        }
        serde_json::from_str::<Extract>(self.content.get())
            .map(|extract| extract.membership)
            .unwrap_or(MembershipState::Leave)
    }

    /// The target of an `m.relates_to` relation, if any.
    pub fn relates_to(&self) -> Option<(OwnedEventId, String)> {
        #[derive(Deserialize)]
        struct Extract {
            #[serde(rename = "m.relates_to")]
            relates_to: Option<RelatesTo>,
        }
        #[derive(Deserialize)]
        struct RelatesTo {
            event_id: Option<OwnedEventId>,
            rel_type: Option<String>,
        }
        let extract: Extract = serde_json::from_str(self.content.get()).ok()?;
        let relates_to = extract.relates_to?;
        Some((relates_to.event_id?, relates_to.rel_type.unwrap_or_default()))
    }

    /// The aggregation key of an `m.annotation` relation.
    pub fn reaction_key(&self) -> Option<String> {
        #[derive(Deserialize)]
        struct Extract {
            #[serde(rename = "m.relates_to")]
            relates_to: Option<RelatesTo>,
        }
        #[derive(Deserialize)]
        struct RelatesTo {
            key: Option<String>,
        }
        serde_json::from_str::<Extract>(self.content.get())
            .ok()?
            .relates_to?
            .key
    }

    /// Typed view of a content field, for summary updates.
    pub fn content_field(&self, field: &str) -> Option<serde_json::Value> {
        serde_json::from_str::<serde_json::Value>(self.content.get())
            .ok()?
            .get(field)
            .cloned()
    }

    pub fn sender_server(&self) -> &ruma::ServerName {
        self.sender.server_name()
    }
}

pub const REL_ANNOTATION: &str = "m.annotation";
pub const REL_THREAD: &str = "m.thread";

impl state_res::Event for Event {
    type Id = OwnedEventId;

    fn event_id(&self) -> &Self::Id {
        &self.event_id
    }

    fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    fn sender(&self) -> &UserId {
        &self.sender
    }

    fn event_type(&self) -> &TimelineEventType {
        &self.kind
    }

    fn content(&self) -> &RawJsonValue {
        &self.content
    }

    fn origin_server_ts(&self) -> MilliSecondsSinceUnixEpoch {
        MilliSecondsSinceUnixEpoch(self.origin_server_ts)
    }

    fn state_key(&self) -> Option<&str> {
        self.state_key.as_deref()
    }

    fn prev_events(&self) -> Box<dyn DoubleEndedIterator<Item = &Self::Id> + '_> {
        Box::new(self.prev_events.iter())
    }

    fn auth_events(&self) -> Box<dyn DoubleEndedIterator<Item = &Self::Id> + '_> {
        Box::new(self.auth_events.iter())
    }

    fn redacts(&self) -> Option<&Self::Id> {
        self.redacts.as_ref()
    }
}

// These allow deduping events when resolving state across forks.
impl Eq for Event {}
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.event_id == other.event_id
    }
}
impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.event_id.cmp(&other.event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_event(content: serde_json::Value) -> Event {
        let partial = PartialEvent::new(
            ruma::owned_room_id!("!room:parlor.test"),
            TimelineEventType::RoomMessage,
            None,
            ruma::owned_user_id!("@alice:parlor.test"),
            &content,
        );
        Event::from_partial(partial)
    }

    #[test]
    fn test_storage_round_trip_keeps_internal_flags() {
        let mut event = message_event(json!({"body": "hi"}));
        event.soft_failed = true;
        event.room_version = RoomVersionId::V11;

        let event_id = ruma::event_id!("$abc123");
        let decoded = Event::from_bytes(&event.to_bytes(), event_id).unwrap();
        assert_eq!(decoded.event_id.as_ref(), event_id);
        assert!(decoded.soft_failed);
        assert!(!decoded.outlier);
        assert_eq!(decoded.room_version, RoomVersionId::V11);
    }

    #[test]
    fn test_wire_json_strips_internal_fields() {
        let mut event = message_event(json!({"body": "hi"}));
        event.soft_failed = true;
        event.origin = Some(ruma::owned_server_name!("parlor.test"));

        let wire = event.to_wire_json().unwrap();
        assert!(wire.contains_key("content"));
        assert!(wire.contains_key("origin"));
        assert!(!wire.contains_key("event_id"));
        for field in INTERNAL_FIELDS {
            assert!(!wire.contains_key(*field), "{field} leaked to the wire");
        }
    }

    #[test]
    fn test_relates_to_and_reaction_key() {
        let event = message_event(json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": "$parent",
                "key": "👍",
            }
        }));
        let (parent, rel_type) = event.relates_to().unwrap();
        assert_eq!(parent.as_str(), "$parent");
        assert_eq!(rel_type, REL_ANNOTATION);
        assert_eq!(event.reaction_key().unwrap(), "👍");

        let plain = message_event(json!({"body": "hi"}));
        assert!(plain.relates_to().is_none());
    }

    #[test]
    #[should_panic(expected = "not a state event")]
    fn test_state_tup_panics_for_message() {
        message_event(json!({})).state_tup();
    }
}
