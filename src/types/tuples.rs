use std::collections::HashMap;

use ruma::{
    events::room::member::MembershipState, events::StateEventType, OwnedEventId, OwnedRoomId,
};
use serde::Serialize;

use crate::database::Versionstamp;
use crate::{Error, Result};

/// A room state slot: (type, state_key).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct StateTup {
    #[serde(rename = "type")]
    pub kind: StateEventType,
    pub state_key: String,
}

impl StateTup {
    pub fn new(kind: StateEventType, state_key: impl Into<String>) -> Self {
        StateTup {
            kind,
            state_key: state_key.into(),
        }
    }
}

/// State slot -> the event ID currently occupying it.
pub type StateMap = HashMap<StateTup, OwnedEventId>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateTupWithId {
    pub tup: StateTup,
    pub event_id: OwnedEventId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EventIdTup {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventIdTupWithVersion {
    pub tup: EventIdTup,
    pub version: Versionstamp,
}

pub fn sort_event_id_tups(tups: &mut [EventIdTupWithVersion]) {
    tups.sort_by(|a, b| a.version.cmp(&b.version));
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct MembershipTup {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub membership: MembershipState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipTupWithVersion {
    pub tup: MembershipTup,
    pub version: Versionstamp,
}

/// Current memberships of an actor, keyed by room.
pub type Memberships = HashMap<OwnedRoomId, MembershipTup>;
/// Ordered membership change log entries.
pub type MembershipChanges = Vec<MembershipTupWithVersion>;

// Value encodings. These are plain values (never scanned by prefix) so a
// zero-byte join is enough; none of the joined identifiers contain NUL.

const SEP: u8 = 0x00;

fn join(parts: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|part| part.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(SEP);
        }
        out.extend_from_slice(part.as_bytes());
    }
    out
}

fn split(value: &[u8], expected: usize) -> Result<Vec<String>> {
    let parts: Vec<String> = value
        .splitn(expected, |&byte| byte == SEP)
        .map(|part| String::from_utf8(part.to_vec()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::BadData("tuple value is not UTF-8"))?;
    if parts.len() != expected {
        return Err(Error::BadData("tuple value has wrong arity"));
    }
    Ok(parts)
}

pub fn value_for_event_id_tup(tup: &EventIdTup) -> Vec<u8> {
    join(&[tup.event_id.as_str(), tup.room_id.as_str()])
}

pub fn value_to_event_id_tup(value: &[u8]) -> Result<EventIdTup> {
    let parts = split(value, 2)?;
    Ok(EventIdTup {
        event_id: parts[0]
            .parse()
            .map_err(|_| Error::BadData("invalid event ID in tuple"))?,
        room_id: parts[1]
            .parse()
            .map_err(|_| Error::BadData("invalid room ID in tuple"))?,
    })
}

pub fn value_for_state_tup_with_id(tup: &StateTupWithId) -> Vec<u8> {
    join(&[
        tup.event_id.as_str(),
        &tup.tup.kind.to_string(),
        &tup.tup.state_key,
    ])
}

pub fn value_to_state_tup_with_id(value: &[u8]) -> Result<StateTupWithId> {
    let parts = split(value, 3)?;
    Ok(StateTupWithId {
        event_id: parts[0]
            .parse()
            .map_err(|_| Error::BadData("invalid event ID in tuple"))?,
        tup: StateTup {
            kind: parts[1].clone().into(),
            state_key: parts[2].clone(),
        },
    })
}

pub fn value_for_membership_tup(tup: &MembershipTup) -> Vec<u8> {
    join(&[
        tup.event_id.as_str(),
        tup.room_id.as_str(),
        tup.membership.as_str(),
    ])
}

pub fn value_to_membership_tup(value: &[u8]) -> Result<MembershipTup> {
    let parts = split(value, 3)?;
    Ok(MembershipTup {
        event_id: parts[0]
            .parse()
            .map_err(|_| Error::BadData("invalid event ID in tuple"))?,
        room_id: parts[1]
            .parse()
            .map_err(|_| Error::BadData("invalid room ID in tuple"))?,
        membership: parts[2].as_str().into(),
    })
}

pub fn value_for_versionstamp(version: Versionstamp) -> Vec<u8> {
    version.to_bytes().to_vec()
}

pub fn value_to_versionstamp(value: &[u8]) -> Result<Versionstamp> {
    Versionstamp::from_bytes(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_tup_round_trip() {
        let tup = MembershipTup {
            event_id: ruma::owned_event_id!("$ev1"),
            room_id: ruma::owned_room_id!("!room:parlor.test"),
            membership: MembershipState::Join,
        };
        let decoded = value_to_membership_tup(&value_for_membership_tup(&tup)).unwrap();
        assert_eq!(decoded, tup);
    }

    #[test]
    fn test_state_tup_round_trip_with_empty_state_key() {
        let tup = StateTupWithId {
            tup: StateTup::new(StateEventType::RoomCreate, ""),
            event_id: ruma::owned_event_id!("$create"),
        };
        let decoded = value_to_state_tup_with_id(&value_for_state_tup_with_id(&tup)).unwrap();
        assert_eq!(decoded, tup);
    }

    #[test]
    fn test_event_id_tup_round_trip() {
        let tup = EventIdTup {
            event_id: ruma::owned_event_id!("$ev2"),
            room_id: ruma::owned_room_id!("!other:parlor.test"),
        };
        let decoded = value_to_event_id_tup(&value_for_event_id_tup(&tup)).unwrap();
        assert_eq!(decoded, tup);
    }

    #[test]
    fn test_sort_by_version() {
        let make = |counter: u8| EventIdTupWithVersion {
            tup: EventIdTup {
                event_id: ruma::owned_event_id!("$ev"),
                room_id: ruma::owned_room_id!("!r:parlor.test"),
            },
            version: Versionstamp::from_parts([0, 0, 0, 0, 0, 0, 0, 0, 0, counter], 0),
        };
        let mut tups = vec![make(3), make(1), make(2)];
        sort_event_id_tups(&mut tups);
        let order: Vec<u8> = tups
            .iter()
            .map(|t| t.version.transaction_version()[9])
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
