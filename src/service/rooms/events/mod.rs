// =============================================================================
// Parlor - Events Directory
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Single owner of the event key-space layout: key and range builders for
//   every event subspace plus the transactional read primitives built on
//   them. Subspace tags are intentionally short to minimize key storage.
//
// =============================================================================

mod auth;
mod pagination;
pub(crate) mod providers;
mod state_current;
mod state_version;

pub use providers::{AuthProvider, EventsProvider};

use ruma::{
    events::StateEventType, EventId, OwnedEventId, OwnedServerName, OwnedUserId, RoomId,
    ServerName, UserId,
};

use crate::database::{part_to_string, KeyRange, Subspace, Versionstamp};
use crate::Result;

/// Types of state event used for authorization - excluding members.
pub(crate) const AUTH_STATE_TYPES: &[StateEventType] = &[
    StateEventType::RoomCreate,
    StateEventType::RoomJoinRules,
    StateEventType::RoomPowerLevels,
];

/// Types of state event used for stripped state on invites.
pub(crate) const INVITE_STATE_TYPES: &[StateEventType] = &[
    StateEventType::RoomCreate,
    StateEventType::RoomName,
    StateEventType::RoomAvatar,
    StateEventType::RoomTopic,
    StateEventType::RoomJoinRules,
    StateEventType::RoomCanonicalAlias,
    StateEventType::RoomEncryption,
];

pub struct EventsDirectory {
    pub(crate) by_id: Subspace,
    pub(crate) by_version: Subspace,
    pub(crate) id_to_version: Subspace,

    pub(crate) by_room_version: Subspace,
    pub(crate) by_room_state_version: Subspace,
    pub(crate) by_room_local_version: Subspace,
    pub(crate) by_room_extrem: Subspace,

    pub(crate) by_room_version_state_tup: Subspace,
    pub(crate) by_room_current_state_tup: Subspace,
    pub(crate) by_room_current_members: Subspace,
    pub(crate) by_room_current_servers: Subspace,

    pub(crate) by_room_relation: Subspace,
    pub(crate) by_room_reaction: Subspace,
    pub(crate) by_room_thread: Subspace,
}

impl EventsDirectory {
    pub fn new() -> Self {
        let root = Subspace::new(b"ev");
        EventsDirectory {
            by_id: root.sub(b"id"),          // event by ID
            by_version: root.sub(b"ver"),    // event by version
            id_to_version: root.sub(b"itv"), // event ID to version

            by_room_version: root.sub(b"rmv"), // event by room/version
            by_room_state_version: root.sub(b"rsv"), // state event by room/version
            by_room_local_version: root.sub(b"rlv"), // local event by room/version
            by_room_extrem: root.sub(b"rex"),  // current room extremities

            by_room_version_state_tup: root.sub(b"rvs"), // state event by room/type/state_key/version
            by_room_current_state_tup: root.sub(b"rcs"), // current state event by room/type/state_key
            by_room_current_members: root.sub(b"rmb"),   // current members by room
            by_room_current_servers: root.sub(b"rsr"),   // current servers by room

            by_room_relation: root.sub(b"rel"), // event by room/rel-to-ev/version
            by_room_reaction: root.sub(b"rea"), // event by room/rel-to-ev/uid/key
            by_room_thread: root.sub(b"rth"),   // root event by room/root-ev-version
        }
    }

    pub fn key_for_event(&self, event_id: &EventId) -> Vec<u8> {
        self.by_id.key(&[event_id.as_bytes()])
    }

    pub fn key_for_id_to_version(&self, event_id: &EventId) -> Vec<u8> {
        self.id_to_version.key(&[event_id.as_bytes()])
    }

    // Global version index
    //

    pub fn key_for_version(&self, version: Versionstamp) -> Vec<u8> {
        self.by_version.versioned_key(&[], version)
    }

    pub fn key_to_version(&self, key: &[u8]) -> Result<Versionstamp> {
        let (_, version) = self.by_version.unpack(key, true)?;
        Ok(version.expect("version key carries a versionstamp"))
    }

    pub fn range_for_versions(&self, from: Versionstamp, to: Versionstamp) -> KeyRange {
        self.by_version.version_range(&[], from, to)
    }

    // Per-room version indices
    //

    pub fn key_for_room_version(&self, room_id: &RoomId, version: Versionstamp) -> Vec<u8> {
        self.by_room_version
            .versioned_key(&[room_id.as_bytes()], version)
    }

    pub fn key_to_room_version(&self, key: &[u8]) -> Result<Versionstamp> {
        let (_, version) = self.by_room_version.unpack(key, true)?;
        Ok(version.expect("room version key carries a versionstamp"))
    }

    pub fn range_for_room_versions(
        &self,
        room_id: &RoomId,
        from: Versionstamp,
        to: Versionstamp,
    ) -> KeyRange {
        self.by_room_version
            .version_range(&[room_id.as_bytes()], from, to)
    }

    pub fn key_for_room_local_version(&self, room_id: &RoomId, version: Versionstamp) -> Vec<u8> {
        self.by_room_local_version
            .versioned_key(&[room_id.as_bytes()], version)
    }

    pub fn key_to_room_local_version(&self, key: &[u8]) -> Result<Versionstamp> {
        let (_, version) = self.by_room_local_version.unpack(key, true)?;
        Ok(version.expect("room local version key carries a versionstamp"))
    }

    pub fn range_for_room_local_versions(
        &self,
        room_id: &RoomId,
        from: Versionstamp,
        to: Versionstamp,
    ) -> KeyRange {
        self.by_room_local_version
            .version_range(&[room_id.as_bytes()], from, to)
    }

    // Per-room state delta log (room, version) -> StateTupWithId
    //

    pub fn key_for_room_state_version(&self, room_id: &RoomId, version: Versionstamp) -> Vec<u8> {
        self.by_room_state_version
            .versioned_key(&[room_id.as_bytes()], version)
    }

    /// Deltas from the start of the room up to (exclusive) `to`.
    pub fn range_for_room_state_versions(&self, room_id: &RoomId, to: Versionstamp) -> KeyRange {
        self.by_room_state_version
            .version_range(&[room_id.as_bytes()], Versionstamp::ZERO, to)
    }

    // Full state history (room, type, state_key, version) -> event_id
    //

    pub fn key_for_room_version_state_tup(
        &self,
        room_id: &RoomId,
        kind: &StateEventType,
        state_key: &str,
        version: Versionstamp,
    ) -> Vec<u8> {
        self.by_room_version_state_tup.versioned_key(
            &[
                room_id.as_bytes(),
                kind.to_string().as_bytes(),
                state_key.as_bytes(),
            ],
            version,
        )
    }

    /// History of one state slot up to (exclusive) `to`; the latest entry
    /// before a version is a reverse scan with limit 1. The key order
    /// (room, type, state_key, version) exists exactly for this query.
    pub fn range_for_room_version_state_tup(
        &self,
        room_id: &RoomId,
        kind: &StateEventType,
        state_key: &str,
        to: Versionstamp,
    ) -> KeyRange {
        self.by_room_version_state_tup.version_range(
            &[
                room_id.as_bytes(),
                kind.to_string().as_bytes(),
                state_key.as_bytes(),
            ],
            Versionstamp::ZERO,
            to,
        )
    }

    // Current state (room, type, state_key) -> event_id
    //

    pub fn key_for_room_current_state_tup(
        &self,
        room_id: &RoomId,
        kind: &StateEventType,
        state_key: &str,
    ) -> Vec<u8> {
        self.by_room_current_state_tup.key(&[
            room_id.as_bytes(),
            kind.to_string().as_bytes(),
            state_key.as_bytes(),
        ])
    }

    pub fn key_to_room_current_state_tup(&self, key: &[u8]) -> Result<(StateEventType, String)> {
        let (mut parts, _) = self.by_room_current_state_tup.unpack(key, false)?;
        if parts.len() != 3 {
            return Err(crate::Error::BadData("malformed current state key"));
        }
        let state_key = part_to_string(parts.pop().expect("three parts"))?;
        let kind = part_to_string(parts.pop().expect("two parts"))?;
        Ok((kind.into(), state_key))
    }

    pub fn range_for_current_room_state(&self, room_id: &RoomId) -> KeyRange {
        self.by_room_current_state_tup.range(&[room_id.as_bytes()])
    }

    // Current members (room, user_id) -> MembershipTup
    //

    pub fn key_for_current_room_member(&self, room_id: &RoomId, user_id: &UserId) -> Vec<u8> {
        self.by_room_current_members
            .key(&[room_id.as_bytes(), user_id.as_bytes()])
    }

    pub fn key_to_current_room_member(&self, key: &[u8]) -> Result<OwnedUserId> {
        let (mut parts, _) = self.by_room_current_members.unpack(key, false)?;
        if parts.len() != 2 {
            return Err(crate::Error::BadData("malformed room member key"));
        }
        part_to_string(parts.pop().expect("two parts"))?
            .parse()
            .map_err(|_| crate::Error::BadData("invalid user ID in member key"))
    }

    pub fn range_for_current_room_members(&self, room_id: &RoomId) -> KeyRange {
        self.by_room_current_members.range(&[room_id.as_bytes()])
    }

    // Current servers (room, server_name) -> MembershipTup
    //

    pub fn key_for_current_room_server(&self, room_id: &RoomId, server: &ServerName) -> Vec<u8> {
        self.by_room_current_servers
            .key(&[room_id.as_bytes(), server.as_bytes()])
    }

    pub fn key_to_current_room_server(&self, key: &[u8]) -> Result<OwnedServerName> {
        let (mut parts, _) = self.by_room_current_servers.unpack(key, false)?;
        if parts.len() != 2 {
            return Err(crate::Error::BadData("malformed room server key"));
        }
        part_to_string(parts.pop().expect("two parts"))?
            .try_into()
            .map_err(|_| crate::Error::BadData("invalid server name in server key"))
    }

    pub fn range_for_current_room_servers(&self, room_id: &RoomId) -> KeyRange {
        self.by_room_current_servers.range(&[room_id.as_bytes()])
    }

    // DAG extremities (room, event_id) -> ''
    //

    pub fn key_for_room_extrem(&self, room_id: &RoomId, event_id: &EventId) -> Vec<u8> {
        self.by_room_extrem
            .key(&[room_id.as_bytes(), event_id.as_bytes()])
    }

    pub fn key_to_room_extrem(&self, key: &[u8]) -> Result<OwnedEventId> {
        let (mut parts, _) = self.by_room_extrem.unpack(key, false)?;
        if parts.len() != 2 {
            return Err(crate::Error::BadData("malformed room extremity key"));
        }
        part_to_string(parts.pop().expect("two parts"))?
            .parse()
            .map_err(|_| crate::Error::BadData("invalid event ID in extremity key"))
    }

    pub fn range_for_room_extrems(&self, room_id: &RoomId) -> KeyRange {
        self.by_room_extrem.range(&[room_id.as_bytes()])
    }

    // Relations, reactions, threads
    //

    pub fn key_for_room_relation(
        &self,
        room_id: &RoomId,
        parent: &EventId,
        version: Versionstamp,
    ) -> Vec<u8> {
        self.by_room_relation
            .versioned_key(&[room_id.as_bytes(), parent.as_bytes()], version)
    }

    pub fn key_for_room_reaction(
        &self,
        room_id: &RoomId,
        parent: &EventId,
        user_id: &UserId,
        key: &str,
    ) -> Vec<u8> {
        self.by_room_reaction.key(&[
            room_id.as_bytes(),
            parent.as_bytes(),
            user_id.as_bytes(),
            key.as_bytes(),
        ])
    }

    pub fn key_for_room_thread(&self, room_id: &RoomId, root_version: Versionstamp) -> Vec<u8> {
        self.by_room_thread
            .versioned_key(&[room_id.as_bytes()], root_version)
    }
}

impl Default for EventsDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_isolation_in_ranges() {
        let dir = EventsDirectory::new();
        let room = ruma::room_id!("!a:parlor.test");
        let sibling = ruma::room_id!("!ab:parlor.test");

        let range = dir.range_for_current_room_members(room);
        let inside = dir.key_for_current_room_member(room, ruma::user_id!("@u:parlor.test"));
        let outside = dir.key_for_current_room_member(sibling, ruma::user_id!("@u:parlor.test"));

        assert!(inside >= range.begin && inside < range.end);
        assert!(outside < range.begin || outside >= range.end);
    }

    #[test]
    fn test_state_tup_key_round_trip() {
        let dir = EventsDirectory::new();
        let room = ruma::room_id!("!a:parlor.test");
        let key =
            dir.key_for_room_current_state_tup(room, &StateEventType::RoomMember, "@u:parlor.test");
        let (kind, state_key) = dir.key_to_room_current_state_tup(&key).unwrap();
        assert_eq!(kind, StateEventType::RoomMember);
        assert_eq!(state_key, "@u:parlor.test");

        // Empty state keys survive
        let key = dir.key_for_room_current_state_tup(room, &StateEventType::RoomCreate, "");
        let (kind, state_key) = dir.key_to_room_current_state_tup(&key).unwrap();
        assert_eq!(kind, StateEventType::RoomCreate);
        assert_eq!(state_key, "");
    }

    #[test]
    fn test_state_history_key_orders_by_version_last() {
        let dir = EventsDirectory::new();
        let room = ruma::room_id!("!a:parlor.test");
        let early = Versionstamp::from_parts([0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 0);
        let late = Versionstamp::from_parts([0, 0, 0, 0, 0, 0, 0, 0, 0, 9], 0);

        let key_early =
            dir.key_for_room_version_state_tup(room, &StateEventType::RoomPowerLevels, "", early);
        let key_late =
            dir.key_for_room_version_state_tup(room, &StateEventType::RoomPowerLevels, "", late);
        assert!(key_early < key_late);

        // "Latest at or before" is a reverse scan bounded at version.next()
        let range = dir.range_for_room_version_state_tup(
            room,
            &StateEventType::RoomPowerLevels,
            "",
            early.next(),
        );
        assert!(key_early >= range.begin && key_early < range.end);
        assert!(key_late >= range.end);
    }
}
