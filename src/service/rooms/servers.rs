// =============================================================================
// Parlor - Servers Directory
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Per-server room residency indices: joined members per room, current
//   memberships, the membership change log driving federation sync range
//   narrowing, and per-destination sync positions.
//
// =============================================================================

use ruma::{RoomId, ServerName};

use crate::database::{
    KeyRange, KvsTransaction, KvsWriteTransaction, RangeOptions, Subspace, Versionstamp,
};
use crate::types::{
    value_to_membership_tup, MembershipChanges, Memberships, MembershipTupWithVersion, VersionMap,
};
use crate::Result;

pub struct ServersDirectory {
    by_joined_member: Subspace,
    by_membership: Subspace,
    by_membership_change: Subspace,
    by_position: Subspace,
}

impl ServersDirectory {
    pub fn new() -> Self {
        let root = Subspace::new(b"srv");
        ServersDirectory {
            by_joined_member: root.sub(b"jme"), // joined members by room/server/local part
            by_membership: root.sub(b"mem"),    // current membership by server/room
            by_membership_change: root.sub(b"mch"), // membership change log by server/version
            by_position: root.sub(b"itt"),      // per-destination sync positions
        }
    }

    pub fn key_for_server_joined_member(
        &self,
        room_id: &RoomId,
        server: &ServerName,
        local_part: &str,
    ) -> Vec<u8> {
        self.by_joined_member.key(&[
            room_id.as_bytes(),
            server.as_str().as_bytes(),
            local_part.as_bytes(),
        ])
    }

    pub fn range_for_server_joined_members(
        &self,
        room_id: &RoomId,
        server: &ServerName,
    ) -> KeyRange {
        self.by_joined_member
            .range(&[room_id.as_bytes(), server.as_str().as_bytes()])
    }

    pub fn key_for_server_membership(&self, server: &ServerName, room_id: &RoomId) -> Vec<u8> {
        self.by_membership
            .key(&[server.as_str().as_bytes(), room_id.as_bytes()])
    }

    pub fn range_for_server_memberships(&self, server: &ServerName) -> KeyRange {
        self.by_membership.range(&[server.as_str().as_bytes()])
    }

    pub fn key_for_server_membership_change(
        &self,
        server: &ServerName,
        version: Versionstamp,
    ) -> Vec<u8> {
        self.by_membership_change
            .versioned_key(&[server.as_str().as_bytes()], version)
    }

    pub fn range_for_server_membership_changes(
        &self,
        server: &ServerName,
        from: Versionstamp,
        to: Versionstamp,
    ) -> KeyRange {
        self.by_membership_change
            .version_range(&[server.as_str().as_bytes()], from, to)
    }

    pub fn key_for_server_position(&self, server: &ServerName) -> Vec<u8> {
        self.by_position.key(&[server.as_str().as_bytes()])
    }

    pub async fn is_server_in_room(
        &self,
        txn: &dyn KvsTransaction,
        server: &ServerName,
        room_id: &RoomId,
    ) -> Result<bool> {
        Ok(txn
            .get(&self.key_for_server_membership(server, room_id))
            .await?
            .is_some())
    }

    /// Whether the server still has any joined member in the room.
    pub async fn has_joined_members(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        server: &ServerName,
    ) -> Result<bool> {
        let kvs = txn
            .get_range(
                &self.range_for_server_joined_members(room_id, server),
                RangeOptions::limit(1),
            )
            .await?;
        Ok(!kvs.is_empty())
    }

    pub async fn lookup_server_memberships(
        &self,
        txn: &dyn KvsTransaction,
        server: &ServerName,
    ) -> Result<Memberships> {
        let kvs = txn
            .get_range(
                &self.range_for_server_memberships(server),
                RangeOptions::default(),
            )
            .await?;
        let mut memberships = Memberships::with_capacity(kvs.len());
        for kv in kvs {
            let tup = value_to_membership_tup(&kv.value)?;
            memberships.insert(tup.room_id.clone(), tup);
        }
        Ok(memberships)
    }

    pub async fn lookup_server_membership_changes(
        &self,
        txn: &dyn KvsTransaction,
        server: &ServerName,
        from: Versionstamp,
        to: Versionstamp,
    ) -> Result<MembershipChanges> {
        let kvs = txn
            .get_range(
                &self.range_for_server_membership_changes(server, from, to),
                RangeOptions::default(),
            )
            .await?;
        let mut changes = MembershipChanges::with_capacity(kvs.len());
        for kv in kvs {
            let (_, version) = self.by_membership_change.unpack(&kv.key, true)?;
            changes.push(MembershipTupWithVersion {
                tup: value_to_membership_tup(&kv.value)?,
                version: version.expect("membership change key carries a versionstamp"),
            });
        }
        Ok(changes)
    }

    /// A destination's persisted sync positions.
    pub async fn get_server_position(
        &self,
        txn: &dyn KvsTransaction,
        server: &ServerName,
    ) -> Result<VersionMap> {
        match txn.get(&self.key_for_server_position(server)).await? {
            Some(bytes) => VersionMap::from_msgpack(&bytes),
            None => Ok(VersionMap::new()),
        }
    }

    pub fn set_server_position(
        &self,
        txn: &dyn KvsWriteTransaction,
        server: &ServerName,
        positions: &VersionMap,
    ) {
        txn.set(&self.key_for_server_position(server), &positions.to_msgpack());
    }
}

impl Default for ServersDirectory {
    fn default() -> Self {
        Self::new()
    }
}
