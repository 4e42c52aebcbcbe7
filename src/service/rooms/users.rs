// =============================================================================
// Parlor - Users Directory
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Per-user membership indices: current memberships, the versioned
//   membership change log driving sync range narrowing, outlier (pending
//   invite) memberships, and user profiles.
//
// =============================================================================

use ruma::{events::room::member::MembershipState, RoomId, UserId};

use crate::database::{KeyRange, KvsTransaction, RangeOptions, Subspace, Versionstamp};
use crate::types::{
    value_to_membership_tup, MembershipChanges, Memberships, MembershipTupWithVersion, UserProfile,
};
use crate::Result;

pub struct UsersDirectory {
    by_membership: Subspace,
    by_membership_change: Subspace,
    by_outlier_membership: Subspace,
    by_profile: Subspace,
}

impl UsersDirectory {
    pub fn new() -> Self {
        let root = Subspace::new(b"usr");
        UsersDirectory {
            by_membership: root.sub(b"mem"),        // current membership by user/room
            by_membership_change: root.sub(b"mch"), // membership change log by user/version
            by_outlier_membership: root.sub(b"out"), // outlier membership by user/room
            by_profile: root.sub(b"prf"),           // profile by user
        }
    }

    pub fn key_for_user_membership(&self, user_id: &UserId, room_id: &RoomId) -> Vec<u8> {
        self.by_membership
            .key(&[user_id.as_bytes(), room_id.as_bytes()])
    }

    pub fn range_for_user_memberships(&self, user_id: &UserId) -> KeyRange {
        self.by_membership.range(&[user_id.as_bytes()])
    }

    pub fn key_for_user_membership_change(
        &self,
        user_id: &UserId,
        version: Versionstamp,
    ) -> Vec<u8> {
        self.by_membership_change
            .versioned_key(&[user_id.as_bytes()], version)
    }

    pub fn range_for_user_membership_changes(
        &self,
        user_id: &UserId,
        from: Versionstamp,
        to: Versionstamp,
    ) -> KeyRange {
        self.by_membership_change
            .version_range(&[user_id.as_bytes()], from, to)
    }

    pub fn key_for_user_outlier_membership(&self, user_id: &UserId, room_id: &RoomId) -> Vec<u8> {
        self.by_outlier_membership
            .key(&[user_id.as_bytes(), room_id.as_bytes()])
    }

    pub fn range_for_user_outlier_memberships(&self, user_id: &UserId) -> KeyRange {
        self.by_outlier_membership.range(&[user_id.as_bytes()])
    }

    pub fn key_for_user_profile(&self, user_id: &UserId) -> Vec<u8> {
        self.by_profile.key(&[user_id.as_bytes()])
    }

    pub async fn is_user_in_room(
        &self,
        txn: &dyn KvsTransaction,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> Result<bool> {
        let value = txn
            .get(&self.key_for_user_membership(user_id, room_id))
            .await?;
        match value {
            Some(value) => {
                Ok(value_to_membership_tup(&value)?.membership == MembershipState::Join)
            }
            None => Ok(false),
        }
    }

    pub async fn lookup_user_memberships(
        &self,
        txn: &dyn KvsTransaction,
        user_id: &UserId,
    ) -> Result<Memberships> {
        let kvs = txn
            .get_range(
                &self.range_for_user_memberships(user_id),
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

    pub async fn lookup_user_outlier_memberships(
        &self,
        txn: &dyn KvsTransaction,
        user_id: &UserId,
    ) -> Result<Memberships> {
        let kvs = txn
            .get_range(
                &self.range_for_user_outlier_memberships(user_id),
                RangeOptions::default(),
            )
            .await?;
        let mut memberships = Memberships::new();
        for kv in kvs {
            let tup = value_to_membership_tup(&kv.value)?;
            memberships.insert(tup.room_id.clone(), tup);
        }
        Ok(memberships)
    }

    /// Membership changes in `(from, to]` style bounds: callers pass the
    /// already-bumped `from` and the exclusive `to`.
    pub async fn lookup_user_membership_changes(
        &self,
        txn: &dyn KvsTransaction,
        user_id: &UserId,
        from: Versionstamp,
        to: Versionstamp,
    ) -> Result<MembershipChanges> {
        let kvs = txn
            .get_range(
                &self.range_for_user_membership_changes(user_id, from, to),
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

    pub async fn lookup_user_profile(
        &self,
        txn: &dyn KvsTransaction,
        user_id: &UserId,
    ) -> Result<Option<UserProfile>> {
        match txn.get(&self.key_for_user_profile(user_id)).await? {
            Some(bytes) => Ok(Some(UserProfile::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl Default for UsersDirectory {
    fn default() -> Self {
        Self::new()
    }
}
