//! Current-state lookups: extremities, state maps, members and servers as
//! of the transaction's snapshot.

use ruma::{events::StateEventType, OwnedEventId, OwnedServerName, OwnedUserId, RoomId};

use super::{providers::EventsProvider, EventsDirectory, AUTH_STATE_TYPES, INVITE_STATE_TYPES};
use crate::database::{KvsTransaction, RangeOptions};
use crate::types::{value_to_membership_tup, MembershipTup, StateMap, StateTup};
use crate::Result;

/// Keep only the given state types (with empty state keys), scheduling
/// fetches for the survivors.
fn filter_state_map(
    state: &StateMap,
    desired: &[StateEventType],
    events_provider: Option<&EventsProvider<'_>>,
) -> StateMap {
    let mut filtered = StateMap::with_capacity(desired.len());
    for kind in desired {
        let tup = StateTup::new(kind.clone(), "");
        if let Some(event_id) = state.get(&tup) {
            if let Some(provider) = events_provider {
                provider.will_get(event_id);
            }
            filtered.insert(tup, event_id.clone());
        }
    }
    filtered
}

impl EventsDirectory {
    /// Current DAG tips of a room. Only the IDs are needed, so no fetches
    /// are scheduled.
    pub async fn lookup_current_room_extrems(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
    ) -> Result<Vec<OwnedEventId>> {
        let kvs = txn
            .get_range(&self.range_for_room_extrems(room_id), RangeOptions::default())
            .await?;
        let mut event_ids = Vec::with_capacity(kvs.len().max(1));
        for kv in kvs {
            event_ids.push(self.key_to_room_extrem(&kv.key)?);
        }
        Ok(event_ids)
    }

    /// Current non-member state of a room.
    pub async fn lookup_current_room_state_map(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<StateMap> {
        let kvs = txn
            .get_range(
                &self.range_for_current_room_state(room_id),
                RangeOptions::default(),
            )
            .await?;

        let mut state = StateMap::new();
        for kv in kvs {
            let (kind, state_key) = self.key_to_room_current_state_tup(&kv.key)?;
            let event_id: OwnedEventId = String::from_utf8(kv.value)
                .map_err(|_| crate::Error::BadData("invalid event ID value"))?
                .parse()
                .map_err(|_| crate::Error::BadData("invalid event ID value"))?;
            if let Some(provider) = events_provider {
                provider.will_get(&event_id);
            }
            state.insert(StateTup { kind, state_key }, event_id);
        }
        Ok(state)
    }

    pub async fn lookup_current_room_auth_state_map(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<StateMap> {
        let state = self
            .lookup_current_room_state_map(txn, room_id, None)
            .await?;
        Ok(filter_state_map(&state, AUTH_STATE_TYPES, events_provider))
    }

    /// The stripped-state subset sent along with invites.
    pub async fn lookup_current_room_invite_state_map(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<StateMap> {
        let state = self
            .lookup_current_room_state_map(txn, room_id, None)
            .await?;
        Ok(filter_state_map(&state, INVITE_STATE_TYPES, events_provider))
    }

    /// Current membership tuples of a room, keyed by user.
    pub async fn lookup_current_room_members(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
    ) -> Result<Vec<(OwnedUserId, MembershipTup)>> {
        let kvs = txn
            .get_range(
                &self.range_for_current_room_members(room_id),
                RangeOptions::default(),
            )
            .await?;
        let mut members = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let user_id = self.key_to_current_room_member(&kv.key)?;
            members.push((user_id, value_to_membership_tup(&kv.value)?));
        }
        Ok(members)
    }

    /// Member state of the whole room as a state map.
    pub async fn lookup_current_room_member_state_map(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<StateMap> {
        let members = self.lookup_current_room_members(txn, room_id).await?;
        let mut state = StateMap::with_capacity(members.len());
        for (user_id, tup) in members {
            if let Some(provider) = events_provider {
                provider.will_get(&tup.event_id);
            }
            state.insert(
                StateTup::new(StateEventType::RoomMember, user_id.as_str()),
                tup.event_id,
            );
        }
        Ok(state)
    }

    /// Member state for a specific set of users only.
    pub async fn lookup_current_specific_member_state_map(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        user_ids: &[OwnedUserId],
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<StateMap> {
        let mut state = StateMap::with_capacity(user_ids.len());
        for user_id in user_ids {
            let key = self.key_for_current_room_member(room_id, user_id);
            let Some(value) = txn.get(&key).await? else {
                continue;
            };
            let tup = value_to_membership_tup(&value)?;
            if let Some(provider) = events_provider {
                provider.will_get(&tup.event_id);
            }
            state.insert(
                StateTup::new(StateEventType::RoomMember, user_id.as_str()),
                tup.event_id,
            );
        }
        Ok(state)
    }

    /// The auth state plus the given users' member state - the working set
    /// for authorizing a batch against current state.
    pub async fn lookup_current_room_auth_and_member_state_map(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        user_ids: &[OwnedUserId],
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<StateMap> {
        let mut state = self
            .lookup_current_room_auth_state_map(txn, room_id, events_provider)
            .await?;
        let members = self
            .lookup_current_specific_member_state_map(txn, room_id, user_ids, events_provider)
            .await?;
        state.extend(members);
        Ok(state)
    }

    /// Servers currently resident in a room.
    pub async fn lookup_current_room_servers(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
    ) -> Result<Vec<OwnedServerName>> {
        let kvs = txn
            .get_range(
                &self.range_for_current_room_servers(room_id),
                RangeOptions::default(),
            )
            .await?;
        let mut servers = Vec::with_capacity(kvs.len());
        for kv in kvs {
            servers.push(self.key_to_current_room_server(&kv.key)?);
        }
        Ok(servers)
    }
}
