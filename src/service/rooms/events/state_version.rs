//! Historical-state lookups: room state as it stood at (or just before) a
//! given event, replayed from the per-room state delta log or read with
//! per-slot reverse scans.

use ruma::{events::StateEventType, EventId, OwnedUserId, RoomId};
use tracing::warn;

use super::{providers::EventsProvider, EventsDirectory, AUTH_STATE_TYPES};
use crate::database::{KvsTransaction, RangeOptions, Versionstamp};
use crate::types::{value_to_state_tup_with_id, value_to_versionstamp, StateMap, StateTup};
use crate::{Error, Result};

impl EventsDirectory {
    /// The versionstamp an event was committed under.
    pub async fn lookup_version_for_event(
        &self,
        txn: &dyn KvsTransaction,
        event_id: &EventId,
    ) -> Result<Versionstamp> {
        let key = self.key_for_id_to_version(event_id);
        let value = txn.get(&key).await?.ok_or(Error::EventNotFound)?;
        value_to_versionstamp(&value)
    }

    /// The exclusive range bound covering everything at or before an event:
    /// the event's own versionstamp plus one user version.
    async fn version_bound_at_event(
        &self,
        txn: &dyn KvsTransaction,
        event_id: &EventId,
    ) -> Result<Versionstamp> {
        Ok(self.lookup_version_for_event(txn, event_id).await?.next())
    }

    /// Full room state at (and including) an event, replayed from the
    /// per-room state delta log. Later deltas overwrite earlier ones.
    pub async fn lookup_room_state_map_at_event(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        event_id: &EventId,
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<StateMap> {
        let bound = self.version_bound_at_event(txn, event_id).await?;

        let kvs = txn
            .get_range(
                &self.range_for_room_state_versions(room_id, bound),
                RangeOptions::default(),
            )
            .await?;

        let mut state = StateMap::new();
        for kv in kvs {
            let tup = value_to_state_tup_with_id(&kv.value)?;
            state.insert(tup.tup, tup.event_id);
        }

        if let Some(provider) = events_provider {
            for event_id in state.values() {
                provider.will_get(event_id);
            }
        }
        Ok(state)
    }

    /// Auth-relevant state (create, join rules, power levels) at an event.
    /// Each slot is one reverse scan with limit 1 over the full-history
    /// index.
    pub async fn lookup_room_auth_state_map_at_event(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        event_id: &EventId,
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<StateMap> {
        let bound = self.version_bound_at_event(txn, event_id).await?;

        let mut state = StateMap::with_capacity(AUTH_STATE_TYPES.len());
        for kind in AUTH_STATE_TYPES {
            let kvs = txn
                .get_range(
                    &self.range_for_room_version_state_tup(room_id, kind, "", bound),
                    RangeOptions::reverse_limit(1),
                )
                .await?;
            if kvs.len() > 1 {
                panic!("more than one key returned for versioned state request");
            }
            let Some(kv) = kvs.into_iter().next() else {
                warn!(
                    room_id = %room_id,
                    state_type = %kind,
                    at_or_before = %event_id,
                    "No historical state event found in room"
                );
                continue;
            };
            let found = event_id_from_value(kv.value)?;
            state.insert(StateTup::new(kind.clone(), ""), found);
        }

        if let Some(provider) = events_provider {
            for event_id in state.values() {
                provider.will_get(event_id);
            }
        }
        Ok(state)
    }

    /// Specific users' member state at an event.
    pub async fn lookup_room_member_state_map_at_event(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        user_ids: &[OwnedUserId],
        event_id: &EventId,
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<StateMap> {
        let bound = self.version_bound_at_event(txn, event_id).await?;

        let mut state = StateMap::with_capacity(user_ids.len());
        for user_id in user_ids {
            let kvs = txn
                .get_range(
                    &self.range_for_room_version_state_tup(
                        room_id,
                        &StateEventType::RoomMember,
                        user_id.as_str(),
                        bound,
                    ),
                    RangeOptions::reverse_limit(1),
                )
                .await?;
            if kvs.len() > 1 {
                panic!("more than one key returned for versioned member state request");
            }
            let Some(kv) = kvs.into_iter().next() else {
                continue;
            };
            let found = event_id_from_value(kv.value)?;
            state.insert(
                StateTup::new(StateEventType::RoomMember, user_id.as_str()),
                found,
            );
        }

        if let Some(provider) = events_provider {
            for event_id in state.values() {
                provider.will_get(event_id);
            }
        }
        Ok(state)
    }

    /// Auth state plus specific members' state at an event - the working
    /// set for step-5 authorization.
    pub async fn lookup_room_auth_and_member_state_map_at_event(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        user_ids: &[OwnedUserId],
        event_id: &EventId,
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<StateMap> {
        let mut state = self
            .lookup_room_auth_state_map_at_event(txn, room_id, event_id, events_provider)
            .await?;
        let members = self
            .lookup_room_member_state_map_at_event(
                txn,
                room_id,
                user_ids,
                event_id,
                events_provider,
            )
            .await?;
        state.extend(members);
        Ok(state)
    }
}

fn event_id_from_value(value: Vec<u8>) -> Result<ruma::OwnedEventId> {
    String::from_utf8(value)
        .map_err(|_| Error::BadData("invalid event ID value"))?
        .parse()
        .map_err(|_| Error::BadData("invalid event ID value"))
}
