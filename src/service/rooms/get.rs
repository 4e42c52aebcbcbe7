//! Read operations over events and state. Workloads too large for one
//! transaction split across several read transactions - events are
//! immutable, so consistency past the first fetch is free.

use std::sync::Arc;

use ruma::{EventId, OwnedEventId, OwnedServerName, RoomId, UserId};

use super::events::EventsProvider;
use super::RoomsDatabase;
use crate::types::{Event, MembershipTup, StateMap};
use crate::{utils, Error, Result};

/// Room state plus its auth chain at a point in the DAG.
#[derive(Debug, Default)]
pub struct RoomStateAtEvent {
    pub state_events: Vec<Event>,
    pub auth_chain: Vec<Event>,
}

/// The same, as bare IDs for federation responses.
#[derive(Debug, Default)]
pub struct RoomStateIdsAtEvent {
    pub state_event_ids: Vec<OwnedEventId>,
    pub auth_chain_ids: Vec<OwnedEventId>,
}

impl RoomsDatabase {
    /// Whether we have accepted an event under this ID.
    pub async fn does_event_exist(&self, event_id: &EventId) -> Result<bool> {
        let txn = self.db.read().await?;
        Ok(txn
            .get(&self.events.key_for_id_to_version(event_id))
            .await?
            .is_some())
    }

    pub async fn get_event(&self, event_id: &EventId) -> Result<Option<Event>> {
        let txn = self.db.read().await?;
        match txn.get(&self.events.key_for_event(event_id)).await? {
            Some(bytes) => Ok(Some(Event::from_bytes(&bytes, event_id)?)),
            None => Ok(None),
        }
    }

    /// The transitive auth chain of one event.
    pub async fn get_event_auth_chain(&self, event_id: &EventId) -> Result<Vec<Event>> {
        let txn = self.db.read().await?;
        let provider = EventsProvider::new(&*txn, &self.events);
        let event = provider.get(event_id).await?;
        let chain = self
            .events
            .get_auth_chain_for_events(&provider, &[event])
            .await?;
        let mut events: Vec<Event> = chain.iter().map(|event| (**event).clone()).collect();
        utils::sort_events(&mut events);
        Ok(events)
    }

    /// Full room state at (and including) an event.
    pub async fn get_room_state_map_at_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<StateMap> {
        let txn = self.db.read().await?;
        self.events
            .lookup_room_state_map_at_event(&*txn, room_id, event_id, None)
            .await
    }

    pub async fn get_room_auth_state_map_at_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<StateMap> {
        let txn = self.db.read().await?;
        self.events
            .lookup_room_auth_state_map_at_event(&*txn, room_id, event_id, None)
            .await
    }

    pub async fn get_room_member_state_map_at_event(
        &self,
        room_id: &RoomId,
        user_ids: &[ruma::OwnedUserId],
        event_id: &EventId,
    ) -> Result<StateMap> {
        let txn = self.db.read().await?;
        self.events
            .lookup_room_member_state_map_at_event(&*txn, room_id, user_ids, event_id, None)
            .await
    }

    /// Current full state events of a room, members included.
    pub async fn get_current_room_state_events(&self, room_id: &RoomId) -> Result<Vec<Event>> {
        let txn = self.db.read().await?;
        let provider = EventsProvider::new(&*txn, &self.events);

        let mut state = self
            .events
            .lookup_current_room_state_map(&*txn, room_id, Some(&provider))
            .await?;
        state.extend(
            self.events
                .lookup_current_room_member_state_map(&*txn, room_id, Some(&provider))
                .await?,
        );

        let mut events = Vec::with_capacity(state.len());
        for event_id in state.values() {
            events.push((*provider.get(event_id).await?).clone());
        }
        utils::sort_events(&mut events);
        Ok(events)
    }

    /// Current membership tuples of a room.
    pub async fn get_current_room_members(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<(ruma::OwnedUserId, MembershipTup)>> {
        let txn = self.db.read().await?;
        self.events.lookup_current_room_members(&*txn, room_id).await
    }

    pub async fn get_current_room_member_events(&self, room_id: &RoomId) -> Result<Vec<Event>> {
        let txn = self.db.read().await?;
        let provider = EventsProvider::new(&*txn, &self.events);
        let members = self
            .events
            .lookup_current_room_member_state_map(&*txn, room_id, Some(&provider))
            .await?;
        let mut events = Vec::with_capacity(members.len());
        for event_id in members.values() {
            events.push((*provider.get(event_id).await?).clone());
        }
        utils::sort_events(&mut events);
        Ok(events)
    }

    /// The stripped state sent along with invites.
    pub async fn get_current_room_invite_state_events(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<Event>> {
        let txn = self.db.read().await?;
        let provider = EventsProvider::new(&*txn, &self.events);
        let state = self
            .events
            .lookup_current_room_invite_state_map(&*txn, room_id, Some(&provider))
            .await?;
        let mut events = Vec::with_capacity(state.len());
        for event_id in state.values() {
            events.push((*provider.get(event_id).await?).clone());
        }
        utils::sort_events(&mut events);
        Ok(events)
    }

    pub async fn get_current_room_servers(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<OwnedServerName>> {
        let txn = self.db.read().await?;
        self.events.lookup_current_room_servers(&*txn, room_id).await
    }

    pub async fn is_user_in_room(&self, user_id: &UserId, room_id: &RoomId) -> Result<bool> {
        let txn = self.db.read().await?;
        self.users.is_user_in_room(&*txn, user_id, room_id).await
    }

    /// Room state with its auth chain at an event, split across two read
    /// transactions to stay inside the transaction time budget.
    pub async fn get_room_state_with_auth_chain_at_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<RoomStateAtEvent> {
        let mut result = RoomStateAtEvent::default();

        let state_arcs: Vec<Arc<Event>> = {
            let txn = self.db.read().await?;
            let provider = EventsProvider::new(&*txn, &self.events);
            let state = self
                .events
                .lookup_room_state_map_at_event(&*txn, room_id, event_id, Some(&provider))
                .await?;
            let mut events = Vec::with_capacity(state.len());
            for event_id in state.values() {
                events.push(provider.get(event_id).await?);
            }
            events
        };

        {
            let txn = self.db.read().await?;
            let provider =
                EventsProvider::new(&*txn, &self.events).with_events(state_arcs.iter().cloned());
            let chain = self
                .events
                .get_auth_chain_for_events(&provider, &state_arcs)
                .await?;
            result.auth_chain = chain.iter().map(|event| (**event).clone()).collect();
        }

        result.state_events = state_arcs.iter().map(|event| (**event).clone()).collect();
        utils::sort_events(&mut result.state_events);
        utils::sort_events(&mut result.auth_chain);
        Ok(result)
    }

    pub async fn get_room_state_with_auth_chain_ids_at_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<RoomStateIdsAtEvent> {
        let full = self
            .get_room_state_with_auth_chain_at_event(room_id, event_id)
            .await?;
        Ok(RoomStateIdsAtEvent {
            state_event_ids: full
                .state_events
                .iter()
                .map(|event| (*event.event_id).to_owned())
                .collect(),
            auth_chain_ids: full
                .auth_chain
                .iter()
                .map(|event| (*event.event_id).to_owned())
                .collect(),
        })
    }

    /// Fetch an event or fail with `EventNotFound`.
    pub(crate) async fn require_event(&self, event_id: &EventId) -> Result<Event> {
        self.get_event(event_id).await?.ok_or(Error::EventNotFound)
    }
}
