// =============================================================================
// Parlor - Transaction Event Providers
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Per-transaction event cache and the state-map-backed authorization
//   context built on it. Both live strictly inside one transaction body and
//   are not safe for concurrent use.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use ruma::{
    events::StateEventType, state_res, EventId, OwnedEventId, OwnedUserId, UserId,
};
use tracing::{debug, trace, warn};

use super::EventsDirectory;
use crate::database::KvsTransaction;
use crate::types::{Event, StateMap, StateTup};
use crate::{Error, Result};

/// A per-transaction read-through cache over full event records.
///
/// `will_get` schedules a read so the engine can prefetch; `get` awaits it.
/// Events added via `add` shadow the store, which is how a batch makes its
/// own events visible to later authorization steps. Not concurrency safe:
/// a transaction is owned by one task.
pub struct EventsProvider<'a> {
    txn: &'a dyn KvsTransaction,
    directory: &'a EventsDirectory,
    scheduled: Mutex<HashSet<OwnedEventId>>,
    events: Mutex<HashMap<OwnedEventId, Arc<Event>>>,
}

impl<'a> EventsProvider<'a> {
    pub fn new(txn: &'a dyn KvsTransaction, directory: &'a EventsDirectory) -> Self {
        EventsProvider {
            txn,
            directory,
            scheduled: Mutex::new(HashSet::new()),
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the cache with events already in hand.
    pub fn with_events<I>(self, events: I) -> Self
    where
        I: IntoIterator<Item = Arc<Event>>,
    {
        for event in events {
            self.add_arc(event);
        }
        self
    }

    /// Carry another (finished) provider's cache into this transaction.
    /// Events are immutable, so reuse across transactions is sound.
    pub fn with_provider_events(self, other: &EventsProvider<'_>) -> Self {
        let inherited: Vec<Arc<Event>> = other
            .events
            .lock()
            .expect("events lock poisoned")
            .values()
            .cloned()
            .collect();
        self.with_events(inherited)
    }

    /// Schedule a fetch for an event if it isn't cached or already
    /// scheduled. Fetching on demand later is always correct, just slower.
    pub fn will_get(&self, event_id: &EventId) {
        if self.events.lock().expect("events lock poisoned").contains_key(event_id) {
            return;
        }
        let mut scheduled = self.scheduled.lock().expect("scheduled lock poisoned");
        if scheduled.insert(event_id.to_owned()) {
            trace!(event_id = %event_id, "Will get event");
        }
    }

    /// Insert an event into the cache, superseding any scheduled fetch.
    pub fn add(&self, event: Event) -> Arc<Event> {
        let event = Arc::new(event);
        self.add_arc(event.clone());
        event
    }

    pub fn add_arc(&self, event: Arc<Event>) {
        self.scheduled
            .lock()
            .expect("scheduled lock poisoned")
            .remove(&*event.event_id);
        self.events
            .lock()
            .expect("events lock poisoned")
            .insert((*event.event_id).to_owned(), event);
    }

    /// Snapshot the cache, to seed a provider in a later transaction.
    pub fn cached_events(&self) -> Vec<Arc<Event>> {
        self.events
            .lock()
            .expect("events lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_cached(&self, event_id: &EventId) -> Option<Arc<Event>> {
        self.events
            .lock()
            .expect("events lock poisoned")
            .get(event_id)
            .cloned()
    }

    /// Fetch an event, from cache if possible.
    pub async fn get(&self, event_id: &EventId) -> Result<Arc<Event>> {
        if let Some(event) = self.get_cached(event_id) {
            return Ok(event);
        }

        let was_scheduled = self
            .scheduled
            .lock()
            .expect("scheduled lock poisoned")
            .remove(event_id);
        if !was_scheduled {
            warn!(event_id = %event_id, "Fetching event on-demand, no scheduled read");
        }

        let key = self.directory.key_for_event(event_id);
        let bytes = self.txn.get(&key).await?.ok_or(Error::EventNotFound)?;

        trace!(event_id = %event_id, "Load event");
        let event = Arc::new(Event::from_bytes(&bytes, event_id)?);
        self.events
            .lock()
            .expect("events lock poisoned")
            .insert(event_id.to_owned(), event.clone());
        Ok(event)
    }
}

/// State-map-backed authorization context.
///
/// After a state event passes `is_event_allowed` the provider's state map
/// is updated in place, so subsequent authorizations in the same batch
/// observe the just-authorized state - a batch can authorize itself.
pub struct AuthProvider<'a, 'p> {
    events: &'p EventsProvider<'a>,
    state: StateMap,
}

impl<'a, 'p> AuthProvider<'a, 'p> {
    pub fn new(events: &'p EventsProvider<'a>, state: StateMap) -> Self {
        AuthProvider { events, state }
    }

    pub fn state(&self) -> &StateMap {
        &self.state
    }

    pub fn into_state(self) -> StateMap {
        self.state
    }

    pub fn create(&self) -> Option<&OwnedEventId> {
        self.state
            .get(&StateTup::new(StateEventType::RoomCreate, ""))
    }

    pub fn join_rules(&self) -> Option<&OwnedEventId> {
        self.state
            .get(&StateTup::new(StateEventType::RoomJoinRules, ""))
    }

    pub fn power_levels(&self) -> Option<&OwnedEventId> {
        self.state
            .get(&StateTup::new(StateEventType::RoomPowerLevels, ""))
    }

    pub fn member(&self, user_id: &UserId) -> Option<&OwnedEventId> {
        self.state
            .get(&StateTup::new(StateEventType::RoomMember, user_id.as_str()))
    }

    pub fn third_party_invite(&self, _token: &str) -> Option<&OwnedEventId> {
        // TODO: third-party invite auth pathway
        None
    }

    /// Select the auth event IDs a new event must declare: current create,
    /// power levels, the sender's membership and, for member events, the
    /// target's membership. The create event itself declares none.
    pub fn auth_event_ids_for_event(&self, event: &Event) -> Result<Vec<OwnedEventId>> {
        if event.kind == ruma::events::TimelineEventType::RoomCreate {
            return Ok(Vec::new());
        }

        let needed = state_res::auth_types_for_event(
            &event.kind,
            &event.sender,
            event.state_key.as_deref(),
            &event.content,
        )
        .map_err(|_| Error::BadData("event content is not a valid JSON object"))?;

        let mut auth_event_ids = Vec::with_capacity(needed.len());
        for (kind, state_key) in needed {
            if let Some(event_id) = self.state.get(&StateTup { kind, state_key }) {
                auth_event_ids.push(Arc::from(&**event_id));
            }
        }
        Ok(auth_event_ids)
    }

    /// Authorize an event against this provider's state under the event's
    /// room version rules.
    pub async fn is_event_allowed(&mut self, event: &Event) -> Result<()> {
        let rules = event.room_version_rules()?;

        // Resolve the state events the auth rules may consult up front;
        // the rules themselves run synchronously over the fetched map.
        let needed = state_res::auth_types_for_event(
            &event.kind,
            &event.sender,
            event.state_key.as_deref(),
            &event.content,
        )
        .map_err(|_| Error::BadData("event content is not a valid JSON object"))?;

        let mut fetched: HashMap<(StateEventType, String), Arc<Event>> = HashMap::new();
        for (kind, state_key) in needed {
            let tup = StateTup::new(kind.clone(), state_key.clone());
            let Some(event_id) = self.state.get(&tup) else {
                trace!(kind = %kind, state_key = %state_key, "Missed auth state event");
                continue;
            };
            let state_event = self.events.get(event_id).await?;
            fetched.insert((kind, state_key), state_event);
        }

        state_res::auth_check(&rules.authorization, event, |kind, state_key| {
            fetched.get(&(kind.clone(), state_key.to_owned()))
        })
        .map_err(|error| {
            debug!(event_id = %event.event_id, %error, "Event failed authorization");
            Error::EventNotAuthorized(error.to_string())
        })?;

        // Authorized: a state event now occupies its slot for the rest of
        // the batch.
        if event.is_state() {
            self.state
                .insert(event.state_tup(), (*event.event_id).to_owned());
        }
        Ok(())
    }

}

/// Build a state map from an event's declared auth events. Non-state auth
/// events should not appear; they are warned about and skipped.
pub async fn state_map_from_auth_events(
    events: &EventsProvider<'_>,
    auth_event_ids: &[OwnedEventId],
) -> Result<StateMap> {
    let mut state = StateMap::new();
    for event_id in auth_event_ids {
        let auth_event = events.get(event_id).await?;
        if !auth_event.is_state() {
            warn!(event_id = %event_id, "Ignoring non-state auth event");
            continue;
        }
        state.insert(auth_event.state_tup(), (*auth_event.event_id).to_owned());
    }
    Ok(state)
}

/// The deduplicated set of users a batch concerns: senders plus membership
/// targets.
pub fn user_id_list_for_events<'e, I>(events: I) -> Vec<OwnedUserId>
where
    I: IntoIterator<Item = &'e Event>,
{
    let mut user_ids = HashSet::new();
    for event in events {
        user_ids.insert(event.sender.clone());
        if event.kind == ruma::events::TimelineEventType::RoomMember {
            if let Some(state_key) = &event.state_key {
                if let Ok(target) = state_key.parse::<OwnedUserId>() {
                    user_ids.insert(target);
                }
            }
        }
    }
    user_ids.into_iter().collect()
}
