// =============================================================================
// Parlor - Send Engine
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   The engine of the room subsystem: authorizes and ingests events from
//   local users in a single write transaction, and federated events via
//   the three-step authorization pipeline (steps 4-6 of the server-server
//   checks) across three transactions, then writes every index the data
//   model derives from an event.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ruma::{
    events::room::member::MembershipState, events::StateEventType, events::TimelineEventType,
    OwnedEventId, OwnedServerName, OwnedUserId, RoomId, RoomVersionId, UInt,
};
use tracing::{debug, info, trace, warn};

use super::events::{
    providers::{state_map_from_auth_events, user_id_list_for_events},
    AuthProvider, EventsProvider,
};
use super::resolution::resolve_conflicts;
use super::RoomsDatabase;
use crate::database::{KvsTransaction, KvsWriteTransaction, Versionstamp};
use crate::service::notifier::Change;
use crate::types::{
    value_for_event_id_tup, value_for_membership_tup, value_for_state_tup_with_id,
    value_for_versionstamp, Event, MembershipTup, PartialEvent, Room, StateMap,
};
use crate::{utils, Error, Result};

/// Outcome of a send: the committed versionstamp (when anything was
/// stored), the accepted batch, and per-event rejections. Soft-failed
/// events are *accepted*.
pub struct SendEventsResult {
    pub version: Option<Versionstamp>,
    pub allowed: Vec<Event>,
    pub rejected: Vec<RejectedEvent>,
}

pub struct RejectedEvent {
    pub event: Event,
    pub error: Error,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SendFederatedOptions {
    /// Skip the step-5 prev-state check; used when re-ingesting events
    /// whose prev state was already evaluated (e.g. send_join responses).
    pub skip_prev_state_check: bool,
}

/// Options reserved for local sends; nothing to tune today.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendLocalOptions {}

impl RoomsDatabase {
    /// Send local events to a room, populating prev/auth events and
    /// authorizing each against the current room state. One write
    /// transaction; state forks are impossible for local sends.
    #[tracing::instrument(skip(self, partial_events), fields(room_id = %room_id, events = partial_events.len()))]
    pub async fn send_local_events(
        &self,
        room_id: &RoomId,
        partial_events: Vec<PartialEvent>,
        _options: SendLocalOptions,
    ) -> Result<SendEventsResult> {
        let txn = self.db.write().await?;

        let (allowed, rejected) = self
            .txn_prepare_local_events(txn.as_read(), room_id, partial_events)
            .await?;

        let change = self.txn_store_events(&*txn, room_id, &allowed).await?;
        let version = txn.commit().await?;

        let result = SendEventsResult {
            version: if allowed.is_empty() {
                None
            } else {
                Some(version)
            },
            allowed,
            rejected,
        };
        self.handle_send_events_result(&result, change);
        Ok(result)
    }

    /// Prepare, but do not store, local events: populate IDs, prev/auth
    /// events and authorize against current state in a read transaction.
    /// Used when a remote server must countersign before persistence; the
    /// result is later ingested through the federated pipeline. Any
    /// rejection fails the whole preparation.
    #[tracing::instrument(skip(self, partial_events))]
    pub async fn prepare_local_events(
        &self,
        partial_events: Vec<PartialEvent>,
    ) -> Result<Vec<Event>> {
        let room_id = partial_events
            .first()
            .map(|partial| partial.room_id.clone())
            .ok_or(Error::BadData("no events to prepare"))?;

        let txn = self.db.read().await?;
        let (allowed, mut rejected) = self
            .txn_prepare_local_events(&*txn, &room_id, partial_events)
            .await?;
        if let Some(rejection) = rejected.drain(..).next() {
            return Err(rejection.error);
        }
        Ok(allowed)
    }

    async fn txn_prepare_local_events(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        partial_events: Vec<PartialEvent>,
    ) -> Result<(Vec<Event>, Vec<RejectedEvent>)> {
        if partial_events.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let events_provider = EventsProvider::new(txn, &self.events);

        // Build the user set up front so one state read covers the batch
        let seed_events: Vec<Event> = partial_events
            .iter()
            .cloned()
            .map(Event::from_partial)
            .collect();
        let user_ids = user_id_list_for_events(seed_events.iter());

        let current_state = self
            .events
            .lookup_current_room_auth_and_member_state_map(
                txn,
                room_id,
                &user_ids,
                Some(&events_provider),
            )
            .await?;

        // Unless creating the room, this server must currently be in it
        if partial_events[0].kind != TimelineEventType::RoomCreate
            && !self
                .servers
                .is_server_in_room(txn, &self.config.server_name, room_id)
                .await?
        {
            return Err(Error::NotInRoom);
        }

        // Room version from the stored room, else from the create content
        let room_bytes = txn.get(&self.key_for_room(room_id)).await?;
        let (room_version, mut depth) = match &room_bytes {
            Some(bytes) => {
                let room = Room::from_bytes(bytes)?;
                (
                    room.version
                        .clone()
                        .ok_or(Error::BadData("stored room has no version"))?,
                    room.current_depth,
                )
            }
            None => (
                room_version_from_create_content(&partial_events[0].content)?,
                UInt::default(),
            ),
        };

        // Current DAG tips become prev_events; may be plural after
        // federation forks, and sending any event heals the split.
        let mut prev_event_ids = self
            .events
            .lookup_current_room_extrems(txn, room_id)
            .await?;

        let mut auth_provider = AuthProvider::new(&events_provider, current_state);

        let mut allowed = Vec::with_capacity(seed_events.len());
        let mut rejected = Vec::new();

        // The whole batch shares one origin timestamp
        let origin_timestamp =
            UInt::try_from(utils::millis_since_unix_epoch()).expect("timestamp fits");

        for mut event in seed_events {
            event.depth = depth;
            event.origin = Some(self.config.server_name.clone());
            event.origin_server_ts = origin_timestamp;
            event.room_version = room_version.clone();
            event.prev_events = prev_event_ids
                .iter()
                .map(|event_id| Arc::from(&**event_id))
                .collect();
            event.auth_events = auth_provider.auth_event_ids_for_event(&event)?;

            self.codec.hash_and_sign_event(&mut event)?;

            if let Err(error) = self.txn_check_event_before_store(txn, room_id, &event).await {
                rejected.push(RejectedEvent { event, error });
                continue;
            }

            if let Err(error) = auth_provider.is_event_allowed(&event).await {
                warn!(
                    event_id = %event.event_id,
                    %error,
                    "Failed to auth event against current state"
                );
                rejected.push(RejectedEvent { event, error });
                continue;
            }

            // Allowed: this event is the next one's prev, and visible to
            // the rest of the batch
            prev_event_ids = vec![(*event.event_id).to_owned()];
            depth = depth
                .checked_add(UInt::from(1u32))
                .expect("depth does not overflow");

            trace!(event_id = %event.event_id, kind = %event.kind, "Event authorized for storage");
            events_provider.add(event.clone());
            allowed.push(event);
        }

        Ok((allowed, rejected))
    }

    /// Send federated events through the three-step authorization
    /// pipeline. All remote fetching must already be done: every event
    /// this batch depends on is either stored or in the batch itself.
    ///
    /// Step 4 authorizes against each event's declared auth events, step 5
    /// against the state before the event (resolving forks), and step 6
    /// against the current room state. A step-6 failure soft-fails the
    /// event rather than rejecting it.
    #[tracing::instrument(skip(self, events, options), fields(room_id = %room_id, events = events.len()))]
    pub async fn send_federated_events(
        &self,
        room_id: &RoomId,
        events: Vec<Event>,
        options: SendFederatedOptions,
    ) -> Result<SendEventsResult> {
        let user_ids = user_id_list_for_events(events.iter());
        let mut rejected = Vec::new();

        // Phase 1 (read): room precondition, duplicate rejection, step 4
        let (events, room_version, carried) = {
            let txn = self.db.read().await?;
            self.txn_federated_step_four(&*txn, room_id, events, &mut rejected)
                .await?
        };

        // Phase 2 (read): step 5, the state before each event
        let (events, carried) = if options.skip_prev_state_check {
            (events, carried)
        } else {
            let txn = self.db.read().await?;
            self.txn_federated_step_five(
                &*txn,
                room_id,
                &room_version,
                events,
                &user_ids,
                carried,
                &mut rejected,
            )
            .await?
        };

        // Phase 3 (write): step 6 against current state, soft-failing, and
        // the actual store
        let txn = self.db.write().await?;
        let events_provider =
            EventsProvider::new(txn.as_read(), &self.events).with_events(carried);

        let current_state = self
            .events
            .lookup_current_room_auth_and_member_state_map(
                txn.as_read(),
                room_id,
                &user_ids,
                Some(&events_provider),
            )
            .await?;
        let mut auth_provider = AuthProvider::new(&events_provider, current_state);

        let mut allowed = Vec::with_capacity(events.len());
        for mut event in events {
            match auth_provider.is_event_allowed(&event).await {
                Ok(()) => {
                    trace!(event_id = %event.event_id, "Event passed authorization step 6");
                }
                Err(error) => {
                    // Soft fail: store and link into the DAG, but keep out
                    // of room indices, current state and client views. No
                    // event verified by steps 4-5 is demoted to rejected.
                    info!(event_id = %event.event_id, %error, "Soft failed to auth event (step 6)");
                    event.soft_failed = true;
                }
            }
            events_provider.add(event.clone());
            allowed.push(event);
        }
        drop(auth_provider);
        drop(events_provider);

        let change = self.txn_store_events(&*txn, room_id, &allowed).await?;
        let version = txn.commit().await?;

        let result = SendEventsResult {
            version: if allowed.is_empty() {
                None
            } else {
                Some(version)
            },
            allowed,
            rejected,
        };
        self.handle_send_events_result(&result, change);
        Ok(result)
    }

    async fn txn_federated_step_four(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        events: Vec<Event>,
        rejected: &mut Vec<RejectedEvent>,
    ) -> Result<(Vec<Event>, RoomVersionId, Vec<Arc<Event>>)> {
        // Room version and the federated flag are immutable, so this
        // check is safe outside the final write transaction.
        let room_bytes = txn.get(&self.key_for_room(room_id)).await?;
        let room_version = match &room_bytes {
            Some(bytes) => {
                let room = Room::from_bytes(bytes)?;
                if !room.federated {
                    return Err(Error::NotFederated);
                }
                room.version
                    .clone()
                    .ok_or(Error::BadData("stored room has no version"))?
            }
            None => {
                // No room: the first event must be its create event
                let first = events.first().ok_or(Error::BadData("no events to send"))?;
                if first.kind != TimelineEventType::RoomCreate {
                    return Err(Error::BadData(
                        "room create event is missing, rejecting entire batch",
                    ));
                }
                if !self.config.allow_federated_room_creates {
                    return Err(Error::NotFederated);
                }
                room_version_from_create_content(&first.content)?
            }
        };

        let events_provider = EventsProvider::new(txn, &self.events)
            .with_events(events.iter().cloned().map(Arc::new));

        // Kick off fetches for everything step 4 and 5 will touch
        for event in &events {
            for event_id in event.auth_events.iter().chain(event.prev_events.iter()) {
                events_provider.will_get(event_id);
            }
        }

        let mut allowed = Vec::with_capacity(events.len());

        for mut event in events {
            event.room_version = room_version.clone();
            // Internal flags are ours to set, never the wire's
            event.soft_failed = false;
            event.outlier = false;

            // Duplicates can arrive when another server gets confused; the
            // one exception is reviving an outlier membership we only knew
            // as a pending invite.
            let exists = txn
                .get(&self.events.key_for_id_to_version(&event.event_id))
                .await?
                .is_some();
            if exists {
                let is_revivable_outlier = event.kind == TimelineEventType::RoomMember
                    && match &event.state_key {
                        Some(state_key) => match state_key.parse::<OwnedUserId>() {
                            Ok(target) => txn
                                .get(&self.users.key_for_user_outlier_membership(
                                    &target, room_id,
                                ))
                                .await?
                                .is_some(),
                            Err(_) => false,
                        },
                        None => false,
                    };
                if !is_revivable_outlier {
                    warn!(event_id = %event.event_id, "Rejecting duplicate event we already know about");
                    rejected.push(RejectedEvent {
                        event,
                        error: Error::EventAlreadyExists,
                    });
                    continue;
                }
            }

            if let Err(error) = self.txn_check_event_before_store(txn, room_id, &event).await {
                rejected.push(RejectedEvent { event, error });
                continue;
            }

            // Step 4: authorize against the event's own declared auth events
            let auth_state =
                match state_map_from_auth_events(&events_provider, &event.auth_events).await {
                    Ok(state) => state,
                    Err(Error::EventNotFound) => {
                        rejected.push(RejectedEvent {
                            event,
                            error: Error::AuthStep4Failed("auth event not found".to_owned()),
                        });
                        continue;
                    }
                    Err(error) => return Err(error),
                };

            let mut auth_provider = AuthProvider::new(&events_provider, auth_state);
            if let Err(error) = auth_provider.is_event_allowed(&event).await {
                warn!(event_id = %event.event_id, %error, "Failed to auth event (step 4)");
                rejected.push(RejectedEvent {
                    event,
                    error: Error::AuthStep4Failed(error.to_string()),
                });
                continue;
            }

            trace!(event_id = %event.event_id, "Event passed authorization step 4");
            allowed.push(event);
        }

        let carried = events_provider.cached_events();
        Ok((allowed, room_version, carried))
    }

    #[allow(clippy::too_many_arguments)]
    async fn txn_federated_step_five(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        room_version: &RoomVersionId,
        events: Vec<Event>,
        user_ids: &[OwnedUserId],
        carried_cache: Vec<Arc<Event>>,
        rejected: &mut Vec<RejectedEvent>,
    ) -> Result<(Vec<Event>, Vec<Arc<Event>>)> {
        let events_provider = EventsProvider::new(txn, &self.events).with_events(carried_cache);

        // Prefetch prev events' auth events where we already have the prev
        for event in &events {
            for prev_id in &event.prev_events {
                match events_provider.get(prev_id).await {
                    Ok(prev_event) => {
                        for auth_id in &prev_event.auth_events {
                            events_provider.will_get(auth_id);
                        }
                    }
                    // The prev may be in this batch or genuinely missing;
                    // the on-demand path below decides which
                    Err(Error::EventNotFound) => continue,
                    Err(error) => return Err(error),
                }
            }
        }

        // State at each event as we authorize, so a batch of events that
        // reference one another as prevs resolves against itself.
        let mut state_at_event: HashMap<OwnedEventId, StateMap> = HashMap::new();

        let mut allowed = Vec::with_capacity(events.len());

        for event in events {
            let mut fork_states: Vec<StateMap> = Vec::with_capacity(event.prev_events.len());
            let mut missing_prev = false;
            for prev_id in &event.prev_events {
                let state = match state_at_event.get(prev_id.as_ref()) {
                    Some(state) => state.clone(),
                    None => {
                        match self
                            .events
                            .lookup_room_auth_and_member_state_map_at_event(
                                txn,
                                room_id,
                                user_ids,
                                prev_id,
                                Some(&events_provider),
                            )
                            .await
                        {
                            Ok(state) => state,
                            Err(Error::EventNotFound) => {
                                missing_prev = true;
                                break;
                            }
                            Err(error) => return Err(error),
                        }
                    }
                };
                fork_states.push(state);
            }
            if missing_prev {
                rejected.push(RejectedEvent {
                    event,
                    error: Error::AuthStep5Failed("prev event not found".to_owned()),
                });
                continue;
            }

            let prev_state = if fork_states.len() == 1 {
                fork_states.pop().expect("one fork state")
            } else {
                // Multiple prevs mean forked history: gather each fork's
                // state events and auth chains, then run state resolution.
                match self
                    .txn_resolve_fork_states(&events_provider, room_version, &fork_states)
                    .await
                {
                    Ok(state) => state,
                    Err(Error::EventNotFound) => {
                        rejected.push(RejectedEvent {
                            event,
                            error: Error::AuthStep5Failed(
                                "state event for resolution not found".to_owned(),
                            ),
                        });
                        continue;
                    }
                    Err(error) => return Err(error),
                }
            };

            // Record now; on success the event is layered on top so later
            // batch members see it.
            state_at_event.insert((*event.event_id).to_owned(), prev_state.clone());

            let mut auth_provider = AuthProvider::new(&events_provider, prev_state);
            if let Err(error) = auth_provider.is_event_allowed(&event).await {
                warn!(event_id = %event.event_id, %error, "Failed to auth event (step 5)");
                rejected.push(RejectedEvent {
                    event,
                    error: Error::AuthStep5Failed(error.to_string()),
                });
                continue;
            }

            trace!(event_id = %event.event_id, "Event passed authorization step 5");
            if event.is_state() {
                state_at_event
                    .get_mut(&*event.event_id)
                    .expect("state recorded above")
                    .insert(event.state_tup(), (*event.event_id).to_owned());
            }
            allowed.push(event);
        }

        let carried = events_provider.cached_events();
        Ok((allowed, carried))
    }

    /// Resolve the union of forked states into one state map.
    async fn txn_resolve_fork_states(
        &self,
        events_provider: &EventsProvider<'_>,
        room_version: &RoomVersionId,
        fork_states: &[StateMap],
    ) -> Result<StateMap> {
        let mut auth_chain_sets = Vec::with_capacity(fork_states.len());
        for state in fork_states {
            let mut state_events = Vec::with_capacity(state.len());
            for event_id in state.values() {
                state_events.push(events_provider.get(event_id).await?);
            }
            let chain = self
                .events
                .get_auth_chain_for_events(events_provider, &state_events)
                .await?;
            let chain_ids: HashSet<OwnedEventId> = chain
                .iter()
                .map(|event| (*event.event_id).to_owned())
                .collect();
            auth_chain_sets.push(chain_ids);
        }

        resolve_conflicts(
            room_version,
            fork_states.to_vec(),
            auth_chain_sets,
            |event_id| events_provider.get_cached(event_id),
            |event| event.soft_failed || event.outlier,
        )
    }

    /// Store a federated membership we only know as a pending invite. The
    /// event is flagged as an outlier: stored and discoverable, but not
    /// linked into the room DAG or any state index.
    pub async fn send_federated_outlier_membership(&self, mut event: Event) -> Result<()> {
        if event.kind != TimelineEventType::RoomMember {
            panic!("outlier event is not a member event");
        }
        event.outlier = true;

        let room_id = event.room_id.clone();
        let txn = self.db.write().await?;
        let change = self
            .txn_store_events(&*txn, &room_id, std::slice::from_ref(&event))
            .await?;
        txn.commit().await?;
        self.notifier.send_change(change);
        Ok(())
    }

    /// Final internal checks before an event is accepted for storage;
    /// currently duplicate annotation suppression.
    async fn txn_check_event_before_store(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        event: &Event,
    ) -> Result<()> {
        // Sanity checks - should never happen
        if event.room_id != room_id {
            panic!("event room ID does not match input room ID");
        }

        if let Some((parent, rel_type)) = event.relates_to() {
            if rel_type == crate::types::REL_ANNOTATION {
                let key = self.events.key_for_room_reaction(
                    room_id,
                    &parent,
                    &event.sender,
                    &event.reaction_key().unwrap_or_default(),
                );
                if txn.get(&key).await?.is_some() {
                    return Err(Error::DuplicateAnnotation);
                }
            }
        }
        Ok(())
    }

    /// Write out everything an already-authorized batch derives: the event
    /// records, version indices, state and membership indices, relations
    /// and DAG extremities. Returns the change to broadcast on commit.
    pub(crate) async fn txn_store_events(
        &self,
        txn: &dyn KvsWriteTransaction,
        room_id: &RoomId,
        events: &[Event],
    ) -> Result<Change> {
        if events.is_empty() {
            return Ok(Change::default());
        }

        let read = txn.as_read();

        let room_key = self.key_for_room(room_id);
        let mut room = match read.get(&room_key).await? {
            Some(bytes) => Room::from_bytes(&bytes)?,
            None => Room::default(),
        };
        let mut room_changed = false;

        let mut changed_users: HashSet<OwnedUserId> = HashSet::new();
        let mut changed_servers: HashSet<OwnedServerName> = HashSet::new();

        for (index, event) in events.iter().enumerate() {
            trace!(event_id = %event.event_id, kind = %event.kind, "Storing event");

            let event_id_bytes = event.event_id.as_bytes();
            let version = Versionstamp::incomplete(u16::try_from(index).expect("batch fits"));

            // The event record itself
            txn.set(&self.events.key_for_event(&event.event_id), &event.to_bytes());

            // Global order: version -> (event_id, room_id)
            txn.set_versionstamped_key(
                &self.events.key_for_version(version),
                &value_for_event_id_tup(&event.event_id_tup()),
            );

            if event.outlier {
                // Outliers are not part of the DAG; store the record plus
                // the pending membership pointer and we're done.
                if let Some(state_key) = &event.state_key {
                    if let Ok(target) = state_key.parse::<OwnedUserId>() {
                        txn.set(
                            &self.users.key_for_user_outlier_membership(&target, room_id),
                            &value_for_membership_tup(&event.membership_tup()),
                        );
                    }
                }
                continue;
            }

            if event.soft_failed {
                // A soft-failed event is not valid at the version we are
                // creating; it *is* valid at its prevs. Pointing its
                // version at the first prev keeps historical state
                // resolution at this event correct without surfacing it
                // in any timeline.
                let prev_id = event
                    .prev_events
                    .first()
                    .expect("soft failed event has prev events");
                let prev_version = self.events.lookup_version_for_event(read, prev_id).await?;
                let value = value_for_versionstamp(prev_version);
                if prev_version.is_incomplete() {
                    // The prev commits in this same batch; patch at commit
                    txn.set_versionstamped_value(
                        &self.events.key_for_id_to_version(&event.event_id),
                        &value,
                    );
                } else {
                    txn.set(&self.events.key_for_id_to_version(&event.event_id), &value);
                }
                continue;
            }

            // event_id -> version
            txn.set_versionstamped_value(
                &self.events.key_for_id_to_version(&event.event_id),
                &value_for_versionstamp(version),
            );

            // Room timeline index, plus the local-only index federation
            // syncs from
            txn.set_versionstamped_key(
                &self.events.key_for_room_version(room_id, version),
                event_id_bytes,
            );
            if event.sender.server_name() == &*self.config.server_name {
                txn.set_versionstamped_key(
                    &self.events.key_for_room_local_version(room_id, version),
                    event_id_bytes,
                );
            }

            if let Some(state_key) = event.state_key.clone() {
                if self
                    .txn_update_room_for_state_event(read, room_id, &mut room, event)
                    .await?
                {
                    room_changed = true;
                }

                // State delta log and full history index
                txn.set_versionstamped_key(
                    &self.events.key_for_room_state_version(room_id, version),
                    &value_for_state_tup_with_id(&event.state_tup_with_id()),
                );
                let kind: StateEventType = event.kind.to_string().into();
                txn.set_versionstamped_key(
                    &self
                        .events
                        .key_for_room_version_state_tup(room_id, &kind, &state_key, version),
                    event_id_bytes,
                );

                if event.kind != TimelineEventType::RoomMember {
                    txn.set(
                        &self
                            .events
                            .key_for_room_current_state_tup(room_id, &kind, &state_key),
                        event_id_bytes,
                    );
                } else {
                    // Member events additionally track which users and
                    // servers are in the room
                    let Ok(member_id) = state_key.parse::<OwnedUserId>() else {
                        return Err(Error::BadData("member event with non-user state key"));
                    };
                    changed_users.insert(member_id.clone());

                    let membership_value = value_for_membership_tup(&event.membership_tup());

                    txn.set(
                        &self.events.key_for_current_room_member(room_id, &member_id),
                        &membership_value,
                    );
                    txn.set(
                        &self.users.key_for_user_membership(&member_id, room_id),
                        &membership_value,
                    );
                    txn.set_versionstamped_key(
                        &self.users.key_for_user_membership_change(&member_id, version),
                        &membership_value,
                    );
                    // A committed membership supersedes any outlier
                    txn.clear(
                        &self
                            .users
                            .key_for_user_outlier_membership(&member_id, room_id),
                    );

                    self.txn_update_server_presence(
                        txn,
                        room_id,
                        event,
                        &member_id,
                        &membership_value,
                        version,
                        &mut changed_servers,
                    )
                    .await?;
                }
            }

            // Relations: the parent-child log, thread roots, and the
            // annotation dedup index
            if let Some((parent, rel_type)) = event.relates_to() {
                let mut relation_value = event.event_id.as_bytes().to_vec();
                relation_value.push(0x00);
                relation_value.extend_from_slice(rel_type.as_bytes());
                txn.set_versionstamped_key(
                    &self.events.key_for_room_relation(room_id, &parent, version),
                    &relation_value,
                );

                if rel_type == crate::types::REL_THREAD {
                    // The first reply in a thread creates the root entry
                    match self.events.lookup_version_for_event(read, &parent).await {
                        Ok(parent_version) if !parent_version.is_incomplete() => {
                            let thread_key =
                                self.events.key_for_room_thread(room_id, parent_version);
                            if read.get(&thread_key).await?.is_none() {
                                txn.set(&thread_key, parent.as_bytes());
                            }
                        }
                        Ok(_) => {
                            debug!(parent = %parent, "Thread root committing in same batch, skipping root index");
                        }
                        Err(Error::EventNotFound) => {
                            warn!(parent = %parent, "Thread relation to unknown event");
                        }
                        Err(error) => return Err(error),
                    }
                }

                if rel_type == crate::types::REL_ANNOTATION {
                    // Dupes were rejected before storage
                    txn.set(
                        &self.events.key_for_room_reaction(
                            room_id,
                            &parent,
                            &event.sender,
                            &event.reaction_key().unwrap_or_default(),
                        ),
                        event_id_bytes,
                    );
                }
            }

            // DAG extremities: each new event retires its prevs and
            // becomes a tip itself, so a non-empty room always has at
            // least one tip and any split heals on the next send.
            for prev_id in &event.prev_events {
                txn.clear(&self.events.key_for_room_extrem(room_id, prev_id));
            }
            txn.set(
                &self.events.key_for_room_extrem(room_id, &event.event_id),
                &[],
            );
        }

        if room_changed {
            txn.set(&room_key, &room.to_bytes());
        }

        let changed_servers: Vec<OwnedServerName> = changed_servers
            .into_iter()
            .filter(|server| *server != self.config.server_name)
            .collect();

        Ok(Change {
            instance_id: String::new(),
            room_ids: vec![room_id.to_owned()],
            user_ids: changed_users.into_iter().collect(),
            servers: changed_servers,
            // Only the last event ID, to keep notifier volume down
            event_ids: vec![(*events[events.len() - 1].event_id).to_owned()],
        })
    }

    /// Track server residency across a membership change.
    #[allow(clippy::too_many_arguments)]
    async fn txn_update_server_presence(
        &self,
        txn: &dyn KvsWriteTransaction,
        room_id: &RoomId,
        event: &Event,
        member_id: &OwnedUserId,
        membership_value: &[u8],
        version: Versionstamp,
        changed_servers: &mut HashSet<OwnedServerName>,
    ) -> Result<()> {
        let read = txn.as_read();
        let server_name = member_id.server_name().to_owned();
        let joined_member_key = self.servers.key_for_server_joined_member(
            room_id,
            &server_name,
            member_id.localpart(),
        );

        if event.membership() == MembershipState::Join {
            let was_joined = self
                .servers
                .is_server_in_room(read, &server_name, room_id)
                .await?;
            txn.set(&joined_member_key, &[]);
            if !was_joined {
                changed_servers.insert(server_name.clone());
                txn.set(
                    &self.events.key_for_current_room_server(room_id, &server_name),
                    membership_value,
                );
                txn.set(
                    &self.servers.key_for_server_membership(&server_name, room_id),
                    membership_value,
                );
                txn.set_versionstamped_key(
                    &self
                        .servers
                        .key_for_server_membership_change(&server_name, version),
                    membership_value,
                );
            }
        } else {
            txn.clear(&joined_member_key);
            // With this member gone, does the server still have anyone
            // joined here?
            let still_joined = self
                .servers
                .has_joined_members(read, room_id, &server_name)
                .await?;
            if !still_joined {
                changed_servers.insert(server_name.clone());
                txn.clear(&self.events.key_for_current_room_server(room_id, &server_name));
                txn.clear(&self.servers.key_for_server_membership(&server_name, room_id));
                // Any non-join membership lands as a leave in the log
                txn.set_versionstamped_key(
                    &self
                        .servers
                        .key_for_server_membership_change(&server_name, version),
                    &value_for_membership_tup(&MembershipTup {
                        event_id: (*event.event_id).to_owned(),
                        room_id: room_id.to_owned(),
                        membership: MembershipState::Leave,
                    }),
                );
            }
        }
        Ok(())
    }

    /// Apply a state event to the room summary. Returns whether the
    /// summary changed.
    async fn txn_update_room_for_state_event(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        room: &mut Room,
        event: &Event,
    ) -> Result<bool> {
        if !room.exists() {
            if event.kind != TimelineEventType::RoomCreate {
                panic!("no room create event");
            }
            room.room_id = Some(room_id.to_owned());
            room.version = Some(event.room_version.clone());
            room.room_type = event
                .content_field("type")
                .and_then(|value| value.as_str().map(str::to_owned));
            room.federated = event
                .content_field("m.federate")
                .and_then(|value| value.as_bool())
                .unwrap_or(true);
            return Ok(true);
        }

        if event.kind == TimelineEventType::RoomCreate {
            panic!("room already exists");
        }

        let mut changed = false;

        // Depth only ever rises
        if event.depth > room.current_depth {
            room.current_depth = event.depth;
            changed = true;
        }

        match event.kind {
            TimelineEventType::RoomName => {
                room.name = event
                    .content_field("name")
                    .and_then(|value| value.as_str().map(str::to_owned));
                changed = true;
            }
            TimelineEventType::RoomTopic => {
                room.topic = event
                    .content_field("topic")
                    .and_then(|value| value.as_str().map(str::to_owned));
                changed = true;
            }
            TimelineEventType::RoomAvatar => {
                room.avatar_url = event
                    .content_field("url")
                    .and_then(|value| value.as_str().map(str::to_owned));
                changed = true;
            }
            TimelineEventType::RoomCanonicalAlias => {
                room.canonical_alias = event
                    .content_field("alias")
                    .and_then(|value| value.as_str().and_then(|alias| alias.parse().ok()));
                changed = true;
            }
            TimelineEventType::RoomMember => {
                // Count against the previous membership to avoid double
                // counting repeated joins or leaves
                let state_key = event.state_key.as_deref().expect("member event has state key");
                if let Ok(member_id) = state_key.parse::<OwnedUserId>() {
                    let was_joined = self
                        .users
                        .is_user_in_room(txn, &member_id, room_id)
                        .await?;
                    match event.membership() {
                        MembershipState::Join if !was_joined => room.member_count += 1,
                        MembershipState::Leave | MembershipState::Ban if was_joined => {
                            room.member_count -= 1
                        }
                        _ => {}
                    }
                    changed = true;
                }
            }
            _ => {}
        }

        Ok(changed)
    }

    fn handle_send_events_result(&self, result: &SendEventsResult, change: Change) {
        if !change.is_empty() {
            self.notifier.send_change(change);
        }

        for rejection in &result.rejected {
            warn!(
                event_id = %rejection.event.event_id,
                error = %rejection.error,
                "Event rejected"
            );
        }

        info!(
            events_allowed = result.allowed.len(),
            events_rejected = result.rejected.len(),
            version = ?result.version,
            "Sent events"
        );
    }
}

/// The room version declared by a create event's content.
fn room_version_from_create_content(content: &serde_json::value::RawValue) -> Result<RoomVersionId> {
    #[derive(serde::Deserialize)]
    struct Extract {
        room_version: Option<RoomVersionId>,
    }
    serde_json::from_str::<Extract>(content.get())
        .ok()
        .and_then(|extract| extract.room_version)
        .ok_or_else(|| Error::UnknownRoomVersion("unable to determine room version".to_owned()))
}
