// =============================================================================
// Parlor - State Resolution
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Pure state resolution across DAG forks. Dispatches on the room
//   version's rules and receives everything it needs as arguments: the
//   forked state maps, their combined auth chains, an event fetcher and a
//   predicate hiding rejected-or-outlier events from the algorithm.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ruma::{state_res, EventId, OwnedEventId, RoomVersionId};
use tracing::debug;

use crate::types::{Event, StateMap, StateTup};
use crate::{Error, Result};

/// Resolve conflicting fork states into a single state map.
///
/// `fetch_event` must cover every event named by the fork states and auth
/// chains; events the predicate marks rejected-or-outlier are withheld
/// from the algorithm, which treats them as unavailable.
pub fn resolve_conflicts(
    room_version: &RoomVersionId,
    fork_states: Vec<StateMap>,
    auth_chain_sets: Vec<HashSet<OwnedEventId>>,
    fetch_event: impl Fn(&EventId) -> Option<Arc<Event>>,
    is_rejected_or_outlier: impl Fn(&Event) -> bool,
) -> Result<StateMap> {
    let rules = room_version
        .rules()
        .ok_or_else(|| Error::UnknownRoomVersion(room_version.to_string()))?;

    let fork_states: Vec<HashMap<_, OwnedEventId>> = fork_states
        .into_iter()
        .map(|state| {
            state
                .into_iter()
                .map(|(tup, event_id)| {
                    ((tup.kind, tup.state_key), Arc::from(&*event_id))
                })
                .collect()
        })
        .collect();

    let auth_chain_sets: Vec<HashSet<OwnedEventId>> = auth_chain_sets
        .into_iter()
        .map(|set| {
            set.into_iter()
                .map(|event_id| Arc::from(&*event_id))
                .collect()
        })
        .collect();

    debug!(
        forks = fork_states.len(),
        room_version = %room_version,
        "Resolving state across forks"
    );

    let resolved = state_res::resolve(
        &rules.authorization,
        &fork_states,
        auth_chain_sets,
        |event_id: &EventId| {
            let event = fetch_event(event_id)?;
            if is_rejected_or_outlier(&event) {
                None
            } else {
                Some(event)
            }
        },
    )
    .map_err(|error| {
        debug!(%error, "State resolution failed");
        Error::BadData("state resolution failed, an event or prev event is missing")
    })?;

    Ok(resolved
        .into_iter()
        .map(|((kind, state_key), event_id)| {
            (
                StateTup { kind, state_key },
                (*event_id).to_owned(),
            )
        })
        .collect())
}
