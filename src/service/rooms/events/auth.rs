//! Auth chain traversal: the transitive closure of `auth_events` starting
//! from a set of events, bounded by a visited set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ruma::OwnedEventId;

use super::{providers::EventsProvider, EventsDirectory};
use crate::types::Event;
use crate::Result;

impl EventsDirectory {
    /// Collect the full auth chain for a set of events: each event's auth
    /// events, their auth events, and so on recursively. Fetches are
    /// scheduled breadth-first so each round's reads overlap.
    pub async fn get_auth_chain_for_events(
        &self,
        events_provider: &EventsProvider<'_>,
        events: &[Arc<Event>],
    ) -> Result<Vec<Arc<Event>>> {
        let mut pending: HashSet<OwnedEventId> = HashSet::new();
        let mut chain: HashMap<OwnedEventId, Arc<Event>> = HashMap::new();

        for event in events {
            for auth_id in &event.auth_events {
                let auth_id: OwnedEventId = (**auth_id).to_owned();
                if pending.insert(auth_id.clone()) {
                    events_provider.will_get(&auth_id);
                }
            }
        }

        while !pending.is_empty() {
            for event_id in std::mem::take(&mut pending) {
                let event = events_provider.get(&event_id).await?;

                for auth_id in &event.auth_events {
                    let auth_id: OwnedEventId = (**auth_id).to_owned();
                    if chain.contains_key(&auth_id) || pending.contains(&auth_id) {
                        continue;
                    }
                    events_provider.will_get(&auth_id);
                    pending.insert(auth_id);
                }

                chain.insert(event_id, event);
            }
        }

        Ok(chain.into_values().collect())
    }
}
