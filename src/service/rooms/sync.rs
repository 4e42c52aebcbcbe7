// =============================================================================
// Parlor - Sync Engine
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Per-actor sync pagination in strict versionstamp order. Membership
//   changes inside the window narrow each room's effective range, rooms
//   paginate in concurrent read transactions, and results merge into one
//   globally ordered, limit-bounded stream.
//
// =============================================================================

use std::collections::HashMap;

use futures_util::future::join_all;
use ruma::{OwnedRoomId, ServerName, UserId};
use serde_json::json;
use tracing::instrument;

use super::events::EventsProvider;
use super::RoomsDatabase;
use crate::database::Versionstamp;
use crate::types::{
    Event, EventIdTupWithVersion, MembershipChanges, Memberships, MembershipTup,
};
use crate::{utils, Result};
use ruma::events::room::member::MembershipState;

#[derive(Clone, Copy, Debug)]
pub struct SyncOptions {
    /// Position to return events strictly *after*.
    pub from: Versionstamp,
    /// Maximum events in the merged stream.
    pub limit: usize,
}

#[derive(Debug, Default)]
pub struct SyncResult {
    /// Position for the next sync: the last selected event's versionstamp,
    /// or the snapshot position when nothing was selected.
    pub next_from: Versionstamp,
    pub events_by_room: HashMap<MembershipTup, Vec<Event>>,
}

enum SyncActor<'a> {
    User(&'a UserId),
    Server(&'a ServerName),
}

impl RoomsDatabase {
    /// Sync room events for a local user, across all their rooms.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn sync_room_events_for_user(
        &self,
        user_id: &UserId,
        options: SyncOptions,
    ) -> Result<SyncResult> {
        self.sync_room_events(SyncActor::User(user_id), options)
            .await
    }

    /// Sync locally-originated room events for a remote server, across all
    /// the rooms it is resident in. This feeds the federation sender.
    #[instrument(skip(self), fields(server = %server))]
    pub async fn sync_room_events_for_server(
        &self,
        server: &ServerName,
        options: SyncOptions,
    ) -> Result<SyncResult> {
        self.sync_room_events(SyncActor::Server(server), options)
            .await
    }

    async fn sync_room_events(
        &self,
        actor: SyncActor<'_>,
        options: SyncOptions,
    ) -> Result<SyncResult> {
        // We want events strictly after `from`
        let from = options.from.next();

        // Snapshot the stream head and the actor's memberships together:
        // the memberships are valid at that position, so each room can be
        // paginated up to it in a later transaction.
        let (snapshot, memberships): (Versionstamp, Memberships) = {
            let txn = self.db.read().await?;
            let snapshot = self.events.latest_event_version(&*txn).await?;
            let memberships = match actor {
                SyncActor::User(user_id) => {
                    self.users.lookup_user_memberships(&*txn, user_id).await?
                }
                SyncActor::Server(server) => {
                    self.servers.lookup_server_memberships(&*txn, server).await?
                }
            };
            (snapshot, memberships)
        };
        let to = snapshot.next();

        // Membership changes inside the window narrow per-room ranges: a
        // join cuts off everything before it, anything else caps the room
        // at the change.
        let changes: MembershipChanges = {
            let txn = self.db.read().await?;
            match actor {
                SyncActor::User(user_id) => {
                    self.users
                        .lookup_user_membership_changes(&*txn, user_id, from, to)
                        .await?
                }
                SyncActor::Server(server) => {
                    self.servers
                        .lookup_server_membership_changes(&*txn, server, from, to)
                        .await?
                }
            }
        };

        struct VersionRange {
            from: Versionstamp,
            to: Versionstamp,
        }

        // One range per room; the membership tuple rides along for the
        // response shape.
        let mut membership_of: HashMap<OwnedRoomId, MembershipTup> = HashMap::new();
        let mut ranges: HashMap<OwnedRoomId, VersionRange> = HashMap::new();
        for (room_id, tup) in memberships {
            membership_of.insert(room_id.clone(), tup);
            ranges.insert(room_id, VersionRange { from, to });
        }

        for change in changes {
            let room_id = change.tup.room_id.clone();
            let range = ranges
                .entry(room_id.clone())
                .or_insert(VersionRange { from, to });
            match change.tup.membership {
                MembershipState::Join => {
                    // Only events after the join
                    range.from = change.version.next();
                }
                _ => {
                    // Nothing after the leave/ban/kick, which itself is
                    // included
                    range.to = change.version.next();
                }
            }
            // The latest change decides the membership we report
            membership_of.insert(room_id, change.tup);
        }

        // Paginate every room concurrently, each in its own read
        // transaction.
        let local_only = matches!(actor, SyncActor::Server(_));
        let room_pages = join_all(ranges.into_iter().map(|(room_id, range)| {
            let tup = membership_of
                .get(&room_id)
                .expect("every range has a membership")
                .clone();
            async move {
                let txn = self.db.read().await?;
                let tups = if local_only {
                    self.events
                        .paginate_room_local(
                            &*txn,
                            &room_id,
                            range.from,
                            range.to,
                            options.limit,
                            None,
                        )
                        .await?
                } else {
                    self.events
                        .paginate_room(&*txn, &room_id, range.from, range.to, options.limit, None)
                        .await?
                };
                Ok::<_, crate::Error>((tup, tups))
            }
        }))
        .await;

        // Merge, order by versionstamp, and keep the first `limit`
        let mut room_of: HashMap<OwnedRoomId, MembershipTup> = HashMap::new();
        let mut merged: Vec<EventIdTupWithVersion> = Vec::new();
        for page in room_pages {
            let (tup, tups) = page?;
            room_of.insert(tup.room_id.clone(), tup);
            merged.extend(tups);
        }
        crate::types::sort_event_id_tups(&mut merged);
        merged.truncate(options.limit);

        let next_from = match merged.last() {
            Some(last) => last.version,
            None => snapshot,
        };

        // Hydrate the chosen events in one more read transaction and
        // annotate each with its age and an opaque ordering token.
        let now = utils::millis_since_unix_epoch();
        let mut events_by_room: HashMap<MembershipTup, Vec<Event>> = HashMap::new();
        {
            let txn = self.db.read().await?;
            let provider = EventsProvider::new(&*txn, &self.events);
            for tup in &merged {
                provider.will_get(&tup.tup.event_id);
            }
            for tup in &merged {
                let mut event = (*provider.get(&tup.tup.event_id).await?).clone();
                let age = now.saturating_sub(u64::from(event.origin_server_ts));
                event.unsigned = Some(serde_json::value::to_raw_value(&json!({
                    "age": age,
                    "hs.order": utils::base64_encode_url_safe(&tup.version.to_bytes()),
                }))?);

                let membership = room_of
                    .get(&tup.tup.room_id)
                    .expect("every merged event maps to a membership")
                    .clone();
                events_by_room.entry(membership).or_default().push(event);
            }
        }

        Ok(SyncResult {
            next_from,
            events_by_room,
        })
    }
}
