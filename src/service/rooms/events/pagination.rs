//! Pagination over the version indices, globally and per room.

use ruma::{OwnedEventId, OwnedRoomId, RoomId};

use super::{providers::EventsProvider, EventsDirectory};
use crate::database::{KvsTransaction, RangeOptions, Versionstamp};
use crate::types::{value_to_event_id_tup, EventIdTup, EventIdTupWithVersion};
use crate::Result;

impl EventsDirectory {
    /// The versionstamp of the most recently committed event, or zero for
    /// an empty store.
    pub async fn latest_event_version(&self, txn: &dyn KvsTransaction) -> Result<Versionstamp> {
        let kvs = txn
            .get_range(
                &self.range_for_versions(Versionstamp::ZERO, Versionstamp::ZERO),
                RangeOptions::reverse_limit(1),
            )
            .await?;
        match kvs.into_iter().next() {
            Some(kv) => self.key_to_version(&kv.key),
            None => Ok(Versionstamp::ZERO),
        }
    }

    /// Paginate all events in commit order: `from` inclusive, `to`
    /// exclusive, zero meaning unbounded.
    pub async fn paginate_all(
        &self,
        txn: &dyn KvsTransaction,
        from: Versionstamp,
        to: Versionstamp,
        limit: usize,
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<Vec<EventIdTupWithVersion>> {
        let kvs = txn
            .get_range(&self.range_for_versions(from, to), RangeOptions::limit(limit))
            .await?;

        let mut tups = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let version = self.key_to_version(&kv.key)?;
            let tup = EventIdTupWithVersion {
                tup: value_to_event_id_tup(&kv.value)?,
                version,
            };
            if let Some(provider) = events_provider {
                provider.will_get(&tup.tup.event_id);
            }
            tups.push(tup);
        }
        Ok(tups)
    }

    /// Paginate one room's event index.
    pub async fn paginate_room(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        from: Versionstamp,
        to: Versionstamp,
        limit: usize,
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<Vec<EventIdTupWithVersion>> {
        let kvs = txn
            .get_range(
                &self.range_for_room_versions(room_id, from, to),
                RangeOptions::limit(limit),
            )
            .await?;
        self.collect_room_tups(room_id, kvs, events_provider, |key| {
            self.key_to_room_version(key)
        })
    }

    /// Paginate one room's locally-originated event index; this is the
    /// view federated out to other servers.
    pub async fn paginate_room_local(
        &self,
        txn: &dyn KvsTransaction,
        room_id: &RoomId,
        from: Versionstamp,
        to: Versionstamp,
        limit: usize,
        events_provider: Option<&EventsProvider<'_>>,
    ) -> Result<Vec<EventIdTupWithVersion>> {
        let kvs = txn
            .get_range(
                &self.range_for_room_local_versions(room_id, from, to),
                RangeOptions::limit(limit),
            )
            .await?;
        self.collect_room_tups(room_id, kvs, events_provider, |key| {
            self.key_to_room_local_version(key)
        })
    }

    fn collect_room_tups(
        &self,
        room_id: &RoomId,
        kvs: Vec<crate::database::KeyValue>,
        events_provider: Option<&EventsProvider<'_>>,
        key_to_version: impl Fn(&[u8]) -> Result<Versionstamp>,
    ) -> Result<Vec<EventIdTupWithVersion>> {
        let room_id: OwnedRoomId = room_id.to_owned();
        let mut tups = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let version = key_to_version(&kv.key)?;
            let event_id: OwnedEventId = String::from_utf8(kv.value)
                .map_err(|_| crate::Error::BadData("invalid event ID value"))?
                .parse()
                .map_err(|_| crate::Error::BadData("invalid event ID value"))?;
            if let Some(provider) = events_provider {
                provider.will_get(&event_id);
            }
            tups.push(EventIdTupWithVersion {
                tup: EventIdTup {
                    event_id,
                    room_id: room_id.clone(),
                },
                version,
            });
        }
        Ok(tups)
    }
}
