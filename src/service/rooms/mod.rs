// =============================================================================
// Parlor - Rooms Database
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Public operations on rooms and events: orchestrates the events, users
//   and servers directories, the send engine, sync pagination and state
//   resolution over one KVS, and posts committed changes to the notifier.
//
// =============================================================================

pub mod events;
mod get;
mod iterator;
mod profiles;
pub mod resolution;
mod send;
mod sync;
pub mod servers;
pub mod users;

pub use get::{RoomStateAtEvent, RoomStateIdsAtEvent};
pub use send::{RejectedEvent, SendEventsResult, SendFederatedOptions, SendLocalOptions};
pub use sync::{SyncOptions, SyncResult};

use std::sync::Arc;

use rand::RngCore;
use ruma::{OwnedEventId, OwnedRoomId, RoomId};
use sha2::{Digest, Sha256};
use tokio_util::task::TaskTracker;

use crate::database::{Database, Subspace};
use crate::service::codec::EventCodec;
use crate::service::lease::LeaseManager;
use crate::service::notifier::Notifier;
use crate::types::Room;
use crate::{utils, Config, Result};

use events::EventsDirectory;
use servers::ServersDirectory;
use users::UsersDirectory;

pub struct RoomsDatabase {
    pub(crate) db: Database,
    pub(crate) config: Arc<Config>,
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) codec: EventCodec,

    pub(crate) events: EventsDirectory,
    pub(crate) users: UsersDirectory,
    pub(crate) servers: ServersDirectory,

    pub(crate) leases: LeaseManager,

    by_id: Subspace,
    iterator_position: Subspace,

    pub(crate) background: TaskTracker,
}

impl RoomsDatabase {
    pub fn new(config: Arc<Config>, db: Database, notifier: Arc<Notifier>) -> Result<Self> {
        let codec = EventCodec::new(config.server_name.clone(), config.keypair()?);
        let root = Subspace::new(b"rm");

        Ok(RoomsDatabase {
            leases: LeaseManager::new(db.clone()),
            db,
            config,
            notifier,
            codec,

            events: EventsDirectory::new(),
            users: UsersDirectory::new(),
            servers: ServersDirectory::new(),

            by_id: root.sub(b"id"),    // room summary by ID
            iterator_position: root.sub(b"itr"), // events iterator position

            background: TaskTracker::new(),
        })
    }

    /// Wait for in-flight background work (profile fan-outs) to finish.
    pub async fn stop(&self) {
        self.background.close();
        self.background.wait().await;
    }

    pub fn server_name(&self) -> &ruma::ServerName {
        &self.config.server_name
    }

    pub fn lease_manager(&self) -> &LeaseManager {
        &self.leases
    }

    /// The codec signing and verifying under this server's identity.
    pub fn codec(&self) -> &EventCodec {
        &self.codec
    }

    pub(crate) fn key_for_room(&self, room_id: &RoomId) -> Vec<u8> {
        self.by_id.key(&[room_id.as_bytes()])
    }

    pub(crate) fn key_for_iterator_position(&self) -> Vec<u8> {
        self.iterator_position.key(&[b"EventsIteratorPosition"])
    }

    /// Generate a fresh room ID under the local server name. Room IDs need
    /// to be distinct, not cryptographically secure.
    pub fn generate_room_id(&self) -> OwnedRoomId {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let digest = Sha256::digest(raw);
        let localpart = utils::base64_encode_url_safe(&digest[..12]);
        format!("!{localpart}:{}", self.config.server_name)
            .try_into()
            .expect("generated room IDs are valid")
    }

    pub async fn get_room(&self, room_id: &RoomId) -> Result<Option<Room>> {
        let txn = self.db.read().await?;
        match txn.get(&self.key_for_room(room_id)).await? {
            Some(bytes) => Ok(Some(Room::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Current DAG tips of a room.
    pub async fn get_current_room_extrems(&self, room_id: &RoomId) -> Result<Vec<OwnedEventId>> {
        let txn = self.db.read().await?;
        self.events
            .lookup_current_room_extrems(&*txn, room_id)
            .await
    }

    /// A destination server's persisted sync positions.
    pub async fn get_server_positions(
        &self,
        server: &ruma::ServerName,
    ) -> Result<crate::types::VersionMap> {
        let txn = self.db.read().await?;
        self.servers.get_server_position(&*txn, server).await
    }

    /// Record a destination's new positions; the lease refresh is the last
    /// write so the advance only commits under a held lease.
    pub async fn update_server_positions(
        &self,
        server: &ruma::ServerName,
        positions: &crate::types::VersionMap,
        lease: &crate::service::lease::Lease,
    ) -> Result<()> {
        let txn = self.db.write().await?;
        self.servers.set_server_position(&*txn, server, positions);
        lease.txn_refresh(&*txn).await?;
        txn.commit().await?;
        Ok(())
    }
}
