// =============================================================================
// Parlor - Services
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Service wiring: everything the embedding server needs, built from a
//   configuration, a KVS engine, a change bus and a federation transport.
//
// =============================================================================

pub mod codec;
pub mod federation;
pub mod keys;
pub mod lease;
pub mod notifier;
pub mod rooms;
pub mod workers;

use std::sync::Arc;

use crate::database::{Database, KvsEngine};
use crate::{Config, Result};

use federation::FederationTransport;
use keys::KeyStore;
use notifier::{ChangeBus, Notifier};
use rooms::RoomsDatabase;
use workers::Workers;

/// The assembled room subsystem for one process.
pub struct Services {
    pub config: Arc<Config>,
    pub rooms: Arc<RoomsDatabase>,
    pub notifier: Arc<Notifier>,
    pub keys: Arc<KeyStore>,
    transport: Arc<dyn FederationTransport>,
}

impl Services {
    /// Build the services. Must run inside a tokio runtime: the notifier
    /// spawns its coordinator and bus tasks immediately.
    pub fn build(
        config: Config,
        engine: Arc<dyn KvsEngine>,
        bus: Arc<dyn ChangeBus>,
        transport: Arc<dyn FederationTransport>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let db = Database::new(engine, &config);
        let notifier = Notifier::new(config.notifier_channel_capacity, bus);
        let rooms = Arc::new(RoomsDatabase::new(
            config.clone(),
            db,
            notifier.clone(),
        )?);
        let keys = Arc::new(KeyStore::new(transport.clone()));

        Ok(Services {
            config,
            rooms,
            notifier,
            keys,
            transport,
        })
    }

    /// Start the background workers for this process.
    pub fn start_workers(&self) -> Workers {
        Workers::start(
            self.config.clone(),
            self.rooms.clone(),
            self.notifier.clone(),
            self.transport.clone(),
        )
    }

    pub fn transport(&self) -> Arc<dyn FederationTransport> {
        self.transport.clone()
    }

    /// Drain background work and stop the notifier.
    pub async fn shutdown(&self) {
        self.rooms.stop().await;
        self.notifier.shutdown();
    }
}
