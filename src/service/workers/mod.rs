// =============================================================================
// Parlor - Background Workers
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Lease-coordinated background workers: the singleton events iterator
//   and the per-destination federation senders. Each logical role runs
//   exactly once across the fleet; fencing tokens make stale holders
//   detectable.
//
// =============================================================================

mod events_iterator;
mod federation_sender;

pub use events_iterator::EventsIterator;
pub use federation_sender::FederationSender;

use std::sync::Arc;

use crate::service::federation::FederationTransport;
use crate::service::notifier::Notifier;
use crate::service::rooms::RoomsDatabase;
use crate::Config;

/// Supervisor owning the worker tasks for one process.
pub struct Workers {
    events_iterator: EventsIterator,
    federation_sender: FederationSender,
}

impl Workers {
    pub fn start(
        config: Arc<Config>,
        rooms: Arc<RoomsDatabase>,
        notifier: Arc<Notifier>,
        transport: Arc<dyn FederationTransport>,
    ) -> Self {
        Workers {
            events_iterator: EventsIterator::start(config.clone(), rooms.clone(), notifier.clone()),
            federation_sender: FederationSender::start(config, rooms, notifier, transport),
        }
    }

    pub async fn stop(&self) {
        self.events_iterator.stop().await;
        self.federation_sender.stop().await;
    }
}
