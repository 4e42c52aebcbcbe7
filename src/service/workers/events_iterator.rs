//! The events iterator is a singleton background worker that walks every
//! event ever stored, in commit order, and wakes downstream consumers.
//! Today that means deriving the destination servers of each new batch and
//! publishing a `servers` change for the federation senders.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ruma::{OwnedRoomId, OwnedServerName};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace};

use crate::service::lease::{Lease, LeaseOptions};
use crate::service::notifier::{Change, Notifier, Subscription};
use crate::service::rooms::RoomsDatabase;
use crate::{Config, Error};

const EVENTS_ITERATOR_LOCK: &str = "EventsIteratorLock";
const LOCK_REFRESH: Duration = Duration::from_secs(5);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct EventsIterator {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl EventsIterator {
    pub fn start(
        config: Arc<Config>,
        rooms: Arc<RoomsDatabase>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(run(config, rooms, notifier, shutdown.clone()));
        tracker.close();

        EventsIterator { shutdown, tracker }
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Events iterator stopped");
    }
}

async fn run(
    config: Arc<Config>,
    rooms: Arc<RoomsDatabase>,
    notifier: Arc<Notifier>,
    shutdown: CancellationToken,
) {
    let options = LeaseOptions {
        refresh_interval: LOCK_REFRESH,
        timeout: LOCK_TIMEOUT,
    };
    let lease = match rooms
        .lease_manager()
        .acquire(EVENTS_ITERATOR_LOCK, options, &shutdown)
        .await
    {
        Ok(Some(lease)) => lease,
        // Cancelled while contending
        Ok(None) => return,
        Err(error) => {
            error!(%error, "Failed to acquire events iterator lease");
            return;
        }
    };

    let mut subscription = notifier.subscribe(Subscription {
        all_events: true,
        ..Default::default()
    });

    // Cold start: handle anything already waiting
    handle_new_events(&config, &rooms, &notifier, &lease).await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                notifier.unsubscribe(subscription.id);
                if let Err(error) = lease.release().await {
                    error!(%error, "Failed to release events iterator lease");
                }
                return;
            }
            change = subscription.recv() => {
                if change.is_none() {
                    return;
                }
                handle_new_events(&config, &rooms, &notifier, &lease).await;
            }
            _ = tokio::time::sleep(LOCK_REFRESH) => {
                if let Err(error) = lease.refresh().await {
                    error!(%error, "Events iterator lease lost, exiting");
                    return;
                }
            }
        }
    }
}

async fn handle_new_events(
    config: &Config,
    rooms: &RoomsDatabase,
    notifier: &Notifier,
    lease: &Lease,
) {
    let start = match rooms.get_events_iterator_position().await {
        Ok(position) => position,
        Err(error) => {
            error!(%error, "Failed to get current position");
            return;
        }
    };

    let batch_size = config.events_iterator_batch;
    let mut current = start;

    loop {
        // Refresh before each batch so long backlogs hold the lease
        if let Err(error) = lease.refresh().await {
            error!(%error, "Events iterator lease lost mid-batch");
            return;
        }

        let tups = match rooms.events_iterator_paginate(current, batch_size).await {
            Ok(tups) => tups,
            Err(error) => {
                error!(%error, "Failed to paginate new events");
                return;
            }
        };
        if tups.is_empty() {
            trace!(from = %current, "No events found");
            break;
        }

        info!(events = tups.len(), from = %current, "Handling new events batch");

        if let Err(error) = notify_federation_senders(config, rooms, notifier, &tups).await {
            error!(%error, "Failed to notify federation senders");
        }

        // Store the position after the most recent handled event
        current = tups[tups.len() - 1].version.next();

        if tups.len() < batch_size {
            break;
        }
    }

    if current == start {
        return;
    }

    // Advance the position under the lease so a stolen lease cannot
    // clobber a newer holder's progress.
    if let Err(error) = rooms.update_events_iterator_position(current, lease).await {
        match error {
            Error::LeaseLost => error!("Events iterator lease lost, position not advanced"),
            error => error!(%error, "Failed to update current position"),
        }
    }
}

async fn notify_federation_senders(
    config: &Config,
    rooms: &RoomsDatabase,
    notifier: &Notifier,
    tups: &[crate::types::EventIdTupWithVersion],
) -> crate::Result<()> {
    let room_ids: HashSet<OwnedRoomId> = tups.iter().map(|tup| tup.tup.room_id.clone()).collect();

    let mut servers: HashSet<OwnedServerName> = HashSet::new();
    for room_id in room_ids {
        for server in rooms.get_current_room_servers(&room_id).await? {
            // Only remote servers need waking
            if server != config.server_name {
                servers.insert(server);
            }
        }
    }

    if servers.is_empty() {
        return Ok(());
    }

    debug!(servers = servers.len(), "Waking federation senders");
    notifier.send_change(Change {
        servers: servers.into_iter().collect(),
        ..Default::default()
    });
    Ok(())
}
