//! Per-destination federation senders. A short-lived task starts when a
//! `servers` notification names a destination with no local sender
//! running; it drains the destination's backlog through the sync engine in
//! 50-event transactions and exits after ten idle refreshes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ruma::{MilliSecondsSinceUnixEpoch, OwnedServerName};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use crate::service::federation::{FederationTransport, Transaction};
use crate::service::lease::{Lease, LeaseOptions};
use crate::service::notifier::{Notifier, Subscription};
use crate::service::rooms::{RoomsDatabase, SyncOptions};
use crate::types::ROOMS_STREAM;
use crate::{utils, Config};

const SENDER_LOCK_PREFIX: &str = "FederationServerSenderLock:";
const SENDER_LOCK_REFRESH: Duration = Duration::from_secs(30);
const SENDER_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_IDLE_REFRESHES: u32 = 10;

type SenderMap = Arc<Mutex<HashMap<OwnedServerName, mpsc::Sender<()>>>>;

pub struct FederationSender {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl FederationSender {
    pub fn start(
        config: Arc<Config>,
        rooms: Arc<RoomsDatabase>,
        notifier: Arc<Notifier>,
        transport: Arc<dyn FederationTransport>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(supervise(
            config,
            rooms,
            notifier,
            transport,
            shutdown.clone(),
            tracker.clone(),
        ));

        FederationSender { shutdown, tracker }
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Federation sender stopped");
    }
}

async fn supervise(
    config: Arc<Config>,
    rooms: Arc<RoomsDatabase>,
    notifier: Arc<Notifier>,
    transport: Arc<dyn FederationTransport>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    let mut subscription = notifier.subscribe(Subscription {
        all_servers: true,
        ..Default::default()
    });
    let senders: SenderMap = Arc::new(Mutex::new(HashMap::new()));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                notifier.unsubscribe(subscription.id);
                return;
            }
            change = subscription.recv() => {
                let Some(change) = change else { return };
                for server in change.servers {
                    // Check our in-memory map first; if a sender is live
                    // locally we only need to poke it, no lease traffic.
                    let existing = {
                        let map = senders.lock().expect("sender map poisoned");
                        map.get(&server).cloned()
                    };
                    match existing {
                        Some(wake) => {
                            let _ = wake.try_send(());
                            trace!(server = %server, "Sender already running locally");
                        }
                        None => {
                            tracker.spawn(maybe_run_server_sender(
                                config.clone(),
                                rooms.clone(),
                                transport.clone(),
                                senders.clone(),
                                server,
                                shutdown.clone(),
                            ));
                        }
                    }
                }
            }
        }
    }
}

async fn maybe_run_server_sender(
    config: Arc<Config>,
    rooms: Arc<RoomsDatabase>,
    transport: Arc<dyn FederationTransport>,
    senders: SenderMap,
    server: OwnedServerName,
    shutdown: CancellationToken,
) {
    let lock_name = format!("{SENDER_LOCK_PREFIX}{server}");
    let options = LeaseOptions {
        refresh_interval: SENDER_LOCK_REFRESH,
        timeout: SENDER_LOCK_TIMEOUT,
    };

    let lease = match rooms.lease_manager().acquire_once(&lock_name, options).await {
        Ok(Some(lease)) => lease,
        Ok(None) => {
            trace!(server = %server, "Someone else is already running this server sender");
            return;
        }
        Err(error) => {
            error!(server = %server, %error, "Error starting server sender");
            return;
        }
    };

    let (wake_sender, wake) = mpsc::channel(1);
    senders
        .lock()
        .expect("sender map poisoned")
        .insert(server.clone(), wake_sender);

    info!(server = %server, "Starting server sender");
    send_events_to_server_loop(&config, &rooms, &*transport, &server, &lease, wake, &shutdown)
        .await;

    senders
        .lock()
        .expect("sender map poisoned")
        .remove(&server);

    if let Err(error) = lease.release().await {
        warn!(server = %server, %error, "Failed to release server sender lease");
    }
    info!(server = %server, "Server sender stopped");
}

#[allow(clippy::too_many_arguments)]
async fn send_events_to_server_loop(
    config: &Config,
    rooms: &RoomsDatabase,
    transport: &dyn FederationTransport,
    server: &OwnedServerName,
    lease: &Lease,
    mut wake: mpsc::Receiver<()>,
    shutdown: &CancellationToken,
) {
    let mut idle_refreshes = 0u32;

    if send_events_to_server(config, rooms, transport, server, lease).await {
        idle_refreshes = 0;
    } else {
        idle_refreshes += 1;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = wake.recv() => {
                if send_events_to_server(config, rooms, transport, server, lease).await {
                    idle_refreshes = 0;
                } else {
                    idle_refreshes += 1;
                }
            }
            _ = tokio::time::sleep(SENDER_LOCK_REFRESH) => {
                if send_events_to_server(config, rooms, transport, server, lease).await {
                    idle_refreshes = 0;
                } else {
                    idle_refreshes += 1;
                }
            }
        }
        if idle_refreshes >= MAX_IDLE_REFRESHES {
            // Nothing to do for a while; exit and let a future
            // notification start us again.
            return;
        }
    }
}

/// Drain the destination's backlog. Returns whether anything was sent.
async fn send_events_to_server(
    config: &Config,
    rooms: &RoomsDatabase,
    transport: &dyn FederationTransport,
    server: &OwnedServerName,
    lease: &Lease,
) -> bool {
    let mut positions = match rooms.get_server_positions(server).await {
        Ok(positions) => positions,
        Err(error) => {
            error!(server = %server, %error, "Failed to get current server positions");
            return false;
        }
    };

    let mut sent = false;

    loop {
        if let Err(error) = lease.refresh().await {
            error!(server = %server, %error, "Server sender lease lost");
            return sent;
        }

        let rooms_position = positions
            .get(ROOMS_STREAM)
            .unwrap_or(crate::database::Versionstamp::ZERO);

        let sync = match rooms
            .sync_room_events_for_server(
                server,
                SyncOptions {
                    from: rooms_position,
                    limit: config.federation_transaction_limit,
                },
            )
            .await
        {
            Ok(sync) => sync,
            Err(error) => {
                error!(server = %server, %error, "Failed to sync events for server");
                return sent;
            }
        };

        if sync.next_from == rooms_position {
            return sent;
        }
        sent = true;

        let mut pdus = Vec::new();
        for events in sync.events_by_room.values() {
            for event in events {
                match event
                    .to_wire_json()
                    .and_then(|object| Ok(serde_json::value::to_raw_value(&object)?))
                {
                    Ok(pdu) => pdus.push(pdu),
                    Err(error) => {
                        error!(event_id = %event.event_id, %error, "Failed to encode PDU");
                    }
                }
            }
        }

        let transaction_id = utils::base64_encode_url_safe(&rooms_position.to_bytes());
        info!(
            server = %server,
            pdus = pdus.len(),
            transaction_id = %transaction_id,
            "Sending transaction to server"
        );

        match transport
            .send_transaction(Transaction {
                transaction_id: transaction_id.clone(),
                origin: config.server_name.clone(),
                destination: server.clone(),
                origin_server_ts: MilliSecondsSinceUnixEpoch(
                    utils::millis_since_unix_epoch()
                        .try_into()
                        .expect("timestamp fits"),
                ),
                pdus,
            })
            .await
        {
            Ok(result) => {
                let mut success = 0;
                let mut failed = 0;
                for (event_id, pdu_result) in result.pdus {
                    match pdu_result.error {
                        None => success += 1,
                        Some(error) => {
                            failed += 1;
                            warn!(
                                event_id = %event_id,
                                transaction_id = %transaction_id,
                                error,
                                "Event error from other server"
                            );
                        }
                    }
                }
                debug!(
                    server = %server,
                    success,
                    failed,
                    transaction_id = %transaction_id,
                    "Sent transaction to server"
                );
            }
            Err(error) => {
                error!(server = %server, %error, "Failed to send transaction");
                return sent;
            }
        }

        positions.set(ROOMS_STREAM, sync.next_from);
        if let Err(error) = rooms.update_server_positions(server, &positions, lease).await {
            error!(server = %server, %error, "Failed to update current server positions");
            return sent;
        }
    }
}
