// =============================================================================
// Parlor - Change Notifier
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Two-layer change fan-out. In process, a single coordinator task owns
//   all subscription maps; subscribe, unsubscribe and dispatch are
//   serialized through its channel so no locks are held across awaits.
//   Across processes, changes are msgpack-encoded and mirrored over the
//   pluggable change bus, tagged with this instance's ID so our own bus
//   messages are skipped on the way back in.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use ruma::{OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::{utils, Error, Result};

/// One or more changes to entities, fanned out to subscribers. Only the
/// last event ID of a batch is carried to keep bus volume down.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Change {
    /// Tag of the publishing instance, to skip changes we sent ourselves.
    #[serde(rename = "i", default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,

    #[serde(rename = "e", default, skip_serializing_if = "Vec::is_empty")]
    pub event_ids: Vec<OwnedEventId>,
    #[serde(rename = "r", default, skip_serializing_if = "Vec::is_empty")]
    pub room_ids: Vec<OwnedRoomId>,
    #[serde(rename = "u", default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<OwnedUserId>,
    #[serde(rename = "s", default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<OwnedServerName>,
}

impl Change {
    pub fn is_empty(&self) -> bool {
        self.event_ids.is_empty()
            && self.room_ids.is_empty()
            && self.user_ids.is_empty()
            && self.servers.is_empty()
    }
}

/// What a subscriber wants to hear about.
#[derive(Clone, Debug, Default)]
pub struct Subscription {
    pub user_ids: Vec<OwnedUserId>,
    pub room_ids: Vec<OwnedRoomId>,
    pub all_events: bool,
    pub all_servers: bool,
}

/// Cross-process transport for serialized changes.
#[async_trait]
pub trait ChangeBus: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;
}

/// Single-process bus over a broadcast channel. Useful for tests and
/// deployments without a shared broker.
pub struct MemoryChangeBus {
    sender: broadcast::Sender<Vec<u8>>,
}

impl MemoryChangeBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        MemoryChangeBus { sender }
    }
}

impl Default for MemoryChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeBus for MemoryChangeBus {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        // Delivery to zero subscribers is fine
        let _ = self.sender.send(payload);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.sender.subscribe()
    }
}

/// A live subscription. Dropping the handle without unsubscribing leaves a
/// dead entry until the coordinator notices the closed channel.
pub struct SubscriptionHandle {
    pub id: Uuid,
    receiver: mpsc::Receiver<Change>,
}

impl SubscriptionHandle {
    pub async fn recv(&mut self) -> Option<Change> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Change> {
        self.receiver.try_recv().ok()
    }
}

enum Command {
    Subscribe {
        id: Uuid,
        subscription: Subscription,
        sender: mpsc::Sender<Change>,
    },
    Unsubscribe {
        id: Uuid,
    },
    Dispatch {
        change: Change,
    },
}

pub struct Notifier {
    instance_id: String,
    channel_capacity: usize,
    commands: mpsc::UnboundedSender<Command>,
    bus: Arc<dyn ChangeBus>,
    shutdown: CancellationToken,
}

impl Notifier {
    pub fn new(channel_capacity: usize, bus: Arc<dyn ChangeBus>) -> Arc<Self> {
        // Small process-unique tag for bus loop suppression
        let mut raw = [0u8; 9];
        rand::thread_rng().fill(&mut raw);
        let instance_id = utils::base64_encode_url_safe(&raw);

        let (commands, command_receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let notifier = Arc::new(Notifier {
            instance_id: instance_id.clone(),
            channel_capacity,
            commands,
            bus: bus.clone(),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(coordinator_loop(command_receiver, shutdown.clone()));
        tokio::spawn(bus_loop(
            bus,
            notifier.commands.clone(),
            instance_id,
            shutdown,
        ));

        notifier
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn subscribe(&self, subscription: Subscription) -> SubscriptionHandle {
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let id = Uuid::new_v4();
        trace!(?id, "Subscribe");
        let _ = self.commands.send(Command::Subscribe {
            id,
            subscription,
            sender,
        });
        SubscriptionHandle { id, receiver }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        let _ = self.commands.send(Command::Unsubscribe { id });
    }

    /// Publish a change to in-process subscribers and mirror it over the
    /// bus. Bus publication is best-effort and off the caller's path.
    pub fn send_change(&self, change: Change) {
        if change.is_empty() {
            return;
        }
        trace!(?change, "Sending change");

        let mut tagged = change.clone();
        tagged.instance_id = self.instance_id.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let payload = rmp_serde::to_vec(&tagged).expect("change serializes");
            if let Err(error) = bus.publish(payload).await {
                error!(%error, "Failed to publish change over the bus");
            }
        });

        let _ = self.commands.send(Command::Dispatch { change });
    }

    /// Encode a change the way it travels on the bus.
    pub fn encode_change(change: &Change) -> Result<Vec<u8>> {
        rmp_serde::to_vec(change).map_err(|error| Error::BusPublishFailed(error.to_string()))
    }

    pub fn decode_change(payload: &[u8]) -> Result<Change> {
        rmp_serde::from_slice(payload).map_err(|_| Error::BadData("invalid msgpack change"))
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

struct SubscriberEntry {
    subscription: Subscription,
    sender: mpsc::Sender<Change>,
}

#[derive(Default)]
struct CoordinatorState {
    subscribers: HashMap<Uuid, SubscriberEntry>,
    by_user: HashMap<OwnedUserId, HashSet<Uuid>>,
    by_room: HashMap<OwnedRoomId, HashSet<Uuid>>,
    all_events: HashSet<Uuid>,
    all_servers: HashSet<Uuid>,
}

impl CoordinatorState {
    fn subscribe(&mut self, id: Uuid, subscription: Subscription, sender: mpsc::Sender<Change>) {
        if subscription.all_events {
            self.all_events.insert(id);
        }
        if subscription.all_servers {
            self.all_servers.insert(id);
        }
        for user_id in &subscription.user_ids {
            self.by_user.entry(user_id.clone()).or_default().insert(id);
        }
        for room_id in &subscription.room_ids {
            self.by_room.entry(room_id.clone()).or_default().insert(id);
        }
        self.subscribers.insert(
            id,
            SubscriberEntry {
                subscription,
                sender,
            },
        );
    }

    fn unsubscribe(&mut self, id: Uuid) {
        let Some(entry) = self.subscribers.remove(&id) else {
            warn!(?id, "Unsubscribe for unknown subscription");
            return;
        };
        self.all_events.remove(&id);
        self.all_servers.remove(&id);
        for user_id in &entry.subscription.user_ids {
            if let Some(set) = self.by_user.get_mut(user_id) {
                set.remove(&id);
            }
        }
        for room_id in &entry.subscription.room_ids {
            if let Some(set) = self.by_room.get_mut(room_id) {
                set.remove(&id);
            }
        }
    }

    fn dispatch(&self, change: &Change) {
        let mut recipients: HashSet<Uuid> = HashSet::new();

        if !change.event_ids.is_empty() {
            recipients.extend(self.all_events.iter().copied());
        }
        if !change.servers.is_empty() {
            recipients.extend(self.all_servers.iter().copied());
        }
        for user_id in &change.user_ids {
            if let Some(set) = self.by_user.get(user_id) {
                recipients.extend(set.iter().copied());
            }
        }
        for room_id in &change.room_ids {
            if let Some(set) = self.by_room.get(room_id) {
                recipients.extend(set.iter().copied());
            }
        }

        for id in recipients {
            let Some(entry) = self.subscribers.get(&id) else {
                continue;
            };
            // Best effort: the coordinator never waits for downstream work
            if entry.sender.try_send(change.clone()).is_err() {
                warn!(subscriber = ?id, "Failed to send notification");
            }
        }
    }
}

async fn coordinator_loop(
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    let mut state = CoordinatorState::default();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            command = commands.recv() => {
                let Some(command) = command else { return };
                match command {
                    Command::Subscribe { id, subscription, sender } => {
                        state.subscribe(id, subscription, sender);
                    }
                    Command::Unsubscribe { id } => state.unsubscribe(id),
                    Command::Dispatch { change } => state.dispatch(&change),
                }
            }
        }
    }
}

async fn bus_loop(
    bus: Arc<dyn ChangeBus>,
    commands: mpsc::UnboundedSender<Command>,
    instance_id: String,
    shutdown: CancellationToken,
) {
    let mut receiver = bus.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            payload = receiver.recv() => {
                let payload = match payload {
                    Ok(payload) => payload,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Change bus receiver lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let change = match Notifier::decode_change(&payload) {
                    Ok(change) => change,
                    Err(error) => {
                        error!(%error, "Invalid msgpack data over the bus");
                        continue;
                    }
                };
                if change.instance_id == instance_id {
                    // Skip changes sent from ourselves
                    continue;
                }
                debug!(?change, "Change received over the bus");
                let _ = commands.send(Command::Dispatch { change });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(name: &str) -> OwnedRoomId {
        format!("!{name}:parlor.test").try_into().unwrap()
    }

    #[tokio::test]
    async fn test_room_filtered_delivery() {
        let notifier = Notifier::new(8, Arc::new(MemoryChangeBus::new()));
        let mut interested = notifier.subscribe(Subscription {
            room_ids: vec![room("a")],
            ..Default::default()
        });
        let mut bystander = notifier.subscribe(Subscription {
            room_ids: vec![room("b")],
            ..Default::default()
        });

        notifier.send_change(Change {
            room_ids: vec![room("a")],
            ..Default::default()
        });

        let change = interested.recv().await.expect("change delivered");
        assert_eq!(change.room_ids, vec![room("a")]);

        tokio::task::yield_now().await;
        assert!(bystander.try_recv().is_none());
        notifier.shutdown();
    }

    #[tokio::test]
    async fn test_all_servers_subscription() {
        let notifier = Notifier::new(8, Arc::new(MemoryChangeBus::new()));
        let mut servers_sub = notifier.subscribe(Subscription {
            all_servers: true,
            ..Default::default()
        });

        notifier.send_change(Change {
            servers: vec!["remote.test".try_into().unwrap()],
            ..Default::default()
        });

        let change = servers_sub.recv().await.expect("change delivered");
        assert_eq!(change.servers.len(), 1);
        notifier.shutdown();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let notifier = Notifier::new(8, Arc::new(MemoryChangeBus::new()));
        let mut handle = notifier.subscribe(Subscription {
            all_events: true,
            ..Default::default()
        });
        notifier.unsubscribe(handle.id);
        tokio::task::yield_now().await;

        notifier.send_change(Change {
            event_ids: vec![ruma::owned_event_id!("$ev")],
            ..Default::default()
        });
        tokio::task::yield_now().await;
        assert!(handle.try_recv().is_none());
        notifier.shutdown();
    }

    #[tokio::test]
    async fn test_cross_process_changes_cross_the_bus() {
        let bus = Arc::new(MemoryChangeBus::new());
        let alpha = Notifier::new(8, bus.clone());
        let beta = Notifier::new(8, bus);

        let mut on_beta = beta.subscribe(Subscription {
            all_events: true,
            ..Default::default()
        });
        tokio::task::yield_now().await;

        alpha.send_change(Change {
            event_ids: vec![ruma::owned_event_id!("$ev")],
            ..Default::default()
        });

        let change = tokio::time::timeout(std::time::Duration::from_secs(1), on_beta.recv())
            .await
            .expect("delivered in time")
            .expect("change delivered");
        assert_eq!(change.event_ids.len(), 1);
        // The originating tag rides along
        assert_eq!(change.instance_id, alpha.instance_id());

        alpha.shutdown();
        beta.shutdown();
    }

    #[test]
    fn test_change_msgpack_round_trip() {
        let change = Change {
            instance_id: "abc".to_owned(),
            event_ids: vec![ruma::owned_event_id!("$ev")],
            servers: vec!["remote.test".try_into().unwrap()],
            ..Default::default()
        };
        let encoded = Notifier::encode_change(&change).unwrap();
        assert_eq!(Notifier::decode_change(&encoded).unwrap(), change);
    }
}
