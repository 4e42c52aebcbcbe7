// =============================================================================
// Parlor - Federation Transport Contract
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   The outbound federation capabilities the core depends on. The HTTP
//   client fulfilling this lives outside the core; tests plug in a mock.
//
// =============================================================================

use std::collections::BTreeMap;

use async_trait::async_trait;
use ruma::{
    CanonicalJsonObject, MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedServerName,
    OwnedUserId, RoomVersionId,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;

use crate::Result;

/// A server's published signing keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerKeys {
    pub server_name: OwnedServerName,
    pub valid_until_ts: MilliSecondsSinceUnixEpoch,
    /// Key ID (`ed25519:abc`) to unpadded base64 public key.
    pub verify_keys: BTreeMap<String, String>,
}

/// A federation `/send` transaction.
#[derive(Clone, Debug, Serialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub origin: OwnedServerName,
    pub destination: OwnedServerName,
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    pub pdus: Vec<Box<RawJsonValue>>,
}

/// Per-PDU processing outcome reported by the destination.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PduProcessingResult {
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TransactionResult {
    pub pdus: BTreeMap<OwnedEventId, PduProcessingResult>,
}

/// A `make_join` template handed back by a resident server.
#[derive(Clone, Debug, Deserialize)]
pub struct JoinTemplate {
    pub room_version: RoomVersionId,
    pub event: Box<RawJsonValue>,
}

/// Outbound federation client capabilities required by the core. All calls
/// are made with this server's origin identity against the named
/// destination.
#[async_trait]
pub trait FederationTransport: Send + Sync {
    async fn get_server_keys(&self, server_name: &OwnedServerName) -> Result<ServerKeys>;

    async fn get_event(
        &self,
        destination: &OwnedServerName,
        event_id: &OwnedEventId,
    ) -> Result<Box<RawJsonValue>>;

    async fn make_join(
        &self,
        destination: &OwnedServerName,
        room_id: &OwnedRoomId,
        user_id: &OwnedUserId,
    ) -> Result<JoinTemplate>;

    async fn send_join(
        &self,
        destination: &OwnedServerName,
        room_id: &OwnedRoomId,
        event: &CanonicalJsonObject,
    ) -> Result<()>;

    async fn send_invite_v2(
        &self,
        destination: &OwnedServerName,
        room_id: &OwnedRoomId,
        event: &CanonicalJsonObject,
    ) -> Result<CanonicalJsonObject>;

    async fn send_transaction(&self, transaction: Transaction) -> Result<TransactionResult>;
}
