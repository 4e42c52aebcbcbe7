// =============================================================================
// Parlor - Server Key Store
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Caches remote servers' verify keys by validity window and verifies
//   signed canonical JSON against them. Keys are fetched from the origin
//   over the federation transport on cache miss or expiry.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use ruma::{
    serde::Base64, signatures::PublicKeyMap, CanonicalJsonObject, MilliSecondsSinceUnixEpoch,
    OwnedServerName,
};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use crate::{service::federation::FederationTransport, utils, Error, Result};

#[derive(Clone, Debug)]
struct CachedServerKeys {
    valid_until: MilliSecondsSinceUnixEpoch,
    /// Key ID to unpadded base64 public key.
    verify_keys: BTreeMap<String, String>,
}

/// Remote server verify-key cache.
pub struct KeyStore {
    transport: Arc<dyn FederationTransport>,
    cache: RwLock<HashMap<OwnedServerName, CachedServerKeys>>,
}

impl KeyStore {
    pub fn new(transport: Arc<dyn FederationTransport>) -> Self {
        KeyStore {
            transport,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn get_server_keys(&self, server_name: &OwnedServerName) -> Result<CachedServerKeys> {
        let now = MilliSecondsSinceUnixEpoch(
            utils::millis_since_unix_epoch()
                .try_into()
                .expect("timestamp fits"),
        );

        if let Some(cached) = self.cache.read().await.get(server_name) {
            if cached.valid_until > now {
                trace!(server = %server_name, "Server keys cached and fresh");
                return Ok(cached.clone());
            }
        }

        info!(server = %server_name, "Fetching keys from server");
        // TODO: fall back to the trusted key servers if the direct fetch fails
        let keys = self.transport.get_server_keys(server_name).await?;

        let cached = CachedServerKeys {
            valid_until: keys.valid_until_ts,
            verify_keys: keys.verify_keys,
        };
        self.cache
            .write()
            .await
            .insert(server_name.clone(), cached.clone());
        Ok(cached)
    }

    /// The origin's keys shaped for `ruma::signatures` verification.
    pub async fn public_key_map_for(&self, server_name: &OwnedServerName) -> Result<PublicKeyMap> {
        let keys = self.get_server_keys(server_name).await?;

        let mut key_set = BTreeMap::new();
        for (key_id, key) in keys.verify_keys {
            let key = Base64::parse(key)
                .map_err(|_| Error::BadData("server key is not valid base64"))?;
            key_set.insert(key_id, key);
        }

        let mut map = PublicKeyMap::new();
        map.insert(server_name.as_str().to_owned(), key_set);
        Ok(map)
    }

    /// Ed25519-verify a signed canonical JSON object against the origin's
    /// key set. The object carries its `signatures`; `unsigned` is ignored
    /// by the signature algorithm.
    pub async fn verify_json_from_server(
        &self,
        server_name: &OwnedServerName,
        object: &CanonicalJsonObject,
    ) -> Result<()> {
        let public_key_map = self.public_key_map_for(server_name).await?;
        ruma::signatures::verify_json(&public_key_map, object).map_err(|error| {
            debug!(server = %server_name, %error, "JSON signature failed");
            Error::SignatureInvalid(server_name.to_string())
        })
    }
}
