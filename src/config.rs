use ruma::{signatures::Ed25519KeyPair, OwnedServerName};
use serde::Deserialize;

use crate::{utils, Error, Result};

/// Configuration for a parlor instance. Parsing the on-disk representation
/// is the embedder's job; this struct is the contract.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The server name local users and events are issued under.
    pub server_name: OwnedServerName,

    /// Unpadded base64 of the DER-encoded Ed25519 signing key document.
    pub signing_key: String,
    /// Version part of the signing key ID, i.e. the `1` of `ed25519:1`.
    #[serde(default = "default_signing_key_version")]
    pub signing_key_version: String,

    /// Whether room create events are accepted over federation.
    #[serde(default)]
    pub allow_federated_room_creates: bool,

    /// KVS transaction time budget in milliseconds.
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    /// KVS transaction retry limit before the error is surfaced.
    #[serde(default = "default_transaction_retry_limit")]
    pub transaction_retry_limit: u32,

    /// Subscriber channel capacity for notifier subscriptions.
    #[serde(default = "default_notifier_capacity")]
    pub notifier_channel_capacity: usize,

    /// Events iterator pagination batch size.
    #[serde(default = "default_events_iterator_batch")]
    pub events_iterator_batch: usize,
    /// Events per federation transaction, the spec limit is 50.
    #[serde(default = "default_federation_batch")]
    pub federation_transaction_limit: usize,
}

fn default_signing_key_version() -> String {
    "1".to_owned()
}

fn default_transaction_timeout_ms() -> u64 {
    5_000
}

fn default_transaction_retry_limit() -> u32 {
    10
}

fn default_notifier_capacity() -> usize {
    64
}

fn default_events_iterator_batch() -> usize {
    10
}

fn default_federation_batch() -> usize {
    50
}

impl Config {
    /// The `ed25519:<version>` key ID the active signing key signs under.
    pub fn signing_key_id(&self) -> String {
        format!("ed25519:{}", self.signing_key_version)
    }

    /// Build the active signing keypair from the configured key document.
    pub fn keypair(&self) -> Result<Ed25519KeyPair> {
        let der = utils::base64_decode(&self.signing_key)
            .map_err(|_| Error::BadConfig("signing_key is not valid base64"))?;
        Ed25519KeyPair::from_der(&der, self.signing_key_version.clone())
            .map_err(|_| Error::BadConfig("signing_key is not a valid Ed25519 DER document"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let der = Ed25519KeyPair::generate().expect("can generate keypair");
        Config {
            server_name: "parlor.test".try_into().unwrap(),
            signing_key: utils::base64_encode(&der),
            signing_key_version: "1".to_owned(),
            allow_federated_room_creates: true,
            transaction_timeout_ms: default_transaction_timeout_ms(),
            transaction_retry_limit: default_transaction_retry_limit(),
            notifier_channel_capacity: default_notifier_capacity(),
            events_iterator_batch: default_events_iterator_batch(),
            federation_transaction_limit: default_federation_batch(),
        }
    }

    #[test]
    fn test_keypair_round_trip() {
        let config = test_config();
        config.keypair().expect("keypair builds from config");
        assert_eq!(config.signing_key_id(), "ed25519:1");
    }

    #[test]
    fn test_bad_signing_key_is_rejected() {
        let mut config = test_config();
        config.signing_key = "!!not base64!!".to_owned();
        assert!(matches!(config.keypair(), Err(Error::BadConfig(_))));
    }
}
