// =============================================================================
// Parlor - Fenced Leases
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Distributed leases backed by three keys per lease: the fencing token
//   (a versionstamp value), an epoch-ms expiry, and the acquirer hostname
//   for operators. Workers refresh the lease as the final write of their
//   work transactions so dependent writes atomically certify validity.
//
// =============================================================================

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::database::{
    Database, KvsWriteTransaction, Subspace, Versionstamp, VERSIONSTAMP_LEN,
};
use crate::database::versionstamp::TX_VERSION_LEN;
use crate::{utils, Error, Result};

#[derive(Clone, Copy, Debug)]
pub struct LeaseOptions {
    /// How often holders refresh; contenders retry at half this.
    pub refresh_interval: Duration,
    /// How long a lease lives without a refresh.
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct LeaseManager {
    db: Database,
    lock: Subspace,
    expires: Subspace,
    hostname: Subspace,
}

/// A held lease. The fencing token is the transaction version of the
/// acquiring commit; any later acquirer holds a strictly greater token, so
/// a stale holder's refresh detectably fails.
pub struct Lease {
    manager: LeaseManager,
    name: String,
    token: [u8; TX_VERSION_LEN],
    options: LeaseOptions,
}

impl LeaseManager {
    pub fn new(db: Database) -> Self {
        LeaseManager {
            db,
            lock: Subspace::new(b"lck"),
            expires: Subspace::new(b"exp"),
            hostname: Subspace::new(b"hst"),
        }
    }

    fn key_for_lock(&self, name: &str) -> Vec<u8> {
        self.lock.key(&[name.as_bytes()])
    }

    fn key_for_expires(&self, name: &str) -> Vec<u8> {
        self.expires.key(&[name.as_bytes()])
    }

    fn key_for_hostname(&self, name: &str) -> Vec<u8> {
        self.hostname.key(&[name.as_bytes()])
    }

    /// Try to acquire once; `None` means someone else holds it.
    pub async fn acquire_once(&self, name: &str, options: LeaseOptions) -> Result<Option<Lease>> {
        trace!(name, "Attempting to acquire lease");
        let txn = self.db.write().await?;

        if self.txn_is_locked(txn.as_read(), name).await? {
            return Ok(None);
        }

        // The versionstamp value doubles as the fencing token
        txn.set_versionstamped_value(
            &self.key_for_lock(name),
            &Versionstamp::incomplete(0).to_bytes(),
        );
        txn.set(
            &self.key_for_hostname(name),
            hostname().as_bytes(),
        );
        self.txn_set_expiry(&*txn, name, options.timeout);

        let version = txn.commit().await?;
        let token = version.transaction_version();
        debug!(name, token = %version, "Acquired lease");

        Ok(Some(Lease {
            manager: self.clone(),
            name: name.to_owned(),
            token,
            options,
        }))
    }

    /// Acquire, retrying until we win or the token is cancelled.
    pub async fn acquire(
        &self,
        name: &str,
        options: LeaseOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<Lease>> {
        debug!(name, "Acquiring lease...");
        loop {
            match self.acquire_once(name, options).await {
                Ok(Some(lease)) => return Ok(Some(lease)),
                Ok(None) => {
                    trace!(name, retry = ?options.refresh_interval / 2, "Lease is held, retrying in");
                }
                Err(error) => {
                    warn!(name, %error, "Error trying to acquire lease, retrying");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(options.refresh_interval / 2) => {}
            }
        }
    }

    async fn txn_is_locked(
        &self,
        txn: &dyn crate::database::KvsTransaction,
        name: &str,
    ) -> Result<bool> {
        let Some(_) = txn.get(&self.key_for_lock(name)).await? else {
            return Ok(false);
        };

        let expires = txn
            .get(&self.key_for_expires(name))
            .await?
            .ok_or(Error::BadData("lease has no expiry"))?;
        let expires = u64::from_be_bytes(
            expires
                .try_into()
                .map_err(|_| Error::BadData("malformed lease expiry"))?,
        );

        if expires < utils::millis_since_unix_epoch() {
            let holder = txn.get(&self.key_for_hostname(name)).await?;
            warn!(
                name,
                timed_out_holder = ?holder.map(String::from_utf8),
                "Found lease timed out"
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn txn_set_expiry(&self, txn: &dyn KvsWriteTransaction, name: &str, timeout: Duration) {
        let expiry = utils::millis_since_unix_epoch() + timeout.as_millis() as u64;
        txn.set(&self.key_for_expires(name), &expiry.to_be_bytes());
    }
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> [u8; TX_VERSION_LEN] {
        self.token
    }

    /// Certify the lease inside a caller's write transaction and bump the
    /// expiry. Must be the last write of the transaction so the caller's
    /// work commits atomically with a valid lease. `LeaseLost` means a
    /// newer fencing token took over; the caller must abandon the write.
    pub async fn txn_refresh(&self, txn: &dyn KvsWriteTransaction) -> Result<()> {
        let value = txn
            .get(&self.manager.key_for_lock(&self.name))
            .await?
            .ok_or(Error::LeaseLost)?;
        if value.len() != VERSIONSTAMP_LEN || value[..TX_VERSION_LEN] != self.token {
            warn!(name = %self.name, "Lease fencing token changed");
            return Err(Error::LeaseLost);
        }
        self.manager
            .txn_set_expiry(txn, &self.name, self.options.timeout);
        Ok(())
    }

    /// Refresh in a transaction of its own.
    pub async fn refresh(&self) -> Result<()> {
        let txn = self.manager.db.write().await?;
        self.txn_refresh(&*txn).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Release the lease, clearing all three keys.
    pub async fn release(&self) -> Result<()> {
        let txn = self.manager.db.write().await?;
        txn.clear(&self.manager.key_for_lock(&self.name));
        txn.clear(&self.manager.key_for_expires(&self.name));
        txn.clear(&self.manager.key_for_hostname(&self.name));
        txn.commit().await?;
        debug!(name = %self.name, "Released lease");
        Ok(())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryEngine;
    use std::sync::Arc;

    fn test_db() -> Database {
        Database::with_default_tuning(Arc::new(MemoryEngine::new()))
    }

    fn options() -> LeaseOptions {
        LeaseOptions {
            refresh_interval: Duration::from_millis(50),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_released() {
        let manager = LeaseManager::new(test_db());

        let lease = manager.acquire_once("worker", options()).await.unwrap();
        let lease = lease.expect("first acquire wins");

        assert!(manager.acquire_once("worker", options()).await.unwrap().is_none());

        lease.release().await.unwrap();
        assert!(manager.acquire_once("worker", options()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_stolen_and_fences_old_holder() {
        let manager = LeaseManager::new(test_db());
        let short = LeaseOptions {
            refresh_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(10),
        };

        let stale = manager
            .acquire_once("worker", short)
            .await
            .unwrap()
            .expect("first acquire wins");

        tokio::time::sleep(Duration::from_millis(25)).await;

        let fresh = manager
            .acquire_once("worker", options())
            .await
            .unwrap()
            .expect("expired lease is stealable");

        // The stale holder's refresh fails loudly
        assert!(matches!(stale.refresh().await, Err(Error::LeaseLost)));
        // The new holder refreshes fine
        fresh.refresh().await.unwrap();
    }

    #[tokio::test]
    async fn test_txn_refresh_certifies_work() {
        let manager = LeaseManager::new(test_db());
        let lease = manager
            .acquire_once("iterator", options())
            .await
            .unwrap()
            .expect("acquire wins");

        let txn = manager.db.write().await.unwrap();
        txn.set(b"position", b"42");
        lease.txn_refresh(&*txn).await.unwrap();
        txn.commit().await.unwrap();

        let txn = manager.db.read().await.unwrap();
        assert_eq!(txn.get(b"position").await.unwrap(), Some(b"42".to_vec()));
    }
}
