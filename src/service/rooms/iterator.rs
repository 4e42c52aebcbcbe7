//! Persisted position of the singleton events iterator.

use crate::database::Versionstamp;
use crate::service::lease::Lease;
use crate::types::{value_for_versionstamp, value_to_versionstamp, EventIdTupWithVersion};
use crate::Result;

use super::RoomsDatabase;

impl RoomsDatabase {
    pub async fn get_events_iterator_position(&self) -> Result<Versionstamp> {
        let txn = self.db.read().await?;
        match txn.get(&self.key_for_iterator_position()).await? {
            Some(value) => value_to_versionstamp(&value),
            None => Ok(Versionstamp::ZERO),
        }
    }

    /// Advance the iterator position. The lease refresh is the last write
    /// so the advance only commits while the lease is still held.
    pub async fn update_events_iterator_position(
        &self,
        version: Versionstamp,
        lease: &Lease,
    ) -> Result<()> {
        let txn = self.db.write().await?;
        txn.set(
            &self.key_for_iterator_position(),
            &value_for_versionstamp(version),
        );
        lease.txn_refresh(&*txn).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Events after `from`, in commit order, for the iterator to fan out.
    pub async fn events_iterator_paginate(
        &self,
        from: Versionstamp,
        limit: usize,
    ) -> Result<Vec<EventIdTupWithVersion>> {
        let txn = self.db.read().await?;
        self.events
            .paginate_all(&*txn, from, Versionstamp::ZERO, limit, None)
            .await
    }
}
