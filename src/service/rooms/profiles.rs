//! User profiles and the member-event fan-out a profile change requires.

use std::sync::Arc;

use ruma::{events::room::member::MembershipState, events::TimelineEventType, UserId};
use tracing::{info, warn};

use super::send::SendLocalOptions;
use super::RoomsDatabase;
use crate::types::{Memberships, PartialEvent, UserProfile};
use crate::{Error, Result};

impl RoomsDatabase {
    pub async fn get_user_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>> {
        let txn = self.db.read().await?;
        self.users.lookup_user_profile(&*txn, user_id).await
    }

    /// Update one profile field and fan a member event out to every room
    /// the user is joined to, per the client-server profile semantics. The
    /// profile write is transactional; the fan-out runs in a bounded
    /// background task so the caller does not wait on room sends.
    pub async fn update_user_profile(
        self: &Arc<Self>,
        user_id: &UserId,
        field: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        let memberships: Memberships = {
            let txn = self.db.write().await?;
            let mut profile = self
                .users
                .lookup_user_profile(txn.as_read(), user_id)
                .await?
                .unwrap_or_default();

            match field {
                "displayname" => {
                    let new = value.as_str().map(str::to_owned);
                    if profile.displayname == new {
                        return Err(Error::ProfileUnchanged);
                    }
                    profile.displayname = new;
                }
                "avatar_url" => {
                    let new = value.as_str().map(str::to_owned);
                    if profile.avatar_url == new {
                        return Err(Error::ProfileUnchanged);
                    }
                    profile.avatar_url = new;
                }
                _ => {
                    profile.custom.insert(field.to_owned(), value);
                }
            }

            txn.set(&self.users.key_for_user_profile(user_id), &profile.to_bytes());

            // Memberships at time of profile update decide the fan-out
            let memberships = self
                .users
                .lookup_user_memberships(txn.as_read(), user_id)
                .await?;
            txn.commit().await?;
            memberships
        };

        let this = Arc::clone(self);
        let user_id = user_id.to_owned();
        self.background.spawn(async move {
            let profile = match this.get_user_profile(&user_id).await {
                Ok(Some(profile)) => profile,
                Ok(None) => UserProfile::default(),
                Err(error) => {
                    warn!(%error, "Failed to re-read profile for member fan-out");
                    return;
                }
            };

            let mut updated = 0;
            for (room_id, membership) in memberships {
                if membership.membership != MembershipState::Join {
                    continue;
                }

                let mut content = profile.to_membership_content();
                content.insert("membership".to_owned(), "join".into());

                let partial = PartialEvent::new(
                    room_id.clone(),
                    TimelineEventType::RoomMember,
                    Some(user_id.as_str().to_owned()),
                    user_id.clone(),
                    &serde_json::Value::Object(content),
                );

                match this
                    .send_local_events(&room_id, vec![partial], SendLocalOptions::default())
                    .await
                {
                    Ok(result) if result.rejected.is_empty() => updated += 1,
                    Ok(result) => {
                        if let Some(rejection) = result.rejected.first() {
                            warn!(
                                room_id = %room_id,
                                error = %rejection.error,
                                "Updated member event not allowed"
                            );
                        }
                    }
                    Err(error) => {
                        warn!(room_id = %room_id, %error, "Failed to send updated member event");
                    }
                }
            }
            info!(updated, "Sent updated member events");
        });

        Ok(())
    }
}
