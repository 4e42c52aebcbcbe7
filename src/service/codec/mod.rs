// =============================================================================
// Parlor - Event Codec
// =============================================================================
//
// Project: Parlor - Matrix homeserver core over a versionstamped KVS
// License: Apache 2.0
//
// Description:
//   Room-version-aware event cryptography: content hashing, reference
//   hashing (event IDs), redaction, signing with the active server key and
//   verification of federated events. Hash and ID formats follow the room
//   version rules; base64 is always unpadded.
//
// =============================================================================

use ruma::{
    canonical_json::redact, signatures::Ed25519KeyPair, CanonicalJsonObject, CanonicalJsonValue,
    EventId, OwnedServerName,
};
use serde_json::value::to_raw_value;
use tracing::warn;

use crate::{
    service::keys::KeyStore,
    types::{Event, EventHash},
    Error, Result,
};

/// Signs and verifies events under this server's identity.
pub struct EventCodec {
    server_name: OwnedServerName,
    keypair: Ed25519KeyPair,
}

impl EventCodec {
    pub fn new(server_name: OwnedServerName, keypair: Ed25519KeyPair) -> Self {
        EventCodec {
            server_name,
            keypair,
        }
    }

    pub fn server_name(&self) -> &OwnedServerName {
        &self.server_name
    }

    /// The event's canonical JSON redacted per its room version.
    pub fn redacted_wire_json(&self, event: &Event) -> Result<CanonicalJsonObject> {
        let rules = event.room_version_rules()?;
        let object = event.to_wire_json()?;
        redact(object, &rules.redaction, None)
            .map_err(|_| Error::BadData("event JSON cannot be redacted"))
    }

    /// SHA-256 content hash over the canonical JSON with `signatures`,
    /// `unsigned` and `hashes` removed; unpadded base64.
    pub fn content_hash(&self, event: &Event) -> Result<String> {
        let object = event.to_wire_json()?;
        Ok(ruma::signatures::content_hash(&object)?.encode())
    }

    /// The reference hash forming the event ID, in the room version's
    /// event ID format.
    pub fn reference_hash(&self, event: &Event) -> Result<String> {
        let rules = event.room_version_rules()?;
        let object = event.to_wire_json()?;
        Ok(ruma::signatures::reference_hash(&object, &rules)?)
    }

    /// Populate content hash, signature and event ID on a locally created
    /// event. The ID is a pure function of the room-version-redacted
    /// canonical JSON, so this must run after all DAG placement fields are
    /// final.
    pub fn hash_and_sign_event(&self, event: &mut Event) -> Result<()> {
        let rules = event.room_version_rules()?;
        let mut object = event.to_wire_json()?;

        ruma::signatures::hash_and_sign_event(
            self.server_name.as_str(),
            &self.keypair,
            &mut object,
            &rules.redaction,
        )?;

        // Pull the hash and signatures back into the stored representation
        if let Some(CanonicalJsonValue::Object(hashes)) = object.get("hashes") {
            if let Some(CanonicalJsonValue::String(sha256)) = hashes.get("sha256") {
                event.hashes = Some(EventHash {
                    sha256: sha256.clone(),
                });
            }
        }
        if let Some(signatures) = object.get("signatures") {
            event.signatures = Some(to_raw_value(signatures)?);
        }

        let reference_hash = ruma::signatures::reference_hash(&object, &rules)?;
        event.event_id = EventId::parse_arc(format!("${reference_hash}"))
            .expect("reference hashes are valid event IDs");

        Ok(())
    }

    /// Verify a federated event: recompute the reference hash against any
    /// provided ID, check the origin server's signature, and check the
    /// content hash. A content hash mismatch is a *redaction*, not a
    /// rejection: the event is flagged and the error is `EventRedacted`.
    pub async fn verify_event(
        &self,
        event: &mut Event,
        sending_server: &OwnedServerName,
        key_store: &KeyStore,
    ) -> Result<()> {
        let rules = event.room_version_rules()?;
        let object = event.to_wire_json()?;

        let reference_hash = ruma::signatures::reference_hash(&object, &rules)?;
        let calculated = EventId::parse_arc(format!("${reference_hash}"))
            .expect("reference hashes are valid event IDs");
        if event.event_id.as_str() == "$thiswillbefilledinlater" {
            event.event_id = calculated;
        } else if event.event_id != calculated {
            warn!(
                event_id = %event.event_id,
                calculated = %calculated,
                "Event ID is not the reference hash"
            );
            return Err(Error::EventIdMismatch);
        }

        let public_key_map = key_store.public_key_map_for(sending_server).await?;
        match ruma::signatures::verify_event(&public_key_map, &object, &rules) {
            Err(error) => {
                warn!(event_id = %event.event_id, %error, "Event signature verification failed");
                Err(Error::SignatureInvalid(sending_server.to_string()))
            }
            Ok(ruma::signatures::Verified::Signatures) => {
                // Valid signature but mismatched content hash: the event
                // has been redacted somewhere along the way.
                event.redacted = true;
                Err(Error::EventRedacted)
            }
            Ok(ruma::signatures::Verified::All) => Ok(()),
        }
    }

    /// Derive the redacted copy of an event. The ID is preserved: redaction
    /// strips exactly the fields the reference hash ignores.
    pub fn redact_event(&self, event: &Event) -> Result<Event> {
        let redacted_object = self.redacted_wire_json(event)?;
        let mut redacted: Event =
            serde_json::from_value(serde_json::to_value(&redacted_object)?)?;
        redacted.event_id = event.event_id.clone();
        redacted.room_version = event.room_version.clone();
        redacted.redacted = true;
        Ok(redacted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartialEvent;
    use crate::utils;
    use ruma::{events::TimelineEventType, RoomVersionId, UInt};
    use serde_json::json;
    use sha2::{Digest, Sha256};

    fn codec() -> EventCodec {
        let der = Ed25519KeyPair::generate().unwrap();
        EventCodec::new(
            ruma::owned_server_name!("parlor.test"),
            Ed25519KeyPair::from_der(&der, "1".to_owned()).unwrap(),
        )
    }

    fn unsigned_event(room_version: RoomVersionId) -> Event {
        let partial = PartialEvent::new(
            ruma::owned_room_id!("!room:parlor.test"),
            TimelineEventType::RoomMessage,
            None,
            ruma::owned_user_id!("@alice:parlor.test"),
            &json!({"body": "hello"}),
        );
        let mut event = Event::from_partial(partial);
        event.origin = Some(ruma::owned_server_name!("parlor.test"));
        event.origin_server_ts = UInt::from(1_700_000_000u32);
        event.room_version = room_version;
        event
    }

    #[test]
    fn test_id_is_deterministic_per_room_version() {
        let codec = codec();
        for version in [RoomVersionId::V10, RoomVersionId::V11] {
            let mut first = unsigned_event(version.clone());
            let mut second = unsigned_event(version);
            codec.hash_and_sign_event(&mut first).unwrap();
            codec.hash_and_sign_event(&mut second).unwrap();
            assert_eq!(first.event_id, second.event_id);
            assert_eq!(first.hashes, second.hashes);
        }
    }

    #[test]
    fn test_content_hash_matches_independent_sha256() {
        let codec = codec();
        let event = unsigned_event(RoomVersionId::V10);

        // Recompute by hand: canonical JSON minus signatures/unsigned/hashes
        let mut object = event.to_wire_json().unwrap();
        object.remove("signatures");
        object.remove("unsigned");
        object.remove("hashes");
        let canonical = serde_json::to_string(&object).unwrap();
        let digest = Sha256::digest(canonical.as_bytes());

        assert_eq!(
            codec.content_hash(&event).unwrap(),
            utils::base64_encode(&digest)
        );
    }

    #[test]
    fn test_event_id_is_urlsafe_base64_of_reference_hash() {
        let codec = codec();
        let mut event = unsigned_event(RoomVersionId::V10);
        codec.hash_and_sign_event(&mut event).unwrap();

        let id = event.event_id.as_str();
        assert!(id.starts_with('$'));
        // v3+ IDs are unpadded URL-safe base64 of a 32-byte hash
        assert_eq!(id.len(), 44);
        assert!(!id.contains('+') && !id.contains('/') && !id.contains('='));
        assert_eq!(utils::base64_decode_url_safe(&id[1..]).unwrap().len(), 32);
    }

    #[test]
    fn test_redaction_preserves_event_id() {
        let codec = codec();
        let mut event = unsigned_event(RoomVersionId::V10);
        codec.hash_and_sign_event(&mut event).unwrap();

        let redacted = codec.redact_event(&event).unwrap();
        assert!(redacted.redacted);
        assert_eq!(redacted.event_id, event.event_id);

        // The redacted form re-hashes to the same reference hash
        assert_eq!(
            codec.reference_hash(&redacted).unwrap(),
            codec.reference_hash(&event).unwrap(),
        );
    }

    #[test]
    fn test_unknown_room_version_is_rejected() {
        let codec = codec();
        let mut event = unsigned_event(RoomVersionId::V10);
        event.room_version = "org.parlor.bogus".try_into().unwrap();
        assert!(matches!(
            codec.hash_and_sign_event(&mut event),
            Err(Error::UnknownRoomVersion(_))
        ));
    }
}
