use ruma::{OwnedRoomAliasId, OwnedRoomId, RoomVersionId, UInt};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Mutable room summary, rewritten transactionally as state events commit.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Room {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<RoomVersionId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_alias: Option<OwnedRoomAliasId>,

    #[serde(default)]
    pub member_count: i64,

    #[serde(default)]
    pub current_depth: UInt,

    #[serde(default)]
    pub federated: bool,
}

impl Room {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("room serializes")
    }

    /// Whether the room has been created (a create event has committed).
    pub fn exists(&self) -> bool {
        self.room_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let room = Room {
            room_id: Some(ruma::owned_room_id!("!room:parlor.test")),
            version: Some(RoomVersionId::V10),
            name: Some("war room".to_owned()),
            member_count: 3,
            federated: true,
            ..Default::default()
        };
        let decoded = Room::from_bytes(&room.to_bytes()).unwrap();
        assert_eq!(decoded.name.as_deref(), Some("war room"));
        assert_eq!(decoded.member_count, 3);
        assert!(decoded.exists());
        assert!(!Room::default().exists());
    }
}
