use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Result;

/// A user's global profile. Custom fields ride along untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(flatten)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl UserProfile {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("profile serializes")
    }

    /// The profile fields carried inside a member event's content.
    pub fn to_membership_content(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut content = serde_json::Map::new();
        if let Some(displayname) = &self.displayname {
            content.insert("displayname".to_owned(), displayname.clone().into());
        }
        if let Some(avatar_url) = &self.avatar_url {
            content.insert("avatar_url".to_owned(), avatar_url.clone().into());
        }
        content
    }
}
