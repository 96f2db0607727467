//! Documents as they are stored, one struct per collection.
//!
//! Documents are JSON objects with camelCase fields. The store stamps every
//! document with [`SCHEMA_VERSION_FIELD`]; older shapes are upgraded by
//! [`Versioned::migrate`] when they are read back.
use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{FriendRequestId, NotificationId, PicnicId, PlaceId, UserId};

pub const SCHEMA_VERSION_FIELD: &str = "schemaVersion";

pub trait Versioned: Serialize + DeserializeOwned {
    const VERSION: u32 = 1;

    /// Upgrades a raw document written at schema version `from`.
    fn migrate(value: Value, _from: u32) -> anyhow::Result<Value> {
        Ok(value)
    }
}

pub fn encode<T: Versioned>(doc: &T) -> anyhow::Result<Value> {
    let mut value = serde_json::to_value(doc)?;
    let object = value.as_object_mut().context("documents must be JSON objects")?;
    object.insert(SCHEMA_VERSION_FIELD.to_string(), Value::from(T::VERSION));
    Ok(value)
}

/// Brings a raw document up to `T::VERSION` without deserializing it.
pub fn upgrade<T: Versioned>(mut value: Value) -> anyhow::Result<Value> {
    let version = value
        .get(SCHEMA_VERSION_FIELD)
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;
    if version < T::VERSION {
        value = T::migrate(value, version)?;
    }
    Ok(value)
}

pub fn decode<T: Versioned>(value: Value) -> anyhow::Result<T> {
    Ok(serde_json::from_value(upgrade::<T>(value)?)?)
}

fn rename_field(object: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = object.remove(from) {
        object.entry(to.to_string()).or_insert(value);
    }
}

/// Display fields of another user cached next to a relationship.
#[derive(Clone, Debug, Serialize, Deserialize, Default, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FriendProfile {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub picnics: u32,
    pub friends: u32,
    pub saved_restaurants: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub email: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub friends: Vec<UserId>,
    #[serde(default)]
    pub friend_profiles: BTreeMap<UserId, FriendProfile>,
    #[serde(default)]
    pub sent_requests: Vec<FriendRequestId>,
    #[serde(default)]
    pub received_requests: Vec<FriendRequestId>,
    #[serde(default)]
    pub stats: UserStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, display_name: impl Into<String>, email: impl AsRef<str>) -> Self {
        let now = Utc::now();
        Self {
            id,
            display_name: display_name.into(),
            email: crate::normalize_email(email),
            avatar_url: None,
            bio: String::new(),
            friends: Vec::new(),
            friend_profiles: BTreeMap::new(),
            sent_requests: Vec::new(),
            received_requests: Vec::new(),
            stats: UserStats::default(),
            created_at: now,
            updated_at: now,
        }
    }
    pub fn profile(&self) -> FriendProfile {
        FriendProfile {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
    pub fn is_friend(&self, other: &UserId) -> bool {
        self.friends.contains(other)
    }
}

impl Versioned for User {
    const VERSION: u32 = 2;

    fn migrate(mut value: Value, from: u32) -> anyhow::Result<Value> {
        if from < 2 {
            let object = value.as_object_mut().context("user document is not an object")?;
            rename_field(object, "photoURL", "avatarUrl");
            if !object.get("friendProfiles").map_or(false, Value::is_object) {
                object.insert("friendProfiles".to_string(), Value::Object(Map::new()));
            }
        }
        Ok(value)
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FriendRequestStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    pub id: FriendRequestId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub status: FriendRequestStatus,
    pub from_profile: Option<FriendProfile>,
    pub to_profile: Option<FriendProfile>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Versioned for FriendRequest {}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PicnicStatus {
    Planning,
    Active,
    Completed,
    Cancelled,
}

impl PicnicStatus {
    pub fn is_open(self) -> bool {
        matches!(self, PicnicStatus::Planning | PicnicStatus::Active)
    }
    pub fn can_transition_to(self, next: PicnicStatus) -> bool {
        use PicnicStatus::*;
        matches!(
            (self, next),
            (Planning, Active) | (Active, Completed) | (Planning, Cancelled) | (Active, Cancelled)
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub selfie_url: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn from_user(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            name: user.display_name.clone(),
            photo_url: user.avatar_url.clone(),
            selfie_url: None,
            joined_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Picnic {
    pub id: PicnicId,
    pub host_id: UserId,
    pub host_name: String,
    #[serde(default)]
    pub host_photo_url: Option<String>,
    pub restaurant_name: String,
    #[serde(default)]
    pub place_id: Option<PlaceId>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    /// Mirrors `participants` so array-contains queries can match on ids.
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub invited_users: Vec<UserId>,
    pub status: PicnicStatus,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub photo_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Picnic {
    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participant_ids.contains(user)
    }
    pub fn is_invited(&self, user: &UserId) -> bool {
        self.invited_users.contains(user)
    }
    pub fn add_participant(&mut self, participant: Participant) {
        if self.is_participant(&participant.id) {
            return;
        }
        self.participant_ids.push(participant.id.clone());
        self.participants.push(participant);
    }
    pub fn participant_mut(&mut self, user: &UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.id == user)
    }
}

impl Versioned for Picnic {}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    PicnicInvite,
    FriendRequest,
    PicnicUpdate,
    Message,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(default)]
    pub picnic_id: Option<PicnicId>,
    pub message: String,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Value,
}

impl Versioned for Notification {
    const VERSION: u32 = 2;

    fn migrate(mut value: Value, from: u32) -> anyhow::Result<Value> {
        if from < 2 {
            let object = value.as_object_mut().context("notification document is not an object")?;
            rename_field(object, "isRead", "read");
        }
        Ok(value)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SavedRestaurant {
    pub place_id: PlaceId,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub price_level: Option<u8>,
    #[serde(default)]
    pub photo_url: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl Versioned for SavedRestaurant {}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn v1_users_are_migrated_on_read() {
        let raw = json!({
            "id": "u1",
            "displayName": "Ada",
            "email": "a@x.com",
            "photoURL": "https://img/a.jpg",
            "friends": ["u2"],
            "friendProfiles": null,
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z",
        });
        let user: User = decode(raw).unwrap();
        assert_eq!(user.avatar_url.as_deref(), Some("https://img/a.jpg"));
        assert!(user.friend_profiles.is_empty());
        assert_eq!(user.friends, vec![UserId("u2".into())]);
    }

    #[test]
    fn encode_stamps_the_current_version() {
        let user = User::new(UserId("u1".into()), "Ada", " A@X.com");
        let value = encode(&user).unwrap();
        assert_eq!(value[SCHEMA_VERSION_FIELD], 2);
        assert_eq!(value["email"], "a@x.com");
        let back: User = decode(value).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn v1_notifications_keep_their_read_flag() {
        let raw = json!({
            "id": "n1",
            "type": "picnic_invite",
            "senderId": "u1",
            "recipientId": "u2",
            "message": "join us",
            "isRead": true,
            "createdAt": "2024-01-01T00:00:00Z",
        });
        let notification: Notification = decode(raw).unwrap();
        assert!(notification.read);
        assert_eq!(notification.kind, NotificationType::PicnicInvite);
    }

    #[test]
    fn picnic_status_transitions() {
        use PicnicStatus::*;
        assert!(Planning.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Planning));
        assert!(!Planning.can_transition_to(Completed));
    }
}
