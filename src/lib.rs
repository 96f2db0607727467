pub mod discovery;
pub mod documents;
pub mod geo;

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Debug, Serialize, Deserialize, Default)]
pub struct UserId(pub String);
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Debug, Serialize, Deserialize, Default)]
pub struct FriendRequestId(pub String);
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Debug, Serialize, Deserialize, Default)]
pub struct PicnicId(pub String);
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Debug, Serialize, Deserialize, Default)]
pub struct NotificationId(pub String);
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Debug, Serialize, Deserialize, Default)]
pub struct PlaceId(pub String);

macro_rules! id_display {
    ($($id:ty),*) => {
        $(impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
        impl AsRef<str> for $id {
            fn as_ref(&self) -> &str {
                &self.0
            }
        })*
    };
}
id_display!(UserId, FriendRequestId, PicnicId, NotificationId, PlaceId);

/// Trims and lowercases an email address so lookups are case-insensitive.
pub fn normalize_email(email: impl AsRef<str>) -> String {
    email.as_ref().trim().to_lowercase()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUp {
    pub email: String,
    pub password: String,
    pub display_name: String,
}
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignIn {
    pub email: String,
    pub password: String,
}
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub token: String,
    pub user_id: UserId,
}
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordResetRequest {
    pub email: String,
}
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordResetConfirm {
    pub token: String,
    pub new_password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub bio: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFriendRequest {
    pub to_user_email: String,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Rejected,
}
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", content = "request", rename_all = "snake_case")]
pub enum SendOutcome {
    Created(documents::FriendRequest),
    /// The recipient had already asked the sender; that request was accepted instead.
    AcceptedExisting(documents::FriendRequest),
}

impl SendOutcome {
    pub fn request(&self) -> &documents::FriendRequest {
        match self {
            SendOutcome::Created(request) | SendOutcome::AcceptedExisting(request) => request,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RespondToFriendRequest {
    pub decision: Decision,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewPicnic {
    pub restaurant_name: String,
    pub place_id: Option<PlaceId>,
    #[serde(default)]
    pub invited_users: Vec<UserId>,
}
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RespondToInvite {
    pub accept: bool,
}
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InviteUsers {
    pub users: Vec<UserId>,
}
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PicnicStatusUpdate {
    pub status: documents::PicnicStatus,
}
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InviteLink {
    pub url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPushToken {
    pub token: String,
    pub platform: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SaveRestaurant {
    pub name: String,
    pub address: String,
    pub rating: Option<f64>,
    pub price_level: Option<u8>,
    pub photo_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Count {
    pub count: usize,
}

/// Body of every non-2xx response.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub success: bool,
    pub code: String,
    pub message: String,
}
