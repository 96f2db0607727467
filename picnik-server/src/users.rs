use chrono::Utc;
use picnik_common::documents::{FriendProfile, User};
use picnik_common::{normalize_email, ProfileUpdate, UserId};
use tracing::info;

use crate::error::{AppError, Result};
use crate::store::{abort, Filter, Tx, TxResult, USERS};
use crate::State;

pub fn get_profile(state: &State, user: &UserId) -> Result<User> {
    state.store.require(USERS, &user.0, "user")
}

pub fn search_by_email(state: &State, email: &str) -> Result<Option<FriendProfile>> {
    let email = normalize_email(email);
    let user: Option<User> = state.store.find_one(USERS, &Filter::eq("email", email.as_str()))?;
    Ok(user.map(|u| u.profile()))
}

/// Writes `user` and refreshes the snapshot of it cached by each friend.
fn save_with_snapshots(tx: &Tx<'_>, user: &User) -> TxResult<()> {
    tx.set(USERS, &user.id.0, user)?;
    let profile = user.profile();
    for friend in &user.friends {
        let Some(mut doc) = tx.get::<User>(USERS, &friend.0)? else {
            continue;
        };
        if doc.friend_profiles.contains_key(&user.id) {
            doc.friend_profiles.insert(user.id.clone(), profile.clone());
            tx.set(USERS, &friend.0, &doc)?;
        }
    }
    Ok(())
}

pub fn update_profile(state: &State, user: &UserId, update: ProfileUpdate) -> Result<User> {
    state.store.transaction(|tx| {
        let mut doc: User = tx.require(USERS, &user.0, "user")?;
        if let Some(name) = &update.display_name {
            let name = name.trim();
            if name.is_empty() {
                return abort(AppError::InvalidOperation("display name cannot be empty".into()));
            }
            doc.display_name = name.to_string();
        }
        if let Some(bio) = &update.bio {
            doc.bio = bio.trim().to_string();
        }
        doc.updated_at = Utc::now();
        save_with_snapshots(tx, &doc)?;
        Ok(doc)
    })
}

pub async fn upload_avatar(state: &State, user: &UserId, bytes: &[u8]) -> Result<User> {
    get_profile(state, user)?;
    let stored = state
        .storage
        .upload(&format!("users/{user}/avatar.jpg"), bytes)
        .await?;
    let doc = state.store.transaction(|tx| {
        let mut doc: User = tx.require(USERS, &user.0, "user")?;
        doc.avatar_url = Some(stored.url.clone());
        doc.updated_at = Utc::now();
        save_with_snapshots(tx, &doc)?;
        Ok(doc)
    })?;
    info!(%user, "avatar updated");
    Ok(doc)
}
