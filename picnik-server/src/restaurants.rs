use chrono::Utc;
use picnik_common::documents::{SavedRestaurant, User};
use picnik_common::{PlaceId, SaveRestaurant, UserId};

use crate::error::{AppError, Result};
use crate::store::{saved_restaurants, Filter, USERS};
use crate::State;

/// Saves or refreshes a bookmark. Only the first save counts towards the
/// user's stats.
pub fn save_restaurant(state: &State, user: &UserId, place: &PlaceId, details: SaveRestaurant) -> Result<SavedRestaurant> {
    if details.name.trim().is_empty() {
        return Err(AppError::InvalidOperation("restaurant name is required".into()));
    }
    let collection = saved_restaurants(user);
    state.store.transaction(|tx| {
        let mut owner: User = tx.require(USERS, &user.0, "user")?;
        let existing = tx.get::<SavedRestaurant>(&collection, &place.0)?;
        let saved = SavedRestaurant {
            place_id: place.clone(),
            name: details.name.trim().to_string(),
            address: details.address.clone(),
            rating: details.rating,
            price_level: details.price_level,
            photo_url: details.photo_url.clone(),
            saved_at: existing.as_ref().map_or_else(Utc::now, |e| e.saved_at),
        };
        tx.set(&collection, &place.0, &saved)?;
        if existing.is_none() {
            owner.stats.saved_restaurants += 1;
            tx.set(USERS, &user.0, &owner)?;
        }
        Ok(saved)
    })
}

/// Removing a bookmark that does not exist is a no-op.
pub fn unsave_restaurant(state: &State, user: &UserId, place: &PlaceId) -> Result<bool> {
    let collection = saved_restaurants(user);
    state.store.transaction(|tx| {
        if !tx.delete(&collection, &place.0)? {
            return Ok(false);
        }
        if let Some(mut owner) = tx.get::<User>(USERS, &user.0)? {
            owner.stats.saved_restaurants = owner.stats.saved_restaurants.saturating_sub(1);
            tx.set(USERS, &user.0, &owner)?;
        }
        Ok(true)
    })
}

pub fn list_saved(state: &State, user: &UserId) -> Result<Vec<SavedRestaurant>> {
    let mut saved: Vec<SavedRestaurant> = state.store.query(&saved_restaurants(user), &Filter::All)?;
    saved.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
    Ok(saved)
}

pub fn is_saved(state: &State, user: &UserId, place: &PlaceId) -> Result<bool> {
    Ok(state
        .store
        .get::<SavedRestaurant>(&saved_restaurants(user), &place.0)?
        .is_some())
}
