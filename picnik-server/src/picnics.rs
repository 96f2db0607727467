use chrono::Utc;
use picnik_common::documents::{Notification, NotificationType, Participant, Picnic, PicnicStatus, User};
use picnik_common::{NewPicnic, PicnicId, UserId};
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::notifications::{self, NewNotification};
use crate::store::{abort, new_id, Filter, Tx, TxResult, PICNICS, USERS};
use crate::State;

pub fn invite_link(public_url: &str, picnic: &PicnicId) -> String {
    format!("{}/join/{picnic}", public_url.trim_end_matches('/'))
}

fn group_photo_path(picnic: &PicnicId) -> String {
    format!("picnics/{picnic}/group.jpg")
}

fn selfie_path(picnic: &PicnicId, user: &UserId) -> String {
    format!("picnics/{picnic}/selfies/{user}.jpg")
}

fn invite_notification(host: &User, invitee: &UserId, picnic: &Picnic) -> Notification {
    NewNotification::new(
        NotificationType::PicnicInvite,
        &host.id,
        invitee,
        format!("{} invited you to a picnic at {}", host.display_name, picnic.restaurant_name),
    )
    .picnic(&picnic.id)
    .build()
}

fn bump_picnic_count(tx: &Tx<'_>, user: &UserId) -> TxResult<User> {
    let mut doc: User = tx.require(USERS, &user.0, "user")?;
    doc.stats.picnics += 1;
    tx.set(USERS, &user.0, &doc)?;
    Ok(doc)
}

fn require_host(picnic: &Picnic, user: &UserId, action: &str) -> TxResult<()> {
    if &picnic.host_id != user {
        return abort(AppError::PermissionDenied(format!("only the host can {action}")));
    }
    Ok(())
}

/// Creates a picnic hosted by `host`. A group photo marks attendance, so a
/// picnic created with one starts out `active`.
pub async fn create_picnic(
    state: &State,
    host: &UserId,
    new: NewPicnic,
    group_photo: Option<&[u8]>,
) -> Result<Picnic> {
    let host_doc: User = state.store.require(USERS, &host.0, "user")?;
    let restaurant_name = new.restaurant_name.trim().to_string();
    if restaurant_name.is_empty() {
        return Err(AppError::InvalidOperation("restaurant name is required".into()));
    }
    let mut invited: Vec<UserId> = Vec::new();
    for user in new.invited_users {
        if &user != host && !invited.contains(&user) {
            invited.push(user);
        }
    }

    let id = PicnicId(new_id());
    let photo = match group_photo {
        Some(bytes) => Some(state.storage.upload(&group_photo_path(&id), bytes).await?),
        None => None,
    };
    let now = Utc::now();
    let mut picnic = Picnic {
        id: id.clone(),
        host_id: host_doc.id.clone(),
        host_name: host_doc.display_name.clone(),
        host_photo_url: host_doc.avatar_url.clone(),
        restaurant_name,
        place_id: new.place_id,
        participants: Vec::new(),
        participant_ids: Vec::new(),
        invited_users: invited.clone(),
        status: if photo.is_some() {
            PicnicStatus::Active
        } else {
            PicnicStatus::Planning
        },
        photo_url: photo.as_ref().map(|p| p.url.clone()),
        photo_path: photo.as_ref().map(|p| p.path.clone()),
        created_at: now,
        updated_at: now,
    };
    picnic.add_participant(Participant::from_user(&host_doc));
    let invites: Vec<Notification> = invited
        .iter()
        .map(|user| invite_notification(&host_doc, user, &picnic))
        .collect();

    let committed = state.store.transaction(|tx| {
        for user in &invited {
            if tx.get::<User>(USERS, &user.0)?.is_none() {
                return abort(AppError::NotFound(format!("user {user}")));
            }
        }
        bump_picnic_count(tx, host)?;
        tx.set(PICNICS, &picnic.id.0, &picnic)?;
        for invite in &invites {
            notifications::insert(tx, invite)?;
        }
        Ok(())
    });
    if let Err(err) = committed {
        if photo.is_some() {
            if let Err(cleanup) = state.storage.delete(&format!("picnics/{id}")).await {
                warn!(picnic = %id, "removing orphaned group photo: {cleanup}");
            }
        }
        return Err(err);
    }
    info!(picnic = %picnic.id, host = %host, invited = invites.len(), "picnic created");
    notifications::dispatch(state, &invites);
    Ok(picnic)
}

pub fn get_picnic(state: &State, picnic: &PicnicId) -> Result<Picnic> {
    state.store.require(PICNICS, &picnic.0, "picnic")
}

/// Joins through an invite link. Joining twice is a no-op.
pub fn join_picnic(state: &State, user: &UserId, picnic_id: &PicnicId) -> Result<Picnic> {
    state.store.transaction(|tx| {
        let mut picnic: Picnic = tx.require(PICNICS, &picnic_id.0, "picnic")?;
        if !picnic.status.is_open() {
            return abort(AppError::InvalidOperation("picnic is no longer open".into()));
        }
        if picnic.is_participant(user) {
            return Ok(picnic);
        }
        let doc = bump_picnic_count(tx, user)?;
        picnic.add_participant(Participant::from_user(&doc));
        picnic.invited_users.retain(|id| id != user);
        picnic.updated_at = Utc::now();
        tx.set(PICNICS, &picnic.id.0, &picnic)?;
        Ok(picnic)
    })
}

/// `invited -> participant | declined`. The invite is consumed either way,
/// and a declined invite cannot be taken back without a new one.
pub fn respond_to_invite(state: &State, user: &UserId, picnic_id: &PicnicId, accept: bool) -> Result<Picnic> {
    let picnic = state.store.transaction(|tx| {
        let mut picnic: Picnic = tx.require(PICNICS, &picnic_id.0, "picnic")?;
        if !picnic.is_invited(user) {
            return abort(AppError::NotInvited);
        }
        if accept && !picnic.status.is_open() {
            return abort(AppError::InvalidOperation("picnic is no longer open".into()));
        }
        picnic.invited_users.retain(|id| id != user);
        if accept {
            let doc = bump_picnic_count(tx, user)?;
            picnic.add_participant(Participant::from_user(&doc));
        }
        picnic.updated_at = Utc::now();
        tx.set(PICNICS, &picnic.id.0, &picnic)?;
        Ok(picnic)
    })?;
    info!(picnic = %picnic.id, %user, accept, "picnic invite answered");
    Ok(picnic)
}

pub fn invite_users(state: &State, host: &UserId, picnic_id: &PicnicId, users: &[UserId]) -> Result<Picnic> {
    let (picnic, invites) = state.store.transaction(|tx| {
        let mut picnic: Picnic = tx.require(PICNICS, &picnic_id.0, "picnic")?;
        require_host(&picnic, host, "invite people")?;
        if !picnic.status.is_open() {
            return abort(AppError::InvalidOperation("picnic is no longer open".into()));
        }
        let host_doc: User = tx.require(USERS, &host.0, "user")?;
        let mut invites = Vec::new();
        for user in users {
            if picnic.is_participant(user) || picnic.is_invited(user) {
                continue;
            }
            if tx.get::<User>(USERS, &user.0)?.is_none() {
                return abort(AppError::NotFound(format!("user {user}")));
            }
            picnic.invited_users.push(user.clone());
            invites.push(invite_notification(&host_doc, user, &picnic));
        }
        if invites.is_empty() {
            return Ok((picnic, invites));
        }
        picnic.updated_at = Utc::now();
        tx.set(PICNICS, &picnic.id.0, &picnic)?;
        for invite in &invites {
            notifications::insert(tx, invite)?;
        }
        Ok((picnic, invites))
    })?;
    notifications::dispatch(state, &invites);
    Ok(picnic)
}

fn newest_first(mut picnics: Vec<Picnic>) -> Vec<Picnic> {
    picnics.retain(|p| p.status.is_open());
    picnics.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    picnics
}

/// Planning or active picnics `user` takes part in.
pub fn list_active_picnics(state: &State, user: &UserId) -> Result<Vec<Picnic>> {
    let filter = Filter::array_contains("participantIds", user.0.as_str());
    Ok(newest_first(state.store.query(PICNICS, &filter)?))
}

/// Open picnics `user` has been invited to and not answered yet.
pub fn list_invites(state: &State, user: &UserId) -> Result<Vec<Picnic>> {
    let filter = Filter::array_contains("invitedUsers", user.0.as_str());
    Ok(newest_first(state.store.query(PICNICS, &filter)?))
}

pub fn update_status(state: &State, host: &UserId, picnic_id: &PicnicId, status: PicnicStatus) -> Result<Picnic> {
    let (picnic, updates) = state.store.transaction(|tx| {
        let mut picnic: Picnic = tx.require(PICNICS, &picnic_id.0, "picnic")?;
        require_host(&picnic, host, "change the picnic status")?;
        if !picnic.status.can_transition_to(status) {
            return abort(AppError::InvalidOperation(format!(
                "cannot move a picnic from {:?} to {:?}",
                picnic.status, status
            )));
        }
        picnic.status = status;
        picnic.updated_at = Utc::now();
        tx.set(PICNICS, &picnic.id.0, &picnic)?;

        let label = format!("{status:?}").to_lowercase();
        let message = format!("Picnic at {} is now {label}", picnic.restaurant_name);
        let mut updates = Vec::new();
        for participant in picnic.participant_ids.iter().filter(|id| *id != host) {
            let update = NewNotification::new(NotificationType::PicnicUpdate, host, participant, message.clone())
                .picnic(&picnic.id)
                .build();
            notifications::insert(tx, &update)?;
            updates.push(update);
        }
        Ok((picnic, updates))
    })?;
    info!(picnic = %picnic.id, status = ?picnic.status, "picnic status changed");
    notifications::dispatch(state, &updates);
    Ok(picnic)
}

/// Stores the group photo. Any participant may take it; it activates a
/// picnic that was still being planned.
pub async fn set_group_photo(state: &State, user: &UserId, picnic_id: &PicnicId, bytes: &[u8]) -> Result<Picnic> {
    let picnic = get_picnic(state, picnic_id)?;
    if !picnic.is_participant(user) {
        return Err(AppError::PermissionDenied("only participants can add the group photo".into()));
    }
    let stored = state.storage.upload(&group_photo_path(picnic_id), bytes).await?;
    state.store.transaction(|tx| {
        let mut picnic: Picnic = tx.require(PICNICS, &picnic_id.0, "picnic")?;
        picnic.photo_url = Some(stored.url.clone());
        picnic.photo_path = Some(stored.path.clone());
        if picnic.status == PicnicStatus::Planning {
            picnic.status = PicnicStatus::Active;
        }
        picnic.updated_at = Utc::now();
        tx.set(PICNICS, &picnic.id.0, &picnic)?;
        Ok(picnic)
    })
}

pub async fn attach_selfie(state: &State, user: &UserId, picnic_id: &PicnicId, bytes: &[u8]) -> Result<Picnic> {
    let picnic = get_picnic(state, picnic_id)?;
    if !picnic.is_participant(user) {
        return Err(AppError::PermissionDenied("only participants can add a selfie".into()));
    }
    let stored = state.storage.upload(&selfie_path(picnic_id, user), bytes).await?;
    state.store.transaction(|tx| {
        let mut picnic: Picnic = tx.require(PICNICS, &picnic_id.0, "picnic")?;
        let Some(participant) = picnic.participant_mut(user) else {
            return abort(AppError::PermissionDenied("only participants can add a selfie".into()));
        };
        participant.selfie_url = Some(stored.url.clone());
        picnic.updated_at = Utc::now();
        tx.set(PICNICS, &picnic.id.0, &picnic)?;
        Ok(picnic)
    })
}

pub async fn delete_picnic(state: &State, host: &UserId, picnic_id: &PicnicId) -> Result<()> {
    state.store.transaction(|tx| {
        let picnic: Picnic = tx.require(PICNICS, &picnic_id.0, "picnic")?;
        require_host(&picnic, host, "delete the picnic")?;
        tx.delete(PICNICS, &picnic_id.0)?;
        Ok(())
    })?;
    info!(picnic = %picnic_id, "picnic deleted");
    if let Err(err) = state.storage.delete(&format!("picnics/{picnic_id}")).await {
        warn!(picnic = %picnic_id, "removing picnic photos: {err}");
    }
    Ok(())
}
