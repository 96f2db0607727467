use chrono::{DateTime, Utc};
use picnik_common::documents::{Notification, NotificationType, User, Versioned};
use picnik_common::{NotificationId, PicnicId, RegisterPushToken, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::store::{abort, new_id, Filter, Subscription, Tx, TxResult, NOTIFICATIONS, PUSH_TOKENS, USERS};
use crate::State;

#[derive(Clone, Debug)]
pub struct NewNotification {
    pub kind: NotificationType,
    pub sender: UserId,
    pub recipient: UserId,
    pub picnic_id: Option<PicnicId>,
    pub message: String,
    pub data: Value,
}

impl NewNotification {
    pub fn new(kind: NotificationType, sender: &UserId, recipient: &UserId, message: impl Into<String>) -> Self {
        Self {
            kind,
            sender: sender.clone(),
            recipient: recipient.clone(),
            picnic_id: None,
            message: message.into(),
            data: Value::Null,
        }
    }
    pub fn picnic(mut self, picnic: &PicnicId) -> Self {
        self.picnic_id = Some(picnic.clone());
        self
    }
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn build(self) -> Notification {
        Notification {
            id: NotificationId(new_id()),
            kind: self.kind,
            sender_id: self.sender,
            recipient_id: self.recipient,
            picnic_id: self.picnic_id,
            message: self.message,
            read: false,
            created_at: Utc::now(),
            read_at: None,
            data: self.data,
        }
    }
}

/// Writes a notification as part of a larger batch. Call [`dispatch`] once
/// the batch has committed.
pub fn insert(tx: &Tx<'_>, notification: &Notification) -> TxResult<()> {
    tx.set(NOTIFICATIONS, &notification.id.0, notification)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushToken {
    pub user_id: UserId,
    pub platform: String,
    pub registered_at: DateTime<Utc>,
}
impl Versioned for PushToken {}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub notification_id: NotificationId,
    pub recipient_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    pub picnic_id: Option<PicnicId>,
    pub tokens: Vec<String>,
}

impl PushMessage {
    pub fn new(notification: &Notification, tokens: Vec<String>) -> Self {
        let title = match notification.kind {
            NotificationType::PicnicInvite => "Picnic invite",
            NotificationType::FriendRequest => "New friend request",
            NotificationType::PicnicUpdate => "Picnic update",
            NotificationType::Message => "New message",
        };
        Self {
            notification_id: notification.id.clone(),
            recipient_id: notification.recipient_id.clone(),
            kind: notification.kind,
            title: title.to_string(),
            body: notification.message.clone(),
            picnic_id: notification.picnic_id.clone(),
            tokens,
        }
    }

    /// Where a click on the OS notification should navigate.
    pub fn click_route(&self) -> String {
        match (self.kind, &self.picnic_id) {
            (NotificationType::PicnicInvite | NotificationType::PicnicUpdate, Some(picnic)) => {
                format!("/picnic/{picnic}")
            }
            (NotificationType::FriendRequest, _) => "/friends".to_string(),
            _ => "/notifications".to_string(),
        }
    }
}

/// Fan-out of push messages to foreground listeners.
#[derive(Clone)]
pub struct PushHub {
    tx: broadcast::Sender<PushMessage>,
}

impl PushHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
    pub fn publish(&self, message: PushMessage) {
        let receivers = self.tx.send(message).unwrap_or(0);
        debug!(receivers, "published push message");
    }
    pub fn subscribe(&self, user: UserId) -> PushStream {
        PushStream {
            rx: self.tx.subscribe(),
            user,
        }
    }
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PushStream {
    rx: broadcast::Receiver<PushMessage>,
    user: UserId,
}

impl PushStream {
    pub async fn next(&mut self) -> Option<PushMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) if message.recipient_id == self.user => return Some(message),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(user = %self.user, skipped, "push listener lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

pub fn push_tokens(state: &State, user: &UserId) -> Result<Vec<String>> {
    let registered = state
        .store
        .query_with_ids::<PushToken>(PUSH_TOKENS, &Filter::eq("userId", user.0.as_str()))?;
    Ok(registered.into_iter().map(|(token, _)| token).collect())
}

/// Publishes committed notifications to their recipients' push listeners.
pub fn dispatch(state: &State, notifications: &[Notification]) {
    for notification in notifications {
        let tokens = push_tokens(state, &notification.recipient_id).unwrap_or_else(|err| {
            warn!("looking up push tokens: {err}");
            Vec::new()
        });
        state.push.publish(PushMessage::new(notification, tokens));
    }
}

pub fn send_notification(state: &State, new: NewNotification) -> Result<Notification> {
    let notification = new.build();
    state.store.transaction(|tx| {
        if tx.get::<User>(USERS, &notification.recipient_id.0)?.is_none() {
            return abort(AppError::NotFound(format!("user {}", notification.recipient_id)));
        }
        insert(tx, &notification)
    })?;
    dispatch(state, std::slice::from_ref(&notification));
    Ok(notification)
}

pub fn list_notifications(state: &State, user: &UserId, unread_only: bool) -> Result<Vec<Notification>> {
    let mut filters = vec![Filter::eq("recipientId", user.0.as_str())];
    if unread_only {
        filters.push(Filter::eq("read", false));
    }
    let mut notifications: Vec<Notification> = state.store.query(NOTIFICATIONS, &Filter::And(filters))?;
    notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(notifications)
}

pub fn unread_count(state: &State, user: &UserId) -> Result<usize> {
    Ok(list_notifications(state, user, true)?.len())
}

pub fn mark_as_read(state: &State, user: &UserId, id: &NotificationId) -> Result<Notification> {
    state.store.transaction(|tx| {
        let mut notification: Notification = tx.require(NOTIFICATIONS, &id.0, "notification")?;
        if &notification.recipient_id != user {
            return abort(AppError::PermissionDenied(
                "only the recipient can mark a notification as read".into(),
            ));
        }
        if !notification.read {
            notification.read = true;
            notification.read_at = Some(Utc::now());
            tx.set(NOTIFICATIONS, &id.0, &notification)?;
        }
        Ok(notification)
    })
}

/// Marks every unread notification of `user` in one batch.
pub fn mark_all_as_read(state: &State, user: &UserId) -> Result<usize> {
    let unread = list_notifications(state, user, true)?;
    let now = Utc::now();
    state.store.transaction(|tx| {
        let mut updated = 0;
        for id in unread.iter().map(|n| &n.id) {
            let Some(mut notification) = tx.get::<Notification>(NOTIFICATIONS, &id.0)? else {
                continue;
            };
            if notification.read {
                continue;
            }
            notification.read = true;
            notification.read_at = Some(now);
            tx.set(NOTIFICATIONS, &id.0, &notification)?;
            updated += 1;
        }
        Ok(updated)
    })
}

pub fn delete_notification(state: &State, user: &UserId, id: &NotificationId) -> Result<()> {
    state.store.transaction(|tx| {
        let notification: Notification = tx.require(NOTIFICATIONS, &id.0, "notification")?;
        if &notification.recipient_id != user {
            return abort(AppError::PermissionDenied(
                "only the recipient can delete a notification".into(),
            ));
        }
        tx.delete(NOTIFICATIONS, &id.0)?;
        Ok(())
    })
}

/// Live list of a user's notifications; every change delivers a full snapshot.
pub fn live(state: &State, user: &UserId) -> Subscription<Notification> {
    state
        .store
        .subscribe(NOTIFICATIONS, Filter::eq("recipientId", user.0.as_str()))
}

pub fn register_push_token(state: &State, user: &UserId, request: RegisterPushToken) -> Result<()> {
    let token = request.token.trim();
    if token.is_empty() {
        return Err(AppError::InvalidOperation("push token is empty".into()));
    }
    let doc = PushToken {
        user_id: user.clone(),
        platform: request.platform,
        registered_at: Utc::now(),
    };
    // A device that changes hands is re-registered to its new owner.
    state.store.set(PUSH_TOKENS, token, &doc)
}

pub fn unregister_push_token(state: &State, user: &UserId, token: &str) -> Result<()> {
    state.store.transaction(|tx| {
        match tx.get::<PushToken>(PUSH_TOKENS, token)? {
            Some(doc) if &doc.user_id != user => abort(AppError::PermissionDenied(
                "push token belongs to another user".into(),
            )),
            Some(_) => {
                tx.delete(PUSH_TOKENS, token)?;
                Ok(())
            }
            None => Ok(()),
        }
    })
}
