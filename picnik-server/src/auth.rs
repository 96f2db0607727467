use anyhow::anyhow;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use chrono::{DateTime, Duration, Utc};
use picnik_common::documents::{User, Versioned};
use picnik_common::{normalize_email, AuthSession, SignIn, SignUp, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::{AppError, Result};
use crate::store::{abort, new_id, Filter, CREDENTIALS, PASSWORD_RESETS, SESSIONS, USERS};
use crate::State;

const MIN_PASSWORD_LEN: usize = 6;
const SESSION_TTL_DAYS: i64 = 30;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub user_id: UserId,
    pub password_hash: String,
}
impl Versioned for Credential {}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}
impl Versioned for Session {}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.created_at + Duration::days(SESSION_TTL_DAYS) < Utc::now()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordReset {
    pub email: String,
    pub expires_at: DateTime<Utc>,
}
impl Versioned for PasswordReset {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(UserId),
    SignedOut(UserId),
    PasswordChanged(UserId),
}

/// Push-style session listener.
#[derive(Clone)]
pub struct AuthEvents {
    tx: broadcast::Sender<AuthEvent>,
}

impl AuthEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.tx.subscribe()
    }
    fn emit(&self, event: AuthEvent) {
        // No listeners is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for AuthEvents {
    fn default() -> Self {
        Self::new()
    }
}

fn check_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::InvalidOperation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

async fn hash_password(password: String, cost: u32) -> Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| anyhow!(e))?
        .map_err(|e| AppError::Unknown(anyhow!("hashing password: {e}")))
}

async fn verify_password(password: String, hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| anyhow!(e))?
        .map_err(|e| AppError::Unknown(anyhow!("verifying password: {e}")))
}

fn new_session(user_id: &UserId) -> (String, Session) {
    let session = Session {
        user_id: user_id.clone(),
        created_at: Utc::now(),
    };
    (new_id(), session)
}

pub async fn sign_up(state: &State, request: SignUp) -> Result<AuthSession> {
    let email = normalize_email(&request.email);
    if !email.contains('@') {
        return Err(AppError::InvalidOperation("invalid email address".into()));
    }
    let display_name = request.display_name.trim().to_string();
    if display_name.is_empty() {
        return Err(AppError::InvalidOperation("display name is required".into()));
    }
    check_password(&request.password)?;
    let password_hash = hash_password(request.password, state.config.bcrypt_cost).await?;

    let user = User::new(UserId(new_id()), display_name, &email);
    let credential = Credential {
        user_id: user.id.clone(),
        password_hash,
    };
    let (token, session) = new_session(&user.id);
    state.store.transaction(|tx| {
        if tx.get::<Credential>(CREDENTIALS, &email)?.is_some() {
            return abort(AppError::InvalidOperation("email already in use".into()));
        }
        tx.set(CREDENTIALS, &email, &credential)?;
        tx.set(USERS, &user.id.0, &user)?;
        tx.set(SESSIONS, &token, &session)?;
        Ok(())
    })?;
    info!(user = %user.id, "signed up");
    state.auth_events.emit(AuthEvent::SignedIn(user.id.clone()));
    Ok(AuthSession {
        token,
        user_id: user.id,
    })
}

pub async fn sign_in(state: &State, request: SignIn) -> Result<AuthSession> {
    let denied = || AppError::Unauthenticated("invalid email or password".into());
    let email = normalize_email(&request.email);
    let credential: Credential = state.store.get(CREDENTIALS, &email)?.ok_or_else(denied)?;
    if !verify_password(request.password, credential.password_hash).await? {
        return Err(denied());
    }
    let (token, session) = new_session(&credential.user_id);
    state.store.set(SESSIONS, &token, &session)?;
    state
        .auth_events
        .emit(AuthEvent::SignedIn(credential.user_id.clone()));
    Ok(AuthSession {
        token,
        user_id: credential.user_id,
    })
}

/// Ending an unknown session is not an error.
pub fn sign_out(state: &State, token: &str) -> Result<()> {
    if let Some(session) = state.store.get::<Session>(SESSIONS, token)? {
        state.store.delete(SESSIONS, token)?;
        state.auth_events.emit(AuthEvent::SignedOut(session.user_id));
    }
    Ok(())
}

/// Sessions last `SESSION_TTL_DAYS` from sign-in; expired ones are removed
/// on first use.
pub fn authenticate(state: &State, token: &str) -> Result<UserId> {
    let rejected = || AppError::Unauthenticated("invalid or expired session".into());
    let session: Session = match state.store.get(SESSIONS, token) {
        Ok(Some(session)) => session,
        Ok(None) | Err(AppError::InvalidOperation(_)) => return Err(rejected()),
        Err(err) => return Err(err),
    };
    if session.is_expired() {
        state.store.delete(SESSIONS, token)?;
        return Err(rejected());
    }
    Ok(session.user_id)
}

/// Issues a reset token. Unknown addresses succeed silently so the endpoint
/// does not reveal which addresses have accounts.
pub fn request_password_reset(state: &State, email: &str) -> Result<Option<String>> {
    let email = normalize_email(email);
    if state.store.get::<Credential>(CREDENTIALS, &email)?.is_none() {
        info!("password reset requested for unknown address");
        return Ok(None);
    }
    let token = new_id();
    let reset = PasswordReset {
        email,
        expires_at: Utc::now() + Duration::hours(1),
    };
    state.store.set(PASSWORD_RESETS, &token, &reset)?;
    info!("password reset token issued");
    Ok(Some(token))
}

pub async fn confirm_password_reset(state: &State, token: &str, new_password: String) -> Result<()> {
    let invalid = || AppError::InvalidOperation("invalid or expired reset token".into());
    check_password(&new_password)?;
    let reset: PasswordReset = state.store.get(PASSWORD_RESETS, token)?.ok_or_else(invalid)?;
    if reset.expires_at < Utc::now() {
        state.store.delete(PASSWORD_RESETS, token)?;
        return Err(invalid());
    }
    let password_hash = hash_password(new_password, state.config.bcrypt_cost).await?;
    let Some(credential) = state.store.get::<Credential>(CREDENTIALS, &reset.email)? else {
        return Err(invalid());
    };
    // Every session of the account ends with the old password.
    let sessions: Vec<(String, Session)> = state
        .store
        .query_with_ids(SESSIONS, &Filter::eq("userId", credential.user_id.0.as_str()))?;
    let user_id = state.store.transaction(|tx| {
        let Some(mut credential) = tx.get::<Credential>(CREDENTIALS, &reset.email)? else {
            return abort(invalid());
        };
        credential.password_hash = password_hash.clone();
        tx.set(CREDENTIALS, &reset.email, &credential)?;
        tx.delete(PASSWORD_RESETS, token)?;
        for (session_token, _) in &sessions {
            tx.delete(SESSIONS, session_token)?;
        }
        Ok(credential.user_id)
    })?;
    info!(user = %user_id, revoked = sessions.len(), "password reset");
    state.auth_events.emit(AuthEvent::PasswordChanged(user_id));
    Ok(())
}

/// The signed-in caller, resolved from `Authorization: Bearer <token>`.
pub struct CurrentUser {
    pub id: UserId,
    pub token: String,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        let state = parts
            .extensions
            .get::<State>()
            .cloned()
            .ok_or_else(|| AppError::Unknown(anyhow!("state extension missing")))?;
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(|| AppError::Unauthenticated("missing bearer token".into()))?
            .to_string();
        let id = authenticate(&state, &token)?;
        Ok(CurrentUser { id, token })
    }
}
