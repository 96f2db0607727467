use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use futures::stream::{self, Stream};
use picnik_common::discovery::{CurrentWeather, Forecast, Recommendation, Restaurant, RestaurantDetails};
use picnik_common::documents::{FriendProfile, FriendRequest, Notification, Picnic, SavedRestaurant, User};
use picnik_common::geo::Coordinates;
use picnik_common::{
    AuthSession, Count, FriendRequestId, InviteLink, InviteUsers, NewPicnic, NotificationId, PasswordResetConfirm,
    PasswordResetRequest, PicnicId, PicnicStatusUpdate, PlaceId, ProfileUpdate, RegisterPushToken,
    RespondToFriendRequest, RespondToInvite, SaveRestaurant, SendFriendRequest, SendOutcome, SignIn, SignUp, UserId,
};
use serde::Deserialize;
use tracing::debug;

use crate::auth::{self, CurrentUser};
use crate::error::{AppError, Result};
use crate::{friends, notifications, picnics, places, restaurants, users, weather, State};

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_RADIUS_M: u32 = 1500;

pub fn router(state: State) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/auth/sign-up", post(sign_up))
        .route("/auth/sign-in", post(sign_in))
        .route("/auth/sign-out", post(sign_out))
        .route("/auth/reset-password", post(request_password_reset))
        .route("/auth/reset-password/confirm", post(confirm_password_reset))
        .route("/users/me", get(get_me).patch(update_me))
        .route("/users/me/avatar", put(upload_avatar))
        .route("/users/search", get(search_user))
        .route("/friends", get(get_friends))
        .route("/friends/:user_id", delete(remove_friend))
        .route("/friend-requests", post(send_friend_request))
        .route("/friend-requests/incoming", get(incoming_requests))
        .route("/friend-requests/outgoing", get(outgoing_requests))
        .route("/friend-requests/:id/respond", post(respond_to_friend_request))
        .route("/friend-requests/:id", delete(cancel_friend_request))
        .route("/picnics", post(create_picnic))
        .route("/picnics/active", get(active_picnics))
        .route("/picnics/invites", get(picnic_invites))
        .route("/picnics/:id", get(get_picnic).delete(delete_picnic))
        .route("/picnics/:id/photo", put(set_group_photo))
        .route("/picnics/:id/selfie", put(attach_selfie))
        .route("/picnics/:id/join", post(join_picnic))
        .route("/picnics/:id/respond", post(respond_to_invite))
        .route("/picnics/:id/invite", post(invite_users))
        .route("/picnics/:id/status", post(update_status))
        .route("/picnics/:id/link", get(invite_link))
        .route("/notifications", get(list_notifications))
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/live", get(live_notifications))
        .route("/notifications/read-all", post(mark_all_as_read))
        .route("/notifications/:id/read", post(mark_as_read))
        .route("/notifications/:id", delete(delete_notification))
        .route("/push/tokens", post(register_push_token))
        .route("/push/tokens/:token", delete(unregister_push_token))
        .route("/push/stream", get(push_stream))
        .route("/restaurants/nearby", get(nearby_restaurants))
        .route("/restaurants/details/:place_id", get(restaurant_details))
        .route("/restaurants/photo/:reference", get(restaurant_photo))
        .route("/restaurants/saved", get(list_saved))
        .route(
            "/restaurants/saved/:place_id",
            get(is_saved).put(save_restaurant).delete(unsave_restaurant),
        )
        .route("/weather", get(current_weather))
        .route("/weather/forecast", get(weather_forecast))
        .route("/weather/recommendation", get(weather_recommendation))
        .route("/files/*path", get(download_file))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(Extension(state))
}

async fn root() -> &'static str {
    "picnik"
}

// auth

async fn sign_up(Extension(state): Extension<State>, Json(payload): Json<SignUp>) -> Result<Json<AuthSession>> {
    Ok(Json(auth::sign_up(&state, payload).await?))
}

async fn sign_in(Extension(state): Extension<State>, Json(payload): Json<SignIn>) -> Result<Json<AuthSession>> {
    Ok(Json(auth::sign_in(&state, payload).await?))
}

async fn sign_out(Extension(state): Extension<State>, user: CurrentUser) -> Result<StatusCode> {
    auth::sign_out(&state, &user.token)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Always accepted. The token goes to the mail relay, which is the log here.
async fn request_password_reset(
    Extension(state): Extension<State>,
    Json(payload): Json<PasswordResetRequest>,
) -> Result<StatusCode> {
    if let Some(token) = auth::request_password_reset(&state, &payload.email)? {
        debug!(%token, "password reset token ready for delivery");
    }
    Ok(StatusCode::ACCEPTED)
}

async fn confirm_password_reset(
    Extension(state): Extension<State>,
    Json(payload): Json<PasswordResetConfirm>,
) -> Result<StatusCode> {
    auth::confirm_password_reset(&state, &payload.token, payload.new_password).await?;
    Ok(StatusCode::NO_CONTENT)
}

// profiles

async fn get_me(Extension(state): Extension<State>, user: CurrentUser) -> Result<Json<User>> {
    Ok(Json(users::get_profile(&state, &user.id)?))
}

async fn update_me(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Json(payload): Json<ProfileUpdate>,
) -> Result<Json<User>> {
    Ok(Json(users::update_profile(&state, &user.id, payload)?))
}

async fn upload_avatar(Extension(state): Extension<State>, user: CurrentUser, body: Bytes) -> Result<Json<User>> {
    Ok(Json(users::upload_avatar(&state, &user.id, &body).await?))
}

#[derive(Deserialize)]
struct EmailQuery {
    email: String,
}

async fn search_user(
    Extension(state): Extension<State>,
    _user: CurrentUser,
    Query(query): Query<EmailQuery>,
) -> Result<Json<FriendProfile>> {
    users::search_by_email(&state, &query.email)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("user with email {}", query.email)))
}

// friends

async fn get_friends(Extension(state): Extension<State>, user: CurrentUser) -> Result<Json<Vec<FriendProfile>>> {
    Ok(Json(friends::get_friends_list(&state, &user.id)?))
}

async fn remove_friend(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(friend): Path<String>,
) -> Result<StatusCode> {
    friends::remove_friend(&state, &user.id, &UserId(friend))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn send_friend_request(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Json(payload): Json<SendFriendRequest>,
) -> Result<Json<SendOutcome>> {
    Ok(Json(friends::send_friend_request(&state, &user.id, &payload.to_user_email)?))
}

async fn incoming_requests(Extension(state): Extension<State>, user: CurrentUser) -> Result<Json<Vec<FriendRequest>>> {
    Ok(Json(friends::pending_requests(&state, &user.id)?))
}

async fn outgoing_requests(Extension(state): Extension<State>, user: CurrentUser) -> Result<Json<Vec<FriendRequest>>> {
    Ok(Json(friends::sent_requests(&state, &user.id)?))
}

async fn respond_to_friend_request(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(payload): Json<RespondToFriendRequest>,
) -> Result<Json<FriendRequest>> {
    let request = friends::respond_to_friend_request(&state, &user.id, &FriendRequestId(id), payload.decision)?;
    Ok(Json(request))
}

async fn cancel_friend_request(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    friends::cancel_friend_request(&state, &user.id, &FriendRequestId(id))?;
    Ok(StatusCode::NO_CONTENT)
}

// picnics

async fn create_picnic(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Json(payload): Json<NewPicnic>,
) -> Result<(StatusCode, Json<Picnic>)> {
    let picnic = picnics::create_picnic(&state, &user.id, payload, None).await?;
    Ok((StatusCode::CREATED, Json(picnic)))
}

async fn active_picnics(Extension(state): Extension<State>, user: CurrentUser) -> Result<Json<Vec<Picnic>>> {
    Ok(Json(picnics::list_active_picnics(&state, &user.id)?))
}

async fn picnic_invites(Extension(state): Extension<State>, user: CurrentUser) -> Result<Json<Vec<Picnic>>> {
    Ok(Json(picnics::list_invites(&state, &user.id)?))
}

/// Readable by anyone signed in, so invite links can be previewed.
async fn get_picnic(
    Extension(state): Extension<State>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Picnic>> {
    Ok(Json(picnics::get_picnic(&state, &PicnicId(id))?))
}

async fn delete_picnic(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    picnics::delete_picnic(&state, &user.id, &PicnicId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_group_photo(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Picnic>> {
    Ok(Json(picnics::set_group_photo(&state, &user.id, &PicnicId(id), &body).await?))
}

async fn attach_selfie(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Picnic>> {
    Ok(Json(picnics::attach_selfie(&state, &user.id, &PicnicId(id), &body).await?))
}

async fn join_picnic(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Picnic>> {
    Ok(Json(picnics::join_picnic(&state, &user.id, &PicnicId(id))?))
}

async fn respond_to_invite(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(payload): Json<RespondToInvite>,
) -> Result<Json<Picnic>> {
    Ok(Json(picnics::respond_to_invite(&state, &user.id, &PicnicId(id), payload.accept)?))
}

async fn invite_users(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(payload): Json<InviteUsers>,
) -> Result<Json<Picnic>> {
    Ok(Json(picnics::invite_users(&state, &user.id, &PicnicId(id), &payload.users)?))
}

async fn update_status(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(payload): Json<PicnicStatusUpdate>,
) -> Result<Json<Picnic>> {
    Ok(Json(picnics::update_status(&state, &user.id, &PicnicId(id), payload.status)?))
}

async fn invite_link(
    Extension(state): Extension<State>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<InviteLink>> {
    let picnic = picnics::get_picnic(&state, &PicnicId(id))?;
    Ok(Json(InviteLink {
        url: picnics::invite_link(&state.config.public_url, &picnic.id),
    }))
}

// notifications

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationQuery {
    #[serde(default)]
    unread_only: bool,
}

async fn list_notifications(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Vec<Notification>>> {
    Ok(Json(notifications::list_notifications(&state, &user.id, query.unread_only)?))
}

async fn unread_count(Extension(state): Extension<State>, user: CurrentUser) -> Result<Json<Count>> {
    Ok(Json(Count {
        count: notifications::unread_count(&state, &user.id)?,
    }))
}

/// Streams the caller's full notification list on every change.
async fn live_notifications(
    Extension(state): Extension<State>,
    user: CurrentUser,
) -> Sse<impl Stream<Item = std::result::Result<Event, serde_json::Error>>> {
    let subscription = notifications::live(&state, &user.id);
    let events = stream::unfold(subscription, |mut subscription| async move {
        let snapshot = subscription.next().await?;
        let event = Event::default().event("notifications").json_data(snapshot);
        Some((event, subscription))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn mark_as_read(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Notification>> {
    Ok(Json(notifications::mark_as_read(&state, &user.id, &NotificationId(id))?))
}

async fn mark_all_as_read(Extension(state): Extension<State>, user: CurrentUser) -> Result<Json<Count>> {
    Ok(Json(Count {
        count: notifications::mark_all_as_read(&state, &user.id)?,
    }))
}

async fn delete_notification(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    notifications::delete_notification(&state, &user.id, &NotificationId(id))?;
    Ok(StatusCode::NO_CONTENT)
}

// push

async fn register_push_token(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Json(payload): Json<RegisterPushToken>,
) -> Result<StatusCode> {
    notifications::register_push_token(&state, &user.id, payload)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unregister_push_token(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(token): Path<String>,
) -> Result<StatusCode> {
    notifications::unregister_push_token(&state, &user.id, &token)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Foreground push messages for the caller. Each event carries the message
/// and the route a click should open.
async fn push_stream(
    Extension(state): Extension<State>,
    user: CurrentUser,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let listener = state.push.subscribe(user.id);
    let events = stream::unfold(listener, |mut listener| async move {
        let message = listener.next().await?;
        let event = Event::default()
            .event("push")
            .id(message.notification_id.to_string())
            .data(serde_json::json!({ "route": message.click_route(), "message": message }).to_string());
        Some((Ok(event), listener))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

// restaurants

#[derive(Deserialize)]
struct NearbyQuery {
    lat: f64,
    lng: f64,
    radius: Option<u32>,
}

async fn nearby_restaurants(
    Extension(state): Extension<State>,
    _user: CurrentUser,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<Restaurant>>> {
    let origin = Coordinates::new(query.lat, query.lng);
    let radius = query.radius.unwrap_or(DEFAULT_RADIUS_M);
    Ok(Json(state.places.nearby_restaurants(origin, radius).await?))
}

async fn restaurant_details(
    Extension(state): Extension<State>,
    _user: CurrentUser,
    Path(place_id): Path<String>,
) -> Result<Json<RestaurantDetails>> {
    Ok(Json(state.places.place_details(&PlaceId(place_id)).await?))
}

/// Proxies a place photo so the provider key stays on the server.
async fn restaurant_photo(
    Extension(state): Extension<State>,
    _user: CurrentUser,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse> {
    let (content_type, bytes) = state.places.photo(&reference, places::PHOTO_WIDTH).await?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

async fn list_saved(Extension(state): Extension<State>, user: CurrentUser) -> Result<Json<Vec<SavedRestaurant>>> {
    Ok(Json(restaurants::list_saved(&state, &user.id)?))
}

async fn is_saved(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(place_id): Path<String>,
) -> Result<Json<bool>> {
    Ok(Json(restaurants::is_saved(&state, &user.id, &PlaceId(place_id))?))
}

async fn save_restaurant(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(place_id): Path<String>,
    Json(payload): Json<SaveRestaurant>,
) -> Result<Json<SavedRestaurant>> {
    Ok(Json(restaurants::save_restaurant(&state, &user.id, &PlaceId(place_id), payload)?))
}

async fn unsave_restaurant(
    Extension(state): Extension<State>,
    user: CurrentUser,
    Path(place_id): Path<String>,
) -> Result<StatusCode> {
    restaurants::unsave_restaurant(&state, &user.id, &PlaceId(place_id))?;
    Ok(StatusCode::NO_CONTENT)
}

// weather

#[derive(Deserialize)]
struct WeatherQuery {
    lat: Option<f64>,
    lng: Option<f64>,
    city: Option<String>,
}

async fn current_for(state: &State, query: &WeatherQuery) -> Result<CurrentWeather> {
    match (query.lat, query.lng, &query.city) {
        (Some(lat), Some(lng), _) => state.weather.current_by_coords(Coordinates::new(lat, lng)).await,
        (_, _, Some(city)) => state.weather.current_by_city(city).await,
        _ => Err(AppError::InvalidOperation("either lat and lng or city is required".into())),
    }
}

async fn current_weather(
    Extension(state): Extension<State>,
    _user: CurrentUser,
    Query(query): Query<WeatherQuery>,
) -> Result<Json<CurrentWeather>> {
    Ok(Json(current_for(&state, &query).await?))
}

async fn weather_forecast(
    Extension(state): Extension<State>,
    _user: CurrentUser,
    Query(query): Query<WeatherQuery>,
) -> Result<Json<Forecast>> {
    let forecast = match (query.lat, query.lng, &query.city) {
        (Some(lat), Some(lng), _) => state.weather.forecast_by_coords(Coordinates::new(lat, lng)).await?,
        (_, _, Some(city)) => state.weather.forecast_by_city(city).await?,
        _ => return Err(AppError::InvalidOperation("either lat and lng or city is required".into())),
    };
    Ok(Json(forecast))
}

async fn weather_recommendation(
    Extension(state): Extension<State>,
    _user: CurrentUser,
    Query(query): Query<WeatherQuery>,
) -> Result<Json<Recommendation>> {
    let current = current_for(&state, &query).await?;
    Ok(Json(weather::recommend(&current)))
}

// files

async fn download_file(Extension(state): Extension<State>, Path(path): Path<String>) -> Result<impl IntoResponse> {
    let path = path.trim_start_matches('/');
    let bytes = state.storage.read(path).await?;
    let content_type = match path.rsplit('.').next() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}
