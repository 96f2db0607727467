use anyhow::{anyhow, Result};
use picnik_common::discovery::{CurrentWeather, Forecast, Recommendation, Restaurant, RestaurantDetails};
use picnik_common::documents::{FriendProfile, FriendRequest, Notification, Picnic, PicnicStatus, SavedRestaurant, User};
use picnik_common::geo::Coordinates;
use picnik_common::{
    ApiError, AuthSession, Count, Decision, FriendRequestId, InviteLink, InviteUsers, NewPicnic, NotificationId,
    PasswordResetConfirm, PasswordResetRequest, PicnicId, PicnicStatusUpdate, PlaceId, ProfileUpdate,
    RegisterPushToken, RespondToFriendRequest, RespondToInvite, SaveRestaurant, SendFriendRequest, SendOutcome,
    SignIn, SignUp, UserId,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

/// Turns a non-2xx response into an error carrying the server's `ApiError`
/// when the body has one.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await?;
    match serde_json::from_str::<ApiError>(&body) {
        Ok(error) => Err(error.into()),
        Err(_) => Err(anyhow!("request failed with {status}: {body}")),
    }
}

async fn json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    Ok(check(request.send().await?).await?.json::<T>().await?)
}

async fn empty(request: RequestBuilder) -> Result<()> {
    check(request.send().await?).await?;
    Ok(())
}

/// One server-sent event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerEvent {
    pub event: String,
    pub id: Option<String>,
    pub data: String,
}

impl ServerEvent {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.data)?)
    }

    fn parse(frame: &str) -> Option<Self> {
        let mut event = ServerEvent::default();
        let mut data = Vec::new();
        for line in frame.lines() {
            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => event.event = value.to_string(),
                "id" => event.id = Some(value.to_string()),
                "data" => data.push(value),
                _ => {}
            }
        }
        // keep-alive frames are comments with no data
        if data.is_empty() {
            return None;
        }
        event.data = data.join("\n");
        Some(event)
    }
}

/// Reads events off a `text/event-stream` response.
pub struct EventStream {
    response: Response,
    buffer: Vec<u8>,
}

impl EventStream {
    /// The next event, or `None` once the server closes the stream.
    pub async fn next(&mut self) -> Result<Option<ServerEvent>> {
        loop {
            if let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
                let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
                match ServerEvent::parse(&String::from_utf8_lossy(&frame)) {
                    Some(event) => return Ok(Some(event)),
                    None => continue,
                }
            }
            match self.response.chunk().await? {
                Some(chunk) => self.buffer.extend(chunk.iter().filter(|&&b| b != b'\r')),
                None => return Ok(None),
            }
        }
    }
}

/// The `ApiError` code behind a failed call, if the server sent one.
pub fn error_code(err: &anyhow::Error) -> Option<&str> {
    err.downcast_ref::<ApiError>().map(|e| e.code.as_str())
}

#[derive(Clone)]
pub struct PicnikClient {
    http: Client,
    base_url: String,
    session: Option<AuthSession>,
}

impl PicnikClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session: None,
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.session.as_ref().map(|s| &s.user_id)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session {
            Some(session) => request.bearer_auth(&session.token),
            None => request,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authed(self.http.get(self.url(path)))
    }
    fn post(&self, path: &str) -> RequestBuilder {
        self.authed(self.http.post(self.url(path)))
    }
    fn put(&self, path: &str) -> RequestBuilder {
        self.authed(self.http.put(self.url(path)))
    }
    fn patch(&self, path: &str) -> RequestBuilder {
        self.authed(self.http.patch(self.url(path)))
    }
    fn delete(&self, path: &str) -> RequestBuilder {
        self.authed(self.http.delete(self.url(path)))
    }

    // auth

    pub async fn sign_up(&mut self, email: &str, password: &str, display_name: &str) -> Result<UserId> {
        let request = SignUp {
            email: email.to_string(),
            password: password.to_string(),
            display_name: display_name.to_string(),
        };
        let session: AuthSession = json(self.post("/auth/sign-up").json(&request)).await?;
        let id = session.user_id.clone();
        self.session = Some(session);
        Ok(id)
    }

    pub async fn sign_in(&mut self, email: &str, password: &str) -> Result<UserId> {
        let request = SignIn {
            email: email.to_string(),
            password: password.to_string(),
        };
        let session: AuthSession = json(self.post("/auth/sign-in").json(&request)).await?;
        let id = session.user_id.clone();
        self.session = Some(session);
        Ok(id)
    }

    pub async fn sign_out(&mut self) -> Result<()> {
        empty(self.post("/auth/sign-out")).await?;
        self.session = None;
        Ok(())
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<()> {
        let request = PasswordResetRequest { email: email.to_string() };
        empty(self.post("/auth/reset-password").json(&request)).await
    }

    pub async fn confirm_password_reset(&self, token: &str, new_password: &str) -> Result<()> {
        let request = PasswordResetConfirm {
            token: token.to_string(),
            new_password: new_password.to_string(),
        };
        empty(self.post("/auth/reset-password/confirm").json(&request)).await
    }

    // profiles

    pub async fn me(&self) -> Result<User> {
        json(self.get("/users/me")).await
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<User> {
        json(self.patch("/users/me").json(update)).await
    }

    pub async fn upload_avatar(&self, bytes: Vec<u8>) -> Result<User> {
        json(self.put("/users/me/avatar").body(bytes)).await
    }

    pub async fn search_user(&self, email: &str) -> Result<FriendProfile> {
        json(self.get("/users/search").query(&[("email", email)])).await
    }

    // friends

    pub async fn friends(&self) -> Result<Vec<FriendProfile>> {
        json(self.get("/friends")).await
    }

    pub async fn remove_friend(&self, friend: &UserId) -> Result<()> {
        empty(self.delete(&format!("/friends/{friend}"))).await
    }

    pub async fn send_friend_request(&self, to_user_email: &str) -> Result<SendOutcome> {
        let request = SendFriendRequest {
            to_user_email: to_user_email.to_string(),
        };
        json(self.post("/friend-requests").json(&request)).await
    }

    pub async fn incoming_requests(&self) -> Result<Vec<FriendRequest>> {
        json(self.get("/friend-requests/incoming")).await
    }

    pub async fn outgoing_requests(&self) -> Result<Vec<FriendRequest>> {
        json(self.get("/friend-requests/outgoing")).await
    }

    pub async fn respond_to_friend_request(&self, id: &FriendRequestId, decision: Decision) -> Result<FriendRequest> {
        json(
            self.post(&format!("/friend-requests/{id}/respond"))
                .json(&RespondToFriendRequest { decision }),
        )
        .await
    }

    pub async fn cancel_friend_request(&self, id: &FriendRequestId) -> Result<()> {
        empty(self.delete(&format!("/friend-requests/{id}"))).await
    }

    // picnics

    pub async fn create_picnic(&self, picnic: &NewPicnic) -> Result<Picnic> {
        json(self.post("/picnics").json(picnic)).await
    }

    pub async fn picnic(&self, id: &PicnicId) -> Result<Picnic> {
        json(self.get(&format!("/picnics/{id}"))).await
    }

    pub async fn active_picnics(&self) -> Result<Vec<Picnic>> {
        json(self.get("/picnics/active")).await
    }

    pub async fn picnic_invites(&self) -> Result<Vec<Picnic>> {
        json(self.get("/picnics/invites")).await
    }

    pub async fn join_picnic(&self, id: &PicnicId) -> Result<Picnic> {
        json(self.post(&format!("/picnics/{id}/join"))).await
    }

    pub async fn respond_to_invite(&self, id: &PicnicId, accept: bool) -> Result<Picnic> {
        json(
            self.post(&format!("/picnics/{id}/respond"))
                .json(&RespondToInvite { accept }),
        )
        .await
    }

    pub async fn invite_users(&self, id: &PicnicId, users: Vec<UserId>) -> Result<Picnic> {
        json(self.post(&format!("/picnics/{id}/invite")).json(&InviteUsers { users })).await
    }

    pub async fn update_status(&self, id: &PicnicId, status: PicnicStatus) -> Result<Picnic> {
        json(
            self.post(&format!("/picnics/{id}/status"))
                .json(&PicnicStatusUpdate { status }),
        )
        .await
    }

    pub async fn set_group_photo(&self, id: &PicnicId, bytes: Vec<u8>) -> Result<Picnic> {
        json(self.put(&format!("/picnics/{id}/photo")).body(bytes)).await
    }

    pub async fn attach_selfie(&self, id: &PicnicId, bytes: Vec<u8>) -> Result<Picnic> {
        json(self.put(&format!("/picnics/{id}/selfie")).body(bytes)).await
    }

    pub async fn delete_picnic(&self, id: &PicnicId) -> Result<()> {
        empty(self.delete(&format!("/picnics/{id}"))).await
    }

    pub async fn invite_link(&self, id: &PicnicId) -> Result<String> {
        let link: InviteLink = json(self.get(&format!("/picnics/{id}/link"))).await?;
        Ok(link.url)
    }

    // notifications

    pub async fn notifications(&self, unread_only: bool) -> Result<Vec<Notification>> {
        json(
            self.get("/notifications")
                .query(&[("unreadOnly", unread_only)]),
        )
        .await
    }

    /// The caller's notification list, resent on every change.
    pub async fn live_notifications(&self) -> Result<EventStream> {
        self.event_stream("/notifications/live").await
    }

    /// Foreground push messages, one `push` event per notification.
    pub async fn push_stream(&self) -> Result<EventStream> {
        self.event_stream("/push/stream").await
    }

    async fn event_stream(&self, path: &str) -> Result<EventStream> {
        let response = check(self.get(path).send().await?).await?;
        Ok(EventStream {
            response,
            buffer: Vec::new(),
        })
    }

    pub async fn unread_count(&self) -> Result<usize> {
        let count: Count = json(self.get("/notifications/unread-count")).await?;
        Ok(count.count)
    }

    pub async fn mark_as_read(&self, id: &NotificationId) -> Result<Notification> {
        json(self.post(&format!("/notifications/{id}/read"))).await
    }

    pub async fn mark_all_as_read(&self) -> Result<usize> {
        let count: Count = json(self.post("/notifications/read-all")).await?;
        Ok(count.count)
    }

    pub async fn delete_notification(&self, id: &NotificationId) -> Result<()> {
        empty(self.delete(&format!("/notifications/{id}"))).await
    }

    pub async fn register_push_token(&self, token: &str, platform: &str) -> Result<()> {
        let request = RegisterPushToken {
            token: token.to_string(),
            platform: platform.to_string(),
        };
        empty(self.post("/push/tokens").json(&request)).await
    }

    pub async fn unregister_push_token(&self, token: &str) -> Result<()> {
        empty(self.delete(&format!("/push/tokens/{token}"))).await
    }

    // restaurants and weather

    pub async fn nearby_restaurants(&self, at: Coordinates, radius_m: u32) -> Result<Vec<Restaurant>> {
        json(self.get("/restaurants/nearby").query(&[
            ("lat", at.lat.to_string()),
            ("lng", at.lng.to_string()),
            ("radius", radius_m.to_string()),
        ]))
        .await
    }

    pub async fn restaurant_details(&self, place: &PlaceId) -> Result<RestaurantDetails> {
        json(self.get(&format!("/restaurants/details/{place}"))).await
    }

    pub async fn saved_restaurants(&self) -> Result<Vec<SavedRestaurant>> {
        json(self.get("/restaurants/saved")).await
    }

    pub async fn is_saved(&self, place: &PlaceId) -> Result<bool> {
        json(self.get(&format!("/restaurants/saved/{place}"))).await
    }

    pub async fn save_restaurant(&self, place: &PlaceId, details: &SaveRestaurant) -> Result<SavedRestaurant> {
        json(self.put(&format!("/restaurants/saved/{place}")).json(details)).await
    }

    pub async fn unsave_restaurant(&self, place: &PlaceId) -> Result<()> {
        empty(self.delete(&format!("/restaurants/saved/{place}"))).await
    }

    pub async fn weather_for_city(&self, city: &str) -> Result<CurrentWeather> {
        json(self.get("/weather").query(&[("city", city)])).await
    }

    pub async fn forecast_for_city(&self, city: &str) -> Result<Forecast> {
        json(self.get("/weather/forecast").query(&[("city", city)])).await
    }

    pub async fn recommendation_for_city(&self, city: &str) -> Result<Recommendation> {
        json(self.get("/weather/recommendation").query(&[("city", city)])).await
    }

    /// Fetches a restaurant photo through the server's proxy link.
    pub async fn restaurant_photo(&self, url: &str) -> Result<Vec<u8>> {
        let response = check(self.authed(self.http.get(url)).send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Downloads a stored file by the URL the server handed out.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = check(self.http.get(url).send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use picnik_common::documents::NotificationType;
    use picnik_server::config::Config;
    use picnik_server::{routes, State};
    use tempfile::TempDir;

    use super::*;

    async fn spawn_server() -> (String, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = State::init(Config::local(dir.path(), port)).await.unwrap();
        let server = axum::Server::from_tcp(listener)
            .unwrap()
            .serve(routes::router(state).into_make_service());
        tokio::spawn(server);
        (format!("http://127.0.0.1:{port}"), dir)
    }

    async fn signed_up(base: &str, name: &str) -> PicnikClient {
        let mut client = PicnikClient::new(base);
        client
            .sign_up(&format!("{name}@x.com"), "hunter22", name)
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn friend_request_flow() {
        let (base, _dir) = spawn_server().await;
        let u1 = signed_up(&base, "u1").await;
        let u2 = signed_up(&base, "u2").await;
        let u1_id = u1.user_id().unwrap().clone();
        let u2_id = u2.user_id().unwrap().clone();

        let outcome = u1.send_friend_request("U2@x.com").await.unwrap();
        let SendOutcome::Created(request) = outcome else {
            panic!("expected a new request");
        };
        assert_eq!(request.to_user_id, u2_id);

        let again = u1.send_friend_request("u2@x.com").await.unwrap_err();
        assert_eq!(error_code(&again), Some("already_processed"));
        let to_self = u1.send_friend_request("u1@x.com").await.unwrap_err();
        assert_eq!(error_code(&to_self), Some("invalid_operation"));

        assert_eq!(u2.incoming_requests().await.unwrap().len(), 1);
        assert_eq!(u1.outgoing_requests().await.unwrap().len(), 1);
        let unread = u2.notifications(true).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].kind, NotificationType::FriendRequest);

        let hijack = u1
            .respond_to_friend_request(&request.id, Decision::Accepted)
            .await
            .unwrap_err();
        assert_eq!(error_code(&hijack), Some("permission_denied"));

        u2.respond_to_friend_request(&request.id, Decision::Accepted)
            .await
            .unwrap();
        let twice = u2
            .respond_to_friend_request(&request.id, Decision::Rejected)
            .await
            .unwrap_err();
        assert_eq!(error_code(&twice), Some("already_processed"));

        let u1_friends = u1.friends().await.unwrap();
        assert_eq!(u1_friends.len(), 1);
        assert_eq!(u1_friends[0].id, u2_id);
        assert_eq!(u2.friends().await.unwrap()[0].id, u1_id);
        assert!(u2.incoming_requests().await.unwrap().is_empty());

        u1.remove_friend(&u2_id).await.unwrap();
        assert!(u1.friends().await.unwrap().is_empty());
        assert!(u2.friends().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn picnic_flow() {
        let (base, _dir) = spawn_server().await;
        let host = signed_up(&base, "host").await;
        let guest = signed_up(&base, "guest").await;
        let guest_id = guest.user_id().unwrap().clone();

        let picnic = host
            .create_picnic(&NewPicnic {
                restaurant_name: "Noodle Bar".into(),
                place_id: None,
                invited_users: vec![guest_id.clone()],
            })
            .await
            .unwrap();
        assert_eq!(picnic.status, PicnicStatus::Planning);
        assert_eq!(guest.picnic_invites().await.unwrap().len(), 1);
        assert!(host
            .invite_link(&picnic.id)
            .await
            .unwrap()
            .ends_with(&format!("/join/{}", picnic.id)));

        let joined = guest.respond_to_invite(&picnic.id, true).await.unwrap();
        assert!(joined.is_participant(&guest_id));
        assert!(guest.picnic_invites().await.unwrap().is_empty());
        let again = guest.respond_to_invite(&picnic.id, true).await.unwrap_err();
        assert_eq!(error_code(&again), Some("not_invited"));

        let denied = guest
            .update_status(&picnic.id, PicnicStatus::Completed)
            .await
            .unwrap_err();
        assert_eq!(error_code(&denied), Some("permission_denied"));

        let with_photo = host.set_group_photo(&picnic.id, b"jpeg bytes".to_vec()).await.unwrap();
        assert_eq!(with_photo.status, PicnicStatus::Active);
        let photo_url = with_photo.photo_url.unwrap();
        assert_eq!(host.download(&photo_url).await.unwrap(), b"jpeg bytes");

        host.update_status(&picnic.id, PicnicStatus::Completed)
            .await
            .unwrap();
        let updates: Vec<_> = guest
            .notifications(true)
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.kind == NotificationType::PicnicUpdate)
            .collect();
        assert!(!updates.is_empty());
        assert!(guest.active_picnics().await.unwrap().is_empty());

        host.delete_picnic(&picnic.id).await.unwrap();
        let gone = guest.picnic(&picnic.id).await.unwrap_err();
        assert_eq!(error_code(&gone), Some("not_found"));
    }

    #[tokio::test]
    async fn notifications_and_sessions() {
        let (base, _dir) = spawn_server().await;
        let mut alice = signed_up(&base, "alice").await;
        let bob = signed_up(&base, "bob").await;
        let bob_id = bob.user_id().unwrap().clone();

        bob.register_push_token("device-1", "android").await.unwrap();
        alice
            .create_picnic(&NewPicnic {
                restaurant_name: "Taco Stand".into(),
                place_id: None,
                invited_users: vec![bob_id.clone()],
            })
            .await
            .unwrap();
        alice.send_friend_request("bob@x.com").await.unwrap();

        assert_eq!(bob.unread_count().await.unwrap(), 2);
        let all = bob.notifications(false).await.unwrap();
        let first = bob.mark_as_read(&all[0].id).await.unwrap();
        assert!(first.read);
        assert_eq!(bob.mark_all_as_read().await.unwrap(), 1);
        assert_eq!(bob.unread_count().await.unwrap(), 0);

        let foreign = alice.delete_notification(&all[1].id).await.unwrap_err();
        assert_eq!(error_code(&foreign), Some("permission_denied"));
        bob.delete_notification(&all[1].id).await.unwrap();
        assert_eq!(bob.notifications(false).await.unwrap().len(), 1);

        let place = PlaceId("p1".into());
        let details = SaveRestaurant {
            name: "Taco Stand".into(),
            ..Default::default()
        };
        alice.save_restaurant(&place, &details).await.unwrap();
        assert!(alice.is_saved(&place).await.unwrap());
        assert_eq!(alice.me().await.unwrap().stats.saved_restaurants, 1);

        alice.sign_out().await.unwrap();
        let signed_out = alice.me().await.unwrap_err();
        assert_eq!(error_code(&signed_out), Some("unauthenticated"));
        alice.sign_in("ALICE@x.com", "hunter22").await.unwrap();
        assert_eq!(alice.saved_restaurants().await.unwrap().len(), 1);
        let wrong = PicnikClient::new(&base)
            .sign_in("alice@x.com", "nope-nope")
            .await
            .unwrap_err();
        assert_eq!(error_code(&wrong), Some("unauthenticated"));
    }

    async fn next_event(stream: &mut EventStream) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("no event within 5s")
            .unwrap()
            .expect("stream closed")
    }

    #[tokio::test]
    async fn live_streams_deliver_notifications() {
        let (base, _dir) = spawn_server().await;
        let alice = signed_up(&base, "alice").await;
        let bob = signed_up(&base, "bob").await;

        let mut live = bob.live_notifications().await.unwrap();
        let mut push = bob.push_stream().await.unwrap();
        let initial = next_event(&mut live).await;
        assert_eq!(initial.event, "notifications");
        assert!(initial.json::<Vec<Notification>>().unwrap().is_empty());

        alice.send_friend_request("bob@x.com").await.unwrap();

        let pushed = next_event(&mut push).await;
        assert_eq!(pushed.event, "push");
        let body: serde_json::Value = pushed.json().unwrap();
        assert_eq!(body["route"], "/friends");
        assert_eq!(body["message"]["type"], "friend_request");
        assert_eq!(pushed.id.as_deref(), body["message"]["notificationId"].as_str());

        let snapshot = loop {
            let event = next_event(&mut live).await;
            let list: Vec<Notification> = event.json().unwrap();
            if !list.is_empty() {
                break list;
            }
        };
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].kind, NotificationType::FriendRequest);

        let anonymous = PicnikClient::new(&base).live_notifications().await.err().unwrap();
        assert_eq!(error_code(&anonymous), Some("unauthenticated"));
    }

    #[test]
    fn event_frames_parse() {
        let event = ServerEvent::parse("event: push\nid: 7\ndata: {\"a\":1}\n\n").unwrap();
        assert_eq!(event.event, "push");
        assert_eq!(event.id.as_deref(), Some("7"));
        assert_eq!(event.data, "{\"a\":1}");
        assert_eq!(ServerEvent::parse(":\n\n"), None);
    }

    #[tokio::test]
    async fn providers_without_keys_fail_upstream() {
        let (base, _dir) = spawn_server().await;
        let client = signed_up(&base, "u1").await;
        let err = client
            .nearby_restaurants(Coordinates::new(40.7, -74.0), 1000)
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), Some("upstream"));
        let err = client.weather_for_city("Springfield").await.unwrap_err();
        assert_eq!(error_code(&err), Some("upstream"));
        let err = client
            .restaurant_photo(&format!("{base}/restaurants/photo/ref1"))
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), Some("upstream"));
        let err = PicnikClient::new(&base)
            .restaurant_photo(&format!("{base}/restaurants/photo/ref1"))
            .await
            .unwrap_err();
        assert_eq!(error_code(&err), Some("unauthenticated"));
    }
}
