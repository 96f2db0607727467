use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod error;
pub mod friends;
pub mod notifications;
pub mod picnics;
pub mod places;
pub mod restaurants;
pub mod routes;
pub mod storage;
pub mod store;
pub mod users;
pub mod weather;

use auth::AuthEvents;
use config::Config;
use error::Result;
use notifications::PushHub;
use places::PlacesClient;
use storage::ObjectStorage;
use store::Store;
use weather::WeatherClient;

/// One configured backend session, shared by every handler.
#[derive(Clone)]
pub struct State {
    pub config: Arc<Config>,
    pub store: Store,
    pub storage: ObjectStorage,
    pub push: PushHub,
    pub auth_events: AuthEvents,
    pub places: PlacesClient,
    pub weather: WeatherClient,
}

impl State {
    pub async fn init(config: Config) -> Result<Self> {
        let store = Store::open(&config.data_dir)?;
        let storage = ObjectStorage::open(&config.storage_dir, &config.public_url).await?;
        let http = reqwest::Client::new();
        Ok(Self {
            places: PlacesClient::new(
                http.clone(),
                &config.places_base_url,
                &config.places_api_key,
                &config.public_url,
            ),
            weather: WeatherClient::new(http, &config.weather_base_url, &config.weather_api_key),
            config: Arc::new(config),
            store,
            storage,
            push: PushHub::new(),
            auth_events: AuthEvents::new(),
        })
    }
}

#[cfg(test)]
pub(crate) async fn test_state() -> (State, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let state = State::init(Config::local(dir.path(), 0)).await.unwrap();
    (state, dir)
}

/// Inserts a user `<name>` with email `<name>@x.com`.
#[cfg(test)]
pub(crate) fn test_user(state: &State, name: &str) -> picnik_common::UserId {
    use picnik_common::documents::User;
    let user = User::new(picnik_common::UserId(name.to_string()), name, format!("{name}@x.com"));
    state.store.set(store::USERS, name, &user).unwrap();
    user.id
}

/// Serves `router` on an ephemeral local port and returns its base URL.
#[cfg(test)]
pub(crate) async fn serve_mock(router: axum::Router) -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = axum::Server::from_tcp(listener).unwrap().serve(router.into_make_service());
    tokio::spawn(server);
    format!("http://{addr}")
}
