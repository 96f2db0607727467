use std::env;
use std::net::SocketAddr;

use anyhow::Context;
use picnik_server::auth::AuthEvent;
use picnik_server::config::Config;
use picnik_server::{routes, State};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut config = Config::load()?;
    if let Some(port) = env::args().nth(1) {
        config.port = port.parse().with_context(|| format!("invalid port argument {port:?}"))?;
    }
    let port = config.port;
    let state = State::init(config).await?;

    let mut sessions = state.auth_events.subscribe();
    tokio::spawn(async move {
        loop {
            match sessions.recv().await {
                Ok(AuthEvent::SignedIn(user)) => info!(%user, "session started"),
                Ok(AuthEvent::SignedOut(user)) => info!(%user, "session ended"),
                Ok(AuthEvent::PasswordChanged(user)) => info!(%user, "password changed"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let store = state.store.clone();
    let app = routes::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("listening on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    store.flush().await?;
    Ok(())
}
