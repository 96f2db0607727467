use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use anyhow::{anyhow, Result};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub public_url: String,
    pub places_api_key: String,
    pub places_base_url: String,
    pub weather_api_key: String,
    pub weather_base_url: String,
    pub bcrypt_cost: u32,
}

impl Config {
    pub fn load() -> Result<Self> {
        let port: u16 = try_load("PICNIK_PORT", "8000")?;
        Ok(Self {
            port,
            data_dir: try_load("PICNIK_DATA_DIR", "picnik-data")?,
            storage_dir: try_load("PICNIK_STORAGE_DIR", "picnik-files")?,
            public_url: try_load("PICNIK_PUBLIC_URL", &format!("http://localhost:{port}"))?,
            places_api_key: secret("PLACES_API_KEY"),
            places_base_url: try_load(
                "PLACES_BASE_URL",
                "https://maps.googleapis.com/maps/api/place",
            )?,
            weather_api_key: secret("WEATHER_API_KEY"),
            weather_base_url: try_load(
                "WEATHER_BASE_URL",
                "https://api.openweathermap.org/data/2.5",
            )?,
            bcrypt_cost: try_load("PICNIK_BCRYPT_COST", &bcrypt::DEFAULT_COST.to_string())?,
        })
    }

    /// Everything under `root`, no provider keys, cheapest hashing.
    pub fn local(root: impl Into<PathBuf>, port: u16) -> Self {
        let root = root.into();
        Self {
            port,
            data_dir: root.join("data"),
            storage_dir: root.join("files"),
            public_url: format!("http://127.0.0.1:{port}"),
            places_api_key: String::new(),
            places_base_url: String::new(),
            weather_api_key: String::new(),
            weather_base_url: String::new(),
            bcrypt_cost: 4,
        }
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    env::var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| anyhow!("invalid {key} value: {e}"))
}

fn secret(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| {
        warn!("{key} not set, requests to that provider will be rejected upstream");
        String::new()
    })
}
