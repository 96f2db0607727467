use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::geo::Coordinates;
use crate::PlaceId;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Restaurant {
    pub place_id: PlaceId,
    pub name: String,
    pub address: String,
    pub rating: Option<f64>,
    pub price_level: Option<u8>,
    pub location: Coordinates,
    /// Kilometres from the search origin.
    pub distance_km: f64,
    pub distance: String,
    pub photo_url: Option<String>,
    pub open_now: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestaurantDetails {
    pub place_id: PlaceId,
    pub name: String,
    pub address: String,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub rating: Option<f64>,
    pub total_ratings: Option<u32>,
    pub price_level: Option<u8>,
    pub location: Coordinates,
    pub open_now: Option<bool>,
    pub photo_urls: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CurrentWeather {
    pub location: String,
    pub temperature: f64,
    pub feels_like: f64,
    pub humidity: u8,
    pub condition: String,
    pub description: String,
    pub icon: String,
    pub wind_speed: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyForecast {
    pub date: NaiveDate,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub condition: String,
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub location: String,
    pub days: Vec<DailyForecast>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub outdoor_seating: bool,
    pub suggested_cuisines: Vec<String>,
    pub message: String,
}
