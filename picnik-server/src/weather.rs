use std::collections::BTreeMap;

use chrono::{NaiveDate, TimeZone, Utc};
use picnik_common::discovery::{CurrentWeather, DailyForecast, Forecast, Recommendation};
use picnik_common::geo::Coordinates;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{AppError, Result};

const FORECAST_DAYS: usize = 5;

#[derive(Deserialize)]
struct RawCondition {
    main: String,
    description: String,
    #[serde(default)]
    icon: String,
}

#[derive(Deserialize)]
struct RawMain {
    temp: f64,
    #[serde(default)]
    feels_like: Option<f64>,
    #[serde(default)]
    temp_min: Option<f64>,
    #[serde(default)]
    temp_max: Option<f64>,
    #[serde(default)]
    humidity: u8,
}

#[derive(Deserialize, Default)]
struct RawWind {
    speed: f64,
}

#[derive(Deserialize)]
struct RawCurrent {
    name: String,
    main: RawMain,
    weather: Vec<RawCondition>,
    #[serde(default)]
    wind: RawWind,
}

#[derive(Deserialize)]
struct RawForecast {
    list: Vec<RawEntry>,
    city: RawCity,
}

#[derive(Deserialize)]
struct RawEntry {
    dt: i64,
    main: RawMain,
    weather: Vec<RawCondition>,
}

#[derive(Deserialize)]
struct RawCity {
    name: String,
    /// Offset from UTC in seconds.
    #[serde(default)]
    timezone: i64,
}

enum Location<'a> {
    Coords(Coordinates),
    City(&'a str),
}

impl Location<'_> {
    fn query(&self) -> Vec<(&'static str, String)> {
        match self {
            Location::Coords(c) => vec![("lat", c.lat.to_string()), ("lon", c.lng.to_string())],
            Location::City(city) => vec![("q", city.to_string())],
        }
    }
}

#[derive(Clone)]
pub struct WeatherClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl WeatherClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, endpoint: &str, location: Location<'_>) -> Result<T> {
        if self.api_key.is_empty() {
            return Err(AppError::Upstream("weather API key is not configured".into()));
        }
        let response = self
            .http
            .get(format!("{}/{endpoint}", self.base_url))
            .query(&location.query())
            .query(&[("appid", self.api_key.as_str()), ("units", "metric")])
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(AppError::NotFound("location".into())),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                Err(AppError::Upstream(format!("weather returned {status}: {body}")))
            }
            _ => Ok(response.json().await?),
        }
    }

    pub async fn current_by_coords(&self, at: Coordinates) -> Result<CurrentWeather> {
        current(self.fetch("weather", Location::Coords(at)).await?)
    }

    pub async fn current_by_city(&self, city: &str) -> Result<CurrentWeather> {
        current(self.fetch("weather", Location::City(city)).await?)
    }

    pub async fn forecast_by_coords(&self, at: Coordinates) -> Result<Forecast> {
        Ok(daily(self.fetch("forecast", Location::Coords(at)).await?))
    }

    pub async fn forecast_by_city(&self, city: &str) -> Result<Forecast> {
        Ok(daily(self.fetch("forecast", Location::City(city)).await?))
    }
}

fn current(raw: RawCurrent) -> Result<CurrentWeather> {
    let condition = raw
        .weather
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Upstream("weather response had no conditions".into()))?;
    Ok(CurrentWeather {
        location: raw.name,
        temperature: raw.main.temp,
        feels_like: raw.main.feels_like.unwrap_or(raw.main.temp),
        humidity: raw.main.humidity,
        condition: condition.main,
        description: condition.description,
        icon: condition.icon,
        wind_speed: raw.wind.speed,
    })
}

#[derive(Default)]
struct DayAccumulator {
    min: Option<f64>,
    max: Option<f64>,
    conditions: BTreeMap<String, (usize, String)>,
}

/// Folds 3-hour entries into one summary per local calendar day. The
/// condition reported for a day is the one seen most often.
fn daily(raw: RawForecast) -> Forecast {
    let mut days: BTreeMap<NaiveDate, DayAccumulator> = BTreeMap::new();
    for entry in raw.list {
        let Some(local) = Utc.timestamp_opt(entry.dt + raw.city.timezone, 0).single() else {
            continue;
        };
        let day = days.entry(local.date_naive()).or_default();
        let low = entry.main.temp_min.unwrap_or(entry.main.temp);
        let high = entry.main.temp_max.unwrap_or(entry.main.temp);
        day.min = Some(day.min.map_or(low, |m| m.min(low)));
        day.max = Some(day.max.map_or(high, |m| m.max(high)));
        if let Some(condition) = entry.weather.into_iter().next() {
            day.conditions
                .entry(condition.main)
                .or_insert((0, condition.description))
                .0 += 1;
        }
    }

    let days = days
        .into_iter()
        .take(FORECAST_DAYS)
        .map(|(date, acc)| {
            let (condition, description) = acc
                .conditions
                .into_iter()
                .max_by_key(|(_, (count, _))| *count)
                .map(|(main, (_, description))| (main, description))
                .unwrap_or_default();
            DailyForecast {
                date,
                min_temperature: acc.min.unwrap_or_default(),
                max_temperature: acc.max.unwrap_or_default(),
                condition,
                description,
            }
        })
        .collect();
    Forecast {
        location: raw.city.name,
        days,
    }
}

fn cuisines(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}

pub fn recommend(weather: &CurrentWeather) -> Recommendation {
    let condition = weather.condition.to_lowercase();
    let temp = weather.temperature;
    if condition.contains("snow") {
        return Recommendation {
            outdoor_seating: false,
            suggested_cuisines: cuisines(&["hot pot", "ramen", "fondue"]),
            message: "Snowy out there. Find a warm table inside.".into(),
        };
    }
    if ["rain", "drizzle", "thunderstorm"].iter().any(|c| condition.contains(c)) {
        return Recommendation {
            outdoor_seating: false,
            suggested_cuisines: cuisines(&["ramen", "pho", "curry"]),
            message: format!("Expect {}. Comfort food indoors is the move.", weather.description),
        };
    }
    if temp >= 28.0 {
        Recommendation {
            outdoor_seating: false,
            suggested_cuisines: cuisines(&["poke", "salads", "ice cream"]),
            message: format!("It's {temp:.0}°C. Stay cool with something light."),
        }
    } else if temp < 10.0 {
        Recommendation {
            outdoor_seating: false,
            suggested_cuisines: cuisines(&["soup", "hot pot", "barbecue"]),
            message: format!("Only {temp:.0}°C. Something warm will hit the spot."),
        }
    } else if temp >= 15.0 && condition == "clear" {
        Recommendation {
            outdoor_seating: true,
            suggested_cuisines: cuisines(&["sandwiches", "tacos", "pizza"]),
            message: "Perfect picnic weather. Grab a spot outside.".into(),
        }
    } else {
        Recommendation {
            outdoor_seating: true,
            suggested_cuisines: cuisines(&["bistro", "brunch", "noodles"]),
            message: "Mild weather. Outdoor seating should be comfortable.".into(),
        }
    }
}
