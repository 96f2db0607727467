use axum::body::Bytes;
use picnik_common::discovery::{Restaurant, RestaurantDetails};
use picnik_common::geo::{format_distance, haversine_km, Coordinates};
use picnik_common::PlaceId;
use serde::Deserialize;
use tracing::debug;

use crate::error::{AppError, Result};

pub const PHOTO_WIDTH: u32 = 400;
const DETAIL_FIELDS: &str = "place_id,name,formatted_address,vicinity,formatted_phone_number,website,\
rating,user_ratings_total,price_level,geometry,photos,opening_hours";

#[derive(Deserialize)]
struct NearbyResponse {
    status: String,
    #[serde(default)]
    results: Vec<RawPlace>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct DetailsResponse {
    status: String,
    result: Option<RawPlace>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct RawPlace {
    place_id: String,
    name: String,
    vicinity: Option<String>,
    formatted_address: Option<String>,
    formatted_phone_number: Option<String>,
    website: Option<String>,
    rating: Option<f64>,
    user_ratings_total: Option<u32>,
    price_level: Option<u8>,
    geometry: Geometry,
    #[serde(default)]
    photos: Vec<RawPhoto>,
    opening_hours: Option<OpeningHours>,
}

#[derive(Deserialize)]
struct Geometry {
    location: Coordinates,
}

#[derive(Deserialize)]
struct RawPhoto {
    photo_reference: String,
}

#[derive(Deserialize)]
struct OpeningHours {
    open_now: Option<bool>,
}

impl RawPlace {
    fn address(&self) -> String {
        self.formatted_address
            .clone()
            .or_else(|| self.vicinity.clone())
            .unwrap_or_default()
    }
}

fn check_status(status: &str, error_message: Option<String>) -> Result<()> {
    match status {
        "OK" | "ZERO_RESULTS" => Ok(()),
        other => Err(AppError::Upstream(format!(
            "places returned {other}: {}",
            error_message.unwrap_or_default()
        ))),
    }
}

#[derive(Clone)]
pub struct PlacesClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    public_url: String,
}

impl PlacesClient {
    /// `public_url` is where this server is reachable; photo links point
    /// at its proxy route so the key never leaves the server.
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str, public_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    fn key(&self) -> Result<&str> {
        if self.api_key.is_empty() {
            return Err(AppError::Upstream("places API key is not configured".into()));
        }
        Ok(&self.api_key)
    }

    pub fn photo_url(&self, reference: &str) -> String {
        format!("{}/restaurants/photo/{reference}", self.public_url)
    }

    /// Fetches a place photo, returning its content type and bytes.
    pub async fn photo(&self, reference: &str, max_width: u32) -> Result<(String, Bytes)> {
        let max_width = max_width.to_string();
        let response = self
            .http
            .get(format!("{}/photo", self.base_url))
            .query(&[
                ("maxwidth", max_width.as_str()),
                ("photo_reference", reference),
                ("key", self.key()?),
            ])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound("photo".into()));
        }
        let response = response.error_for_status()?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        Ok((content_type, response.bytes().await?))
    }

    /// Restaurants within `radius_m` metres of `origin`, nearest first.
    pub async fn nearby_restaurants(&self, origin: Coordinates, radius_m: u32) -> Result<Vec<Restaurant>> {
        let location = format!("{},{}", origin.lat, origin.lng);
        let radius = radius_m.to_string();
        let response: NearbyResponse = self
            .http
            .get(format!("{}/nearbysearch/json", self.base_url))
            .query(&[
                ("location", location.as_str()),
                ("radius", radius.as_str()),
                ("type", "restaurant"),
                ("key", self.key()?),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        check_status(&response.status, response.error_message)?;

        let mut restaurants: Vec<Restaurant> = response
            .results
            .into_iter()
            .map(|place| {
                let distance_km = haversine_km(origin, place.geometry.location);
                Restaurant {
                    address: place.address(),
                    photo_url: place
                        .photos
                        .first()
                        .map(|p| self.photo_url(&p.photo_reference)),
                    open_now: place.opening_hours.as_ref().and_then(|h| h.open_now),
                    place_id: PlaceId(place.place_id),
                    name: place.name,
                    rating: place.rating,
                    price_level: place.price_level,
                    location: place.geometry.location,
                    distance: format_distance(distance_km),
                    distance_km,
                }
            })
            .collect();
        restaurants.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        debug!(count = restaurants.len(), "nearby restaurants");
        Ok(restaurants)
    }

    pub async fn place_details(&self, place: &PlaceId) -> Result<RestaurantDetails> {
        let response: DetailsResponse = self
            .http
            .get(format!("{}/details/json", self.base_url))
            .query(&[
                ("place_id", place.0.as_str()),
                ("fields", DETAIL_FIELDS),
                ("key", self.key()?),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.status == "NOT_FOUND" {
            return Err(AppError::NotFound(format!("place {place}")));
        }
        check_status(&response.status, response.error_message)?;
        let place = response
            .result
            .ok_or_else(|| AppError::NotFound(format!("place {place}")))?;
        Ok(RestaurantDetails {
            address: place.address(),
            photo_urls: place
                .photos
                .iter()
                .map(|p| self.photo_url(&p.photo_reference))
                .collect(),
            open_now: place.opening_hours.as_ref().and_then(|h| h.open_now),
            place_id: PlaceId(place.place_id),
            name: place.name,
            phone: place.formatted_phone_number,
            website: place.website,
            rating: place.rating,
            total_ratings: place.user_ratings_total,
            price_level: place.price_level,
            location: place.geometry.location,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use axum::{extract::Query, routing::get, Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::serve_mock;

    async fn nearby(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        if params.get("key").map(String::as_str) != Some("test") {
            return Json(json!({ "status": "REQUEST_DENIED", "error_message": "bad key", "results": [] }));
        }
        assert_eq!(params["type"], "restaurant");
        if params["radius"] == "0" {
            return Json(json!({ "status": "INVALID_REQUEST", "results": [] }));
        }
        Json(json!({
            "status": "OK",
            "results": [
                {
                    "place_id": "far",
                    "name": "Far Diner",
                    "vicinity": "9 Long Rd",
                    "geometry": { "location": { "lat": 40.0, "lng": -73.9 } },
                },
                {
                    "place_id": "near",
                    "name": "Near Noodles",
                    "vicinity": "1 Main St",
                    "rating": 4.6,
                    "price_level": 2,
                    "geometry": { "location": { "lat": 40.7129, "lng": -74.0061 } },
                    "photos": [{ "photo_reference": "ref1" }],
                    "opening_hours": { "open_now": true },
                },
            ],
        }))
    }

    async fn details(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        if params["place_id"] != "near" {
            return Json(json!({ "status": "NOT_FOUND" }));
        }
        Json(json!({
            "status": "OK",
            "result": {
                "place_id": "near",
                "name": "Near Noodles",
                "formatted_address": "1 Main St, Springfield",
                "formatted_phone_number": "555-0100",
                "rating": 4.6,
                "user_ratings_total": 120,
                "geometry": { "location": { "lat": 40.7129, "lng": -74.0061 } },
                "photos": [{ "photo_reference": "a" }, { "photo_reference": "b" }],
            },
        }))
    }

    async fn photo(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
        if params.get("key").map(String::as_str) != Some("test") {
            return (StatusCode::FORBIDDEN, [(header::CONTENT_TYPE, "text/plain")], Vec::new());
        }
        if params["photo_reference"] != "ref1" {
            return (StatusCode::NOT_FOUND, [(header::CONTENT_TYPE, "text/plain")], Vec::new());
        }
        assert_eq!(params["maxwidth"], "400");
        (StatusCode::OK, [(header::CONTENT_TYPE, "image/png")], vec![0x89, b'P', b'N', b'G'])
    }

    async fn client(key: &str) -> PlacesClient {
        let base = serve_mock(
            Router::new()
                .route("/nearbysearch/json", get(nearby))
                .route("/details/json", get(details))
                .route("/photo", get(photo)),
        )
        .await;
        PlacesClient::new(reqwest::Client::new(), &base, key, "https://picnik.test/")
    }

    #[tokio::test]
    async fn nearby_results_are_sorted_by_distance() {
        let places = client("test").await;
        let origin = Coordinates::new(40.7128, -74.0060);
        let restaurants = places.nearby_restaurants(origin, 1500).await.unwrap();

        let ids: Vec<_> = restaurants.iter().map(|r| r.place_id.0.as_str()).collect();
        assert_eq!(ids, ["near", "far"]);
        let near = &restaurants[0];
        assert!(near.distance_km < 0.05);
        assert!(near.distance.ends_with(" m"));
        assert_eq!(near.open_now, Some(true));
        assert_eq!(
            near.photo_url.as_deref(),
            Some("https://picnik.test/restaurants/photo/ref1")
        );
        assert_eq!(restaurants[1].address, "9 Long Rd");
    }

    #[tokio::test]
    async fn provider_errors_surface_as_upstream() {
        let places = client("wrong").await;
        let result = places.nearby_restaurants(Coordinates::new(0.0, 0.0), 100).await;
        assert!(matches!(result, Err(AppError::Upstream(_))));

        let unconfigured = client("").await;
        let result = unconfigured.nearby_restaurants(Coordinates::new(0.0, 0.0), 100).await;
        assert!(matches!(result, Err(AppError::Upstream(_))));
    }

    #[tokio::test]
    async fn rejected_nearby_search_is_upstream_not_missing() {
        let places = client("test").await;
        let result = places.nearby_restaurants(Coordinates::new(40.7128, -74.0060), 0).await;
        assert!(matches!(result, Err(AppError::Upstream(message)) if message.contains("INVALID_REQUEST")));
    }

    #[tokio::test]
    async fn photo_links_never_carry_the_key() {
        let places = client("test").await;
        let restaurants = places.nearby_restaurants(Coordinates::new(40.7128, -74.0060), 1500).await.unwrap();
        let details = places.place_details(&PlaceId("near".into())).await.unwrap();
        let links = restaurants
            .iter()
            .filter_map(|r| r.photo_url.clone())
            .chain(details.photo_urls);
        for link in links {
            assert!(!link.contains("key="), "{link}");
        }

        let (content_type, bytes) = places.photo("ref1", PHOTO_WIDTH).await.unwrap();
        assert_eq!(content_type, "image/png");
        assert_eq!(&bytes[..], b"\x89PNG");

        let missing = places.photo("gone", PHOTO_WIDTH).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
        let denied = client("wrong").await.photo("ref1", PHOTO_WIDTH).await;
        assert!(matches!(denied, Err(AppError::Upstream(_))));
    }

    #[tokio::test]
    async fn details_map_every_photo() {
        let places = client("test").await;
        let details = places.place_details(&PlaceId("near".into())).await.unwrap();
        assert_eq!(details.address, "1 Main St, Springfield");
        assert_eq!(details.phone.as_deref(), Some("555-0100"));
        assert_eq!(
            details.photo_urls,
            ["https://picnik.test/restaurants/photo/a", "https://picnik.test/restaurants/photo/b"]
        );
        assert_eq!(details.total_ratings, Some(120));

        let missing = places.place_details(&PlaceId("nope".into())).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }
}
