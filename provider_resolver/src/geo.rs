use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::common::truncate_for_log;
use crate::error::GeocodeError;
use crate::model::{Address, GeoPoint};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub fn normalize_zip5(s: &str) -> Option<String> {
    let mut digits = String::with_capacity(5);
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 5 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.len() == 5 {
        Some(digits)
    } else {
        None
    }
}

/// Great-circle distance in metres (haversine).
pub fn distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlng / 2.0).sin().powi(2);

    EARTH_RADIUS_M * 2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Lat/lng window that contains every point within `radius_m` of `center`.
/// The longitude range is `None` when the window would wrap the antimeridian
/// or reach a pole.
pub fn bounding_box(center: GeoPoint, radius_m: f64) -> ((f64, f64), Option<(f64, f64)>) {
    // Padded slightly so float error never drops a point on the boundary.
    let angular = radius_m / EARTH_RADIUS_M;
    let dlat = angular.to_degrees() * 1.001;
    let lat_range = (center.lat - dlat, center.lat + dlat);

    let cos_lat = center.lat.to_radians().cos();
    if cos_lat < 1e-6 || lat_range.0 <= -90.0 || lat_range.1 >= 90.0 {
        return (lat_range, None);
    }
    let ratio = angular.sin() / cos_lat;
    if ratio >= 1.0 {
        return (lat_range, None);
    }
    let dlng = ratio.asin().to_degrees() * 1.001;
    let lng_range = (center.lng - dlng, center.lng + dlng);
    if lng_range.0 < -180.0 || lng_range.1 > 180.0 {
        return (lat_range, None);
    }
    (lat_range, Some(lng_range))
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` when the service has no result for the address.
    async fn geocode(&self, address: &Address) -> Result<Option<GeoPoint>, GeocodeError>;
}

/// Used when no geocoding key is configured: locations are kept without
/// coordinates and never show up in proximity searches.
#[derive(Debug, Default, Clone)]
pub struct NoGeocoder;

#[async_trait]
impl Geocoder for NoGeocoder {
    async fn geocode(&self, _address: &Address) -> Result<Option<GeoPoint>, GeocodeError> {
        Ok(None)
    }
}

#[derive(Clone)]
pub struct GoogleGeocoder {
    client: Client,
    api_url: String,
    api_key: String,
}

impl GoogleGeocoder {
    pub fn new(client: Client, api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn geocode(&self, address: &Address) -> Result<Option<GeoPoint>, GeocodeError> {
        let one_line = address.one_line();
        debug!(address = %one_line, "Geocoding address");

        let response = self
            .client
            .get(&self.api_url)
            .query(&[("address", one_line.as_str()), ("key", self.api_key.as_str())])
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| GeocodeError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GeocodeError::Unavailable(format!(
                "status {status}: {}",
                truncate_for_log(&body)
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GeocodeError::Unavailable(format!("invalid JSON: {e}")))?;
        parse_geocode_response(&body)
    }
}

pub fn parse_geocode_response(body: &Value) -> Result<Option<GeoPoint>, GeocodeError> {
    let status = body.get("status").and_then(Value::as_str).unwrap_or("OK");
    match status {
        "OK" => {}
        "ZERO_RESULTS" => return Ok(None),
        "REQUEST_DENIED" | "INVALID_REQUEST" => {
            let message = body
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or(status);
            return Err(GeocodeError::Rejected(message.to_string()));
        }
        other => return Err(GeocodeError::Unavailable(other.to_string())),
    }

    let location = body
        .get("results")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
        .and_then(|r| r.pointer("/geometry/location"));
    let Some(location) = location else {
        return Ok(None);
    };

    let lat = location.get("lat").and_then(Value::as_f64);
    let lng = location.get("lng").and_then(Value::as_f64);
    match (lat, lng) {
        (Some(lat), Some(lng)) => Ok(Some(GeoPoint { lat, lng })),
        _ => {
            warn!("Geocoding result without numeric coordinates");
            Ok(None)
        }
    }
}
