use crate::config::GeocoderConfig;
use crate::db::models::Coordinates;
use crate::error::{AppError, Result};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Upper bound for honoring a server-provided `Retry-After`
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Upper bound for the exponential backoff between retries
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Resolves free-text place descriptions to coordinates
///
/// `Ok(None)` means the service answered but knows no such place.
/// Errors are reserved for failed lookups; rate limiting is reported as
/// [`AppError::RateLimited`] so it is never mistaken for a missing place.
pub trait Geocoder {
    fn resolve(&self, query: &str) -> impl Future<Output = Result<Option<Coordinates>>> + Send;
}

/// Client for the OpenStreetMap Nominatim search API
///
/// Requests are serialized and spaced at least `request_delay` apart,
/// regardless of how many callers share the client.
pub struct NominatimGeocoder {
    client: Client,
    base_url: String,
    request_delay: Duration,
    max_retries: u32,
    last_request: Mutex<Option<Instant>>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocoderConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_delay: Duration::from_millis(config.request_delay_ms),
            max_retries: config.max_retries,
            last_request: Mutex::new(None),
        })
    }

    async fn search(&self, query: &str) -> Result<Option<Coordinates>> {
        // Holding the lock across the request keeps lookups strictly sequential
        let mut last_request = self.last_request.lock().await;
        if let Some(previous) = *last_request {
            let elapsed = previous.elapsed();
            if elapsed < self.request_delay {
                tokio::time::sleep(self.request_delay - elapsed).await;
            }
        }
        *last_request = Some(Instant::now());

        let url = format!("{}/search", self.base_url);
        debug!("Geocoding '{}' via {}", query, url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("q", query),
                ("format", "jsonv2"),
                ("limit", "1"),
                ("countrycodes", "us"),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AppError::RateLimited {
                status: status.as_u16(),
                retry_after,
            });
        }

        let response = response.error_for_status()?;
        let results: Vec<SearchResult> = response.json().await?;

        best_match(&results)
    }
}

impl Geocoder for NominatimGeocoder {
    async fn resolve(&self, query: &str) -> Result<Option<Coordinates>> {
        let mut retries = 0;
        loop {
            match self.search(query).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    retries += 1;

                    if retries > self.max_retries || !is_transient(&e) {
                        return Err(e);
                    }

                    let delay = match &e {
                        AppError::RateLimited {
                            retry_after: Some(after),
                            ..
                        } => (*after).min(MAX_RETRY_AFTER),
                        _ => backoff_delay(retries),
                    };
                    warn!(
                        "Geocoding '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        query, retries, self.max_retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// `2^(attempt-1)` seconds, capped at [`MAX_BACKOFF`]
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Whether a failed lookup is worth retrying
fn is_transient(error: &AppError) -> bool {
    match error {
        // Retry on connection errors, timeouts, server errors (5xx)
        AppError::Http(reqwest_err) => {
            reqwest_err.is_timeout()
                || reqwest_err.is_connect()
                || reqwest_err
                    .status()
                    .map(|s| s.is_server_error())
                    .unwrap_or(false)
        }
        AppError::RateLimited { .. } => true,
        _ => false,
    }
}

/// Nominatim orders results by rank; with `limit=1` the first one is the best match
fn best_match(results: &[SearchResult]) -> Result<Option<Coordinates>> {
    let Some(first) = results.first() else {
        return Ok(None);
    };

    let latitude = first.lat.parse::<f64>().map_err(|_| {
        AppError::Geocoding(format!("invalid latitude '{}' in response", first.lat))
    })?;
    let longitude = first.lon.parse::<f64>().map_err(|_| {
        AppError::Geocoding(format!("invalid longitude '{}' in response", first.lon))
    })?;

    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(AppError::Geocoding(format!(
            "coordinates out of range: ({}, {})",
            latitude, longitude
        )));
    }

    if let Some(name) = &first.display_name {
        debug!("Best match: {}", name);
    }

    Ok(Some(Coordinates {
        latitude,
        longitude,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(lat: &str, lon: &str) -> SearchResult {
        SearchResult {
            lat: lat.to_string(),
            lon: lon.to_string(),
            display_name: None,
        }
    }

    #[test]
    fn test_best_match_takes_first_result() {
        let results = vec![result("34.7304", "-86.5861"), result("40.0", "-90.0")];
        let coords = best_match(&results).unwrap().unwrap();
        assert_eq!(coords.latitude, 34.7304);
        assert_eq!(coords.longitude, -86.5861);
    }

    #[test]
    fn test_best_match_empty_is_none() {
        assert_eq!(best_match(&[]).unwrap(), None);
    }

    #[test]
    fn test_best_match_rejects_garbage() {
        assert!(best_match(&[result("north", "-86.5")]).is_err());
        assert!(best_match(&[result("134.0", "-86.5")]).is_err());
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(7), MAX_BACKOFF);
        assert_eq!(backoff_delay(65), MAX_BACKOFF);
        assert_eq!(backoff_delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_rate_limit_is_transient_but_not_parse_errors() {
        let limited = AppError::RateLimited {
            status: 429,
            retry_after: None,
        };
        assert!(is_transient(&limited));
        assert!(!is_transient(&AppError::Geocoding("bad".to_string())));
    }
}
