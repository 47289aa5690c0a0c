use crate::db::models::{State, Station};
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::geocoder::Geocoder;
use crate::progress::ProgressReporter;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeFailure {
    pub station_code: String,
    pub query: String,
    pub reason: String,
}

/// End-of-run counters of a geocoding pass over one state
#[derive(Debug, Default)]
pub struct GeocodeSummary {
    pub state_code: String,
    pub candidates: usize,
    pub geocoded: usize,
    pub not_found: usize,
    pub failed: usize,
    pub failures: Vec<GeocodeFailure>,
    /// Candidates left untouched because the run stopped early
    pub not_attempted: usize,
    /// Set when the service rate-limited us and the run stopped
    pub rate_limited: Option<AppError>,
}

impl GeocodeSummary {
    pub fn is_complete(&self) -> bool {
        self.rate_limited.is_none()
    }
}

/// Fills in coordinates for the stations of one state
///
/// Only stations still lacking coordinates are looked up, and each result is
/// written as soon as it arrives, so an interrupted run can simply be repeated.
/// Rate limiting ends the run early; the returned summary then carries the
/// error in [`GeocodeSummary::rate_limited`] and nothing is counted as a miss.
pub struct Enricher<G> {
    repository: Arc<Repository>,
    geocoder: G,
    show_progress: bool,
}

impl<G: Geocoder> Enricher<G> {
    pub fn new(repository: Arc<Repository>, geocoder: G) -> Self {
        Self {
            repository,
            geocoder,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub async fn run(&self, state_code: &str) -> Result<GeocodeSummary> {
        let state_code = state_code.to_uppercase();
        let state = self
            .repository
            .get_state(&state_code)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "state '{}' is not in the database, load the CSV first",
                    state_code
                ))
            })?;

        let candidates = self.repository.find_ungeocoded(&state.code).await?;
        let mut summary = GeocodeSummary {
            state_code: state.code.clone(),
            candidates: candidates.len(),
            ..GeocodeSummary::default()
        };

        if candidates.is_empty() {
            info!("All stations in {} already have coordinates", state.name);
            return Ok(summary);
        }

        info!(
            "Geocoding {} stations in {} ({})",
            candidates.len(),
            state.name,
            state.code
        );

        let progress = if self.show_progress {
            ProgressReporter::new(
                candidates.len() as u64,
                &format!("Geocoding stations in {}", state.name),
            )
        } else {
            ProgressReporter::silent()
        };

        for (idx, station) in candidates.iter().enumerate() {
            let Some(query) = build_query(station, &state) else {
                warn!("Station {} has no city or location text, skipping", station.code);
                summary.failed += 1;
                summary.failures.push(GeocodeFailure {
                    station_code: station.code.clone(),
                    query: String::new(),
                    reason: "no city or location text".to_string(),
                });
                progress.increment(1);
                continue;
            };

            progress.set_message(&format!("Geocoding {}", query));

            match self.geocoder.resolve(&query).await {
                Ok(Some(coordinates)) => {
                    self.repository
                        .update_coordinates(&station.code, coordinates)
                        .await?;
                    summary.geocoded += 1;
                    info!(
                        "Geocoded {} '{}': ({}, {})",
                        station.code, query, coordinates.latitude, coordinates.longitude
                    );
                }
                Ok(None) => {
                    summary.not_found += 1;
                    warn!("No match for station {} '{}'", station.code, query);
                    summary.failures.push(GeocodeFailure {
                        station_code: station.code.clone(),
                        query,
                        reason: "no match".to_string(),
                    });
                }
                Err(e) if e.is_rate_limited() => {
                    progress.finish_with_message("Geocoding stopped: rate limited");
                    summary.not_attempted = candidates.len() - idx;
                    error!(
                        "Stopping at station {}: {}. {} geocoded, {} without match, {} failed, \
                         {} not attempted; re-run later to continue with the remaining ones",
                        station.code,
                        e,
                        summary.geocoded,
                        summary.not_found,
                        summary.failed,
                        summary.not_attempted
                    );
                    summary.rate_limited = Some(e);
                    return Ok(summary);
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!("Error geocoding station {} '{}': {}", station.code, query, e);
                    summary.failures.push(GeocodeFailure {
                        station_code: station.code.clone(),
                        query,
                        reason: e.to_string(),
                    });
                }
            }

            progress.increment(1);
        }

        progress.finish_with_message(&format!("Geocoding for {} complete", state.name));

        info!(
            "Geocoding for {} complete: {} of {} stations geocoded, {} without match, {} failed",
            state.code, summary.geocoded, summary.candidates, summary.not_found, summary.failed
        );

        Ok(summary)
    }
}

/// `"{city}, {state name}"`, falling back to the station's location text
pub fn build_query(station: &Station, state: &State) -> Option<String> {
    let city = station.city.trim();
    if !city.is_empty() {
        return Some(format!("{}, {}", city, state.name));
    }

    let location = station.location.trim();
    if !location.is_empty() {
        return Some(location.to_string());
    }

    None
}
