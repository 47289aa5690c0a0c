use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use weather_pipeline::config::DatabaseConfig;
use weather_pipeline::db::models::{Coordinates, NewState, NewStation};
use weather_pipeline::db::Repository;
use weather_pipeline::enrichment::Enricher;
use weather_pipeline::error::{AppError, Result};
use weather_pipeline::geocoder::Geocoder;

/// Deterministic stand-in for the geocoding service
#[derive(Default)]
struct StubGeocoder {
    known: HashMap<String, Coordinates>,
    failing: Vec<String>,
    rate_limited: Vec<String>,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl StubGeocoder {
    fn with_place(mut self, query: &str, latitude: f64, longitude: f64) -> Self {
        self.known.insert(
            query.to_string(),
            Coordinates {
                latitude,
                longitude,
            },
        );
        self
    }

    fn failing_on(mut self, query: &str) -> Self {
        self.failing.push(query.to_string());
        self
    }

    fn rate_limited_on(mut self, query: &str) -> Self {
        self.rate_limited.push(query.to_string());
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Geocoder for &StubGeocoder {
    async fn resolve(&self, query: &str) -> Result<Option<Coordinates>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());

        if self.rate_limited.iter().any(|q| q == query) {
            return Err(AppError::RateLimited {
                status: 429,
                retry_after: None,
            });
        }
        if self.failing.iter().any(|q| q == query) {
            return Err(AppError::Geocoding("connection reset".to_string()));
        }
        Ok(self.known.get(query).copied())
    }
}

async fn setup(dir: &TempDir) -> Arc<Repository> {
    let config = DatabaseConfig {
        path: dir.path().join("weather.db"),
        max_connections: 1,
        create_if_missing: true,
    };
    let repo = Repository::connect(&config)
        .await
        .expect("Failed to open database");
    repo.run_migrations().await.expect("Migrations failed");

    repo.get_or_create_state(&NewState {
        code: "AL".to_string(),
        name: "Alabama".to_string(),
    })
    .await
    .unwrap();
    repo.get_or_create_state(&NewState {
        code: "GA".to_string(),
        name: "Georgia".to_string(),
    })
    .await
    .unwrap();

    for (code, state, city) in [
        ("BHM", "AL", "Birmingham"),
        ("HSV", "AL", "Huntsville"),
        ("MOB", "AL", "Mobile"),
        ("ATL", "GA", "Atlanta"),
    ] {
        repo.get_or_create_station(&NewStation {
            code: code.to_string(),
            state_code: state.to_string(),
            city: city.to_string(),
            location: format!("{}, {}", city, state),
        })
        .await
        .unwrap();
    }

    Arc::new(repo)
}

fn alabama_geocoder() -> StubGeocoder {
    StubGeocoder::default()
        .with_place("Birmingham, Alabama", 33.52, -86.80)
        .with_place("Huntsville, Alabama", 34.73, -86.59)
        .with_place("Mobile, Alabama", 30.69, -88.04)
}

/// All stations of the target state get coordinates; other states are untouched
#[tokio::test]
async fn test_geocodes_target_state_only() {
    let dir = TempDir::new().unwrap();
    let repo = setup(&dir).await;
    let geocoder = alabama_geocoder();

    let summary = Enricher::new(Arc::clone(&repo), &geocoder)
        .run("AL")
        .await
        .expect("Geocoding failed");

    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.geocoded, 3);
    assert!(summary.failures.is_empty());
    assert!(summary.is_complete());
    assert_eq!(summary.not_attempted, 0);

    let hsv = repo.get_station("HSV").await.unwrap().unwrap();
    assert_eq!(hsv.latitude, Some(34.73));
    assert_eq!(hsv.longitude, Some(-86.59));

    let atl = repo.get_station("ATL").await.unwrap().unwrap();
    assert!(!atl.is_geocoded());

    let queries = geocoder.queries.lock().unwrap().clone();
    assert_eq!(
        queries,
        vec!["Birmingham, Alabama", "Huntsville, Alabama", "Mobile, Alabama"]
    );
}

/// A second run finds nothing left to look up
#[tokio::test]
async fn test_second_run_makes_no_lookups() {
    let dir = TempDir::new().unwrap();
    let repo = setup(&dir).await;

    let first = alabama_geocoder();
    Enricher::new(Arc::clone(&repo), &first)
        .run("AL")
        .await
        .unwrap();
    assert_eq!(first.calls(), 3);

    let second = alabama_geocoder();
    let summary = Enricher::new(Arc::clone(&repo), &second)
        .run("al")
        .await
        .unwrap();

    assert_eq!(second.calls(), 0);
    assert_eq!(summary.candidates, 0);
    assert_eq!(summary.geocoded, 0);
}

/// One failing lookup leaves only that station without coordinates
#[tokio::test]
async fn test_single_failure_is_isolated() {
    let dir = TempDir::new().unwrap();
    let repo = setup(&dir).await;
    let geocoder = alabama_geocoder().failing_on("Huntsville, Alabama");

    let summary = Enricher::new(Arc::clone(&repo), &geocoder)
        .run("AL")
        .await
        .expect("A single failure must not abort the run");

    assert_eq!(summary.geocoded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].station_code, "HSV");
    assert_eq!(geocoder.calls(), 3);

    let hsv = repo.get_station("HSV").await.unwrap().unwrap();
    assert_eq!(hsv.latitude, None);
    assert_eq!(hsv.longitude, None);
    assert!(repo.get_station("BHM").await.unwrap().unwrap().is_geocoded());
    assert!(repo.get_station("MOB").await.unwrap().unwrap().is_geocoded());

    // The failed station is picked up again on the next run
    let retry = alabama_geocoder();
    let summary = Enricher::new(Arc::clone(&repo), &retry)
        .run("AL")
        .await
        .unwrap();
    assert_eq!(retry.calls(), 1);
    assert_eq!(summary.geocoded, 1);
}

/// "No match" is recorded separately from errors
#[tokio::test]
async fn test_no_match_is_reported() {
    let dir = TempDir::new().unwrap();
    let repo = setup(&dir).await;
    let geocoder = StubGeocoder::default()
        .with_place("Birmingham, Alabama", 33.52, -86.80)
        .with_place("Huntsville, Alabama", 34.73, -86.59);

    let summary = Enricher::new(Arc::clone(&repo), &geocoder)
        .run("AL")
        .await
        .unwrap();

    assert_eq!(summary.geocoded, 2);
    assert_eq!(summary.not_found, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.failures[0].station_code, "MOB");
    assert_eq!(summary.failures[0].reason, "no match");
}

/// Rate limiting stops the run without marking the station as unresolvable
#[tokio::test]
async fn test_rate_limit_stops_run() {
    let dir = TempDir::new().unwrap();
    let repo = setup(&dir).await;
    let geocoder = alabama_geocoder().rate_limited_on("Huntsville, Alabama");

    let summary = Enricher::new(Arc::clone(&repo), &geocoder)
        .run("AL")
        .await
        .expect("Rate limiting returns the partial summary");

    assert!(!summary.is_complete());
    assert!(matches!(
        summary.rate_limited,
        Some(AppError::RateLimited { status: 429, .. })
    ));
    // BHM was done before the limit hit, MOB was never attempted
    assert_eq!(geocoder.calls(), 2);
    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.geocoded, 1);
    assert_eq!(summary.not_found, 0);
    assert_eq!(summary.failed, 0);
    assert!(summary.failures.is_empty());
    assert_eq!(summary.not_attempted, 2);
    assert!(repo.get_station("BHM").await.unwrap().unwrap().is_geocoded());

    let remaining: Vec<String> = repo
        .find_ungeocoded("AL")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.code)
        .collect();
    assert_eq!(remaining, vec!["HSV", "MOB"]);
}

/// Misses gathered before a rate limit are still reported
#[tokio::test]
async fn test_rate_limit_keeps_earlier_failures() {
    let dir = TempDir::new().unwrap();
    let repo = setup(&dir).await;
    let geocoder = StubGeocoder::default()
        .failing_on("Birmingham, Alabama")
        .with_place("Huntsville, Alabama", 34.73, -86.59)
        .rate_limited_on("Mobile, Alabama");

    let summary = Enricher::new(Arc::clone(&repo), &geocoder)
        .run("AL")
        .await
        .unwrap();

    assert!(summary.rate_limited.is_some());
    assert_eq!(summary.geocoded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].station_code, "BHM");
    assert_eq!(summary.not_attempted, 1);
}

/// Unknown states are a setup error
#[tokio::test]
async fn test_unknown_state() {
    let dir = TempDir::new().unwrap();
    let repo = setup(&dir).await;
    let geocoder = alabama_geocoder();

    let result = Enricher::new(repo, &geocoder).run("TX").await;

    assert!(matches!(result, Err(AppError::NotFound(_))));
    assert_eq!(geocoder.calls(), 0);
}
