use chrono::{Datelike, NaiveDate};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct State {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewState {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Station {
    pub code: String,
    pub state_code: String,
    pub city: String,
    pub location: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Station {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }

    pub fn is_geocoded(&self) -> bool {
        self.coordinates().is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewStation {
    pub code: String,
    pub state_code: String,
    pub city: String,
    pub location: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct WeatherRecord {
    pub id: i64,
    pub precipitation: Option<f64>,
    pub avg_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub min_temp: Option<f64>,
    pub wind_direction: Option<f64>,
    pub wind_speed: Option<f64>,
    pub date: NaiveDate,
    pub year: i32,
    pub month: i32,
    pub week_of: i32,
    pub station_code: String,
    pub state_code: String,
}

/// Measurements of one weather record, each independently missing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurements {
    pub precipitation: Option<f64>,
    pub avg_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub min_temp: Option<f64>,
    pub wind_direction: Option<f64>,
    pub wind_speed: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct NewWeatherRecord {
    pub measurements: Measurements,
    pub date: NaiveDate,
    pub year: i32,
    pub month: i32,
    pub week_of: i32,
    pub station_code: String,
    pub state_code: String,
}

/// Outcome of writing one batch of parsed rows
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub states_created: usize,
    pub stations_created: usize,
    pub records_inserted: usize,
    /// Rows whose state disagreed with the already stored station
    pub state_mismatches: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TableCounts {
    pub states: i64,
    pub stations: i64,
    pub weather_records: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct StateGeocodingStatus {
    pub code: String,
    pub name: String,
    pub total_stations: i64,
    pub geocoded_stations: i64,
}

/// Referential and denormalization health of the store
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub counts: TableCounts,
    pub stations_without_state: i64,
    pub records_without_station: i64,
    /// Records whose `state_code` differs from their station's
    pub records_with_state_mismatch: i64,
    pub stations_with_partial_coordinates: i64,
    pub geocoding: Vec<StateGeocodingStatus>,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.stations_without_state == 0
            && self.records_without_station == 0
            && self.records_with_state_mismatch == 0
            && self.stations_with_partial_coordinates == 0
    }
}

impl NewWeatherRecord {
    /// Build a record, deriving year, month and week of year from `date`
    ///
    /// `week_of` counts 7-day blocks from January 1st (1..=53), so it always
    /// belongs to the same calendar year as `year`.
    pub fn new(
        measurements: Measurements,
        date: NaiveDate,
        station_code: String,
        state_code: String,
    ) -> Self {
        Self {
            measurements,
            date,
            year: date.year(),
            month: date.month() as i32,
            week_of: week_of_year(date),
            station_code,
            state_code,
        }
    }
}

/// One validated CSV row, before its entities are resolved against the store
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub state: NewState,
    pub station: NewStation,
    pub measurements: Measurements,
    pub date: NaiveDate,
}

/// Week of the calendar year, with week 1 starting on January 1st
pub fn week_of_year(date: NaiveDate) -> i32 {
    (date.ordinal0() / 7 + 1) as i32
}
