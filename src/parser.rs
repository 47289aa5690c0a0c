use crate::config::{MalformedFieldPolicy, StateFilter};
use crate::db::models::{Measurements, NewState, NewStation, PendingRecord};
use crate::error::{AppError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const MISSING_MARKERS: [&str; 4] = ["nan", "na", "null", "none"];

/// A CSV row as written by the binary-to-CSV export step
///
/// Every column is optional; validation happens in [`CsvParser`].
/// `year`, `month` and `week_of` columns may be present but are ignored,
/// those values are always derived from `date`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRow {
    #[serde(alias = "code")]
    station_code: Option<String>,
    state_code: Option<String>,
    #[serde(rename = "state")]
    state_name: Option<String>,
    city: Option<String>,
    location: Option<String>,
    #[serde(alias = "date_full")]
    date: Option<String>,
    precipitation: Option<String>,
    avg_temp: Option<String>,
    max_temp: Option<String>,
    min_temp: Option<String>,
    wind_direction: Option<String>,
    wind_speed: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub total_rows: usize,
    pub parsed_successfully: usize,
    pub rows_skipped: usize,
    /// Rows dropped because their state is outside the configured filter
    pub rows_filtered: usize,
    /// Non-numeric measurements stored as NULL
    pub fields_nulled: usize,
    pub failure_rate: f64,
}

impl ParseStats {
    pub fn finalize(&mut self) {
        let considered = self.total_rows - self.rows_filtered;
        self.failure_rate = if considered > 0 {
            self.rows_skipped as f64 / considered as f64
        } else {
            0.0
        };
    }
}

pub struct CsvParser {
    policy: MalformedFieldPolicy,
    filter: StateFilter,
}

impl CsvParser {
    pub fn new(policy: MalformedFieldPolicy) -> Self {
        Self {
            policy,
            filter: StateFilter::default(),
        }
    }

    pub fn with_state_filter(mut self, filter: StateFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Parse a weather-records CSV file
    ///
    /// A missing file is reported as [`AppError::InputNotFound`]; bad rows
    /// never fail the parse, they are counted in [`ParseStats`].
    pub fn parse_path(&self, path: &Path) -> Result<(Vec<PendingRecord>, ParseStats)> {
        let file = std::fs::File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::InputNotFound(path.to_path_buf()),
            _ => AppError::Io(e),
        })?;
        self.parse_reader(file)
    }

    pub fn parse_reader<R: Read>(&self, reader: R) -> Result<(Vec<PendingRecord>, ParseStats)> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        // An unreadable header means the file is not a weather CSV at all
        let headers = rdr.headers()?.clone();
        if !headers.iter().any(|h| h == "station_code" || h == "code") {
            return Err(AppError::InvalidData(
                "CSV header has no station_code (or code) column".to_string(),
            ));
        }

        let mut records = Vec::new();
        let mut stats = ParseStats::default();

        for (idx, result) in rdr.deserialize::<RawRow>().enumerate() {
            stats.total_rows += 1;
            // Header is line 1
            let line_num = idx + 2;

            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    stats.rows_skipped += 1;
                    warn!("Skipping unreadable CSV line {}: {}", line_num, e);
                    continue;
                }
            };

            match self.parse_row(raw) {
                Ok(RowOutcome::Parsed { record, nulled }) => {
                    stats.parsed_successfully += 1;
                    stats.fields_nulled += nulled;
                    records.push(record);
                }
                Ok(RowOutcome::Filtered) => {
                    stats.rows_filtered += 1;
                }
                Err(e) => {
                    stats.rows_skipped += 1;
                    warn!(
                        "Skipping CSV line {} (skip {}/{}): {}",
                        line_num, stats.rows_skipped, stats.total_rows, e
                    );
                }
            }
        }

        stats.finalize();
        Ok((records, stats))
    }

    fn parse_row(&self, raw: RawRow) -> Result<RowOutcome> {
        let station_code = non_blank(raw.station_code)
            .ok_or_else(|| AppError::Parse("missing station code".to_string()))?;

        let city = non_blank(raw.city).unwrap_or_default();
        let location = non_blank(raw.location).unwrap_or_default();
        let state_name = non_blank(raw.state_name);

        let state = resolve_state(non_blank(raw.state_code), &location, state_name)?;
        if !self.filter.matches(&state.code) {
            return Ok(RowOutcome::Filtered);
        }

        let date_text = non_blank(raw.date)
            .ok_or_else(|| AppError::Parse(format!("station {}: missing date", station_code)))?;
        let date = parse_date(&date_text)?;

        let mut nulled = 0;
        let mut measurement = |name: &str, value: Option<String>| -> Result<Option<f64>> {
            match parse_measurement(value.as_deref()) {
                Ok(v) => Ok(v),
                Err(e) => match self.policy {
                    MalformedFieldPolicy::SetNull => {
                        debug!("Station {} on {}: {} set to NULL ({})", station_code, date, name, e);
                        nulled += 1;
                        Ok(None)
                    }
                    MalformedFieldPolicy::SkipRow => Err(AppError::Parse(format!(
                        "station {} on {}: {} {}",
                        station_code, date, name, e
                    ))),
                },
            }
        };

        let measurements = Measurements {
            precipitation: measurement("precipitation", raw.precipitation)?,
            avg_temp: measurement("avg_temp", raw.avg_temp)?,
            max_temp: measurement("max_temp", raw.max_temp)?,
            min_temp: measurement("min_temp", raw.min_temp)?,
            wind_direction: measurement("wind_direction", raw.wind_direction)?,
            wind_speed: measurement("wind_speed", raw.wind_speed)?,
        };

        let station = NewStation {
            code: station_code,
            state_code: state.code.clone(),
            city,
            location,
        };

        Ok(RowOutcome::Parsed {
            record: PendingRecord {
                state,
                station,
                measurements,
                date,
            },
            nulled,
        })
    }
}

enum RowOutcome {
    Parsed { record: PendingRecord, nulled: usize },
    Filtered,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn is_state_code(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_uppercase())
}

/// Work out the state code and display name of a row
///
/// Code precedence: explicit `state_code` column, the `", XX"` suffix of the
/// location text, a `state` column that is itself a code, and finally the
/// first two letters of the state name.
fn resolve_state(
    state_code: Option<String>,
    location: &str,
    state_name: Option<String>,
) -> Result<NewState> {
    let from_location = location
        .rsplit_once(", ")
        .map(|(_, suffix)| suffix.trim())
        .filter(|suffix| is_state_code(suffix))
        .map(str::to_string);

    let (name, name_as_code) = match state_name {
        Some(n) if is_state_code(&n) => (None, Some(n)),
        other => (other, None),
    };

    let code = if let Some(code) = state_code {
        code.to_uppercase()
    } else if let Some(code) = from_location.or(name_as_code) {
        code
    } else if let Some(name) = &name {
        let fallback = name
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .take(2)
            .collect::<String>()
            .to_uppercase();
        if fallback.len() != 2 {
            return Err(AppError::Parse(format!(
                "cannot derive a state code from state name '{}'",
                name
            )));
        }
        warn!("Using fallback state code {} for {}", fallback, name);
        fallback
    } else {
        return Err(AppError::Parse("missing state".to_string()));
    };

    let name = name.unwrap_or_else(|| code.clone());
    Ok(NewState { code, name })
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Ok(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(datetime.date());
        }
    }
    Err(AppError::Parse(format!("unparseable date '{}'", s)))
}

/// Blank and NaN-like values are missing readings; anything else must be a finite number
fn parse_measurement(value: Option<&str>) -> std::result::Result<Option<f64>, String> {
    let Some(s) = value.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };

    if MISSING_MARKERS.iter().any(|m| s.eq_ignore_ascii_case(m)) {
        return Ok(None);
    }

    match s.replace(',', "").parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(format!("is not numeric: '{}'", s)),
    }
}
