use crate::config::DatabaseConfig;
use crate::db::models::{
    BatchResult, Coordinates, IntegrityReport, NewState, NewStation, NewWeatherRecord,
    PendingRecord, State, StateGeocodingStatus, Station, TableCounts,
};
use crate::error::{AppError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Rows per multi-row INSERT; 12 binds each keeps well under SQLite's variable limit
const INSERT_CHUNK_SIZE: usize = 500;

pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (and optionally create) the SQLite file with foreign keys enforced
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if config.create_if_missing {
            if let Some(parent) = config.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(config.create_if_missing)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        debug!("Opened SQLite database at {}", config.path.display());
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Insert the state if its code is unknown, otherwise return the stored row untouched
    pub async fn get_or_create_state(&self, state: &NewState) -> Result<State> {
        let mut conn = self.pool.acquire().await?;
        let (state, _) = upsert_state(&mut conn, state).await?;
        Ok(state)
    }

    /// Insert the station if its code is unknown, otherwise return the stored row untouched
    ///
    /// The referenced state must already exist.
    pub async fn get_or_create_station(&self, station: &NewStation) -> Result<Station> {
        let mut conn = self.pool.acquire().await?;
        let (station, _) = upsert_station(&mut conn, station).await?;
        Ok(station)
    }

    pub async fn get_state(&self, code: &str) -> Result<Option<State>> {
        let state = sqlx::query_as::<_, State>("SELECT code, name FROM states WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;

        Ok(state)
    }

    pub async fn get_station(&self, code: &str) -> Result<Option<Station>> {
        let station = sqlx::query_as::<_, Station>(
            "SELECT code, state_code, city, location, latitude, longitude \
             FROM stations WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(station)
    }

    pub async fn list_stations(&self, state_code: &str) -> Result<Vec<Station>> {
        let stations = sqlx::query_as::<_, Station>(
            "SELECT code, state_code, city, location, latitude, longitude \
             FROM stations WHERE state_code = ? ORDER BY code",
        )
        .bind(state_code)
        .fetch_all(&self.pool)
        .await?;

        Ok(stations)
    }

    /// Stations of a state still missing either coordinate, ordered by code
    pub async fn find_ungeocoded(&self, state_code: &str) -> Result<Vec<Station>> {
        let stations = sqlx::query_as::<_, Station>(
            r#"
            SELECT code, state_code, city, location, latitude, longitude
            FROM stations
            WHERE state_code = ? AND (latitude IS NULL OR longitude IS NULL)
            ORDER BY code
            "#,
        )
        .bind(state_code)
        .fetch_all(&self.pool)
        .await?;

        Ok(stations)
    }

    /// Write both coordinates of a station in one statement
    pub async fn update_coordinates(&self, station_code: &str, coordinates: Coordinates) -> Result<()> {
        let result = sqlx::query("UPDATE stations SET latitude = ?, longitude = ? WHERE code = ?")
            .bind(coordinates.latitude)
            .bind(coordinates.longitude)
            .bind(station_code)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("station '{}'", station_code)));
        }

        Ok(())
    }

    /// Insert weather records in a single transaction
    ///
    /// Records are always inserted, never deduplicated.
    pub async fn insert_weather_records(&self, records: &[NewWeatherRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let inserted = insert_records(&mut tx, records).await?;
        tx.commit().await?;

        Ok(inserted)
    }

    /// Resolve the states and stations of a batch of rows and insert one record per row
    ///
    /// Everything happens in one transaction, so a failure leaves no partially
    /// written batch behind. The weather record always takes the state of the
    /// stored station, even when the row claims a different one.
    pub async fn write_batch(&self, rows: &[PendingRecord]) -> Result<BatchResult> {
        let mut result = BatchResult::default();
        if rows.is_empty() {
            return Ok(result);
        }

        let mut tx = self.pool.begin().await?;

        let mut known_states: HashSet<String> = HashSet::new();
        let mut station_states: HashMap<String, String> = HashMap::new();
        let mut mismatched_stations: HashSet<String> = HashSet::new();
        let mut records = Vec::with_capacity(rows.len());

        for row in rows {
            if !known_states.contains(&row.state.code) {
                let (_, created) = upsert_state(&mut tx, &row.state).await?;
                if created {
                    result.states_created += 1;
                }
                known_states.insert(row.state.code.clone());
            }

            let station_state = match station_states.get(&row.station.code) {
                Some(state_code) => state_code.clone(),
                None => {
                    let (station, created) = upsert_station(&mut tx, &row.station).await?;
                    if created {
                        result.stations_created += 1;
                    }
                    station_states.insert(station.code.clone(), station.state_code.clone());
                    station.state_code
                }
            };

            if station_state != row.state.code {
                result.state_mismatches += 1;
                if mismatched_stations.insert(row.station.code.clone()) {
                    warn!(
                        "Station {} is stored under state {} but the input row says {}; keeping {}",
                        row.station.code, station_state, row.state.code, station_state
                    );
                }
            }

            records.push(NewWeatherRecord::new(
                row.measurements.clone(),
                row.date,
                row.station.code.clone(),
                station_state,
            ));
        }

        result.records_inserted = insert_records(&mut tx, &records).await?;
        tx.commit().await?;

        Ok(result)
    }

    pub async fn table_counts(&self) -> Result<TableCounts> {
        let (states, stations, weather_records) = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM states),
                (SELECT COUNT(*) FROM stations),
                (SELECT COUNT(*) FROM weather_records)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TableCounts {
            states,
            stations,
            weather_records,
        })
    }

    /// Check referential integrity, denormalized state codes and coordinate pairs
    pub async fn integrity_report(&self) -> Result<IntegrityReport> {
        let counts = self.table_counts().await?;

        let stations_without_state = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM stations st
            LEFT JOIN states s ON s.code = st.state_code
            WHERE s.code IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let records_without_station = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM weather_records wr
            LEFT JOIN stations st ON st.code = wr.station_code
            WHERE st.code IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let records_with_state_mismatch = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM weather_records wr
            JOIN stations st ON st.code = wr.station_code
            WHERE wr.state_code <> st.state_code
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let stations_with_partial_coordinates = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM stations WHERE (latitude IS NULL) <> (longitude IS NULL)",
        )
        .fetch_one(&self.pool)
        .await?;

        let geocoding = sqlx::query_as::<_, StateGeocodingStatus>(
            r#"
            SELECT
                s.code AS code,
                s.name AS name,
                COUNT(st.code) AS total_stations,
                COUNT(CASE WHEN st.latitude IS NOT NULL AND st.longitude IS NOT NULL THEN 1 END)
                    AS geocoded_stations
            FROM states s
            LEFT JOIN stations st ON st.state_code = s.code
            GROUP BY s.code, s.name
            ORDER BY s.code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(IntegrityReport {
            counts,
            stations_without_state,
            records_without_station,
            records_with_state_mismatch,
            stations_with_partial_coordinates,
            geocoding,
        })
    }
}

/// Returns the stored state and whether this call created it
async fn upsert_state(conn: &mut SqliteConnection, state: &NewState) -> Result<(State, bool)> {
    let inserted = sqlx::query("INSERT INTO states (code, name) VALUES (?, ?) ON CONFLICT (code) DO NOTHING")
        .bind(&state.code)
        .bind(&state.name)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    let stored = sqlx::query_as::<_, State>("SELECT code, name FROM states WHERE code = ?")
        .bind(&state.code)
        .fetch_one(&mut *conn)
        .await?;

    if inserted > 0 {
        debug!("Created state {} ({})", stored.code, stored.name);
    }

    Ok((stored, inserted > 0))
}

/// Returns the stored station and whether this call created it
async fn upsert_station(
    conn: &mut SqliteConnection,
    station: &NewStation,
) -> Result<(Station, bool)> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO stations (code, state_code, city, location)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (code) DO NOTHING
        "#,
    )
    .bind(&station.code)
    .bind(&station.state_code)
    .bind(&station.city)
    .bind(&station.location)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    let stored = sqlx::query_as::<_, Station>(
        "SELECT code, state_code, city, location, latitude, longitude FROM stations WHERE code = ?",
    )
    .bind(&station.code)
    .fetch_one(&mut *conn)
    .await?;

    if inserted > 0 {
        debug!("Created station {} in {}", stored.code, stored.state_code);
    }

    Ok((stored, inserted > 0))
}

async fn insert_records(conn: &mut SqliteConnection, records: &[NewWeatherRecord]) -> Result<usize> {
    let mut total = 0;

    for (chunk_idx, chunk) in records.chunks(INSERT_CHUNK_SIZE).enumerate() {
        debug!(
            "Inserting chunk {}/{} ({} weather records)",
            chunk_idx + 1,
            records.len().div_ceil(INSERT_CHUNK_SIZE),
            chunk.len()
        );

        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO weather_records (
                precipitation, avg_temp, max_temp, min_temp, wind_direction, wind_speed,
                date, year, month, week_of, station_code, state_code
            ) ",
        );

        query_builder.push_values(chunk, |mut b, record| {
            let m = &record.measurements;
            b.push_bind(m.precipitation)
                .push_bind(m.avg_temp)
                .push_bind(m.max_temp)
                .push_bind(m.min_temp)
                .push_bind(m.wind_direction)
                .push_bind(m.wind_speed)
                .push_bind(record.date)
                .push_bind(record.year)
                .push_bind(record.month)
                .push_bind(record.week_of)
                .push_bind(&record.station_code)
                .push_bind(&record.state_code);
        });

        let result = query_builder.build().execute(&mut *conn).await?;
        total += result.rows_affected() as usize;
    }

    Ok(total)
}
