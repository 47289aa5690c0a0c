use crate::config::LoaderConfig;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::parser::CsvParser;
use crate::progress::ProgressReporter;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// End-of-run counters of a CSV load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSummary {
    pub rows_read: usize,
    pub rows_loaded: usize,
    pub rows_skipped: usize,
    pub rows_filtered: usize,
    pub fields_nulled: usize,
    pub states_created: usize,
    pub stations_created: usize,
    pub state_mismatches: usize,
    pub batches_committed: usize,
}

/// Loads a weather-records CSV into the normalized store
///
/// States and stations are created on first sight and never modified
/// afterwards. Every valid row becomes a new weather record, so loading the
/// same file twice duplicates the records but not the states or stations.
pub struct Loader {
    repository: Arc<Repository>,
    config: LoaderConfig,
    show_progress: bool,
}

impl Loader {
    pub fn new(repository: Arc<Repository>, config: LoaderConfig) -> Self {
        Self {
            repository,
            config,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub async fn load(&self, csv_path: &Path) -> Result<LoadSummary> {
        // Checked before anything touches the store
        if !csv_path.is_file() {
            return Err(AppError::InputNotFound(csv_path.to_path_buf()));
        }

        info!(
            "Loading {} (malformed measurements: {}, batch size: {})",
            csv_path.display(),
            self.config.malformed_fields,
            self.config.batch_size
        );
        if !self.config.states.is_empty() {
            info!("Restricting load to states: {:?}", self.config.states.states);
        }

        let parser = CsvParser::new(self.config.malformed_fields)
            .with_state_filter(self.config.states.clone());
        let (rows, parse_stats) = parser.parse_path(csv_path)?;

        info!(
            "Parsed {}: {} rows, {} valid, {} skipped, {} filtered, {} fields set to NULL ({:.1}% skipped)",
            csv_path.display(),
            parse_stats.total_rows,
            parse_stats.parsed_successfully,
            parse_stats.rows_skipped,
            parse_stats.rows_filtered,
            parse_stats.fields_nulled,
            parse_stats.failure_rate * 100.0
        );

        let mut summary = LoadSummary {
            rows_read: parse_stats.total_rows,
            rows_skipped: parse_stats.rows_skipped,
            rows_filtered: parse_stats.rows_filtered,
            fields_nulled: parse_stats.fields_nulled,
            ..LoadSummary::default()
        };

        if rows.is_empty() {
            warn!("No valid rows in {}, nothing to load", csv_path.display());
            return Ok(summary);
        }

        let batch_count = rows.len().div_ceil(self.config.batch_size);
        let progress = if self.show_progress {
            ProgressReporter::new(batch_count as u64, "Loading weather records")
        } else {
            ProgressReporter::silent()
        };

        for (batch_idx, batch) in rows.chunks(self.config.batch_size).enumerate() {
            // A failed batch is rolled back whole; earlier batches stay committed
            let result = self.repository.write_batch(batch).await.map_err(|e| {
                error!(
                    "Batch {}/{} failed after {} committed rows: {}",
                    batch_idx + 1,
                    batch_count,
                    summary.rows_loaded,
                    e
                );
                e
            })?;

            summary.rows_loaded += result.records_inserted;
            summary.states_created += result.states_created;
            summary.stations_created += result.stations_created;
            summary.state_mismatches += result.state_mismatches;
            summary.batches_committed += 1;
            progress.increment(1);
        }

        progress.finish_with_message("Weather records loaded");

        info!(
            "Load complete: {} rows loaded, {} skipped, {} fields set to NULL, \
             {} new states, {} new stations, {} station/state mismatches",
            summary.rows_loaded,
            summary.rows_skipped,
            summary.fields_nulled,
            summary.states_created,
            summary.stations_created,
            summary.state_mismatches
        );

        Ok(summary)
    }
}
