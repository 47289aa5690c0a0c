use crate::error::{AppError, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};

/// Host of the public Nominatim instance, which enforces one request per second.
const PUBLIC_NOMINATIM_HOST: &str = "nominatim.openstreetmap.org";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    pub geocoder: GeocoderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections", deserialize_with = "deserialize_number")]
    pub max_connections: u32,
    #[serde(default = "default_create_if_missing")]
    pub create_if_missing: bool,
}

fn default_max_connections() -> u32 {
    1
}

fn default_create_if_missing() -> bool {
    true
}

/// Custom deserializer that handles numbers given either as YAML numbers or strings
///
/// Accepts:
/// - `request_delay_ms: 1100` (number)
/// - `request_delay_ms: "1100"` (string that parses to number)
/// - `request_delay_ms: ${GEOCODER_DELAY_MS}` (env var substituted to either)
fn deserialize_number<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr + Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberValue<T> {
        Number(T),
        String(String),
    }

    match NumberValue::<T>::deserialize(deserializer)? {
        NumberValue::Number(n) => Ok(n),
        NumberValue::String(s) => s
            .trim()
            .parse::<T>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid number: '{}'", s))),
    }
}

/// What to do with a measurement field that is present but not numeric.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MalformedFieldPolicy {
    /// Store NULL for the offending field and keep the row.
    #[default]
    SetNull,
    /// Drop the whole row.
    SkipRow,
}

impl std::fmt::Display for MalformedFieldPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedFieldPolicy::SetNull => write!(f, "set_null"),
            MalformedFieldPolicy::SkipRow => write!(f, "skip_row"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    #[serde(default = "default_csv_path")]
    pub csv_path: PathBuf,
    #[serde(default = "default_batch_size", deserialize_with = "deserialize_number")]
    pub batch_size: usize,
    #[serde(default)]
    pub malformed_fields: MalformedFieldPolicy,
    #[serde(default)]
    pub states: StateFilter,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            csv_path: default_csv_path(),
            batch_size: default_batch_size(),
            malformed_fields: MalformedFieldPolicy::default(),
            states: StateFilter::default(),
        }
    }
}

fn default_csv_path() -> PathBuf {
    PathBuf::from("data/weather_parsed.csv")
}

fn default_batch_size() -> usize {
    1000
}

/// Optional restriction of the loader to a set of state codes
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(transparent)]
pub struct StateFilter {
    pub states: Vec<String>,
}

impl StateFilter {
    pub fn new<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            states: states.into_iter().map(|s| s.into().to_uppercase()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn matches(&self, state_code: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        self.states
            .iter()
            .any(|s| s.eq_ignore_ascii_case(state_code))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocoderConfig {
    /// State whose stations get geocoded
    pub state: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_delay_ms", deserialize_with = "deserialize_number")]
    pub request_delay_ms: u64,
    #[serde(default = "default_timeout_secs", deserialize_with = "deserialize_number")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries", deserialize_with = "deserialize_number")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    format!("https://{}", PUBLIC_NOMINATIM_HOST)
}

fn default_user_agent() -> String {
    concat!("weather-pipeline/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_request_delay_ms() -> u64 {
    1100 // Nominatim allows at most one request per second
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables
    /// - Non-empty database path and sane pool size
    /// - Positive batch size
    /// - Two-letter state codes
    /// - HTTPS geocoder URL and a user agent
    pub fn validate(&self) -> Result<()> {
        let path = self.database.path.to_string_lossy();
        let fields_to_check = [
            ("database.path", &*path),
            ("geocoder.state", self.geocoder.state.as_str()),
            ("geocoder.base_url", self.geocoder.base_url.as_str()),
            ("geocoder.user_agent", self.geocoder.user_agent.as_str()),
        ];

        for (field_name, value) in &fields_to_check {
            if value.contains("${") {
                return Err(AppError::Config(format!(
                    "{} references an environment variable that is not set. \
                     Please set it or create a .env file.",
                    field_name
                )));
            }
        }

        if path.trim().is_empty() {
            return Err(AppError::Config(
                "Database path cannot be empty".to_string(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "Database max_connections must be at least 1".to_string(),
            ));
        }

        // SQLite has a single writer; more connections only add lock contention
        if self.database.max_connections > 16 {
            return Err(AppError::Config(format!(
                "Database max_connections {} is too high for SQLite, maximum is 16",
                self.database.max_connections
            )));
        }

        if self.loader.batch_size == 0 {
            return Err(AppError::Config(
                "Loader batch_size must be greater than 0".to_string(),
            ));
        }

        for state in &self.loader.states.states {
            validate_state_code(state)?;
        }
        validate_state_code(&self.geocoder.state)?;

        if self.geocoder.max_retries > 10 {
            return Err(AppError::Config(format!(
                "Geocoder max_retries {} is too high, maximum is 10",
                self.geocoder.max_retries
            )));
        }

        if self.geocoder.user_agent.trim().is_empty() {
            return Err(AppError::Config(
                "Geocoder user_agent cannot be empty".to_string(),
            ));
        }

        let parsed = url::Url::parse(&self.geocoder.base_url).map_err(|e| {
            AppError::Config(format!(
                "Invalid geocoder base_url '{}': {}",
                self.geocoder.base_url, e
            ))
        })?;

        if parsed.scheme() != "https" {
            return Err(AppError::Config(format!(
                "Geocoder base_url must use HTTPS, got: {}",
                parsed.scheme()
            )));
        }

        if parsed.host_str() == Some(PUBLIC_NOMINATIM_HOST) && self.geocoder.request_delay_ms < 1000
        {
            tracing::warn!(
                "Geocoder request delay of {}ms is below the public Nominatim limit of 1 request/second",
                self.geocoder.request_delay_ms
            );
        }

        Ok(())
    }
}

fn validate_state_code(state: &str) -> Result<()> {
    if state.len() != 2 || !state.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AppError::Config(format!(
            "State code '{}' must be exactly 2 letters (e.g., 'AL', 'TX')",
            state
        )));
    }
    Ok(())
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid env var pattern: {}", e)))?;

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root\n\
             2. Or export {}=<value> before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            missing_vars[0],
        )));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
database:
  path: data/weather_data.db
geocoder:
  state: AL
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.database.max_connections, 1);
        assert!(config.database.create_if_missing);
        assert_eq!(config.loader.batch_size, 1000);
        assert_eq!(config.loader.malformed_fields, MalformedFieldPolicy::SetNull);
        assert!(config.loader.states.is_empty());
        assert_eq!(config.geocoder.base_url, "https://nominatim.openstreetmap.org");
        assert_eq!(config.geocoder.request_delay_ms, 1100);
        assert!(config.geocoder.user_agent.starts_with("weather-pipeline/"));
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
database:
  path: /tmp/weather.db
  max_connections: 2
  create_if_missing: false
loader:
  csv_path: input.csv
  batch_size: "250"
  malformed_fields: skip_row
  states: [al, GA]
geocoder:
  state: GA
  base_url: https://geocode.example.org
  user_agent: tester/1.0
  request_delay_ms: "2000"
  timeout_secs: 5
  max_retries: 1
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.loader.batch_size, 250);
        assert_eq!(config.loader.malformed_fields, MalformedFieldPolicy::SkipRow);
        assert!(config.loader.states.matches("AL"));
        assert!(config.loader.states.matches("ga"));
        assert!(!config.loader.states.matches("TX"));
        assert_eq!(config.geocoder.request_delay_ms, 2000);
        assert_eq!(config.geocoder.max_retries, 1);
    }

    #[test]
    fn test_invalid_number_string() {
        let yaml = r#"
path: test.db
max_connections: "lots"
"#;
        let result: std::result::Result<DatabaseConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Invalid number") || err_msg.contains("lots"));
    }

    #[test]
    fn test_rejects_http_geocoder_url() {
        let yaml = r#"
database:
  path: test.db
geocoder:
  state: AL
  base_url: http://nominatim.openstreetmap.org
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("must use HTTPS"));
    }

    #[test]
    fn test_rejects_bad_state_code() {
        let yaml = r#"
database:
  path: test.db
geocoder:
  state: Alabama
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("exactly 2 letters"));
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let yaml = r#"
database:
  path: test.db
loader:
  batch_size: 0
geocoder:
  state: AL
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_excessive_max_retries() {
        let yaml = r#"
database:
  path: test.db
geocoder:
  state: AL
  max_retries: 100
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn test_missing_env_var_is_reported() {
        let yaml = r#"
database:
  path: ${WEATHER_PIPELINE_TEST_UNSET_VAR}
geocoder:
  state: AL
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err
            .to_string()
            .contains("WEATHER_PIPELINE_TEST_UNSET_VAR"));
    }

    #[test]
    fn test_empty_state_filter_matches_all() {
        let filter = StateFilter::default();
        assert!(filter.matches("AL"));
        assert!(filter.matches("WY"));
    }
}
