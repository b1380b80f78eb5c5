use crate::domain::{Address, Decimal};
use crate::orchestration::SyncSettings;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// How the binary drives the sync queue on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Resume the checkpointed bulk backfill; completed targets are skipped.
    #[default]
    Bulk,
    /// Re-sync every target from its watermark.
    Incremental,
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "bulk" => Ok(SyncMode::Bulk),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(format!("must be bulk or incremental, got {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub events_api_url: String,
    pub checkpoint_path: String,
    pub sync_concurrency: usize,
    pub sync_retry_ceiling: u32,
    pub sync_batch_size: usize,
    pub sync_page_size: usize,
    pub fetch_timeout_ms: u64,
    pub retry_base_delay_ms: u64,
    pub dry_run: bool,
    pub sync_mode: SyncMode,
    pub notional_per_share: Decimal,
    pub reference_pnl_url: Option<String>,
    pub validation_tolerance: Decimal,
    pub validation_report_path: String,
    /// Market resolution/category CSV loaded into the store at startup.
    pub markets_csv_path: Option<String>,
    /// Mark price CSV loaded into the store at startup.
    pub marks_csv_path: Option<String>,
    /// External roster of wallets to keep in sync.
    pub sync_wallets: Vec<Address>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

fn invalid(var: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue(var.to_string(), reason.into())
}

fn required(env_map: &HashMap<String, String>, var: &str) -> Result<String, ConfigError> {
    env_map
        .get(var)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingEnv(var.to_string()))
}

fn optional(env_map: &HashMap<String, String>, var: &str) -> Option<String> {
    env_map
        .get(var)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    var: &str,
    default: &str,
    expected: &str,
) -> Result<T, ConfigError> {
    env_map
        .get(var)
        .map(|s| s.trim())
        .unwrap_or(default)
        .parse::<T>()
        .map_err(|_| invalid(var, format!("must be {}", expected)))
}

/// Counts that must be at least one.
fn parse_at_least_one(
    env_map: &HashMap<String, String>,
    var: &str,
    default: &str,
) -> Result<usize, ConfigError> {
    let value: usize = parse_or(env_map, var, default, "a positive integer")?;
    if value == 0 {
        return Err(invalid(var, "must be >= 1"));
    }
    Ok(value)
}

fn parse_bool(env_map: &HashMap<String, String>, var: &str) -> Result<bool, ConfigError> {
    match env_map
        .get(var)
        .map(|s| s.trim().to_ascii_lowercase())
        .as_deref()
    {
        None | Some("") | Some("false") | Some("0") | Some("no") => Ok(false),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some(other) => Err(invalid(var, format!("must be true or false, got {}", other))),
    }
}

fn parse_decimal_or(
    env_map: &HashMap<String, String>,
    var: &str,
    default: &str,
) -> Result<Decimal, ConfigError> {
    let raw = env_map.get(var).map(|s| s.as_str()).unwrap_or(default);
    let value = Decimal::from_str_canonical(raw).map_err(|_| invalid(var, "must be a decimal"))?;
    if value.is_negative() {
        return Err(invalid(var, "must not be negative"));
    }
    Ok(value)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or(&env_map, "PORT", "8080", "a valid u16")?;
        let database_path = required(&env_map, "DATABASE_PATH")?;
        let events_api_url = required(&env_map, "EVENTS_API_URL")?;
        let checkpoint_path = env_map
            .get("CHECKPOINT_PATH")
            .cloned()
            .unwrap_or_else(|| "sync_checkpoint.json".to_string());

        let sync_concurrency = parse_at_least_one(&env_map, "SYNC_CONCURRENCY", "32")?;
        let sync_retry_ceiling = parse_at_least_one(&env_map, "SYNC_RETRY_CEILING", "3")?;
        let sync_retry_ceiling = u32::try_from(sync_retry_ceiling)
            .map_err(|_| invalid("SYNC_RETRY_CEILING", "too large"))?;
        let sync_batch_size = parse_at_least_one(&env_map, "SYNC_BATCH_SIZE", "10")?;
        let sync_page_size = parse_at_least_one(&env_map, "SYNC_PAGE_SIZE", "500")?;
        let fetch_timeout_ms: u64 =
            parse_or(&env_map, "FETCH_TIMEOUT_MS", "30000", "a valid u64")?;
        if fetch_timeout_ms == 0 {
            return Err(invalid("FETCH_TIMEOUT_MS", "must be >= 1"));
        }
        let retry_base_delay_ms =
            parse_or(&env_map, "RETRY_BASE_DELAY_MS", "500", "a valid u64")?;
        let dry_run = parse_bool(&env_map, "SYNC_DRY_RUN")?;
        let sync_mode = env_map
            .get("SYNC_MODE")
            .map(|s| s.parse::<SyncMode>())
            .transpose()
            .map_err(|e| invalid("SYNC_MODE", e))?
            .unwrap_or_default();

        let notional_per_share = parse_decimal_or(&env_map, "NOTIONAL_PER_SHARE", "1")?;
        let reference_pnl_url = optional(&env_map, "REFERENCE_PNL_URL");
        let validation_tolerance = parse_decimal_or(&env_map, "VALIDATION_TOLERANCE", "1")?;
        let validation_report_path = env_map
            .get("VALIDATION_REPORT_PATH")
            .cloned()
            .unwrap_or_else(|| "validation_report.csv".to_string());

        let markets_csv_path = optional(&env_map, "MARKETS_CSV_PATH");
        let marks_csv_path = optional(&env_map, "MARKS_CSV_PATH");

        let sync_wallets = parse_sync_wallets_from_map(&env_map)?;

        Ok(Config {
            port,
            database_path,
            events_api_url,
            checkpoint_path,
            sync_concurrency,
            sync_retry_ceiling,
            sync_batch_size,
            sync_page_size,
            fetch_timeout_ms,
            retry_base_delay_ms,
            dry_run,
            sync_mode,
            notional_per_share,
            reference_pnl_url,
            validation_tolerance,
            validation_report_path,
            markets_csv_path,
            marks_csv_path,
            sync_wallets,
        })
    }

    /// Deadline for one page fetch, retries included.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Bound on a single HTTP request to the event source.
    pub fn request_timeout(&self) -> Duration {
        self.fetch_timeout() / 4
    }

    /// Time the event source may spend retrying transient errors within one
    /// fetch. With one last request on top it still ends before `fetch_timeout`.
    pub fn retry_budget(&self) -> Duration {
        self.fetch_timeout() / 2
    }

    /// Run parameters for the orchestrator.
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            concurrency: self.sync_concurrency,
            retry_ceiling: self.sync_retry_ceiling,
            batch_size: self.sync_batch_size,
            page_size: self.sync_page_size,
            fetch_timeout: self.fetch_timeout(),
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            dry_run: self.dry_run,
        }
    }
}

fn parse_wallet_list<'a>(
    var: &str,
    entries: impl Iterator<Item = &'a str>,
) -> Result<Vec<Address>, ConfigError> {
    let mut wallets: Vec<Address> = Vec::new();
    for entry in entries.map(str::trim).filter(|s| !s.is_empty()) {
        let wallet = Address::parse(entry).map_err(|e| invalid(var, e.to_string()))?;
        if !wallets.contains(&wallet) {
            wallets.push(wallet);
        }
    }
    Ok(wallets)
}

fn parse_sync_wallets_from_map(
    env_map: &HashMap<String, String>,
) -> Result<Vec<Address>, ConfigError> {
    if let Some(wallets_str) = env_map.get("SYNC_WALLETS") {
        parse_wallet_list("SYNC_WALLETS", wallets_str.split(','))
    } else if let Some(file_path) = env_map.get("SYNC_WALLETS_FILE") {
        let content = std::fs::read_to_string(file_path)
            .map_err(|_| invalid("SYNC_WALLETS_FILE", "file not found or unreadable"))?;
        parse_wallet_list("SYNC_WALLETS_FILE", content.lines())
    } else {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/test.db".to_string());
        map.insert(
            "EVENTS_API_URL".to_string(),
            "https://indexer.example".to_string(),
        );
        map
    }

    #[test]
    fn test_missing_database_path() {
        let mut env_map = setup_required_env();
        env_map.remove("DATABASE_PATH");
        match Config::from_env_map(env_map) {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "DATABASE_PATH"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_missing_events_api_url() {
        let mut env_map = setup_required_env();
        env_map.remove("EVENTS_API_URL");
        match Config::from_env_map(env_map) {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "EVENTS_API_URL"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.checkpoint_path, "sync_checkpoint.json");
        assert_eq!(config.notional_per_share, Decimal::one());
        assert_eq!(config.validation_tolerance, Decimal::one());
        assert!(config.reference_pnl_url.is_none());
        assert!(config.markets_csv_path.is_none());
        assert!(config.marks_csv_path.is_none());
        assert!(config.sync_wallets.is_empty());
        assert_eq!(config.sync_mode, SyncMode::Bulk);
        assert_eq!(config.sync_settings(), SyncSettings::default());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("SYNC_CONCURRENCY".to_string(), "0".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(var, _)) => assert_eq!(var, "SYNC_CONCURRENCY"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_invalid_port() {
        let mut env_map = setup_required_env();
        env_map.insert("PORT".to_string(), "99999".to_string());
        assert!(matches!(
            Config::from_env_map(env_map),
            Err(ConfigError::InvalidValue(_, _))
        ));
    }

    #[test]
    fn test_dry_run_flag() {
        let mut env_map = setup_required_env();
        env_map.insert("SYNC_DRY_RUN".to_string(), "true".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert!(config.sync_settings().dry_run);

        let mut env_map = setup_required_env();
        env_map.insert("SYNC_DRY_RUN".to_string(), "maybe".to_string());
        assert!(Config::from_env_map(env_map).is_err());
    }

    #[test]
    fn test_sync_mode() {
        let mut env_map = setup_required_env();
        env_map.insert("SYNC_MODE".to_string(), " Incremental ".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.sync_mode, SyncMode::Incremental);

        let mut env_map = setup_required_env();
        env_map.insert("SYNC_MODE".to_string(), "bulk".to_string());
        assert_eq!(Config::from_env_map(env_map).unwrap().sync_mode, SyncMode::Bulk);

        let mut env_map = setup_required_env();
        env_map.insert("SYNC_MODE".to_string(), "nightly".to_string());
        assert!(matches!(
            Config::from_env_map(env_map),
            Err(ConfigError::InvalidValue(var, _)) if var == "SYNC_MODE"
        ));
    }

    #[test]
    fn test_sync_wallets_from_list_dedups_and_lowercases() {
        let mut env_map = setup_required_env();
        env_map.insert(
            "SYNC_WALLETS".to_string(),
            "0xABC, 0xdef,,0xabc".to_string(),
        );
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(
            config.sync_wallets,
            vec![Address::new("0xabc"), Address::new("0xdef")]
        );
    }

    #[test]
    fn test_sync_wallets_rejects_bad_address() {
        let mut env_map = setup_required_env();
        env_map.insert("SYNC_WALLETS".to_string(), "0xabc,nothex".to_string());
        assert!(matches!(
            Config::from_env_map(env_map),
            Err(ConfigError::InvalidValue(var, _)) if var == "SYNC_WALLETS"
        ));
    }

    #[test]
    fn test_sync_wallets_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0x1111").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  0x2222  ").unwrap();

        let mut env_map = setup_required_env();
        env_map.insert(
            "SYNC_WALLETS_FILE".to_string(),
            file.path().to_string_lossy().to_string(),
        );
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.sync_wallets.len(), 2);
    }

    #[test]
    fn test_blank_optional_paths_are_unset() {
        let mut env_map = setup_required_env();
        env_map.insert("MARKETS_CSV_PATH".to_string(), "markets.csv".to_string());
        env_map.insert("MARKS_CSV_PATH".to_string(), "   ".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.markets_csv_path.as_deref(), Some("markets.csv"));
        assert!(config.marks_csv_path.is_none());
    }

    #[test]
    fn test_retry_budget_fits_inside_fetch_timeout() {
        for timeout_ms in ["1000", "30000", "7"] {
            let mut env_map = setup_required_env();
            env_map.insert("FETCH_TIMEOUT_MS".to_string(), timeout_ms.to_string());
            let config = Config::from_env_map(env_map).unwrap();
            assert!(config.retry_budget() + config.request_timeout() < config.fetch_timeout());
            assert!(!config.retry_budget().is_zero());
        }
    }

    #[test]
    fn test_negative_notional_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("NOTIONAL_PER_SHARE".to_string(), "-1".to_string());
        assert!(Config::from_env_map(env_map).is_err());
    }
}
