use crate::error::AppError;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const SERVICE_NAME: &str = "bill-meter";
const ENV_PREFIX: &str = "BILL_METER";

pub fn normalize_account_id(account_id: &str) -> String {
    account_id.trim().to_string()
}

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("BILL_METER_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("com", "neubell", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".bill-meter"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub adapter_reference: String,
    pub request_timeout_secs: u64,
    /// How long a run's claim on a report blocks other runs if it never
    /// finishes.
    pub claim_lease_secs: u64,
    pub report_source: ReportSourceSettings,
    pub ignorable_item_descriptions: Vec<String>,
    pub retry: RetrySettings,
    /// Seed for the zone inventory: availability zone -> region.
    pub zones: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportSourceSettings {
    Local { dir: Option<PathBuf> },
    Http { base_url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetrySettings {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let jitter_range = capped * self.jitter;
        let jitter = if jitter_range > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            adapter_reference: "/adapters/billing-stats".into(),
            request_timeout_secs: 60,
            claim_lease_secs: 900,
            report_source: ReportSourceSettings::Local { dir: None },
            ignorable_item_descriptions: vec![
                "Total statement amount for period".into(),
                "Total amount for linked account".into(),
                "This is an estimated invoice".into(),
            ],
            retry: RetrySettings::default(),
            zones: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("inventory.sqlite"))
}

pub fn reports_dir() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("reports"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    fs::create_dir_all(reports_dir()?)?;
    Ok(())
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;

    let mut ignorable = Vec::new();
    for raw in &config.ignorable_item_descriptions {
        let trimmed = raw.trim().to_string();
        if trimmed != *raw {
            changed = true;
        }
        if trimmed.is_empty() || ignorable.contains(&trimmed) {
            changed = true;
            continue;
        }
        ignorable.push(trimmed);
    }
    config.ignorable_item_descriptions = ignorable;

    let mut zones = HashMap::new();
    for (zone, region) in std::mem::take(&mut config.zones) {
        let normalized_zone = zone.trim().to_ascii_lowercase();
        let normalized_region = region.trim().to_ascii_lowercase();
        if normalized_zone != zone || normalized_region != region {
            changed = true;
        }
        zones.insert(normalized_zone, normalized_region);
    }
    config.zones = zones;

    if let ReportSourceSettings::Http { base_url } = &mut config.report_source {
        let trimmed = base_url.trim_end_matches('/').to_string();
        if trimmed != *base_url {
            *base_url = trimmed;
            changed = true;
        }
    }

    changed
}

/// Rewrites the file at `path` in normalized form when normalizing changes it.
fn normalize_config_file(path: &Path) -> Result<bool, AppError> {
    if !path.exists() {
        return Ok(false);
    }
    let mut stored: AppConfig = toml::from_str(&fs::read_to_string(path)?)?;
    let changed = normalize_config(&mut stored);
    if changed {
        fs::write(path, toml::to_string_pretty(&stored)?)?;
    }
    Ok(changed)
}

/// Reads the TOML file at `path` (if any) with `BILL_METER__*` environment
/// overrides layered on top. The file itself is saved back normalized.
pub fn load_config_from(path: &Path) -> Result<AppConfig, AppError> {
    if normalize_config_file(path)? {
        debug!(path = %path.display(), "normalized config file");
    }

    let layered = ::config::Config::builder()
        .add_source(::config::File::from(path.to_path_buf()).required(false))
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?;

    let mut parsed: AppConfig = layered.try_deserialize()?;
    normalize_config(&mut parsed);
    Ok(parsed)
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from(&config_path()?)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn normalize_account_id_trims() {
        assert_eq!(normalize_account_id(" 123456 "), "123456");
    }

    #[test]
    fn normalize_config_dedupes_and_normalizes_keys() {
        let mut cfg = AppConfig {
            ignorable_item_descriptions: vec![
                " Total amount for linked account".into(),
                "Total amount for linked account".into(),
                "".into(),
            ],
            zones: HashMap::from([(" US-EAST-1A ".into(), "US-EAST-1".into())]),
            report_source: ReportSourceSettings::Http {
                base_url: "https://billing.example.com/".into(),
            },
            ..AppConfig::default()
        };

        let changed = normalize_config(&mut cfg);
        assert!(changed);
        assert_eq!(
            cfg.ignorable_item_descriptions,
            vec!["Total amount for linked account".to_string()]
        );
        assert_eq!(cfg.zones.get("us-east-1a").map(String::as_str), Some("us-east-1"));
        assert_eq!(
            cfg.report_source,
            ReportSourceSettings::Http {
                base_url: "https://billing.example.com".into()
            }
        );
    }

    #[test]
    fn load_config_from_missing_file_uses_defaults() {
        let tmp = TempDir::new().expect("tempdir");
        let cfg = load_config_from(&tmp.path().join("absent.toml")).expect("load defaults");
        assert_eq!(cfg.request_timeout_secs, 60);
        assert_eq!(cfg.report_source, ReportSourceSettings::Local { dir: None });
        assert_eq!(cfg.retry.max_retries, 3);
    }

    #[test]
    fn load_config_from_reads_saved_toml() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");
        let cfg = AppConfig {
            request_timeout_secs: 5,
            report_source: ReportSourceSettings::Http {
                base_url: "https://billing.example.com".into(),
            },
            zones: HashMap::from([("us-west-2b".into(), "us-west-2".into())]),
            ..AppConfig::default()
        };
        fs::write(&path, toml::to_string_pretty(&cfg).expect("toml")).expect("write");

        let loaded = load_config_from(&path).expect("load");
        assert_eq!(loaded.request_timeout_secs, 5);
        assert_eq!(loaded.report_source, cfg.report_source);
        assert_eq!(loaded.zones.get("us-west-2b").map(String::as_str), Some("us-west-2"));
    }

    #[test]
    fn load_config_from_saves_normalized_file() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");
        let cfg = AppConfig {
            zones: HashMap::from([(" US-EAST-1A ".into(), "US-EAST-1".into())]),
            ..AppConfig::default()
        };
        fs::write(&path, toml::to_string_pretty(&cfg).expect("toml")).expect("write");

        load_config_from(&path).expect("load");
        let saved: AppConfig =
            toml::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(saved.zones.get("us-east-1a").map(String::as_str), Some("us-east-1"));

        let before = fs::read_to_string(&path).expect("read");
        assert!(!normalize_config_file(&path).expect("normalize again"));
        assert_eq!(fs::read_to_string(&path).expect("read"), before);
    }

    #[test]
    fn retry_delay_grows_and_is_capped() {
        let retry = RetrySettings {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 300,
            backoff_multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(300));
    }
}
