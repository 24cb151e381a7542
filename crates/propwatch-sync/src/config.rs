//! Process configuration: optional YAML file, then environment overrides.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use propwatch_core::{Compression, ConfigError, DetectionConfig, StoreConfig};
use serde::Deserialize;

pub const DEFAULT_SYNC_CRON: &str = "0 0 3 * * *";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub csv_dir: PathBuf,
    pub database_url: Option<String>,
    pub reports_dir: PathBuf,
    pub detection: DetectionConfig,
    pub sync_enabled: bool,
    pub sync_cron: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            csv_dir: PathBuf::from("./data/csv"),
            database_url: None,
            reports_dir: PathBuf::from("./reports"),
            detection: DetectionConfig::default(),
            sync_enabled: false,
            sync_cron: DEFAULT_SYNC_CRON.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    detection: Option<DetectionConfig>,
    store_root: Option<PathBuf>,
    csv_dir: Option<PathBuf>,
    reports_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a key lookup. Unset keys keep their defaults; a key that is
    /// set but cannot be parsed is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(path) = get("PROPWATCH_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }

        if let Some(root) = get("PPD_VOLUME_PATH") {
            config.store.root = PathBuf::from(root);
        }
        if let Some(compression) = parsed::<Compression>(&get, "PPD_COMPRESSION")? {
            config.store.compression = compression;
        }
        if let Some(dir) = get("CSV_VOLUME_PATH") {
            config.csv_dir = PathBuf::from(dir);
        }
        if let Some(url) = get("DATABASE_URL") {
            config.database_url = Some(url);
        }
        if let Some(dir) = get("REPORTS_DIR") {
            config.reports_dir = PathBuf::from(dir);
        }

        let detection = &mut config.detection;
        if let Some(months) = parsed(&get, "SCAN_WINDOW_MONTHS")? {
            detection.scan_window_months = months;
        }
        if let Some(value) = parsed(&get, "MIN_CONFIDENCE_THRESHOLD")? {
            detection.min_confidence_threshold = value;
        }
        if let Some(value) = parsed(&get, "HIGH_CONFIDENCE_THRESHOLD")? {
            detection.high_confidence_threshold = value;
        }
        if let Some(value) = parsed(&get, "MIN_ADDRESS_SIMILARITY")? {
            detection.min_address_similarity = value;
        }
        if let Some(value) = parsed(&get, "ADDRESS_SIMILARITY_WEIGHT")? {
            detection.weights.address = value;
        }
        if let Some(value) = parsed(&get, "DATE_PROXIMITY_WEIGHT")? {
            detection.weights.date = value;
        }
        if let Some(value) = parsed(&get, "POSTCODE_MATCH_WEIGHT")? {
            detection.weights.postcode = value;
        }

        if let Some(raw) = get("SYNC_PPD") {
            config.sync_enabled = parse_flag("SYNC_PPD", &raw)?;
        }
        if let Some(cron) = get("SYNC_CRON") {
            config.sync_cron = cron;
        }

        config.detection.validate()?;
        config.store.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            key: "PROPWATCH_CONFIG".to_string(),
            value: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|err| invalid(err.to_string()))?;
        let file: FileConfig = serde_yaml::from_str(&text).map_err(|err| invalid(err.to_string()))?;

        if let Some(detection) = file.detection {
            self.detection = detection;
        }
        if let Some(root) = file.store_root {
            self.store.root = root;
        }
        if let Some(dir) = file.csv_dir {
            self.csv_dir = dir;
        }
        if let Some(dir) = file.reports_dir {
            self.reports_dir = dir;
        }
        Ok(())
    }
}

fn parsed<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = get(key) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: err.to_string(),
        })
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = AppConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
        assert!(!config.sync_enabled);
    }

    #[test]
    fn environment_keys_override_defaults() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PPD_VOLUME_PATH", "/srv/ppd"),
            ("PPD_COMPRESSION", "zstd"),
            ("SCAN_WINDOW_MONTHS", "12"),
            ("ADDRESS_SIMILARITY_WEIGHT", "0.6"),
            ("DATE_PROXIMITY_WEIGHT", "0.3"),
            ("SYNC_PPD", "true"),
            ("DATABASE_URL", "postgres://localhost/propwatch"),
        ]))
        .unwrap();
        assert_eq!(config.store.root, PathBuf::from("/srv/ppd"));
        assert_eq!(config.store.compression, Compression::Zstd);
        assert_eq!(config.detection.scan_window_months, 12);
        assert_eq!(config.detection.weights.address, 0.6);
        assert!(config.sync_enabled);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/propwatch"));
    }

    #[test]
    fn unparseable_values_are_errors_not_defaults() {
        let err = AppConfig::from_lookup(lookup(&[("SCAN_WINDOW_MONTHS", "two years")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SCAN_WINDOW_MONTHS"));

        let err = AppConfig::from_lookup(lookup(&[("SYNC_PPD", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = AppConfig::from_lookup(lookup(&[("PPD_COMPRESSION", "lz4")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn weights_that_do_not_sum_to_one_are_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("POSTCODE_MATCH_WEIGHT", "0.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::WeightSum { .. }));
    }

    #[test]
    fn yaml_file_is_applied_before_environment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("propwatch.yaml");
        std::fs::write(
            &path,
            "detection:\n  scan_window_months: 6\n  min_confidence_threshold: 75\ncsv_dir: /srv/csv\n",
        )
        .unwrap();
        let path_str = path.display().to_string();

        let config = AppConfig::from_lookup(lookup(&[
            ("PROPWATCH_CONFIG", path_str.as_str()),
            ("MIN_CONFIDENCE_THRESHOLD", "72.5"),
        ]))
        .unwrap();
        assert_eq!(config.detection.scan_window_months, 6);
        assert_eq!(config.detection.min_confidence_threshold, 72.5);
        assert_eq!(config.detection.high_confidence_threshold, 85.0);
        assert_eq!(config.csv_dir, PathBuf::from("/srv/csv"));
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = AppConfig::from_lookup(lookup(&[("PROPWATCH_CONFIG", "/nonexistent/propwatch.yaml")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PROPWATCH_CONFIG"));
    }
}
