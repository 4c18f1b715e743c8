//! Engine configuration from environment variables.

use std::collections::HashMap;
use std::path::PathBuf;

pub const DEFAULT_RESULT_DATA_MAX_SIZE: usize = 5_000_000;
pub const DEFAULT_UPLOADS_MAX_FILE_SIZE: u64 = 30 * 1024 * 1024;
pub const DEFAULT_UPLOADS_LIMIT_PER_RUN: u64 = 50 * 1024 * 1024;

const ENV_KEYS: [&str; 6] = [
    "PUBLIX_RESULT_DATA_MAX_SIZE",
    "PUBLIX_UPLOADS_ENABLED",
    "PUBLIX_UPLOADS_MAX_FILE_SIZE",
    "PUBLIX_UPLOADS_LIMIT_PER_RUN",
    "PUBLIX_UPLOADS_DIR",
    "PUBLIX_TOKEN_SECRET",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadLimits {
    pub enabled: bool,
    pub max_file_size: u64,
    pub limit_per_run: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            max_file_size: DEFAULT_UPLOADS_MAX_FILE_SIZE,
            limit_per_run: DEFAULT_UPLOADS_LIMIT_PER_RUN,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublixConfig {
    /// Ceiling for a component-run's result data, checked after appending.
    pub result_data_max_size: usize,
    pub uploads: UploadLimits,
    /// Filesystem root for result files; in-memory storage when unset.
    pub uploads_dir: Option<PathBuf>,
    /// HMAC key for identity tokens; random per process when unset.
    pub token_secret: Option<String>,
}

impl Default for PublixConfig {
    fn default() -> Self {
        Self {
            result_data_max_size: DEFAULT_RESULT_DATA_MAX_SIZE,
            uploads: UploadLimits::default(),
            uploads_dir: None,
            token_secret: None,
        }
    }
}

impl PublixConfig {
    pub fn from_env() -> Result<Self, String> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    pub fn from_env_map(envs: &HashMap<String, String>) -> Result<Self, String> {
        let defaults = Self::default();
        let result_data_max_size = parse_number(
            envs,
            "PUBLIX_RESULT_DATA_MAX_SIZE",
            defaults.result_data_max_size as u64,
        )?;
        let result_data_max_size = usize::try_from(result_data_max_size)
            .map_err(|_| "PUBLIX_RESULT_DATA_MAX_SIZE is out of range".to_string())?;
        let enabled = match envs.get("PUBLIX_UPLOADS_ENABLED") {
            Some(raw) => parse_bool("PUBLIX_UPLOADS_ENABLED", raw)?,
            None => defaults.uploads.enabled,
        };
        let max_file_size = parse_number(
            envs,
            "PUBLIX_UPLOADS_MAX_FILE_SIZE",
            defaults.uploads.max_file_size,
        )?;
        let limit_per_run = parse_number(
            envs,
            "PUBLIX_UPLOADS_LIMIT_PER_RUN",
            defaults.uploads.limit_per_run,
        )?;
        let uploads_dir = envs
            .get("PUBLIX_UPLOADS_DIR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let token_secret = envs
            .get("PUBLIX_TOKEN_SECRET")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            result_data_max_size,
            uploads: UploadLimits {
                enabled,
                max_file_size,
                limit_per_run,
            },
            uploads_dir,
            token_secret,
        })
    }
}

fn parse_number(envs: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, String> {
    match envs.get(key) {
        Some(raw) => raw
            .trim()
            .replace('_', "")
            .parse::<u64>()
            .map_err(|_| format!("invalid {}='{}'. expected a byte count", key, raw)),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!(
            "invalid {}='{}'. expected true or false",
            key, value
        )),
    }
}
