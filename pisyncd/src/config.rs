use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_CONCURRENCY_LIMIT: usize = 10;
pub const MAX_RETRIES_LIMIT: u32 = 10;

const DEFAULT_PORT: u16 = 22;
const DEFAULT_MAX_CONCURRENCY: usize = 2;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_REMOTE_PATH: &str = "/home/pi/sync";
const DEFAULT_LOCAL_DIR_NAME: &str = "pisync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("{0} is not configured")]
    Missing(&'static str),
    #[error("neither password nor privateKeyPath is configured")]
    NoCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Everything not excluded is synced.
    #[default]
    Mirror,
    /// Pushes are limited to paths matching an include glob.
    Selective,
}

impl FromStr for SyncMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mirror" => Ok(SyncMode::Mirror),
            "selective" => Ok(SyncMode::Selective),
            _ => Err(ConfigError::InvalidValue {
                name: "syncMode",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub enabled: bool,
    pub auto_sync: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub exclusions: Vec<String>,
    pub includes: Vec<String>,
    pub sync_mode: SyncMode,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_sync: true,
            host: String::new(),
            port: DEFAULT_PORT,
            username: String::new(),
            password: None,
            private_key_path: None,
            remote_path: DEFAULT_REMOTE_PATH.to_string(),
            local_path: default_local_root(),
            exclusions: vec![".git".to_string(), "node_modules".to_string()],
            includes: Vec::new(),
            sync_mode: SyncMode::Mirror,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
        }
    }
}

impl fmt::Debug for SyncSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSettings")
            .field("enabled", &self.enabled)
            .field("auto_sync", &self.auto_sync)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("remote_path", &self.remote_path)
            .field("local_path", &self.local_path)
            .field("exclusions", &self.exclusions)
            .field("includes", &self.includes)
            .field("sync_mode", &self.sync_mode)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_retries", &self.max_retries)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("operation_timeout_ms", &self.operation_timeout_ms)
            .finish()
    }
}

impl SyncSettings {
    /// Reads `PISYNC_CONFIG` when set, otherwise the `PISYNC_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        match std::env::var("PISYNC_CONFIG") {
            Ok(path) if !path.trim().is_empty() => {
                Self::from_file(&expand_with_home(path.trim(), &home), &home)
            }
            _ => Self::from_lookup(|name| std::env::var(name).ok(), &home),
        }
    }

    pub fn from_file(path: &Path, home: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: SyncSettings = serde_json::from_str(&raw)?;
        settings.local_path = expand_with_home(&settings.local_path.to_string_lossy(), home);
        settings.private_key_path = settings
            .private_key_path
            .map(|key| expand_with_home(&key.to_string_lossy(), home));
        Ok(settings.normalized())
    }

    /// Builds settings from a variable lookup; unset variables keep defaults.
    pub fn from_lookup<F>(lookup: F, home: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SyncSettings::default();
        let text = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let sync_mode = match text("PISYNC_SYNC_MODE") {
            Some(value) => value.parse()?,
            None => defaults.sync_mode,
        };

        let settings = SyncSettings {
            enabled: read_bool(&text, "PISYNC_ENABLED", defaults.enabled),
            auto_sync: read_bool(&text, "PISYNC_AUTO_SYNC", defaults.auto_sync),
            host: text("PISYNC_HOST").unwrap_or(defaults.host),
            port: read_number(&text, "PISYNC_PORT").unwrap_or(defaults.port),
            username: text("PISYNC_USERNAME").unwrap_or(defaults.username),
            password: lookup("PISYNC_PASSWORD").filter(|value| !value.is_empty()),
            private_key_path: text("PISYNC_PRIVATE_KEY_PATH")
                .map(|value| expand_with_home(&value, home)),
            remote_path: text("PISYNC_REMOTE_PATH").unwrap_or(defaults.remote_path),
            local_path: text("PISYNC_LOCAL_PATH")
                .map(|value| expand_with_home(&value, home))
                .unwrap_or(defaults.local_path),
            exclusions: text("PISYNC_EXCLUSIONS")
                .map(|value| split_list(&value))
                .unwrap_or(defaults.exclusions),
            includes: text("PISYNC_INCLUDES")
                .map(|value| split_list(&value))
                .unwrap_or(defaults.includes),
            sync_mode,
            max_concurrency: read_number(&text, "PISYNC_MAX_CONCURRENCY")
                .unwrap_or(defaults.max_concurrency),
            max_retries: read_number(&text, "PISYNC_MAX_RETRIES").unwrap_or(defaults.max_retries),
            connect_timeout_ms: read_number(&text, "PISYNC_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout_ms),
            operation_timeout_ms: read_number(&text, "PISYNC_OPERATION_TIMEOUT_MS")
                .unwrap_or(defaults.operation_timeout_ms),
        };
        Ok(settings.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.max_concurrency = self.max_concurrency.clamp(1, MAX_CONCURRENCY_LIMIT);
        self.max_retries = self.max_retries.min(MAX_RETRIES_LIMIT);
        self.connect_timeout_ms = self.connect_timeout_ms.max(1);
        self.operation_timeout_ms = self.operation_timeout_ms.max(1);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

pub fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_local_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_LOCAL_DIR_NAME)
}

fn read_number<T: FromStr>(text: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    text(name).and_then(|value| value.parse::<T>().ok())
}

fn read_bool(text: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    text(name)
        .map(|value| {
            matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn expands_tilde_against_home() {
        let home = PathBuf::from("/tmp/home-user");
        assert_eq!(
            expand_with_home("~/projects/site", &home),
            PathBuf::from("/tmp/home-user/projects/site")
        );
        assert_eq!(expand_with_home("~", &home), home);
        assert_eq!(expand_with_home("/abs", &home), PathBuf::from("/abs"));
    }

    #[test]
    fn reads_settings_from_variables() {
        let home = PathBuf::from("/home/me");
        let settings = SyncSettings::from_lookup(
            lookup(&[
                ("PISYNC_HOST", "pi.local"),
                ("PISYNC_USERNAME", "pi"),
                ("PISYNC_PRIVATE_KEY_PATH", "~/.ssh/id_ed25519"),
                ("PISYNC_LOCAL_PATH", "~/site"),
                ("PISYNC_EXCLUSIONS", "node_modules, *.log ,"),
                ("PISYNC_SYNC_MODE", "selective"),
                ("PISYNC_AUTO_SYNC", "no"),
            ]),
            &home,
        )
        .unwrap();

        assert_eq!(settings.host, "pi.local");
        assert_eq!(settings.port, 22);
        assert_eq!(
            settings.private_key_path,
            Some(PathBuf::from("/home/me/.ssh/id_ed25519"))
        );
        assert_eq!(settings.local_path, PathBuf::from("/home/me/site"));
        assert_eq!(settings.exclusions, vec!["node_modules", "*.log"]);
        assert_eq!(settings.sync_mode, SyncMode::Selective);
        assert!(!settings.auto_sync);
        assert!(settings.enabled);
    }

    #[test]
    fn clamps_concurrency_and_retries() {
        let home = PathBuf::from("/home/me");
        let high = SyncSettings::from_lookup(
            lookup(&[
                ("PISYNC_MAX_CONCURRENCY", "64"),
                ("PISYNC_MAX_RETRIES", "99"),
            ]),
            &home,
        )
        .unwrap();
        assert_eq!(high.max_concurrency, MAX_CONCURRENCY_LIMIT);
        assert_eq!(high.max_retries, MAX_RETRIES_LIMIT);

        let low = SyncSettings::from_lookup(
            lookup(&[
                ("PISYNC_MAX_CONCURRENCY", "0"),
                ("PISYNC_MAX_RETRIES", "0"),
                ("PISYNC_OPERATION_TIMEOUT_MS", "0"),
            ]),
            &home,
        )
        .unwrap();
        assert_eq!(low.max_concurrency, 1);
        assert_eq!(low.max_retries, 0);
        assert_eq!(low.operation_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn rejects_unknown_sync_mode() {
        let err = SyncSettings::from_lookup(
            lookup(&[("PISYNC_SYNC_MODE", "bidirectional")]),
            Path::new("/home/me"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "syncMode", .. }));
    }

    #[test]
    fn parses_camel_case_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pisync.json");
        std::fs::write(
            &path,
            r#"{
                "host": "10.0.0.7",
                "username": "pi",
                "password": "raspberry",
                "remotePath": "/srv/www",
                "localPath": "~/www",
                "includes": ["src/**"],
                "syncMode": "selective",
                "maxConcurrency": 12,
                "operationTimeoutMs": 5000
            }"#,
        )
        .unwrap();

        let settings = SyncSettings::from_file(&path, Path::new("/home/me")).unwrap();
        assert_eq!(settings.remote_path, "/srv/www");
        assert_eq!(settings.local_path, PathBuf::from("/home/me/www"));
        assert_eq!(settings.includes, vec!["src/**"]);
        assert_eq!(settings.max_concurrency, MAX_CONCURRENCY_LIMIT);
        assert_eq!(settings.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(settings.operation_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn debug_output_redacts_password() {
        let settings = SyncSettings {
            password: Some("raspberry".into()),
            ..SyncSettings::default()
        };
        let debug = format!("{settings:?}");
        assert!(!debug.contains("raspberry"));
        assert!(debug.contains("<redacted>"));
    }
}
