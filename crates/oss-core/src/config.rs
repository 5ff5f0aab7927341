use serde::Deserialize;
use std::time::Duration;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub blob: BlobConfig,
    pub crypto: CryptoConfig,
    pub sync: SyncConfig,
    pub worker: WorkerSettings,
    pub parser: ParserConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
    pub blob_root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BlobConfig {
    /// "fs" or "s3".
    pub backend: String,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CryptoConfig {
    /// 32-byte AES-256-GCM key, base64. Use an `env:` marker in the file.
    pub credentials_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    #[serde(default = "default_cadence_secs")]
    pub cadence_secs: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: i64,
    #[serde(default = "default_pause_minutes")]
    pub pause_minutes: i64,
}

impl SyncConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkerSettings {
    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: usize,
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_parse_concurrency")]
    pub parse_concurrency: usize,
    #[serde(default = "default_stitch_concurrency")]
    pub stitch_concurrency: usize,
    #[serde(default = "default_route_concurrency")]
    pub route_concurrency: usize,
    #[serde(default = "default_sync_visibility_secs")]
    pub sync_visibility_secs: u64,
    #[serde(default = "default_fetch_visibility_secs")]
    pub fetch_visibility_secs: u64,
    #[serde(default = "default_parse_visibility_secs")]
    pub parse_visibility_secs: u64,
    #[serde(default = "default_stitch_visibility_secs")]
    pub stitch_visibility_secs: u64,
    #[serde(default = "default_route_visibility_secs")]
    pub route_visibility_secs: u64,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_drain_secs")]
    pub drain_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ParserConfig {
    pub sanitizer_revision: String,
}

fn default_cadence_secs() -> u64 {
    60
}
fn default_breaker_threshold() -> i64 {
    5
}
fn default_pause_minutes() -> i64 {
    30
}
fn default_sync_concurrency() -> usize {
    2
}
fn default_fetch_concurrency() -> usize {
    8
}
fn default_parse_concurrency() -> usize {
    8
}
fn default_stitch_concurrency() -> usize {
    4
}
fn default_route_concurrency() -> usize {
    4
}
fn default_sync_visibility_secs() -> u64 {
    300
}
fn default_fetch_visibility_secs() -> u64 {
    120
}
fn default_parse_visibility_secs() -> u64 {
    120
}
fn default_stitch_visibility_secs() -> u64 {
    60
}
fn default_route_visibility_secs() -> u64 {
    60
}
fn default_backoff_base_secs() -> u64 {
    30
}
fn default_backoff_cap_secs() -> u64 {
    900
}
fn default_drain_secs() -> u64 {
    30
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid APP_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
    #[error("unknown blob backend {0:?} (expected \"fs\" or \"s3\")")]
    UnknownBlobBackend(String),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides,
    /// and resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("APP_PORT") {
            let port: u16 = port.parse().map_err(ConfigError::InvalidPort)?;
            self.app.port = port;
        }

        if let Ok(key) = env::var("OSS_CREDENTIALS_KEY") {
            self.crypto.credentials_key = key;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.crypto.credentials_key)?;
        apply_env_marker(&mut self.blob.backend)?;
        if let Some(bucket) = &mut self.blob.bucket {
            apply_env_marker(bucket)?;
        }
        if let Some(endpoint) = &mut self.blob.endpoint {
            apply_env_marker(endpoint)?;
        }
        if let Some(region) = &mut self.blob.region {
            apply_env_marker(region)?;
        }
        apply_env_marker(&mut self.parser.sanitizer_revision)?;
        apply_env_marker_path(&mut self.paths.database)?;
        apply_env_marker_path(&mut self.paths.blob_root)?;
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.paths.database = expand_tilde(&self.paths.database);
        self.paths.blob_root = expand_tilde(&self.paths.blob_root);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.blob.backend.as_str() {
            "fs" | "s3" => Ok(()),
            other => Err(ConfigError::UnknownBlobBackend(other.to_string())),
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy().to_string();
    PathBuf::from(shellexpand::tilde(&raw).as_ref())
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::{fs, sync::Mutex};
    use tempfile::TempDir;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn write_config(contents: &str) -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write config");
        (dir, path)
    }

    fn with_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().expect("lock env");
        let saved: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(k, _)| (k.to_string(), env::var(k).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        f();

        for (key, value) in saved {
            match value {
                Some(v) => unsafe { env::set_var(&key, v) },
                None => unsafe { env::remove_var(&key) },
            }
        }
    }

    fn full_config_body(database: &str, blob_root: &str) -> String {
        format!(
            r#"
[app]
service_name = "oss-ticketing"
port = 17900
env = "dev"

[paths]
database = "{database}"
blob_root = "{blob_root}"

[blob]
backend = "fs"

[crypto]
credentials_key = "env:OSS_CREDENTIALS_KEY"

[sync]
cadence_secs = 60
breaker_threshold = 5
pause_minutes = 30

[worker]
fetch_concurrency = 8

[parser]
sanitizer_revision = "allowlist-2025-06"
"#
        )
    }

    #[test]
    fn load_resolves_env_markers_and_applies_defaults() {
        let (_dir, path) = write_config(&full_config_body("/tmp/oss.db", "/tmp/blobs"));

        with_env(
            &[
                ("APP_PORT", None),
                ("OSS_CREDENTIALS_KEY", Some("a2V5LWZyb20tZW52")),
            ],
            || {
                let cfg = Config::load(&path).expect("config loads");
                assert_eq!(cfg.app.service_name, "oss-ticketing");
                assert_eq!(cfg.app.port, 17900);
                assert_eq!(cfg.crypto.credentials_key, "a2V5LWZyb20tZW52");
                assert_eq!(cfg.blob.backend, "fs");
                // Defaults fill the unlisted worker and sync knobs.
                assert_eq!(cfg.worker.sync_concurrency, 2);
                assert_eq!(cfg.worker.fetch_concurrency, 8);
                assert_eq!(cfg.worker.parse_concurrency, 8);
                assert_eq!(cfg.worker.stitch_concurrency, 4);
                assert_eq!(cfg.worker.route_concurrency, 4);
                assert_eq!(cfg.worker.backoff_base_secs, 30);
                assert_eq!(cfg.worker.backoff_cap_secs, 900);
                assert_eq!(cfg.sync.cadence(), Duration::from_secs(60));
            },
        );
    }

    #[test]
    fn env_overrides_take_precedence() {
        let (_dir, path) = write_config(&full_config_body("/tmp/oss.db", "/tmp/blobs"));

        with_env(
            &[
                ("APP_PORT", Some("19100")),
                ("OSS_CREDENTIALS_KEY", Some("ZnJvbS1lbnY")),
            ],
            || {
                let cfg = Config::load(&path).expect("config loads");
                assert_eq!(cfg.app.port, 19100);
            },
        );
    }

    #[test]
    fn env_marker_without_variable_errors() {
        let (_dir, path) = write_config(&full_config_body("/tmp/oss.db", "/tmp/blobs"));

        with_env(
            &[("APP_PORT", None), ("OSS_CREDENTIALS_KEY", None)],
            || {
                let err = Config::load(&path).expect_err("missing env var should error");
                match err {
                    ConfigError::MissingEnvVar(name) => assert_eq!(name, "OSS_CREDENTIALS_KEY"),
                    other => panic!("unexpected error: {other}"),
                }
            },
        );
    }

    #[test]
    fn tilde_paths_are_expanded() {
        let (dir, path) = write_config(&full_config_body("~/data/oss.db", "~/data/blobs"));
        let home = dir.path().join("home");
        fs::create_dir_all(&home).expect("home dir");

        with_env(
            &[
                ("APP_PORT", None),
                ("OSS_CREDENTIALS_KEY", Some("aw")),
                ("HOME", Some(home.to_str().unwrap())),
            ],
            || {
                let cfg = Config::load(&path).expect("config loads");
                assert_eq!(cfg.paths.database, home.join("data/oss.db"));
                assert_eq!(cfg.paths.blob_root, home.join("data/blobs"));
            },
        );
    }

    #[test]
    fn unknown_blob_backend_is_rejected() {
        let body = full_config_body("/tmp/oss.db", "/tmp/blobs").replace(
            "backend = \"fs\"",
            "backend = \"gcs\"",
        );
        let (_dir, path) = write_config(&body);

        with_env(
            &[("APP_PORT", None), ("OSS_CREDENTIALS_KEY", Some("aw"))],
            || {
                let err = Config::load(&path).expect_err("unknown backend should error");
                assert!(matches!(err, ConfigError::UnknownBlobBackend(_)));
            },
        );
    }
}
