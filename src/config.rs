use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub aika: AikaConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Debug, Deserialize)]
pub struct AikaConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for AikaConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            timezone: default_timezone(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "aika.db".to_string()
}

/// Remote endpoints. Overridable so the client can be pointed at a test server.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_scan_host")]
    pub scan_host: String,
    #[serde(default = "default_id_host")]
    pub id_host: String,
    #[serde(default = "default_video_api_host")]
    pub video_api_host: String,
    #[serde(default = "default_video_site")]
    pub video_site: String,
    #[serde(default = "default_passport_cookie_domain")]
    pub passport_cookie_domain: String,
    #[serde(default = "default_video_cookie_domain")]
    pub video_cookie_domain: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            scan_host: default_scan_host(),
            id_host: default_id_host(),
            video_api_host: default_video_api_host(),
            video_site: default_video_site(),
            passport_cookie_domain: default_passport_cookie_domain(),
            video_cookie_domain: default_video_cookie_domain(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
        }
    }
}

fn default_scan_host() -> String {
    "https://scan.acfun.cn".to_string()
}
fn default_id_host() -> String {
    "https://id.app.acfun.cn".to_string()
}
fn default_video_api_host() -> String {
    "https://onvideoapi.kuaishou.com".to_string()
}
fn default_video_site() -> String {
    "https://onvideo.kuaishou.com".to_string()
}
fn default_passport_cookie_domain() -> String {
    ".acfun.cn".to_string()
}
fn default_video_cookie_domain() -> String {
    ".kuaishouzt.com".to_string()
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36"
        .to_string()
}
fn default_timeout() -> String {
    "30s".to_string()
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        humantime::parse_duration(&self.timeout).unwrap_or(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            failure_limit: default_failure_limit(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_failure_limit() -> u32 {
    10
}
fn default_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_download_binary")]
    pub binary: String,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            binary: default_download_binary(),
            ffmpeg: default_ffmpeg(),
            work_dir: None,
            extra_args: Vec::new(),
        }
    }
}

fn default_download_binary() -> String {
    "N_m3u8DL-RE".to_string()
}
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

impl Config {
    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        let db_path = Path::new(&self.database.path);
        if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            self.aika.data_dir.join(db_path)
        }
    }

    /// Where the login QR code image is written for the user to scan.
    pub fn qr_path(&self) -> PathBuf {
        self.aika.data_dir.join("login-qr.png")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download
            .work_dir
            .clone()
            .unwrap_or_else(|| self.aika.data_dir.clone())
    }

    /// Configured display timezone. Falls back to UTC; `validate_config` rejects bad names.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.aika.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

/// Load the config file, or built-in defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    config
        .aika
        .timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", config.aika.timezone)))?;

    humantime::parse_duration(&config.api.timeout)
        .map_err(|e| ConfigError::Validation(format!("api timeout '{}': {}", config.api.timeout, e)))?;

    for (name, host) in [
        ("scan_host", &config.api.scan_host),
        ("id_host", &config.api.id_host),
        ("video_api_host", &config.api.video_api_host),
        ("video_site", &config.api.video_site),
    ] {
        reqwest::Url::parse(host)
            .map_err(|e| ConfigError::Validation(format!("api.{name} '{host}' is not a valid URL: {e}")))?;
    }

    for (name, domain) in [
        ("passport_cookie_domain", &config.api.passport_cookie_domain),
        ("video_cookie_domain", &config.api.video_cookie_domain),
    ] {
        if domain.trim_start_matches('.').is_empty() {
            return Err(ConfigError::Validation(format!("api.{name} must not be empty")).into());
        }
    }

    if config.fetch.batch_size == 0 {
        return Err(ConfigError::Validation("fetch.batch_size must be at least 1".to_string()).into());
    }

    if config.download.binary.is_empty() || config.download.ffmpeg.is_empty() {
        return Err(ConfigError::Validation("download.binary and download.ffmpeg must be set".to_string()).into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.aika.timezone, "Asia/Shanghai");
        assert_eq!(config.fetch.max_retries, 3);
        assert_eq!(config.fetch.failure_limit, 10);
        assert_eq!(config.fetch.batch_size, 100);
        assert_eq!(config.db_path(), PathBuf::from("./data/aika.db"));
        assert_eq!(config.api.timeout(), Duration::from_secs(30));
        validate_config(&config).unwrap();
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.download.binary, "N_m3u8DL-RE");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [aika]
            data_dir = "/var/lib/aika"

            [database]
            path = "/tmp/other.db"

            [fetch]
            batch_size = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/tmp/other.db"));
        assert_eq!(config.qr_path(), PathBuf::from("/var/lib/aika/login-qr.png"));
        assert_eq!(config.download_dir(), PathBuf::from("/var/lib/aika"));
        assert_eq!(config.fetch.batch_size, 20);
        assert_eq!(config.fetch.failure_limit, 10);
    }

    #[test]
    fn rejects_bad_timezone() {
        let config: Config = toml::from_str("[aika]\ntimezone = \"Mars/Olympus\"").unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("unknown timezone"));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let config: Config = toml::from_str("[fetch]\nbatch_size = 0").unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_unparseable_host() {
        let config: Config = toml::from_str("[api]\nscan_host = \"not a url\"").unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("scan_host"));
    }
}
