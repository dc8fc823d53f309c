use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download tool not found: {0}")]
    BinaryNotFound(String),
    #[error("download tool failed (exit code {exit_code:?}): {message}")]
    Execution { exit_code: Option<i32>, message: String },
    #[error("stream {0} has no playback URL")]
    NoPlaybackUrl(i64),
    #[error("stream {0} is too old to be served by the platform")]
    TooOld(i64),
    #[error("could not refresh playback URL for stream {0}")]
    RefreshFailed(i64),
    #[error("download of stream {0} cancelled")]
    Cancelled(i64),
}
