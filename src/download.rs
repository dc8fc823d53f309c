use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::feed::ChannelSource;
use crate::models::ChannelRecord;
use crate::store;

/// Characters that are not allowed in file names on at least one platform.
const INVALID_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The tool ran to completion and saved the stream under this name.
    Saved(String),
    /// No tools available; the playback URL is handed back for the user instead.
    UrlOnly(String),
}

/// Locate a binary: an explicit path that exists, or a bare name on `PATH`.
pub fn resolve_binary(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

pub fn tools_available(config: &DownloadConfig) -> bool {
    let downloader = resolve_binary(&config.binary);
    let ffmpeg = resolve_binary(&config.ffmpeg);
    debug!(downloader = ?downloader, ffmpeg = ?ffmpeg, "download tools");
    downloader.is_some() && ffmpeg.is_some()
}

pub fn sanitize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control() && !INVALID_NAME_CHARS.contains(c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// `[YYYY-MM-DD HH-MM-SS][nickname]name`, start time in the display zone.
pub fn save_name(record: &ChannelRecord, tz: Tz) -> String {
    let start = record.start_time.with_timezone(&tz).format("%Y-%m-%d %H-%M-%S");
    format!("[{start}][{}]{}", sanitize(&record.nickname), sanitize(&record.name))
}

pub fn download_args(url: &str, save_name: &str, ffmpeg: &str, extra_args: &[String]) -> Vec<String> {
    let mut args = vec![
        url.to_string(),
        "--save-name".to_string(),
        save_name.to_string(),
        "--ffmpeg-binary-path".to_string(),
        ffmpeg.to_string(),
    ];
    args.extend(extra_args.iter().cloned());
    args
}

/// Make sure the record carries a playback URL that still works.
///
/// Stored URLs are used while they have not expired. Otherwise the record is fetched
/// again, provided the platform still serves streams that old, and the fresh URLs
/// are written back to the store.
pub async fn resolve_playable<S: ChannelSource>(
    record: ChannelRecord,
    source: &S,
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<ChannelRecord> {
    let stream_id = record.stream_id;
    if record.can_download_local(now) && record.playback_url().is_some() {
        return Ok(record);
    }
    if !record.can_download_remote(now) {
        return Err(DownloadError::TooOld(stream_id).into());
    }

    info!(stream_id, "playback URL expired, refreshing");
    let Some(fresh) = source.get_channel(stream_id).await else {
        if source.is_canceled() {
            return Err(DownloadError::Cancelled(stream_id).into());
        }
        return Err(DownloadError::RefreshFailed(stream_id).into());
    };
    if fresh.playback_url().is_none() {
        return Err(DownloadError::NoPlaybackUrl(stream_id).into());
    }

    let updated = store::update_stream(pool, &fresh)
        .await
        .with_context(|| format!("storing refreshed URLs for stream {stream_id}"))?;
    if updated == 0 {
        warn!(stream_id, "refreshed stream is not in the local store");
    }
    Ok(fresh)
}

/// Run the download tool for one record, killing it if `cancel` fires first.
pub async fn run_download(
    config: &DownloadConfig,
    work_dir: &Path,
    record: &ChannelRecord,
    tz: Tz,
    cancel: CancellationToken,
) -> Result<String> {
    let stream_id = record.stream_id;
    let url = record.playback_url().ok_or(DownloadError::NoPlaybackUrl(stream_id))?;
    let name = save_name(record, tz);
    let ffmpeg = resolve_binary(&config.ffmpeg)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| config.ffmpeg.clone());

    tokio::fs::create_dir_all(work_dir)
        .await
        .with_context(|| format!("creating download directory {}", work_dir.display()))?;

    info!(
        stream_id,
        binary = %config.binary,
        save_name = %name,
        work_dir = %work_dir.display(),
        "starting download"
    );

    let mut cmd = tokio::process::Command::new(&config.binary);
    cmd.args(download_args(url, &name, &ffmpeg, &config.extra_args))
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DownloadError::BinaryNotFound(config.binary.clone()).into());
        }
        Err(e) => {
            return Err(DownloadError::Execution {
                exit_code: None,
                message: e.to_string(),
            }
            .into());
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!(stream_id, "download cancelled, killing download tool");
            let _ = child.kill().await;
            Err(DownloadError::Cancelled(stream_id).into())
        }
        status = child.wait() => {
            let status = status.map_err(|e| DownloadError::Execution {
                exit_code: None,
                message: e.to_string(),
            })?;
            if status.success() {
                info!(stream_id, save_name = %name, "download finished");
                Ok(name)
            } else {
                Err(DownloadError::Execution {
                    exit_code: status.code(),
                    message: format!("{} exited with {status}", config.binary),
                }
                .into())
            }
        }
    }
}

/// Download a stored stream, refreshing its URL first when needed.
pub async fn download_stream<S: ChannelSource>(
    config: &DownloadConfig,
    work_dir: &Path,
    pool: &SqlitePool,
    source: &S,
    stream_id: i64,
    tz: Tz,
    cancel: CancellationToken,
) -> Result<DownloadOutcome> {
    let record = store::get_stream(pool, stream_id)
        .await?
        .with_context(|| format!("stream {stream_id} is not in the local store"))?;
    let record = resolve_playable(record, source, pool, Utc::now()).await?;

    if !tools_available(config) {
        let url = record
            .playback_url()
            .ok_or(DownloadError::NoPlaybackUrl(stream_id))?
            .to_string();
        info!(stream_id, "download tools not found, returning playback URL");
        return Ok(DownloadOutcome::UrlOnly(url));
    }

    run_download(config, work_dir, &record, tz, cancel)
        .await
        .map(DownloadOutcome::Saved)
}
