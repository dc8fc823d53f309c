use anyhow::{Context, Result};
use chrono::{DateTime, Days, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Sqlite, SqlitePool};
use tracing::debug;

use crate::models::{ChannelRecord, ChannelRow, LiveUser};

/// All stream columns in SELECT order (must match ChannelRow field order).
const STREAM_COLUMNS: &str = "stream_id, id, stream_name, name, status, stream_urls, stream_inner_url,
    created_time, start_time, end_time, thumb_url, stream_url_expired_time,
    client_source_id, kind, client, weight, manage, ks_user_id, nickname, user_id, sort_id,
    private_live, property";

const INSERT_STREAM: &str = "INSERT OR REPLACE INTO streams (
    stream_id, id, stream_name, name, status, stream_urls, stream_inner_url,
    created_time, start_time, end_time, thumb_url, stream_url_expired_time,
    client_source_id, kind, client, weight, manage, ks_user_id, nickname, user_id, sort_id,
    private_live, property)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// How many rows the unfiltered listing returns.
const RECENT_LIMIT: i64 = 100;

fn insert_query(record: &ChannelRecord) -> sqlx::query::Query<'_, Sqlite, SqliteArguments<'_>> {
    sqlx::query(INSERT_STREAM)
        .bind(record.stream_id)
        .bind(&record.id)
        .bind(&record.stream_name)
        .bind(&record.name)
        .bind(record.status)
        .bind(record.joined_urls())
        .bind(&record.stream_inner_url)
        .bind(record.created_time.timestamp_millis())
        .bind(record.start_time.timestamp_millis())
        .bind(record.end_time.timestamp_millis())
        .bind(&record.thumb_url)
        .bind(record.stream_url_expired_time.timestamp_millis())
        .bind(record.client_source_id)
        .bind(record.kind)
        .bind(record.client)
        .bind(record.weight)
        .bind(record.manage)
        .bind(record.ks_user_id)
        .bind(&record.nickname)
        .bind(record.user_id)
        .bind(record.sort_id)
        .bind(record.private_live)
        .bind(record.property)
}

fn into_records(rows: Vec<ChannelRow>) -> Vec<ChannelRecord> {
    rows.into_iter().map(ChannelRecord::from).collect()
}

/// The 100 most recent streams, newest first.
pub async fn get_recent_streams(pool: &SqlitePool) -> Result<Vec<ChannelRecord>> {
    let rows = sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {STREAM_COLUMNS} FROM streams ORDER BY stream_id DESC LIMIT ?"
    ))
    .bind(RECENT_LIMIT)
    .fetch_all(pool)
    .await
    .context("querying recent streams")?;

    Ok(into_records(rows))
}

pub async fn stream_exists(pool: &SqlitePool, stream_id: i64) -> Result<bool> {
    let found: i64 = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM streams WHERE stream_id = ? LIMIT 1)")
        .bind(stream_id)
        .fetch_one(pool)
        .await
        .context("checking stream existence")?;

    Ok(found == 1)
}

/// Whether any stream id in `[a, b]` is stored. Bounds may be given in either order.
pub async fn streams_exist_in_range(pool: &SqlitePool, a: i64, b: i64) -> Result<bool> {
    let (start, end) = if a <= b { (a, b) } else { (b, a) };
    let found: i64 =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM streams WHERE stream_id BETWEEN ? AND ? LIMIT 1)")
            .bind(start)
            .bind(end)
            .fetch_one(pool)
            .await
            .context("checking stream range existence")?;

    Ok(found == 1)
}

pub async fn get_users(pool: &SqlitePool) -> Result<Vec<LiveUser>> {
    let users = sqlx::query_as::<_, LiveUser>(
        "SELECT DISTINCT user_id, nickname FROM streams ORDER BY user_id, nickname",
    )
    .fetch_all(pool)
    .await
    .context("querying known users")?;

    Ok(users)
}

/// Highest stored stream id, 0 for an empty store.
pub async fn last_stream_id(pool: &SqlitePool) -> Result<i64> {
    let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(stream_id), 0) FROM streams")
        .fetch_one(pool)
        .await
        .context("querying last stream id")?;

    Ok(id)
}

/// Start of today (UTC) minus two months: streams starting after this can still be
/// fetched from the platform.
pub fn remote_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    midnight.checked_sub_months(Months::new(2)).unwrap_or(midnight)
}

/// Streams recent enough to be downloaded remotely.
pub async fn get_valid_streams(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<ChannelRecord>> {
    let rows = sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {STREAM_COLUMNS} FROM streams WHERE start_time >= ? ORDER BY stream_id DESC"
    ))
    .bind(remote_cutoff(now).timestamp_millis())
    .fetch_all(pool)
    .await
    .context("querying valid streams")?;

    Ok(into_records(rows))
}

pub async fn get_streams_by_nickname(pool: &SqlitePool, nickname: &str) -> Result<Vec<ChannelRecord>> {
    let rows = sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {STREAM_COLUMNS} FROM streams WHERE nickname LIKE ? ORDER BY stream_id DESC"
    ))
    .bind(format!("%{nickname}%"))
    .fetch_all(pool)
    .await
    .context("querying streams by nickname")?;

    Ok(into_records(rows))
}

pub async fn get_streams_by_user_id(pool: &SqlitePool, user_id: i64) -> Result<Vec<ChannelRecord>> {
    let rows = sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {STREAM_COLUMNS} FROM streams WHERE user_id = ? ORDER BY stream_id DESC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("querying streams by user id")?;

    Ok(into_records(rows))
}

pub async fn get_streams_by_range(pool: &SqlitePool, a: i64, b: i64) -> Result<Vec<ChannelRecord>> {
    let (start, end) = if a <= b { (a, b) } else { (b, a) };
    let rows = sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {STREAM_COLUMNS} FROM streams WHERE stream_id BETWEEN ? AND ? ORDER BY stream_id DESC"
    ))
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
    .context("querying streams by id range")?;

    Ok(into_records(rows))
}

/// Streams that started on `date` as seen in `tz`.
pub async fn get_streams_by_date(pool: &SqlitePool, date: NaiveDate, tz: Tz) -> Result<Vec<ChannelRecord>> {
    let local_midnight = date.and_time(NaiveTime::MIN);
    let start = tz
        .from_local_datetime(&local_midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| local_midnight.and_utc());
    let end = start.checked_add_days(Days::new(1)).unwrap_or(start);

    let rows = sqlx::query_as::<_, ChannelRow>(&format!(
        "SELECT {STREAM_COLUMNS} FROM streams WHERE start_time BETWEEN ? AND ? ORDER BY stream_id DESC"
    ))
    .bind(start.timestamp_millis())
    .bind(end.timestamp_millis())
    .fetch_all(pool)
    .await
    .context("querying streams by date")?;

    Ok(into_records(rows))
}

pub async fn get_stream(pool: &SqlitePool, stream_id: i64) -> Result<Option<ChannelRecord>> {
    let row = sqlx::query_as::<_, ChannelRow>(&format!("SELECT {STREAM_COLUMNS} FROM streams WHERE stream_id = ?"))
        .bind(stream_id)
        .fetch_optional(pool)
        .await
        .context("querying stream by id")?;

    Ok(row.map(ChannelRecord::from))
}

/// Insert-or-replace a single stream.
pub async fn add_stream(pool: &SqlitePool, record: &ChannelRecord) -> Result<()> {
    insert_query(record)
        .execute(pool)
        .await
        .context("inserting stream")?;

    debug!(stream_id = record.stream_id, "stored stream");
    Ok(())
}

/// Insert-or-replace many streams in one transaction.
pub async fn add_streams(pool: &SqlitePool, records: &[ChannelRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await.context("starting stream batch transaction")?;
    for record in records {
        insert_query(record)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting stream {}", record.stream_id))?;
    }
    tx.commit().await.context("committing stream batch")?;

    debug!(count = records.len(), "stored stream batch");
    Ok(())
}

/// Refresh the fields that change after a stream is first seen. Returns rows updated.
pub async fn update_stream(pool: &SqlitePool, record: &ChannelRecord) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE streams SET
            stream_urls = ?,
            stream_inner_url = ?,
            created_time = ?,
            start_time = ?,
            end_time = ?,
            stream_url_expired_time = ?,
            ks_user_id = ?,
            nickname = ?,
            user_id = ?,
            sort_id = ?
         WHERE stream_id = ?",
    )
    .bind(record.joined_urls())
    .bind(&record.stream_inner_url)
    .bind(record.created_time.timestamp_millis())
    .bind(record.start_time.timestamp_millis())
    .bind(record.end_time.timestamp_millis())
    .bind(record.stream_url_expired_time.timestamp_millis())
    .bind(record.ks_user_id)
    .bind(&record.nickname)
    .bind(record.user_id)
    .bind(record.sort_id)
    .bind(record.stream_id)
    .execute(pool)
    .await
    .context("updating stream")?;

    Ok(result.rows_affected())
}
