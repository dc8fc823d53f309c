use chrono::{DateTime, Months, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;

/// Separator used for the playback URL list in the `stream_urls` column.
pub const URL_SEPARATOR: char = '|';

/// One observed live-stream session ("channel" in the platform's vocabulary).
///
/// Decoded straight from the feed API's `data` object. Timestamps travel as
/// milliseconds since the epoch; anything that is not a number decodes as the
/// epoch, which for `end_time` means "still live / unknown".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelRecord {
    #[serde(deserialize_with = "nullable")]
    pub id: String,
    pub stream_id: i64,
    #[serde(deserialize_with = "nullable")]
    pub stream_name: String,
    #[serde(deserialize_with = "nullable")]
    pub name: String,
    pub status: i64,
    #[serde(deserialize_with = "nullable")]
    pub stream_urls: Vec<String>,
    #[serde(deserialize_with = "nullable")]
    pub stream_inner_url: String,
    #[serde(with = "millis")]
    pub created_time: DateTime<Utc>,
    #[serde(with = "millis")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "millis")]
    pub end_time: DateTime<Utc>,
    pub thumb_url: Option<String>,
    #[serde(with = "millis")]
    pub stream_url_expired_time: DateTime<Utc>,
    pub client_source_id: i64,
    #[serde(rename = "type")]
    pub kind: i64,
    pub client: i64,
    pub weight: i64,
    pub manage: i64,
    pub ks_user_id: i64,
    #[serde(deserialize_with = "nullable")]
    pub nickname: String,
    pub user_id: i64,
    pub sort_id: i64,
    pub private_live: bool,
    pub property: i64,
}

impl ChannelRecord {
    pub fn is_live(&self) -> bool {
        self.end_time == DateTime::<Utc>::UNIX_EPOCH
    }

    /// Stream length, `None` while the stream is live or its end is unknown.
    pub fn duration(&self) -> Option<chrono::Duration> {
        (!self.is_live()).then(|| self.end_time - self.start_time)
    }

    /// The stored playback URLs are still valid for a direct download.
    pub fn can_download_local(&self, now: DateTime<Utc>) -> bool {
        self.stream_url_expired_time > now
    }

    /// Recent enough (last two months) that the platform can still serve it.
    pub fn can_download_remote(&self, now: DateTime<Utc>) -> bool {
        match now.checked_sub_months(Months::new(2)) {
            Some(cutoff) => self.start_time > cutoff,
            None => false,
        }
    }

    pub fn playback_url(&self) -> Option<&str> {
        self.stream_urls.first().map(String::as_str)
    }

    /// `start ~ end` in the given zone; `N/A` for the end of a live stream.
    pub fn time_range(&self, tz: Tz) -> String {
        let start = self.start_time.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S");
        if self.is_live() {
            format!("{start} ~ N/A")
        } else {
            let end = self.end_time.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S");
            format!("{start} ~ {end}")
        }
    }

    pub fn duration_label(&self) -> String {
        match self.duration() {
            Some(d) => {
                let secs = d.num_seconds().max(0);
                format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
            }
            None => "N/A".to_string(),
        }
    }

    pub fn expire_label(&self, tz: Tz) -> String {
        self.stream_url_expired_time
            .with_timezone(&tz)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    /// URL list as stored in the database (`NULL` when there is none).
    pub fn joined_urls(&self) -> Option<String> {
        if self.stream_urls.is_empty() {
            None
        } else {
            Some(self.stream_urls.join(&URL_SEPARATOR.to_string()))
        }
    }
}

/// Row shape of the `streams` table.
#[derive(Debug, FromRow)]
pub struct ChannelRow {
    pub stream_id: i64,
    pub id: String,
    pub stream_name: String,
    pub name: String,
    pub status: i64,
    pub stream_urls: Option<String>,
    pub stream_inner_url: String,
    pub created_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub thumb_url: Option<String>,
    pub stream_url_expired_time: i64,
    pub client_source_id: i64,
    pub kind: i64,
    pub client: i64,
    pub weight: i64,
    pub manage: i64,
    pub ks_user_id: i64,
    pub nickname: String,
    pub user_id: i64,
    pub sort_id: i64,
    pub private_live: bool,
    pub property: i64,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl From<ChannelRow> for ChannelRecord {
    fn from(row: ChannelRow) -> Self {
        let stream_urls = row
            .stream_urls
            .filter(|s| !s.is_empty())
            .map(|s| s.split(URL_SEPARATOR).map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            id: row.id,
            stream_id: row.stream_id,
            stream_name: row.stream_name,
            name: row.name,
            status: row.status,
            stream_urls,
            stream_inner_url: row.stream_inner_url,
            created_time: from_millis(row.created_time),
            start_time: from_millis(row.start_time),
            end_time: from_millis(row.end_time),
            thumb_url: row.thumb_url,
            stream_url_expired_time: from_millis(row.stream_url_expired_time),
            client_source_id: row.client_source_id,
            kind: row.kind,
            client: row.client,
            weight: row.weight,
            manage: row.manage,
            ks_user_id: row.ks_user_id,
            nickname: row.nickname,
            user_id: row.user_id,
            sort_id: row.sort_id,
            private_live: row.private_live,
            property: row.property,
        }
    }
}

/// A streamer known to the local store.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct LiveUser {
    pub user_id: i64,
    pub nickname: String,
}

/// The identity returned once the QR login is confirmed. Held in memory only.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub avatar: String,
    pub pass_token: String,
}

/// Cross-domain token pair returned by the token exchange. Held in memory only.
#[derive(Debug, Clone, Deserialize)]
pub struct Token {
    #[serde(default = "unset")]
    pub result: i64,
    #[serde(rename = "acfun.midground.api_st", default, deserialize_with = "nullable")]
    pub session_token: String,
    #[serde(rename = "acfun.midground.api.at", default, deserialize_with = "nullable")]
    pub access_token: String,
    #[serde(rename = "userId", default = "unset")]
    pub user_id: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub ssecurity: String,
    #[serde(default, deserialize_with = "nullable")]
    pub error_msg: String,
}

impl Token {
    pub const SESSION_COOKIE: &'static str = "acfun.midground.api_st";
}

fn unset() -> i64 {
    -1
}

/// Treat JSON `null` like a missing field.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.timestamp_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(value
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decodes_feed_payload() {
        let json = r#"{
            "id": "abc",
            "streamId": 4242,
            "streamName": "room",
            "name": "evening show",
            "status": 2,
            "streamUrls": ["https://cdn/a.m3u8", "https://cdn/b.m3u8"],
            "streamInnerUrl": "inner",
            "createdTime": 1700000000000,
            "startTime": 1700000100000,
            "endTime": 1700003700000,
            "thumbUrl": null,
            "streamUrlExpiredTime": 1700090000000,
            "type": 7,
            "ksUserId": 55,
            "nickname": "host",
            "userId": 99,
            "privateLive": true
        }"#;
        let record: ChannelRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.stream_id, 4242);
        assert_eq!(record.kind, 7);
        assert_eq!(record.stream_urls.len(), 2);
        assert_eq!(record.playback_url(), Some("https://cdn/a.m3u8"));
        assert_eq!(record.thumb_url, None);
        assert!(record.private_live);
        assert_eq!(record.duration(), Some(chrono::Duration::hours(1)));
        assert_eq!(record.duration_label(), "1:00:00");
    }

    #[test]
    fn tolerates_null_urls_and_non_numeric_times() {
        let json = r#"{"streamId": 1, "streamUrls": null, "endTime": "", "nickname": null}"#;
        let record: ChannelRecord = serde_json::from_str(json).unwrap();
        assert!(record.stream_urls.is_empty());
        assert!(record.is_live());
        assert_eq!(record.duration(), None);
        assert_eq!(record.duration_label(), "N/A");
        assert_eq!(record.nickname, "");
        assert_eq!(record.joined_urls(), None);
    }

    #[test]
    fn download_windows() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let record = ChannelRecord {
            start_time: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            stream_url_expired_time: Utc.with_ymd_and_hms(2024, 6, 15, 11, 0, 0).unwrap(),
            ..Default::default()
        };
        assert!(!record.can_download_local(now));
        assert!(record.can_download_remote(now));

        let old = ChannelRecord {
            start_time: Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
            stream_url_expired_time: Utc.with_ymd_and_hms(2024, 6, 16, 0, 0, 0).unwrap(),
            ..Default::default()
        };
        assert!(old.can_download_local(now));
        assert!(!old.can_download_remote(now));
    }

    #[test]
    fn time_range_uses_zone() {
        let record = ChannelRecord {
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, 16, 0, 0).unwrap(),
            ..Default::default()
        };
        assert_eq!(record.time_range(chrono_tz::Asia::Shanghai), "2024-01-02 00:00:00 ~ N/A");
    }

    #[test]
    fn row_round_trip_splits_urls() {
        let row = ChannelRow {
            stream_id: 3,
            id: "x".into(),
            stream_name: String::new(),
            name: String::new(),
            status: 0,
            stream_urls: Some("u1|u2".into()),
            stream_inner_url: String::new(),
            created_time: 0,
            start_time: 1_000,
            end_time: 0,
            thumb_url: None,
            stream_url_expired_time: 0,
            client_source_id: 0,
            kind: 0,
            client: 0,
            weight: 0,
            manage: 0,
            ks_user_id: 0,
            nickname: "n".into(),
            user_id: 1,
            sort_id: 0,
            private_live: false,
            property: 0,
        };
        let record = ChannelRecord::from(row);
        assert_eq!(record.stream_urls, vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(record.joined_urls().as_deref(), Some("u1|u2"));
        assert_eq!(record.start_time.timestamp_millis(), 1_000);
    }

    #[test]
    fn token_field_names() {
        let json = r#"{"result":0,"acfun.midground.api_st":"st","acfun.midground.api.at":"at","userId":7,"ssecurity":"s"}"#;
        let token: Token = serde_json::from_str(json).unwrap();
        assert_eq!(token.result, 0);
        assert_eq!(token.session_token, "st");
        assert_eq!(token.access_token, "at");
        assert_eq!(token.user_id, 7);
        assert_eq!(token.error_msg, "");
    }
}
