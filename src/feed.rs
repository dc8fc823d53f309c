use reqwest::header::{ORIGIN, REFERER};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::models::ChannelRecord;
use crate::session::{Reply, SessionClient};

/// Anything that can look up a channel by stream id. The fetch loop depends on this
/// rather than on the HTTP client directly.
pub trait ChannelSource {
    async fn get_channel(&self, stream_id: i64) -> Option<ChannelRecord>;

    /// Whether the last `None` was caused by cancellation.
    fn is_canceled(&self) -> bool;
}

/// Envelope of the video API.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

const CODE_OK: i64 = 200;

enum Attempt {
    Found(ChannelRecord),
    Io(reqwest::Error),
    Rejected,
    Cancelled,
}

impl SessionClient {
    async fn request_channel(&self, stream_id: i64) -> Attempt {
        let url = format!("{}/api/live/get_channel/{}", self.api.video_api_host, stream_id);
        let mut request = self.http().get(url).query(&[("source", "ac")]);
        if self.is_authenticated() {
            request = request
                .header(ORIGIN, self.api.video_site.as_str())
                .header(REFERER, format!("{}/", self.api.video_site));
        }

        let response = match self.send(request).await {
            Reply::Done(response) => response,
            Reply::Transport(e) => return Attempt::Io(e),
            Reply::Cancelled => return Attempt::Cancelled,
        };

        debug!(stream_id, body = %String::from_utf8_lossy(&response.body), "get channel");

        if !response.status.is_success() {
            debug!(stream_id, status = %response.status, "get channel rejected");
            return Attempt::Rejected;
        }

        let envelope: ApiResponse<ChannelRecord> = match serde_json::from_slice(&response.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(stream_id, error = %e, "failed to decode channel response");
                return Attempt::Rejected;
            }
        };

        match envelope {
            ApiResponse {
                code: CODE_OK,
                data: Some(record),
                ..
            } => Attempt::Found(record),
            ApiResponse { code, msg, .. } => {
                debug!(stream_id, code, msg = msg.as_deref().unwrap_or(""), "no channel");
                Attempt::Rejected
            }
        }
    }

    /// Fetch one channel record.
    ///
    /// A record that comes back without playback URLs, and a transport failure, are
    /// both retried up to `max_retries` more times. Once the budget is spent the empty
    /// record is returned as is, while the transport failure gives up on the id.
    /// Malformed or rejected responses and cancellation return `None` straight away.
    pub async fn get_channel(&self, stream_id: i64) -> Option<ChannelRecord> {
        let mut retries = 0;
        loop {
            if self.is_canceled() {
                return None;
            }

            match self.request_channel(stream_id).await {
                Attempt::Found(record) if !record.stream_urls.is_empty() => return Some(record),
                Attempt::Found(mut record) => {
                    if retries < self.max_retries {
                        retries += 1;
                        debug!(stream_id, retries, "no playback URLs yet, retrying");
                        continue;
                    }
                    record.stream_urls.clear();
                    return Some(record);
                }
                Attempt::Io(e) => {
                    if retries < self.max_retries {
                        retries += 1;
                        warn!(stream_id, retries, error = %e, "transport error, retrying");
                        continue;
                    }
                    error!(stream_id, error = %e, "giving up on channel after transport errors");
                    return None;
                }
                Attempt::Rejected | Attempt::Cancelled => return None,
            }
        }
    }
}

impl ChannelSource for SessionClient {
    async fn get_channel(&self, stream_id: i64) -> Option<ChannelRecord> {
        SessionClient::get_channel(self, stream_id).await
    }

    fn is_canceled(&self) -> bool {
        SessionClient::is_canceled(self)
    }
}
