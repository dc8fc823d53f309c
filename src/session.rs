//! HTTP session against the platform: QR login handshake, token exchange and the
//! cross-domain login for the video host.
//!
//! Every remote call is a soft failure: non-success HTTP status, a non-zero API result
//! code, transport errors and cancellation all come back as `None`/`false`. Callers tell
//! cancellation apart through [`SessionClient::is_canceled`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, SET_COOKIE};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ApiConfig, FetchConfig};
use crate::models::{Token, User, nullable};

/// Service id the token exchange and the video host expect.
const SID: &str = "acfun.midground.api";

/// Cookie the video host sets once the cross-domain login went through.
const FEDERATION_COOKIE: &str = "ks_onvideo_ps_token";

const COOKIE_PASS_TOKEN: &str = "acPasstoken";
const COOKIE_AUTH_KEY: &str = "auth_key";
const COOKIE_USER_ID: &str = "userId";

/// Continuation state of the QR handshake, rotated by each successful step.
#[derive(Debug, Default)]
struct ScanState {
    next: Option<String>,
    token: Option<String>,
    signature: Option<String>,
}

pub(crate) struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

pub(crate) enum Reply {
    Done(RawResponse),
    Transport(reqwest::Error),
    Cancelled,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StartResult {
    result: i64,
    #[serde(deserialize_with = "nullable")]
    image_data: String,
    #[serde(deserialize_with = "nullable")]
    next: String,
    #[serde(deserialize_with = "nullable")]
    qr_login_token: String,
    #[serde(deserialize_with = "nullable")]
    qr_login_signature: String,
    expire_time: i64,
    #[serde(rename = "error_msg", deserialize_with = "nullable")]
    error_msg: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ScanResult {
    result: i64,
    #[serde(deserialize_with = "nullable")]
    next: String,
    #[serde(deserialize_with = "nullable")]
    qr_login_signature: String,
    #[serde(deserialize_with = "nullable")]
    status: String,
    #[serde(rename = "error_msg", deserialize_with = "nullable")]
    error_msg: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AcceptResult {
    result: i64,
    #[serde(rename = "userId")]
    user_id: i64,
    #[serde(deserialize_with = "nullable")]
    ac_username: String,
    #[serde(deserialize_with = "nullable")]
    ac_userimg: String,
    #[serde(rename = "acPasstoken", deserialize_with = "nullable")]
    pass_token: String,
    #[serde(deserialize_with = "nullable")]
    error_msg: String,
}

pub struct SessionClient {
    http: reqwest::Client,
    jar: Arc<Jar>,
    pub(crate) api: ApiConfig,
    pub(crate) max_retries: u32,
    cancel: Mutex<CancellationToken>,
    scan: Mutex<ScanState>,
    authenticated: AtomicBool,
}

impl SessionClient {
    pub fn new(api: &ApiConfig, fetch: &FetchConfig) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(api.user_agent.as_str())
            .timeout(api.timeout())
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            jar,
            api: api.clone(),
            max_retries: fetch.max_retries,
            cancel: Mutex::new(CancellationToken::new()),
            scan: Mutex::new(ScanState::default()),
            authenticated: AtomicBool::new(false),
        })
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.lock().unwrap().is_cancelled()
    }

    /// Cancel whatever is in flight and every call after it, until [`reset`](Self::reset).
    pub fn cancel(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Install a fresh cancellation token.
    pub fn reset(&self) {
        *self.cancel.lock().unwrap() = CancellationToken::new();
    }

    /// The token in force right now; cancelled together with the client.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    /// True once [`federated_login`](Self::federated_login) succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Send a request, racing it against the current cancellation token.
    pub(crate) async fn send(&self, request: RequestBuilder) -> Reply {
        let cancel = self.cancellation();
        if cancel.is_cancelled() {
            return Reply::Cancelled;
        }

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?.to_vec();
            Ok::<_, reqwest::Error>(RawResponse { status, headers, body })
        };

        tokio::select! {
            _ = cancel.cancelled() => Reply::Cancelled,
            result = exchange => {
                if cancel.is_cancelled() {
                    return Reply::Cancelled;
                }
                match result {
                    Ok(response) => Reply::Done(response),
                    Err(e) => Reply::Transport(e),
                }
            }
        }
    }

    /// Send and decode a JSON reply; any failure is logged and becomes `None`.
    async fn call<T: DeserializeOwned>(&self, step: &'static str, request: RequestBuilder) -> Option<T> {
        let response = match self.send(request).await {
            Reply::Done(response) => response,
            Reply::Cancelled => {
                debug!(step, "request cancelled");
                return None;
            }
            Reply::Transport(e) => {
                warn!(step, error = %e, "request failed");
                return None;
            }
        };

        debug!(step, status = %response.status, body = %String::from_utf8_lossy(&response.body), "response");

        if !response.status.is_success() {
            warn!(step, status = %response.status, "unexpected HTTP status");
            return None;
        }

        match serde_json::from_slice(&response.body) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(step, error = %e, "malformed response body");
                None
            }
        }
    }

    /// Ask for a login challenge. Returns the QR code image to show the user.
    pub async fn start_scan(&self) -> Option<Vec<u8>> {
        self.reset();
        *self.scan.lock().unwrap() = ScanState::default();

        let url = format!("{}/rest/pc-direct/qr/start", self.api.scan_host);
        let request = self
            .http
            .get(url)
            .query(&[("type", "WEB_LOGIN")])
            .query(&[("_", Utc::now().timestamp())]);

        let result: StartResult = self.call("start scan", request).await?;
        if result.result != 0 {
            warn!(result = result.result, error = %result.error_msg, "start scan rejected");
            return None;
        }

        let image = match base64::engine::general_purpose::STANDARD.decode(result.image_data.trim()) {
            Ok(image) => image,
            Err(e) => {
                warn!(error = %e, "QR image is not valid base64");
                return None;
            }
        };

        debug!(expire_time = result.expire_time, "login challenge issued");
        *self.scan.lock().unwrap() = ScanState {
            next: Some(result.next),
            token: Some(result.qr_login_token),
            signature: Some(result.qr_login_signature),
        };

        Some(image)
    }

    /// Build the poll request for the current handshake step.
    fn scan_request(&self) -> Option<RequestBuilder> {
        let scan = self.scan.lock().unwrap();
        let (Some(next), Some(token), Some(signature)) = (&scan.next, &scan.token, &scan.signature) else {
            warn!("QR handshake polled before a challenge was issued");
            return None;
        };

        let url = format!("{}/rest/pc-direct/qr/{}", self.api.scan_host, next);
        Some(
            self.http
                .get(url)
                .query(&[("qrLoginToken", token.as_str()), ("qrLoginSignature", signature.as_str())])
                .query(&[("_", Utc::now().timestamp_millis())]),
        )
    }

    /// Wait for the mobile app to scan the code.
    pub async fn accept_scan(&self) -> bool {
        let Some(request) = self.scan_request() else {
            return false;
        };

        let Some(result) = self.call::<ScanResult>("accept scan", request).await else {
            return false;
        };
        if result.result != 0 {
            warn!(result = result.result, error = %result.error_msg, "scan not accepted");
            return false;
        }

        debug!(status = %result.status, "QR code scanned");
        let mut scan = self.scan.lock().unwrap();
        scan.next = Some(result.next);
        scan.signature = Some(result.qr_login_signature);
        true
    }

    /// Wait for the user to confirm the login in the app.
    pub async fn confirm_scan(&self) -> Option<User> {
        let request = self.scan_request()?;

        let result: AcceptResult = self.call("confirm scan", request).await?;
        if result.result != 0 {
            warn!(result = result.result, error = %result.error_msg, "login not confirmed");
            return None;
        }

        debug!(user_id = result.user_id, avatar = %result.ac_userimg, "login confirmed");
        Some(User {
            id: result.user_id,
            username: result.ac_username,
            avatar: result.ac_userimg,
            pass_token: result.pass_token,
        })
    }

    fn set_cookie(&self, domain: &str, name: &str, value: &str) {
        let host = domain.trim_start_matches('.');
        match Url::parse(&format!("https://{host}/")) {
            Ok(url) => self
                .jar
                .add_cookie_str(&format!("{name}={value}; Domain={domain}; Path=/"), &url),
            Err(e) => warn!(domain, error = %e, "cannot build cookie URL"),
        }
    }

    /// Put the confirmed user's identity cookies into the jar.
    pub fn inject_user_cookies(&self, user: &User) {
        let id = user.id.to_string();
        self.set_cookie(&self.api.passport_cookie_domain, COOKIE_PASS_TOKEN, &user.pass_token);
        self.set_cookie(&self.api.passport_cookie_domain, COOKIE_AUTH_KEY, &id);
        self.set_cookie(&self.api.video_cookie_domain, COOKIE_USER_ID, &id);
    }

    /// Exchange the logged-in session for the video host's token pair.
    pub async fn exchange_token(&self) -> Option<Token> {
        let url = format!("{}/rest/web/token/get", self.api.id_host);
        let request = self.http.post(url).form(&[("sid", SID)]);

        let token: Token = self.call("token exchange", request).await?;
        if token.result != 0 {
            warn!(result = token.result, error = %token.error_msg, "token exchange rejected");
            return None;
        }

        debug!(
            user_id = token.user_id,
            has_ssecurity = !token.ssecurity.is_empty(),
            "token exchanged"
        );
        self.set_cookie(&self.api.video_cookie_domain, Token::SESSION_COOKIE, &token.session_token);
        Some(token)
    }

    fn has_federation_cookie(&self, headers: &HeaderMap) -> bool {
        let in_response = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|cookie| cookie.contains(FEDERATION_COOKIE));
        if in_response {
            return true;
        }

        // Redirect hops store their cookies in the jar without surfacing the headers.
        Url::parse(&self.api.video_api_host)
            .ok()
            .and_then(|url| self.jar.cookies(&url))
            .and_then(|v| v.to_str().map(|s| s.contains(FEDERATION_COOKIE)).ok())
            .unwrap_or(false)
    }

    /// Establish the session on the video host using the exchanged token.
    pub async fn federated_login(&self, user: &User, token: &Token) -> bool {
        let follow_url = format!("{}/hub/home?source=ac", self.api.video_site);

        let sts = self
            .http
            .get(format!("{}/rest/infra/sts", self.api.video_api_host))
            .query(&[
                ("authToken", token.access_token.as_str()),
                ("sid", SID),
                ("followUrl", follow_url.as_str()),
                ("passToken", "null"),
            ])
            .query(&[("userId", user.id)]);

        match self.send(sts).await {
            Reply::Done(response) if response.status.is_success() => {
                debug!(status = %response.status, "sts handshake accepted");
            }
            Reply::Done(response) => {
                warn!(status = %response.status, "sts handshake rejected");
                return false;
            }
            Reply::Transport(e) => {
                warn!(error = %e, "sts handshake failed");
                return false;
            }
            Reply::Cancelled => return false,
        }

        let current = self
            .http
            .get(format!("{}/uaa/account/current", self.api.video_api_host))
            .query(&[("source", "ac"), ("__redirectURL", follow_url.as_str())]);

        let response = match self.send(current).await {
            Reply::Done(response) => response,
            Reply::Transport(e) => {
                warn!(error = %e, "account lookup failed");
                return false;
            }
            Reply::Cancelled => return false,
        };

        debug!(status = %response.status, body = %String::from_utf8_lossy(&response.body), "account lookup");

        if !response.status.is_success() {
            warn!(status = %response.status, "account lookup rejected");
            return false;
        }
        if !self.has_federation_cookie(&response.headers) {
            warn!(cookie = FEDERATION_COOKIE, "video host did not issue its session cookie");
            return false;
        }

        self.authenticated.store(true, Ordering::Release);
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use axum::Router;
    use axum::extract::{Path, Query, State};
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Form, Json};
    use serde_json::json;

    use super::*;

    pub(crate) async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub(crate) fn client_for(base: &str) -> SessionClient {
        let api = ApiConfig {
            scan_host: base.to_string(),
            id_host: base.to_string(),
            video_api_host: base.to_string(),
            video_site: base.to_string(),
            timeout: "5s".to_string(),
            ..Default::default()
        };
        SessionClient::new(&api, &FetchConfig::default()).unwrap()
    }

    pub(crate) fn qr_png() -> Vec<u8> {
        vec![0x89, b'P', b'N', b'G', 1, 2, 3]
    }

    /// Fake scan/id/video hosts for the whole handshake.
    pub(crate) fn login_router() -> Router {
        async fn start() -> Json<serde_json::Value> {
            Json(json!({
                "result": 0,
                "imageData": base64::engine::general_purpose::STANDARD.encode(qr_png()),
                "next": "scanResult",
                "qrLoginToken": "tok",
                "qrLoginSignature": "sig1",
                "expireTime": 120000
            }))
        }

        async fn poll(
            Path(step): Path<String>,
            Query(q): Query<std::collections::HashMap<String, String>>,
        ) -> Json<serde_json::Value> {
            assert_eq!(q.get("qrLoginToken").map(String::as_str), Some("tok"));
            match (step.as_str(), q.get("qrLoginSignature").map(String::as_str)) {
                ("scanResult", Some("sig1")) => Json(json!({
                    "result": 0, "next": "acceptResult", "qrLoginSignature": "sig2", "status": "SCANNED"
                })),
                ("acceptResult", Some("sig2")) => Json(json!({
                    "result": 0, "status": "ACCEPTED", "userId": 77,
                    "ac_username": "viewer", "ac_userimg": "https://img/avatar.png", "acPasstoken": "pass"
                })),
                _ => Json(json!({"result": 100400, "error_msg": "bad step"})),
            }
        }

        async fn token(Form(form): Form<std::collections::HashMap<String, String>>) -> Json<serde_json::Value> {
            assert_eq!(form.get("sid").map(String::as_str), Some(SID));
            Json(json!({
                "result": 0,
                "acfun.midground.api_st": "st",
                "acfun.midground.api.at": "at",
                "userId": 77,
                "ssecurity": "sec"
            }))
        }

        async fn sts(Query(q): Query<std::collections::HashMap<String, String>>) -> impl IntoResponse {
            assert_eq!(q.get("authToken").map(String::as_str), Some("at"));
            assert_eq!(q.get("userId").map(String::as_str), Some("77"));
            "ok"
        }

        async fn current() -> impl IntoResponse {
            (
                [(header::SET_COOKIE, "ks_onvideo_ps_token=abc; Path=/")],
                Json(json!({"result": 1})),
            )
        }

        Router::new()
            .route("/rest/pc-direct/qr/start", get(start))
            .route("/rest/pc-direct/qr/{step}", get(poll))
            .route("/rest/web/token/get", post(token))
            .route("/rest/infra/sts", get(sts))
            .route("/uaa/account/current", get(current))
    }

    #[tokio::test]
    async fn full_handshake_rotates_state() {
        let base = serve(login_router()).await;
        let client = client_for(&base);

        let image = client.start_scan().await.unwrap();
        assert_eq!(image, qr_png());
        assert!(client.accept_scan().await);
        let user = client.confirm_scan().await.unwrap();
        assert_eq!(user.id, 77);
        assert_eq!(user.username, "viewer");
        assert_eq!(user.pass_token, "pass");
        assert_eq!(user.avatar, "https://img/avatar.png");

        client.inject_user_cookies(&user);
        let token = client.exchange_token().await.unwrap();
        assert_eq!(token.access_token, "at");
        assert_eq!(token.ssecurity, "sec");
        assert!(!client.is_authenticated());
        assert!(client.federated_login(&user, &token).await);
        assert!(client.is_authenticated());
        assert!(!client.is_canceled());
    }

    #[tokio::test]
    async fn start_scan_rejects_non_zero_result() {
        let router = Router::new().route(
            "/rest/pc-direct/qr/start",
            get(|| async { Json(json!({"result": 1, "error_msg": "nope"})) }),
        );
        let client = client_for(&serve(router).await);
        assert!(client.start_scan().await.is_none());
        assert!(!client.is_canceled());
    }

    #[tokio::test]
    async fn start_scan_rejects_http_error() {
        let router = Router::new().route(
            "/rest/pc-direct/qr/start",
            get(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
        );
        let client = client_for(&serve(router).await);
        assert!(client.start_scan().await.is_none());
    }

    #[tokio::test]
    async fn polling_before_challenge_fails() {
        let client = client_for("http://127.0.0.1:9");
        assert!(!client.accept_scan().await);
        assert!(client.confirm_scan().await.is_none());
    }

    #[tokio::test]
    async fn token_exchange_rejects_non_zero_result() {
        let router = Router::new().route(
            "/rest/web/token/get",
            post(|| async { Json(json!({"result": 112, "error_msg": "expired"})) }),
        );
        let client = client_for(&serve(router).await);
        assert!(client.exchange_token().await.is_none());
    }

    #[tokio::test]
    async fn federated_login_requires_session_cookie() {
        let router = Router::new()
            .route("/rest/infra/sts", get(|| async { "ok" }))
            .route("/uaa/account/current", get(|| async { Json(json!({"result": 0})) }));
        let client = client_for(&serve(router).await);
        let user = User {
            id: 1,
            username: "u".into(),
            avatar: String::new(),
            pass_token: "p".into(),
        };
        let token: Token = serde_json::from_str(r#"{"result":0,"acfun.midground.api.at":"at"}"#).unwrap();
        assert!(!client.federated_login(&user, &token).await);
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_call() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/rest/pc-direct/qr/start",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Json(json!({"result": 0}))
                }),
            )
            .with_state(hits.clone());
        let client = Arc::new(client_for(&serve(router).await));

        let canceller = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        assert!(client.start_scan().await.is_none());
        assert!(client.is_canceled());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // later calls observe the flag without touching the network
        assert!(client.exchange_token().await.is_none());
        client.reset();
        assert!(!client.is_canceled());
    }
}
