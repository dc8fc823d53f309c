use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::models::User;
use crate::session::SessionClient;

/// Progress of a QR login, reported as it happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStatus {
    /// The QR code was written to this path and is waiting to be scanned.
    QrReady(PathBuf),
    Scanned,
    Confirmed { username: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailure {
    QrUnavailable,
    ScanTimedOut,
    NotConfirmed,
    TokenRejected,
    FederationRejected,
}

impl fmt::Display for LoginFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            LoginFailure::QrUnavailable => "could not get a login QR code",
            LoginFailure::ScanTimedOut => "QR code was not scanned in time, start again",
            LoginFailure::NotConfirmed => "login was not confirmed in the app",
            LoginFailure::TokenRejected => "token exchange was rejected",
            LoginFailure::FederationRejected => "video host refused the login",
        };
        f.write_str(msg)
    }
}

#[derive(Debug)]
pub enum LoginOutcome {
    LoggedIn(User),
    Cancelled,
    Failed(LoginFailure),
}

impl LoginOutcome {
    fn failed(client: &SessionClient, failure: LoginFailure) -> Self {
        if client.is_canceled() {
            LoginOutcome::Cancelled
        } else {
            LoginOutcome::Failed(failure)
        }
    }
}

async fn remove_qr(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove QR code image");
    }
}

/// Run the whole QR login: challenge, scan, confirmation, token exchange and the
/// cross-domain login. Only writing the QR image can fail hard.
pub async fn qr_login<F>(client: &SessionClient, qr_path: &Path, mut notify: F) -> Result<LoginOutcome>
where
    F: FnMut(LoginStatus),
{
    let Some(image) = client.start_scan().await else {
        return Ok(LoginOutcome::failed(client, LoginFailure::QrUnavailable));
    };

    if let Some(parent) = qr_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    tokio::fs::write(qr_path, &image)
        .await
        .with_context(|| format!("writing QR code to {}", qr_path.display()))?;
    info!(path = %qr_path.display(), "login QR code ready");
    notify(LoginStatus::QrReady(qr_path.to_path_buf()));

    if !client.accept_scan().await {
        remove_qr(qr_path).await;
        return Ok(LoginOutcome::failed(client, LoginFailure::ScanTimedOut));
    }
    notify(LoginStatus::Scanned);

    let user = client.confirm_scan().await;
    remove_qr(qr_path).await;
    let Some(user) = user else {
        return Ok(LoginOutcome::failed(client, LoginFailure::NotConfirmed));
    };
    notify(LoginStatus::Confirmed {
        username: user.username.clone(),
    });

    client.inject_user_cookies(&user);

    let Some(token) = client.exchange_token().await else {
        return Ok(LoginOutcome::failed(client, LoginFailure::TokenRejected));
    };

    if !client.federated_login(&user, &token).await {
        return Ok(LoginOutcome::failed(client, LoginFailure::FederationRejected));
    }

    info!(user_id = user.id, username = %user.username, "logged in");
    Ok(LoginOutcome::LoggedIn(user))
}

#[cfg(test)]
mod tests {
    use axum::Json;
    use axum::Router;
    use axum::routing::get;
    use serde_json::json;

    use super::*;
    use crate::session::tests::{client_for, login_router, qr_png, serve};

    #[tokio::test]
    async fn logs_in_and_reports_progress() {
        let base = serve(login_router()).await;
        let client = client_for(&base);
        let dir = tempfile::tempdir().unwrap();
        let qr_path = dir.path().join("qr").join("login.png");

        let mut seen = Vec::new();
        let qr_check = qr_path.clone();
        let outcome = qr_login(&client, &qr_path, |status| {
            if let LoginStatus::QrReady(path) = &status {
                assert_eq!(std::fs::read(path).unwrap(), qr_png());
                assert_eq!(path, &qr_check);
            }
            seen.push(status);
        })
        .await
        .unwrap();

        match outcome {
            LoginOutcome::LoggedIn(user) => assert_eq!(user.id, 77),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            seen,
            vec![
                LoginStatus::QrReady(qr_path.clone()),
                LoginStatus::Scanned,
                LoginStatus::Confirmed {
                    username: "viewer".into()
                },
            ]
        );
        assert!(!qr_path.exists());
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn reports_missing_qr_code() {
        let router = Router::new().route(
            "/rest/pc-direct/qr/start",
            get(|| async { Json(json!({"result": 2, "error_msg": "busy"})) }),
        );
        let client = client_for(&serve(router).await);
        let dir = tempfile::tempdir().unwrap();

        let outcome = qr_login(&client, &dir.path().join("qr.png"), |_| {}).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::Failed(LoginFailure::QrUnavailable)));
    }

    #[tokio::test]
    async fn scan_timeout_cleans_up_image() {
        let router = Router::new()
            .route(
                "/rest/pc-direct/qr/start",
                get(|| async {
                    Json(json!({
                        "result": 0, "imageData": "iVBORw==", "next": "scanResult",
                        "qrLoginToken": "t", "qrLoginSignature": "s"
                    }))
                }),
            )
            .route(
                "/rest/pc-direct/qr/{step}",
                get(|| async { Json(json!({"result": 100400002, "error_msg": "expired"})) }),
            );
        let client = client_for(&serve(router).await);
        let dir = tempfile::tempdir().unwrap();
        let qr_path = dir.path().join("qr.png");

        let outcome = qr_login(&client, &qr_path, |_| {}).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::Failed(LoginFailure::ScanTimedOut)));
        assert!(!qr_path.exists());
    }

    #[tokio::test]
    async fn cancellation_is_reported_as_cancelled() {
        let router = Router::new().route(
            "/rest/pc-direct/qr/start",
            get(|| async {
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                Json(json!({"result": 0}))
            }),
        );
        let client = std::sync::Arc::new(client_for(&serve(router).await));
        let canceller = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let dir = tempfile::tempdir().unwrap();
        let outcome = qr_login(&client, &dir.path().join("qr.png"), |_| {}).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::Cancelled));
    }

    #[test]
    fn failure_messages() {
        assert_eq!(
            LoginFailure::ScanTimedOut.to_string(),
            "QR code was not scanned in time, start again"
        );
    }
}
