mod cli;
mod config;
mod db;
mod download;
mod error;
mod feed;
mod fetcher;
mod login;
mod models;
mod session;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use chrono_tz::Tz;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::{Config, load_config, validate_config};
use crate::download::DownloadOutcome;
use crate::error::DownloadError;
use crate::fetcher::{FetchEvent, FetchState, Fetcher};
use crate::login::{LoginOutcome, LoginStatus};
use crate::models::{ChannelRecord, User};
use crate::session::SessionClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.aika.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    let tz = config.tz();

    match cli.command {
        Commands::Validate => {
            println!("Configuration is valid.");
        }
        Commands::Login => {
            let client = session_client(&config)?;
            interactive_login(&client, &config).await?;
        }
        Commands::Fetch { start, count } => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            info!(db_path = %config.db_path().display(), "database ready");

            let client = session_client(&config)?;
            if interactive_login(&client, &config).await?.is_none() {
                return Ok(());
            }

            let start = match start {
                Some(id) => id,
                None => store::last_stream_id(&pool).await?,
            };
            info!(start, count, "fetching streams");

            let (tx, mut rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        FetchEvent::Fetched {
                            stream_id,
                            current,
                            total,
                            nickname,
                            name,
                        } => println!("[{current}/{total}] {stream_id} {nickname}: {name}"),
                        FetchEvent::Failed { stream_id, consecutive } => {
                            println!("{stream_id} not available ({consecutive} in a row)")
                        }
                        FetchEvent::Flushed { count } => println!("saved {count} streams"),
                    }
                }
            });

            let mut fetcher = Fetcher::new(client.as_ref(), &pool, &config.fetch, start).with_events(tx);
            let outcome = fetcher.run(count).await;
            drop(fetcher);
            let _ = printer.await;

            let summary = match outcome.state {
                FetchState::Completed => "Fetch completed",
                FetchState::Cancelled => "Fetch cancelled",
                FetchState::Aborted => "Fetch stopped after too many consecutive failures",
            };
            println!(
                "{summary}: {} fetched, {} saved, {} ids tried, resume from {}",
                outcome.records.len(),
                outcome.persisted,
                outcome.attempted,
                outcome.last_id
            );
        }
        Commands::Search {
            name,
            uid,
            from,
            to,
            date,
            valid,
            json,
        } => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            let records = if let Some(name) = name {
                store::get_streams_by_nickname(&pool, &name).await?
            } else if let Some(uid) = uid {
                store::get_streams_by_user_id(&pool, uid).await?
            } else if let (Some(a), Some(b)) = (from, to) {
                store::get_streams_by_range(&pool, a, b).await?
            } else if let Some(date) = date {
                store::get_streams_by_date(&pool, date, tz).await?
            } else if valid {
                store::get_valid_streams(&pool, Utc::now()).await?
            } else {
                store::get_recent_streams(&pool).await?
            };
            print_records(&records, json, tz)?;
        }
        Commands::Users => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            let users = store::get_users(&pool).await?;
            if users.is_empty() {
                println!("No streamers stored yet.");
            }
            for user in users {
                println!("{:>12}  {}", user.user_id, user.nickname);
            }
        }
        Commands::Show { stream_id } => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            let record = store::get_stream(&pool, stream_id)
                .await?
                .with_context(|| format!("stream {stream_id} is not in the local store"))?;
            print_details(&record, tz);
        }
        Commands::Download { stream_id } => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            let client = session_client(&config)?;

            // Refreshing an expired URL goes through the video host, which wants a session.
            let now = Utc::now();
            if let Some(record) = store::get_stream(&pool, stream_id).await?
                && !record.can_download_local(now)
                && record.can_download_remote(now)
                && interactive_login(&client, &config).await?.is_none()
            {
                return Ok(());
            }

            let result = download::download_stream(
                &config.download,
                &config.download_dir(),
                &pool,
                client.as_ref(),
                stream_id,
                tz,
                client.cancellation(),
            )
            .await;

            match result {
                Ok(DownloadOutcome::Saved(name)) => {
                    println!("Saved {name} to {}", config.download_dir().display());
                }
                Ok(DownloadOutcome::UrlOnly(url)) => {
                    println!("Download tools not found. Playback URL:\n{url}");
                }
                Err(e) if matches!(e.downcast_ref::<DownloadError>(), Some(DownloadError::Cancelled(_))) => {
                    println!("Download cancelled.");
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(())
}

/// Build the shared session client and cancel it on every Ctrl-C.
fn session_client(config: &Config) -> Result<Arc<SessionClient>> {
    let client = Arc::new(SessionClient::new(&config.api, &config.fetch)?);

    let watched = client.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            watched.cancel();
        }
    });

    Ok(client)
}

/// Interactive QR login. `None` when the user cancelled.
async fn interactive_login(client: &SessionClient, config: &Config) -> Result<Option<User>> {
    let outcome = login::qr_login(client, &config.qr_path(), |status| match status {
        LoginStatus::QrReady(path) => {
            println!("Scan the QR code in {} with the mobile app.", path.display())
        }
        LoginStatus::Scanned => println!("Scanned. Confirm the login in the app."),
        LoginStatus::Confirmed { username } => println!("Confirmed as {username}, finishing login..."),
    })
    .await?;

    match outcome {
        LoginOutcome::LoggedIn(user) => {
            println!("Logged in as {} ({}).", user.username, user.id);
            if !user.avatar.is_empty() {
                println!("Avatar: {}", user.avatar);
            }
            Ok(Some(user))
        }
        LoginOutcome::Cancelled => {
            println!("Login cancelled.");
            Ok(None)
        }
        LoginOutcome::Failed(failure) => anyhow::bail!("login failed: {failure}"),
    }
}

fn print_records(records: &[ChannelRecord], json: bool, tz: Tz) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records).context("encoding records")?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No streams found.");
        return Ok(());
    }
    for record in records {
        println!(
            "{:>10}  {}  {:>9}  {}({})  {}",
            record.stream_id,
            record.time_range(tz),
            record.duration_label(),
            record.nickname,
            record.user_id,
            record.name
        );
    }
    Ok(())
}

fn print_details(record: &ChannelRecord, tz: Tz) {
    let now = Utc::now();
    println!("Stream:     {} ({})", record.stream_id, record.id);
    println!("Title:      {}", record.name);
    println!("Streamer:   {} ({})", record.nickname, record.user_id);
    println!("Time:       {}", record.time_range(tz));
    println!("Duration:   {}", record.duration_label());
    println!("URL expiry: {}", record.expire_label(tz));
    let availability = if record.can_download_local(now) {
        "stored URL valid"
    } else if record.can_download_remote(now) {
        "URL expired, can be refreshed"
    } else {
        "too old to download"
    };
    println!("Download:   {availability}");
    for url in &record.stream_urls {
        println!("  {url}");
    }
}
