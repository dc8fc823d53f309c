use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "aika", about = "Aika helper: archive live-stream metadata and download recordings")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Log in by scanning a QR code with the mobile app
    Login,

    /// Log in, then fetch stream records into the local store
    Fetch {
        /// First stream id to try (defaults to the highest stored id)
        #[arg(long)]
        start: Option<i64>,

        /// How many ids to walk; negative walks downward
        #[arg(long, short = 'n', allow_negative_numbers = true)]
        count: i64,
    },

    /// Search the local store
    Search {
        /// Streamer nickname (substring match)
        #[arg(long)]
        name: Option<String>,

        /// Streamer user id
        #[arg(long)]
        uid: Option<i64>,

        /// Stream id range, used together with --to
        #[arg(long, requires = "to")]
        from: Option<i64>,

        #[arg(long, requires = "from")]
        to: Option<i64>,

        /// Streams that started on this day (YYYY-MM-DD, display timezone)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Streams recent enough to still be downloadable
        #[arg(long)]
        valid: bool,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// List known streamers
    Users,

    /// Show one stored stream
    Show {
        stream_id: i64,
    },

    /// Download a stored stream with the external HLS tool
    Download {
        stream_id: i64,
    },
}
