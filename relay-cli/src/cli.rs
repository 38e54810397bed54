use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relay_engine::{Credentials, RelayConfig};

use crate::error::{AppError, Result};

#[derive(Parser, Debug)]
#[command(
    name = "relay",
    version,
    about = "Relay a remote segmented media stream from a local HTTP endpoint"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Address the local endpoint binds to
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Port the local endpoint listens on
    #[arg(long, default_value_t = 9999, global = true)]
    pub port: u16,

    /// Contiguous segments buffered before the output playlist is published
    #[arg(long, default_value_t = 2, global = true)]
    pub prebuffer: usize,

    /// Maximum concurrent segment downloads
    #[arg(long, default_value_t = 3, global = true)]
    pub concurrency: usize,

    /// Basic auth user for the upstream
    #[arg(long, global = true, requires = "password")]
    pub username: Option<String>,

    /// Basic auth password for the upstream
    #[arg(long, global = true, requires = "username")]
    pub password: Option<String>,

    /// Query parameter appended to playlist requests (key=value, repeatable)
    #[arg(long, value_parser = parse_pair, global = true)]
    pub playlist_query: Vec<(String, String)>,

    /// Query parameter appended to segment requests (key=value, repeatable)
    #[arg(long, value_parser = parse_pair, global = true)]
    pub segment_query: Vec<(String, String)>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Relay a live stream
    Live {
        /// Upstream playlist URL
        url: String,

        /// Also write every received segment into this directory
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Relay an event stream, keeping its full history on disk
    Event {
        /// Upstream playlist URL
        url: String,

        /// Identifier the event is stored under
        #[arg(long)]
        event_id: String,

        /// Directory holding stored events
        #[arg(long, default_value = "events")]
        storage_dir: PathBuf,
    },
}

impl Commands {
    pub fn url(&self) -> &str {
        match self {
            Self::Live { url, .. } | Self::Event { url, .. } => url,
        }
    }
}

fn parse_pair(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((key.to_owned(), value.to_owned()))
}

impl Args {
    pub fn service_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn relay_config(&self) -> Result<RelayConfig> {
        if self.prebuffer == 0 {
            return Err(AppError::InvalidInput("--prebuffer must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(AppError::InvalidInput("--concurrency must be at least 1".into()));
        }

        let mut config = RelayConfig::default();
        config.server.service_url = self.service_url();
        config.provider.prebuffer_size = self.prebuffer;
        config.monitor.concurrent_download_max = self.concurrency;
        config.http.playlist_query = self.playlist_query.clone();
        config.http.segment_query = self.segment_query.clone();
        config.http.credentials = match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            (None, None) => None,
            _ => {
                return Err(AppError::InvalidInput(
                    "--username and --password must be given together".into(),
                ));
            }
        };
        Ok(config)
    }
}
