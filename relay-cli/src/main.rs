mod cli;
mod endpoint;
mod error;

use std::process;
use std::sync::Arc;

use clap::Parser;
use relay_engine::{
    EventRelay, Fetcher, FileStore, HttpFetcher, LiveRelay, RelayService, StreamErrorKind,
    StreamEvent,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::{Args, Commands},
    error::{AppError, Result},
};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let config = args.relay_config()?;
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&config.http)?);

    let (relay, events) = match &args.command {
        Commands::Live { url, record } => {
            let (relay, events) = LiveRelay::start(url, config, fetcher)?;
            if let Some(dir) = record {
                relay.start_recording(dir)?;
                info!(dir = %dir.display(), "Recording segments");
            }
            (Relay::Live(relay), events)
        }
        Commands::Event {
            url,
            event_id,
            storage_dir,
        } => {
            let blobs = Arc::new(FileStore::for_event(storage_dir, event_id)?);
            info!(dir = %blobs.root().display(), "Storing event");
            let (relay, events) = EventRelay::start(url, config, fetcher, blobs)?;
            (Relay::Event(relay), events)
        }
    };
    let service = relay.service();

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!("Serving {} from {}", args.command.url(), args.service_url());

    let token = CancellationToken::new();
    let watcher = tokio::spawn(watch(events, token.clone()));
    let shutdown = token.clone();
    let served = axum::serve(listener, endpoint::router(Arc::clone(&service)))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await;

    service.stop();
    token.cancel();
    relay.flush().await;
    served?;
    match watcher.await {
        Ok(Some(kind)) => Err(AppError::Stream(kind)),
        Ok(None) => Ok(()),
        Err(e) => {
            warn!("Notification watcher aborted: {e}");
            Ok(())
        }
    }
}

enum Relay {
    Live(Arc<LiveRelay>),
    Event(Arc<EventRelay>),
}

impl Relay {
    fn service(&self) -> Arc<dyn RelayService> {
        match self {
            Self::Live(relay) => Arc::clone(relay) as Arc<dyn RelayService>,
            Self::Event(relay) => Arc::clone(relay) as Arc<dyn RelayService>,
        }
    }

    /// Lets pending storage writes finish before exit.
    async fn flush(&self) {
        match self {
            Self::Live(relay) => relay.flush().await,
            Self::Event(relay) => relay.flush().await,
        }
    }
}

/// Logs relay notifications. Returns the failure that ended the relay, if
/// any, after cancelling `token`.
async fn watch(
    mut events: UnboundedReceiver<StreamEvent>,
    token: CancellationToken,
) -> Option<StreamErrorKind> {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return None,
            event = events.recv() => event?,
        };
        match event {
            StreamEvent::Ready { playlist_url } => info!(%playlist_url, "Stream ready"),
            StreamEvent::Failed(kind) => {
                error!(code = kind.code(), "Stream failed: {kind}");
                token.cancel();
                return Some(kind);
            }
            StreamEvent::PlaylistEnded(playlist) => {
                info!(segments = playlist.segments().len(), "Upstream playlist ended")
            }
            StreamEvent::ClientIdle => info!("No client requested the playlist recently"),
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(verbose))
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}
