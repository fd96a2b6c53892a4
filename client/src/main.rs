use clap::Parser;
use client::cli::{Args, Command};
use client::error::SessionError;
use client::session::Session;
use std::sync::Arc;
use swarm_core::ContentInfo;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracker::StaticTracker;

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .try_init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), SessionError> {
    let config = args.session_config();
    let downloading = matches!(args.command, Command::Download { .. });
    let mut session = match &args.command {
        Command::Share { file, .. } => {
            Session::share(file, config, Arc::new(StaticTracker::new(Vec::new()))).await?
        }
        Command::Download {
            content_id,
            length,
            piece_length,
            name,
            peers,
            ..
        } => Session::download(
            ContentInfo::new(*content_id, name, *length, *piece_length),
            config,
            Arc::new(StaticTracker::new(peers.clone())),
        )?,
    };
    session.start().await?;
    info!(
        "peer id {}, content id {}",
        hex::encode(session.peer_id()),
        session.content().hex_id()
    );

    let outcome = tokio::select! {
        result = session.wait_complete(), if downloading => result.map(|path| {
            if let Some(path) = path {
                info!("saved to {}", path.display());
            }
        }),
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down.");
            Ok(())
        }
    };

    let stats = session.stats().await;
    session.stop().await?;
    info!(
        "{}/{} pieces, downloaded {} bytes, uploaded {} bytes",
        stats.held_pieces, stats.total_pieces, stats.downloaded, stats.uploaded
    );
    outcome
}
