use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;

use pressy::config::Config;
use pressy::controller::{update_message, Controller, UiEvent};
use pressy::document::Document;
use pressy::server;

/// Get the config directory path (~/.config/pressy/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let config_dir = PathBuf::from(home).join(".config").join("pressy");
    Ok(config_dir)
}

#[derive(Parser, Debug)]
#[command(name = "pressy", about = "Feed reader core with a background serving worker")]
struct Args {
    /// Config file (defaults to ~/.config/pressy/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Feeds file, overriding the config
    #[arg(long, value_name = "FILE")]
    feeds_file: Option<PathBuf>,

    /// Subscribe to a feed link, parsing the content in --seed
    #[arg(long, value_name = "LINK", requires = "seed")]
    add: Option<String>,

    /// File holding the feed content for --add
    #[arg(long, value_name = "FILE", requires = "add")]
    seed: Option<PathBuf>,

    /// Refresh all feeds over HTTP
    #[arg(long)]
    refresh: bool,

    /// List subscribed feeds and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let feeds_path = args
        .feeds_file
        .clone()
        .unwrap_or_else(|| config.feeds_path(&config_dir));
    let document = Document::load(&feeds_path)
        .with_context(|| format!("Failed to load feeds from {}", feeds_path.display()))?;

    // Detached: the worker is abandoned at process exit
    let serving = server::start(document.clone(), config.worker_queue_depth);

    let (event_tx, event_rx) = mpsc::channel::<UiEvent>(32);
    let printer = tokio::spawn(print_ui_events(event_rx, std::io::stdout()));

    let controller = Controller::new(document, config.shutdown_timeout(), event_tx);

    let one_shot = args.add.is_some() || args.refresh || args.list;

    if let (Some(link), Some(seed_path)) = (&args.add, &args.seed) {
        let seed = tokio::fs::read(seed_path)
            .await
            .with_context(|| format!("Failed to read seed file: {}", seed_path.display()))?;
        if let Err(e) = controller.add_feed(link, &seed) {
            eprintln!("Error: {}", e);
        }
    }

    if args.refresh {
        let options = config.refresh_options();
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let results = controller.refresh_all(&client, &options).await;
        for failure in results.iter().filter(|r| r.result.is_err()) {
            if let Err(e) = &failure.result {
                eprintln!("Feed {}: {}", failure.feed_id, e);
            }
        }
    }

    if args.list {
        let feeds = serving
            .list_feeds()
            .await
            .context("Serving worker unavailable")?;
        if feeds.is_empty() {
            println!("No feeds. Add one with: pressy --add <LINK> --seed <FILE>");
        }
        for feed in feeds {
            println!(
                "{:>4}  {}  ({} items)\n      {}",
                feed.id, feed.title, feed.item_count, feed.link
            );
        }
    }

    if !one_shot {
        println!(
            "Serving {} feeds from {}. Press Ctrl-C to quit.",
            controller.feeds().len(),
            feeds_path.display()
        );
        wait_for_signal().await?;
    }

    controller
        .request_shutdown()
        .await
        .context("Failed to save feeds; changes from this session were not persisted")?;

    // The controller holds the only event sender; dropping it lets the
    // printer finish once queued events are written
    drop(controller);
    match printer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to print UI events"),
        Err(e) => tracing::warn!(error = %e, "UI event printer stopped"),
    }

    println!("Goodbye!");
    Ok(())
}

/// Print UI events until every sender is dropped.
async fn print_ui_events(
    mut events: mpsc::Receiver<UiEvent>,
    mut out: impl Write,
) -> std::io::Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            UiEvent::FeedAdded(feed) => {
                writeln!(out, "Added: {} ({} items)", feed.title, feed.items.len())?
            }
            UiEvent::LoadFinished => tracing::debug!("Load finished"),
            UiEvent::UpdateSummary(counts) => writeln!(out, "{}", update_message(counts))?,
        }
    }
    out.flush()
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down gracefully"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down gracefully"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C, shutting down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pressy::document::{Feed, UpdateCounts};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_printer_drains_queued_events_after_sender_dropped() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(UiEvent::FeedAdded(Arc::new(Feed {
            id: 1,
            link: "https://example.com/rss".to_string(),
            title: "Example".to_string(),
            items: Vec::new(),
        })))
        .await
        .unwrap();
        tx.send(UiEvent::LoadFinished).await.unwrap();
        tx.send(UiEvent::UpdateSummary(UpdateCounts { feeds: 1, items: 3 }))
            .await
            .unwrap();
        drop(tx);

        let mut out = Vec::new();
        print_ui_events(rx, &mut out).await.unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!(
                "Added: Example (0 items)\n{}\n",
                update_message(UpdateCounts { feeds: 1, items: 3 })
            )
        );
    }
}
