use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use feedsync::config::Config;
use feedsync::errors::TracingErrorHandler;
use feedsync::events::EventBus;
use feedsync::feed::{read_opml_file, write_opml_file, Fetcher, IconResolver};
use feedsync::service::{FeedSyncEngine, FolderService, OpmlService, SyncOutcome};
use feedsync::storage::{Database, FeedSource, Folder};
use feedsync::util::validate_feed_url;

/// Config directory (~/.config/feedsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsync"))
}

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Sync RSS, Atom and JSON feeds into a local database")]
struct Args {
    /// Config file (default: ~/.config/feedsync/feedsync.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed and fetch it
    Add {
        uri: String,
        /// Put the feed in this folder (created if missing)
        #[arg(long)]
        folder: Option<String>,
    },
    /// Fetch every subscribed feed
    Refresh,
    /// List folders and feeds with unread counts
    List,
    /// Import subscriptions from an OPML file
    Import {
        file: PathBuf,
        /// Fetch all feeds after importing
        #[arg(long)]
        sync: bool,
    },
    /// Export subscriptions to an OPML file
    Export { file: PathBuf },
    /// Manage folders
    #[command(subcommand)]
    Folder(FolderCommand),
    /// Move a feed into a folder, or out of every folder
    Move {
        feed_uri: String,
        #[arg(required_unless_present = "none")]
        folder: Option<String>,
        #[arg(long, conflicts_with = "folder")]
        none: bool,
    },
    /// Unsubscribe from a feed and delete its items
    Remove { feed_uri: String },
}

#[derive(Subcommand, Debug)]
enum FolderCommand {
    Add { name: String },
    /// Delete a folder; its feeds become unorganized
    Remove { name: String },
    Rename { name: String, new_name: String },
    List,
}

struct Services {
    db: Database,
    engine: FeedSyncEngine,
    folders: FolderService,
    opml: OpmlService,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("feedsync.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;

    let db_path = match args.db.clone().or_else(|| config.database_path.clone()) {
        Some(path) => path,
        None => {
            ensure_private_dir(&config_dir)?;
            config_dir.join("feeds.db")
        }
    };
    let db_path = db_path
        .to_str()
        .context("Database path is not valid UTF-8")?
        .to_string();
    let db = Database::open(&db_path)
        .await
        .with_context(|| format!("Failed to open database: {db_path}"))?;

    let services = build_services(db, &config)?;
    run(args.command, &services, &config).await
}

fn build_services(db: Database, config: &Config) -> Result<Services> {
    let client = config.build_client().context("Failed to build HTTP client")?;
    let fetcher = Fetcher::new(client, config.fetch_settings());
    let events = EventBus::default();

    // The process may exit before a background lookup finishes, so the CLI
    // resolves icons explicitly after syncing instead.
    let mut sync_settings = config.sync_settings();
    sync_settings.resolve_icons = false;

    let engine = FeedSyncEngine::new(
        db.clone(),
        fetcher.clone(),
        IconResolver::new(fetcher),
        Arc::new(TracingErrorHandler),
        events.clone(),
        sync_settings,
    );
    Ok(Services {
        folders: FolderService::new(db.clone(), events.clone()),
        opml: OpmlService::new(db.clone(), events).with_host_policy(config.host_policy()),
        engine,
        db,
    })
}

async fn run(command: Command, services: &Services, config: &Config) -> Result<()> {
    match command {
        Command::Add { uri, folder } => {
            let url = validate_feed_url(&uri, config.host_policy())
                .with_context(|| format!("Refusing feed URI: {uri}"))?;
            let uri = uri.trim();
            tracing::debug!(url = %url, "Adding feed");

            let outcome = services.engine.sync_uri(uri, &CancellationToken::new()).await;
            let SyncOutcome::Merged { feed_id, new_items } = outcome else {
                bail!("Could not subscribe to {uri} ({outcome:?})");
            };
            println!("Subscribed to {uri}: {new_items} items");

            if let Some(name) = folder {
                let folder = find_or_create_folder(&services.folders, &name).await?;
                services.folders.add_feed_to_folder(folder.id, feed_id).await?;
                println!("Moved to folder '{}'", folder.name);
            }
            resolve_icons(services, config).await;
        }
        Command::Refresh => {
            refresh(services).await;
            resolve_icons(services, config).await;
        }
        Command::List => list(services).await?,
        Command::Import { file, sync } => {
            let doc = read_opml_file(&file)
                .await
                .with_context(|| format!("Failed to import {}", file.display()))?;
            let added = services.opml.import(&doc).await?;
            println!("Imported {added} feeds from {}", file.display());
            if sync && added > 0 {
                refresh(services).await;
                resolve_icons(services, config).await;
            }
        }
        Command::Export { file } => {
            let doc = services.opml.export().await?;
            write_opml_file(&doc, &file).await?;
            println!("Exported subscriptions to {}", file.display());
        }
        Command::Folder(folder_command) => run_folder(folder_command, &services.folders).await?,
        Command::Move {
            feed_uri,
            folder,
            none,
        } => {
            let feed = find_feed(&services.db, &feed_uri).await?;
            match (folder, none) {
                (_, true) => match feed.folder_id {
                    Some(current) => {
                        services.folders.remove_feed_from_folder(current, feed.id).await?;
                        println!("{} is now unorganized", feed.display_name());
                    }
                    None => println!("{} is not in a folder", feed.display_name()),
                },
                (Some(name), false) => {
                    let folder = find_folder(&services.folders, &name).await?;
                    services.folders.add_feed_to_folder(folder.id, feed.id).await?;
                    println!("Moved {} to '{}'", feed.display_name(), folder.name);
                }
                (None, false) => bail!("Name a folder or pass --none"),
            }
        }
        Command::Remove { feed_uri } => {
            let feed = find_feed(&services.db, &feed_uri).await?;
            services.folders.remove_feed(feed.id).await?;
            println!("Removed {}", feed.display_name());
        }
    }
    Ok(())
}

async fn run_folder(command: FolderCommand, folders: &FolderService) -> Result<()> {
    match command {
        FolderCommand::Add { name } => {
            let folder = folders.add_folder(&name).await?;
            println!("Added folder '{}'", folder.name);
        }
        FolderCommand::Remove { name } => {
            let folder = find_folder(folders, &name).await?;
            folders.remove_folder(folder.id).await?;
            println!("Removed folder '{}'", folder.name);
        }
        FolderCommand::Rename { name, new_name } => {
            let folder = find_folder(folders, &name).await?;
            folders.rename_folder(folder.id, &new_name).await?;
            println!("Renamed '{}' to '{}'", folder.name, new_name.trim());
        }
        FolderCommand::List => {
            for folder in folders.list_folders().await? {
                let count = folders.feeds_in_folder(folder.id).await?.len();
                println!("{} ({count} feeds)", folder.name);
            }
        }
    }
    Ok(())
}

/// Sync everything; Ctrl-C cancels the fetches still in flight.
async fn refresh(services: &Services) {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let outcomes = services.engine.sync_all_with(&cancel).await;
    watcher.abort();

    for (uri, outcome) in &outcomes {
        match outcome {
            SyncOutcome::Merged { new_items, .. } => println!("{uri}: {new_items} new items"),
            SyncOutcome::Empty => println!("{uri}: empty response"),
            SyncOutcome::Cancelled => println!("{uri}: cancelled"),
            SyncOutcome::Removed => println!("{uri}: removed during refresh"),
            SyncOutcome::Failed => println!("{uri}: failed"),
        }
    }
}

async fn resolve_icons(services: &Services, config: &Config) {
    if config.resolve_icons {
        let updated = services.engine.resolve_missing_images().await;
        tracing::info!(updated, "Resolved feed images");
    }
}

async fn list(services: &Services) -> Result<()> {
    let folders = services.folders.list_folders().await?;
    let feeds = services.db.get_feeds().await?;
    let unread = services.db.get_unread_counts().await?;

    let print_feed = |feed: &FeedSource, indent: &str| {
        let count = unread.get(&feed.id).copied().unwrap_or(0);
        let status = feed
            .last_error
            .as_deref()
            .map(|e| format!("  [error: {e}]"))
            .unwrap_or_default();
        println!(
            "{indent}{} <{}> ({count} unread, {}){status}",
            feed.display_name(),
            feed.uri,
            feed.format.label()
        );
    };

    for folder in &folders {
        println!("{}/", folder.name);
        for feed in feeds.iter().filter(|f| f.folder_id == Some(folder.id)) {
            print_feed(feed, "  ");
        }
    }
    for feed in feeds.iter().filter(|f| f.folder_id.is_none()) {
        print_feed(feed, "");
    }
    Ok(())
}

async fn find_feed(db: &Database, uri: &str) -> Result<FeedSource> {
    db.get_feed_by_uri(uri.trim())
        .await?
        .with_context(|| format!("No feed with URI {uri}"))
}

async fn find_folder(folders: &FolderService, name: &str) -> Result<Folder> {
    let name = name.trim();
    folders
        .list_folders()
        .await?
        .into_iter()
        .find(|f| f.name == name)
        .with_context(|| format!("No folder named '{name}'"))
}

async fn find_or_create_folder(folders: &FolderService, name: &str) -> Result<Folder> {
    match find_folder(folders, name).await {
        Ok(folder) => Ok(folder),
        Err(_) => Ok(folders.add_folder(name).await?),
    }
}

/// Create `dir` with owner-only permissions.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}
