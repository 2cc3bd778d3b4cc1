use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use iranmix_api::{
    config::{check_history_cap, DEFAULT_HISTORY_CAP},
    identity,
    models::Track,
    store::{ActivityStore, FileBackend},
};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mixcli")]
#[command(about = "inspect and edit IranMix user data on disk", long_about = None)]
struct Cli {
    /// Directory holding one JSON file per user
    #[arg(long, env = "DATA_DIR", default_value = "./user_data")]
    data_dir: PathBuf,

    /// Maximum entries kept per history list
    #[arg(long, env = "HISTORY_CAP", default_value_t = DEFAULT_HISTORY_CAP, value_parser = parse_history_cap)]
    history_cap: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the full record of a user
    Show {
        #[arg(value_name = "USER_ID")]
        user_id: String,
    },

    /// Print derived stats for a user
    Stats {
        #[arg(value_name = "USER_ID")]
        user_id: String,
    },

    /// Print the played/liked/skipped lists of a user
    Lists {
        #[arg(value_name = "USER_ID")]
        user_id: String,
    },

    /// Record a play, like or skip by hand
    Log {
        #[arg(value_name = "USER_ID")]
        user_id: String,

        /// play, like or skip
        #[arg(value_name = "ACTION")]
        action: String,

        #[arg(short, long)]
        title: String,

        #[arg(short, long)]
        singer: String,

        /// Optional track id to store alongside the entry
        #[arg(long)]
        id: Option<String>,
    },

    /// Derive a user id from a client fingerprint
    Identify {
        #[arg(value_name = "FINGERPRINT")]
        fingerprint: Option<String>,
    },

    /// Summarise every stored user
    Users {
        /// Number of records read concurrently
        #[arg(short, long, default_value_t = 8)]
        parallelism: usize,
    },
}

fn parse_history_cap(raw: &str) -> Result<usize, String> {
    let cap: usize = raw.parse().map_err(|e| format!("{e}"))?;
    check_history_cap(cap).map_err(|e| e.to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("mixcli=info,iranmix_api=warn")
        .init();

    let cli = Cli::parse();
    let (data_dir, history_cap) = (&cli.data_dir, cli.history_cap);

    match cli.command {
        Commands::Identify { fingerprint } => {
            println!(
                "{}",
                identity::user_id_from_fingerprint(fingerprint.as_deref())
            );
            Ok(())
        }
        Commands::Show { user_id } => {
            let store = open_store(data_dir, history_cap).await?;
            print_json(&store.get(&user_id).await?)
        }
        Commands::Stats { user_id } => {
            let store = open_store(data_dir, history_cap).await?;
            print_json(&store.derive_stats(&user_id).await?)
        }
        Commands::Lists { user_id } => {
            let store = open_store(data_dir, history_cap).await?;
            print_json(&store.list_history(&user_id).await?)
        }
        Commands::Log {
            user_id,
            action,
            title,
            singer,
            id,
        } => {
            let store = open_store(data_dir, history_cap).await?;
            handle_log(&store, &user_id, &action, title, singer, id).await
        }
        Commands::Users { parallelism } => {
            let store = open_store(data_dir, history_cap).await?;
            handle_users(&store, parallelism).await
        }
    }
}

/// Identify is the only command that never touches the data directory.
async fn open_store(data_dir: &Path, history_cap: usize) -> Result<ActivityStore> {
    let backend = FileBackend::open(data_dir)
        .await
        .with_context(|| format!("failed to open {}", data_dir.display()))?;
    Ok(ActivityStore::new(Arc::new(backend), history_cap))
}

async fn handle_log(
    store: &ActivityStore,
    user_id: &str,
    action: &str,
    title: String,
    singer: String,
    id: Option<String>,
) -> Result<()> {
    let mut fields = json!({ "title": title, "singer": singer });
    if let Some(id) = id {
        fields["id"] = json!(id);
    }
    let track: Track = serde_json::from_value(fields)?;

    store
        .record_action(user_id, action, track)
        .await
        .with_context(|| format!("failed to log {action} for {user_id}"))?;

    println!("{action} logged successfully");
    Ok(())
}

async fn handle_users(store: &ActivityStore, parallelism: usize) -> Result<()> {
    let ids = store.user_ids().await?;
    tracing::info!("found {} users", ids.len());

    let mut rows = stream::iter(ids)
        .map(|user_id| async move {
            let record = store.get(&user_id).await;
            (user_id, record)
        })
        .buffer_unordered(parallelism.max(1))
        .collect::<Vec<_>>()
        .await;

    rows.sort_by(|a, b| a.0.cmp(&b.0));

    for (user_id, record) in rows {
        match record {
            Ok(record) => println!(
                "{:<20} played {:>5}  liked {:>5}  skipped {:>5}  updated {}",
                user_id,
                record.stats.played,
                record.stats.liked,
                record.stats.disliked,
                record.last_updated.to_rfc3339()
            ),
            Err(e) => tracing::error!("failed to read {}: {}", user_id, e),
        }
    }

    Ok(())
}
