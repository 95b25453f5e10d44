//! Demo/debug driver for the pawtrail sync core.
//!
//! Runs the core against the in-memory store so the handle API, push
//! fan-out, and unread derivation can be exercised end-to-end without a
//! real backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use pawtrail_core::models::{ReportFilter, ReportStatus};
use pawtrail_core::remote::{tables, MemoryStore, RemoteStore};
use pawtrail_core::store::LoadOutcome;
use pawtrail_core::{CoreConfig, CoreEvent, CoreRuntime, Identity, LogNotifier, OsNotifier};

#[derive(Parser)]
#[command(name = "pawtrail-cli")]
#[command(about = "Demo driver for the pawtrail sync core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Two-session message exchange: alice reports, bob replies, watch the
    /// push events land.
    Chat,

    /// Page through a seeded report feed.
    Feed {
        /// Report status to filter by (lost, found, reunited)
        #[arg(long, default_value = "lost")]
        status: String,

        /// Number of reports to seed
        #[arg(long, default_value_t = 30)]
        seed: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Chat => run_chat_demo().await,
        Commands::Feed { status, seed } => run_feed_demo(&status, seed).await,
    }
}

fn parse_status(status: &str) -> Result<ReportStatus> {
    match status {
        "lost" => Ok(ReportStatus::Lost),
        "found" => Ok(ReportStatus::Found),
        "reunited" => Ok(ReportStatus::Reunited),
        other => anyhow::bail!("unknown status: {other}"),
    }
}

async fn seed_reports(store: &MemoryStore, n: usize) -> Result<()> {
    let species = ["dog", "cat", "bird", "rabbit"];
    for i in 0..n {
        let status = if i % 3 == 0 { "found" } else { "lost" };
        store
            .insert(
                tables::REPORTS,
                json!({
                    "status": status,
                    "species": species[i % species.len()],
                    "pet_name": format!("pet-{i}"),
                    "description": "seeded demo report",
                    "reporter_id": "alice",
                }),
            )
            .await?;
    }
    Ok(())
}

fn new_runtime(store: &Arc<MemoryStore>) -> Arc<CoreRuntime> {
    Arc::new(CoreRuntime::new(
        CoreConfig::default(),
        store.clone() as Arc<dyn RemoteStore>,
        Arc::new(LogNotifier::new(true)) as Arc<dyn OsNotifier>,
    ))
}

async fn run_chat_demo() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    seed_reports(&store, 3).await?;

    let alice_rt = new_runtime(&store);
    let bob_rt = new_runtime(&store);
    alice_rt
        .set_identity(Some(Identity::new("alice", "Alice")))
        .await;
    bob_rt.set_identity(Some(Identity::new("bob", "Bob"))).await;

    // Tail bob's core events in the background.
    let mut bob_events = bob_rt.subscribe_events();
    let tail = tokio::spawn(async move {
        while let Ok(event) = bob_events.recv().await {
            match event {
                CoreEvent::Toast(n) => println!("[bob] toast: {} -> {}", n.body, n.link),
                CoreEvent::ConversationUpdated { chat_id } => {
                    println!("[bob] conversation updated: {chat_id}")
                }
                CoreEvent::FeedInvalidated { table } => {
                    println!("[bob] feed invalidated: {table}")
                }
                CoreEvent::NotificationsUpdated => println!("[bob] notification list changed"),
            }
        }
    });

    let chat = alice_rt.open_conversation("bob", Some("report-0")).await?;
    chat.send("Hi! I think I found your dog near the park.").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let bob_chats = bob_rt.conversations();
    for c in &bob_chats {
        println!(
            "[bob] chat {} with {:?}: {} message(s), unread={}",
            c.id,
            c.participants,
            c.messages.len(),
            c.unread_for("bob"),
        );
    }
    println!("[bob] unread badge: {}", bob_rt.unread_global());

    let first = bob_chats
        .first()
        .ok_or_else(|| anyhow::anyhow!("push never reached bob's session"))?;
    let bob_chat = bob_rt.conversation(&first.id);
    bob_chat.send("That's him! Where exactly?").await?;
    bob_chat.mark_read().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("[bob] unread badge after reading: {}", bob_rt.unread_global());
    println!("[alice] unread badge: {}", alice_rt.unread_global());

    tail.abort();
    Ok(())
}

async fn run_feed_demo(status: &str, seed: usize) -> Result<()> {
    let status = parse_status(status)?;
    let store = Arc::new(MemoryStore::new());
    seed_reports(&store, seed).await?;

    let runtime = new_runtime(&store);
    runtime
        .set_identity(Some(Identity::new("alice", "Alice")))
        .await;

    let feed = runtime.feed(ReportFilter::default().status(status));
    loop {
        match feed.load_more().await? {
            LoadOutcome::Appended(n) => {
                let snapshot = feed.snapshot();
                println!(
                    "page {}: +{n} items ({}/{} fetched)",
                    snapshot.pages.len(),
                    snapshot.len(),
                    snapshot.total,
                );
            }
            LoadOutcome::Exhausted => break,
            LoadOutcome::Superseded => continue,
        }
    }

    for report in feed.snapshot().items() {
        println!(
            "  [{}] {:?} {:?} :: {}",
            report.id,
            report.status,
            report.species,
            report.pet_name.as_deref().unwrap_or("(unnamed)"),
        );
    }
    Ok(())
}
