//! Card ledger integrity CLI

use anyhow::Context;
use card_ledger::{
    repair::{seal_chains, RepairOutcome},
    CardLedger, Config, LedgerSnapshot, Storage,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "card-ledger",
    about = "Hash-chained fare card ledger: validate, repair and inspect",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file (defaults to LEDGER_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the RocksDB data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Audit every card and list integrity issues
    Validate,
    /// Repair the chains of all cards
    FixAll,
    /// Repair the chain of one card
    FixCard {
        /// Card ID
        card_id: Uuid,
    },
    /// Repair the chain containing an event
    FixEvent {
        /// Event ID
        event_id: Uuid,
    },
    /// Corrupt one random event (demo only)
    Tamper,
    /// Show the Merkle root of a card
    ShowRoot {
        /// Card ID
        card_id: Uuid,
    },
    /// Load cards and events from a JSON snapshot
    Import {
        /// Snapshot file: {"cards": [...], "events": [...]}
        path: PathBuf,
        /// Link and hash each card's events before storing them
        #[arg(long)]
        seal: bool,
    },
}

#[derive(Serialize)]
struct ImportSummary {
    cards: usize,
    events: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env()?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Command::Import { path, seal } => {
            let summary = import(&config, &path, seal)?;
            emit(cli.format, &summary, |s| {
                println!("Imported {} cards and {} events", s.cards, s.events)
            })
        }
        Command::Validate => {
            let ledger = CardLedger::open(config)?;
            let report = ledger.validate().await?;
            emit(cli.format, &report, |r| {
                for issue in &r.issues {
                    println!("{}", issue);
                }
                for card_id in &r.failed_cards {
                    println!("[AuditFailed] card {}", card_id);
                }
                println!(
                    "{} cards, {} events checked: {} issues",
                    r.cards_checked,
                    r.events_checked,
                    r.issues.len()
                );
            })
        }
        Command::FixAll => {
            let ledger = CardLedger::open(config)?;
            let outcomes = ledger.fix_all().await?;
            emit(cli.format, &outcomes, |o| {
                o.iter().for_each(print_outcome);
                println!("{} cards repaired", o.len());
            })
        }
        Command::FixCard { card_id } => {
            let ledger = CardLedger::open(config)?;
            let outcome = ledger.fix_card(card_id).await?;
            emit(cli.format, &outcome, |o| match o {
                Some(outcome) => print_outcome(outcome),
                None => println!("card {} has no events", card_id),
            })
        }
        Command::FixEvent { event_id } => {
            let ledger = CardLedger::open(config)?;
            let outcome = ledger.fix_event(event_id).await?;
            emit(cli.format, &outcome, |o| {
                if let Some(outcome) = o {
                    print_outcome(outcome);
                }
            })
        }
        Command::Tamper => {
            let ledger = CardLedger::open(config)?;
            let record = ledger.tamper().await?;
            emit(cli.format, &record, |r| match r {
                Some(r) => println!(
                    "tampered {} of event {} (card {})",
                    r.field, r.event_id, r.card_id
                ),
                None => println!("ledger is empty, nothing to tamper"),
            })
        }
        Command::ShowRoot { card_id } => {
            let ledger = CardLedger::open(config)?;
            let root = ledger.merkle_root(card_id).await?;
            emit(cli.format, &root, |r| match r {
                Some(root) => println!("{}", root),
                None => println!("card {} has no events", card_id),
            })
        }
    }
}

fn import(config: &Config, path: &Path, seal: bool) -> anyhow::Result<ImportSummary> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut snapshot: LedgerSnapshot = serde_json::from_str(&content)
        .with_context(|| format!("parsing snapshot {}", path.display()))?;

    if seal {
        snapshot.events = seal_chains(snapshot.events);
    }

    let storage = Storage::open(config)?;
    for card in &snapshot.cards {
        storage.put_card(card)?;
    }
    for event in &snapshot.events {
        storage
            .append_event(event)
            .with_context(|| format!("importing event {}", event.id))?;
    }

    Ok(ImportSummary {
        cards: snapshot.cards.len(),
        events: snapshot.events.len(),
    })
}

fn print_outcome(outcome: &RepairOutcome) {
    println!(
        "card {}: {} events rewritten, root {}",
        outcome.card_id, outcome.events_rewritten, outcome.merkle_root
    );
}

fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce(&T)) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => text(value),
    }
    Ok(())
}
