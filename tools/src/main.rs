//! defense-runner: operator CLI for the fraud threat-clustering engine.
//!
//! Usage:
//!   defense-runner --db defense.db run
//!   defense-runner --db defense.db analyze --window 50
//!   defense-runner --db defense.db ingest --file events.jsonl
//!   defense-runner --db defense.db seed-rules | rules | actions

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use defense_core::{
    clock::{Clock, SystemClock},
    config::DefenseConfig,
    notify::{JsonlSink, LogSink, NotificationSink},
    report::OperatorReport,
    rule::ActionRule,
    scheduler,
    service::DefenseService,
    store::ThreatStore,
    threat::ThreatEvent,
};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "defense-runner",
    about   = "Fraud threat clustering and automated defense",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, default_value = "defense.db", help = "SQLite database path")]
    db: String,

    #[arg(long, help = "JSON config file (defaults apply when omitted)")]
    config: Option<PathBuf>,

    #[arg(long, help = "Append notifications to this JSONL file instead of the log")]
    notify_jsonl: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic analysis until Ctrl+C.
    Run,
    /// Run one manual pass and print its report.
    Analyze {
        #[arg(long, default_value_t = 100,
              value_parser = clap::value_parser!(u16).range(1..=200),
              help = "Most recent events to analyse (1-200)")]
        window: u16,
    },
    /// Load JSONL threat events into the event store.
    Ingest {
        #[arg(long)]
        file: PathBuf,
    },
    /// Install the baseline rules that are missing.
    SeedRules,
    /// List active rules.
    Rules,
    /// List active defense actions.
    Actions,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DefenseConfig::load(path)?,
        None => DefenseConfig::default(),
    };
    let store = Arc::new(ThreatStore::open(&cli.db).with_context(|| format!("opening {}", cli.db))?);
    store.migrate().context("applying migrations")?;

    let sink: Arc<dyn NotificationSink> = match &cli.notify_jsonl {
        Some(path) => Arc::new(JsonlSink::new(path)),
        None => Arc::new(LogSink),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = DefenseService::build(store.clone(), sink, clock.clone(), config.clone());

    match cli.command {
        Command::Run => run(&service, &config).await,
        Command::Analyze { window } => analyze(&service, &config, clock.as_ref(), window as usize),
        Command::Ingest { file } => ingest(&store, &file),
        Command::SeedRules => {
            let created = service.rules.seed_default_rules()?;
            println!("seeded {created} rule(s)");
            Ok(())
        }
        Command::Rules => print_rules(&service, &store),
        Command::Actions => print_actions(&store, clock.as_ref()),
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

async fn run(service: &DefenseService, config: &DefenseConfig) -> Result<()> {
    if config.seed_default_rules {
        service.rules.seed_default_rules()?;
    }

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(scheduler::run_periodic(
        service.engine.clone(),
        config.analysis_interval(),
        rx,
    ));

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    log::info!("Received shutdown signal");
    let _ = tx.send(true);
    handle.await.context("scheduler task")?;
    Ok(())
}

fn analyze(service: &DefenseService, config: &DefenseConfig, clock: &dyn Clock, window: usize) -> Result<()> {
    let rules_created = if config.seed_default_rules {
        service.rules.seed_default_rules()?
    } else {
        0
    };

    let started = clock.now();
    let manual = service.engine.trigger_manual_analysis_window(window);
    let report = OperatorReport::build(&service.store, &manual, started, rules_created, clock.now())?;
    print!("{report}");
    Ok(())
}

fn ingest(store: &ThreatStore, file: &Path) -> Result<()> {
    let f = std::fs::File::open(file).with_context(|| format!("Cannot read {}", file.display()))?;
    let mut inserted = 0usize;
    let mut rejected = 0usize;

    for (n, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ThreatEvent>(&line) {
            Ok(event) => {
                store.insert_threat_event(&event)?;
                inserted += 1;
            }
            Err(e) => {
                log::warn!("{}:{}: skipped: {e}", file.display(), n + 1);
                rejected += 1;
            }
        }
    }

    println!("ingested {inserted} event(s), rejected {rejected}");
    Ok(())
}

fn print_rules(service: &DefenseService, store: &ThreatStore) -> Result<()> {
    let (rules, invalid) = service.rules.load_active_rules()?;
    println!("=== ACTIVE RULES ({}) ===", rules.len());
    for rule in &rules {
        print_rule(rule);
    }
    if invalid > 0 {
        println!("  ({invalid} malformed rule(s) excluded; see log)");
    }

    let inactive: Vec<_> = store.all_rule_rows()?.into_iter().filter(|r| !r.is_active).collect();
    if !inactive.is_empty() {
        println!();
        println!("=== INACTIVE RULES ({}) ===", inactive.len());
        for row in &inactive {
            println!("  [sev {}] {:<30} {}  → {}", row.severity, row.name, row.condition, row.action_type);
        }
    }
    Ok(())
}

fn print_rule(rule: &ActionRule) {
    let c = &rule.condition;
    println!(
        "  [sev {}] {:<30} {:?} {:?} {}  → {}  (fired {}x)",
        rule.severity,
        rule.name,
        c.field,
        c.operator,
        c.value,
        rule.action_type,
        rule.trigger_count
    );
}

fn print_actions(store: &ThreatStore, clock: &dyn Clock) -> Result<()> {
    let actions = store.active_defense_actions(clock.now())?;
    println!("=== ACTIVE DEFENSE ACTIONS ({}) ===", actions.len());
    for a in &actions {
        println!(
            "  {:<13} {:<40} sev {} {} expires {}",
            a.action_type.as_str(),
            a.target_value,
            a.severity,
            a.triggered_by,
            a.expires_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
        );
    }
    Ok(())
}
