use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tabled::{Table, settings::Style};
use winetrace::{AuditVerifier, AuditReport, BatchSubmission, IngestReceipt, IngestWorkflow, LedgerClient, MemoryLedger, RecordStore, Reconciler, Stage, TraceConfig};
use winetrace::error::{LedgerError, TraceError};
use winetrace::workflow::PartialCommit;

#[derive(Parser)]
#[command(name = "winetrace")]
#[command(about = "Wine provenance recording with ledger-anchored audit hashes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML config file
    #[arg(short, long, env = "WINETRACE_CONFIG")]
    config: Option<PathBuf>,

    /// Local SQLite database (overrides config)
    #[arg(long, env = "WINETRACE_DB")]
    db: Option<PathBuf>,

    /// Ledger snapshot file (overrides config)
    #[arg(long, env = "WINETRACE_LEDGER")]
    ledger: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local store schema and the ledger snapshot
    Init,

    /// Register a bottle (and its batch) and anchor it
    Produce {
        /// Batch JSON file
        #[arg(long)]
        batch_json: PathBuf,

        /// Bottle JSON file, hashed exactly as written
        #[arg(long)]
        bottle_json: PathBuf,
    },

    /// Record a transport event; milestones are anchored
    Ship {
        #[arg(long)]
        bottle_id: String,

        /// Transport event JSON file
        #[arg(long)]
        event_json: PathBuf,
    },

    /// Record the sale of a bottle and anchor it
    Deliver {
        /// Sale JSON file: {bottle_id, store, ts}
        #[arg(long)]
        event_json: PathBuf,
    },

    /// Compare local hashes against the ledger for every stage of a bottle
    Verify {
        #[arg(long)]
        bottle_id: String,

        /// Output format: table, yaml, json
        #[arg(short, long, default_value = "table")]
        output: OutputFormat,
    },

    /// List bottles in the local store
    List,

    /// Show every fingerprint of one stage next to the ledger value
    Diagnose {
        #[arg(long)]
        stage: Stage,

        #[arg(long)]
        bottle_id: String,

        /// The JSON file that was originally submitted for this stage
        #[arg(long)]
        event_json: PathBuf,
    },

    /// Compare ledger truth with local rows after a partial commit
    Reconcile {
        #[arg(long)]
        stage: Stage,

        #[arg(long)]
        bottle_id: String,

        /// Event timestamp for ship/deliver (defaults to the latest local row)
        #[arg(long)]
        ts: Option<i64>,

        /// Output format: table, yaml, json
        #[arg(short, long, default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Yaml,
    Json,
}

struct Context {
    config: TraceConfig,
    store: RecordStore,
    client: Arc<LedgerClient>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("winetrace=debug,info")
    } else {
        EnvFilter::new("winetrace=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(e);
            ExitCode::FAILURE
        }
    }
}

fn print_error(err: Box<dyn std::error::Error>) {
    match err.downcast_ref::<TraceError>() {
        Some(TraceError::Ledger(ledger)) => print_ledger_error(ledger),
        Some(TraceError::PartialCommit(partial)) => print_partial_commit(partial),
        Some(trace) => print_trace_error(trace),
        None => eprintln!("\x1b[31m✗ Error:\x1b[0m {}", err),
    }
}

fn print_trace_error(err: &TraceError) {
    eprintln!("\n\x1b[31m✗ Error [{}]\x1b[0m", err.error_code());
    eprintln!("  {}", err);
    if let Some(suggestion) = err.suggestion() {
        eprintln!("\n\x1b[33mSuggestion:\x1b[0m");
        for line in suggestion.lines() {
            eprintln!("  {}", line);
        }
    }
    eprintln!();
}

fn print_ledger_error(err: &LedgerError) {
    eprintln!("\n\x1b[31m✗ Ledger Error [{}]\x1b[0m", err.error_code());
    eprintln!("  {}", err);
    eprintln!("\n\x1b[33mSuggestion:\x1b[0m");
    for line in err.suggestion().lines() {
        eprintln!("  {}", line);
    }
    eprintln!();
}

fn print_partial_commit(partial: &PartialCommit) {
    eprintln!("\n\x1b[31m✗ Partial Commit [{} {}]\x1b[0m", partial.stage, partial.bottle_id);
    eprintln!("  {}", partial.reason);
    eprintln!("  row key       : {}", partial.row_key);
    eprintln!("  expected hash : {}", partial.expected_hash);
    eprintln!("  lifecycle     : {}", partial.lifecycle.as_str());
    eprintln!("  anchor        : {}", partial.anchor.as_str());
    eprintln!("\n\x1b[33mSuggestion:\x1b[0m");
    let ts = partial.ts.map(|ts| format!(" --ts {}", ts)).unwrap_or_default();
    eprintln!("  The local transaction was rolled back but the ledger was written. Inspect with:");
    eprintln!("  winetrace reconcile --stage {} --bottle-id {}{}", partial.stage, partial.bottle_id, ts);
    eprintln!();
}

fn load_config(cli: &Cli) -> Result<TraceConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => TraceConfig::load(path)?,
        None => TraceConfig::default(),
    };
    if let Some(db) = &cli.db {
        config = config.with_database(db);
    }
    if let Some(ledger) = &cli.ledger {
        config = config.with_ledger(ledger);
    }
    Ok(config)
}

fn open_context(config: TraceConfig) -> Result<Context, Box<dyn std::error::Error>> {
    let store = RecordStore::open(&config.database)?;
    let ledger = Arc::new(MemoryLedger::open(&config.ledger)?);
    let client = Arc::new(LedgerClient::new(ledger, config.ledger_timeout()));
    Ok(Context { config, store, client })
}

fn read_json_object(path: &Path) -> Result<Map<String, Value>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
    match serde_json::from_str::<Value>(&raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(format!("{} must contain a JSON object", path.display()).into()),
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Init => cmd_init(config)?,

        Commands::Produce { batch_json, bottle_json } => {
            let ctx = open_context(config)?;
            let batch: BatchSubmission = serde_json::from_value(Value::Object(read_json_object(&batch_json)?))?;
            let bottle = read_json_object(&bottle_json)?;
            let receipt = workflow(&ctx).produce(&batch, &bottle).await?;
            print_receipt(&receipt);
        }

        Commands::Ship { bottle_id, event_json } => {
            let ctx = open_context(config)?;
            let event = read_json_object(&event_json)?;
            let receipt = workflow(&ctx).ship(&bottle_id, &event).await?;
            print_receipt(&receipt);
        }

        Commands::Deliver { event_json } => {
            let ctx = open_context(config)?;
            let event = read_json_object(&event_json)?;
            let receipt = workflow(&ctx).deliver(&event).await?;
            print_receipt(&receipt);
        }

        Commands::Verify { bottle_id, output } => {
            let ctx = open_context(config)?;
            cmd_verify(&ctx, &bottle_id, output).await?;
        }

        Commands::List => {
            let ctx = open_context(config)?;
            let ids = ctx.store.bottle_ids().await?;
            if ids.is_empty() {
                println!("No bottles in {}", ctx.config.database.display());
            }
            for id in ids {
                println!("  {}", id);
            }
        }

        Commands::Diagnose { stage, bottle_id, event_json } => {
            let ctx = open_context(config)?;
            let submission = read_json_object(&event_json)?;
            cmd_diagnose(&ctx, stage, &bottle_id, &submission).await?;
        }

        Commands::Reconcile { stage, bottle_id, ts, output } => {
            let ctx = open_context(config)?;
            cmd_reconcile(&ctx, stage, &bottle_id, ts, output).await?;
        }
    }

    Ok(())
}

fn workflow(ctx: &Context) -> IngestWorkflow {
    IngestWorkflow::new(ctx.store.clone(), ctx.client.clone())
        .with_read_back_attempts(ctx.config.read_back_attempts)
}

fn cmd_init(config: TraceConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Initializing local store {}", config.database.display());
    RecordStore::open(&config.database)?;

    if config.ledger.exists() {
        warn!("Ledger snapshot {} already exists, keeping it", config.ledger.display());
    } else {
        MemoryLedger::open(&config.ledger)?.flush()?;
    }

    println!("✓ Local store ready at {}", config.database.display());
    println!("✓ Ledger snapshot at {} (chain id {})", config.ledger.display(), config.chain_id);
    Ok(())
}

fn print_receipt(receipt: &IngestReceipt) {
    match &receipt.anchor {
        Some(proof) => {
            println!("\n✅ {} {} committed (run {})", receipt.stage, receipt.bottle_id, receipt.run_id);
            println!("  compact JSON : {}", proof.canonical_json);
            println!("  row key      : {}", proof.row_key);
            println!("  row hash     : {}", proof.row_hash);
            if let Some(tx) = &proof.transition_tx {
                println!("  {} tx   : {}", receipt.stage, tx);
            }
            match &proof.anchor_tx {
                Some(tx) => println!("  storeHash tx : {}", tx),
                None => println!("  storeHash tx : (receipt lost, confirmed by read-back)"),
            }
        }
        None => {
            println!("\n📄 {} {} stored locally only (not a milestone)", receipt.stage, receipt.bottle_id);
        }
    }
}

async fn cmd_verify(ctx: &Context, bottle_id: &str, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let verifier = AuditVerifier::new(ctx.store.clone(), ctx.client.clone());
    let report = verifier.verify(bottle_id).await?;

    match output {
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(&report)?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_report_table(&report),
    }

    Ok(())
}

fn print_report_table(report: &AuditReport) {
    if report.local_status.is_none() {
        println!("No bottle '{}' in the local store.", report.bottle_id);
    }

    println!("\nOff-ledger / on-ledger hash check\n");
    let mut table = Table::new(report.table_rows());
    table.with(Style::markdown());
    println!("{}", table);

    println!("\nLedger lifecycle status: {}", report.ledger_state);
    for divergence in report.divergences() {
        println!(
            "⚠ {} hash matches but the ledger state {} has not reached that stage",
            divergence.stage, report.ledger_state
        );
    }

    match &report.detail {
        Some(detail) => {
            println!("\nAll stages verified ✓ – detailed information follows:\n");

            println!("Bottle row:");
            println!("{}", Table::new([&detail.bottle]).with(Style::markdown()));

            if let Some(batch) = &detail.batch {
                println!("\nBatch row:");
                println!("{}", Table::new([batch]).with(Style::markdown()));
            }

            if !detail.transport_events.is_empty() {
                println!("\nTransport events:");
                println!("{}", Table::new(&detail.transport_events).with(Style::markdown()));
            }

            if let Some(sold) = &detail.sold_event {
                println!("\nSold event:");
                println!("{}", Table::new([sold]).with(Style::markdown()));
            }
        }
        None => println!("\n✗ At least one stage did not match – no detailed dump shown."),
    }
}

async fn cmd_diagnose(
    ctx: &Context,
    stage: Stage,
    bottle_id: &str,
    submission: &Map<String, Value>,
) -> Result<(), Box<dyn std::error::Error>> {
    let verifier = AuditVerifier::new(ctx.store.clone(), ctx.client.clone());
    let diagnosis = verifier.diagnose(stage, bottle_id, submission).await?;

    println!("\nCompact JSON taking part in the hash ({})", stage);
    println!("  file         : {}", diagnosis.file_json);
    println!("  store subset : {}", diagnosis.store_json.as_deref().unwrap_or("-"));
    println!("  full row     : {}", diagnosis.row_json.as_deref().unwrap_or("-"));

    println!("\n{} fingerprints\n", stage);
    let mut table = Table::new(diagnosis.fingerprints());
    table.with(Style::markdown());
    println!("{}", table);

    println!();
    println!("{} file JSON vs ledger", if diagnosis.file_matches_ledger() { "✓" } else { "×" });
    println!("{} store subset vs ledger", if diagnosis.store_matches_ledger() { "✓" } else { "×" });

    if let Some(diff) = diagnosis.diff() {
        println!("\nfile vs store canonical JSON:");
        println!("{}", diff);
    }

    Ok(())
}

async fn cmd_reconcile(
    ctx: &Context,
    stage: Stage,
    bottle_id: &str,
    ts: Option<i64>,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let reconciler = Reconciler::new(ctx.store.clone(), ctx.client.clone());
    let report = reconciler.reconcile(stage, bottle_id, ts).await?;

    match output {
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(&report)?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => {
            let opt = |h: Option<winetrace::ContentHash>| h.map(|h| h.to_hex()).unwrap_or_else(|| "-".into());
            println!("\nReconciliation for {} {}\n", stage, bottle_id);
            println!("  row key      : {}", report.row_key);
            println!("  ledger hash  : {}", opt(report.ledger_hash));
            println!("  local hash   : {}", opt(report.local_hash));
            println!("  ledger state : {}", report.ledger_state);
            println!(
                "  local state  : {}",
                report.local_state.map(|s| s.to_string()).unwrap_or_else(|| "-".into())
            );
            println!("\n→ {}", report.classification);
        }
    }

    Ok(())
}
