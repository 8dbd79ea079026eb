use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use datalake_curator::observability::{self, metrics};
use datalake_curator::pipeline::curated_to_prod;
use datalake_curator::pipeline::ingestion::ExtractRequest;
use datalake_curator::pipeline::raw_to_curated;
use datalake_curator::pipeline::{PipelineOutcome, PipelineStatus, ProdOutcome};
use datalake_curator::{PipelineConfig, PipelineContext, TableRegistry};

#[derive(Parser)]
#[command(name = "curator")]
#[command(about = "Raw to curated to prod data-quality pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    /// TOML configuration file; `CURATOR_*` environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory of JSON table bundles replacing or extending the built-in ones
    #[arg(long, global = true)]
    registry_dir: Option<PathBuf>,

    /// Print Prometheus metrics on exit
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ExtractArgs {
    /// Object key of the raw extract (.json, .ndjson or .jsonl)
    #[arg(long)]
    locator: String,
    #[arg(long)]
    table: String,
    #[arg(long, default_value = "v1")]
    schema_version: String,
    /// Reference extract for cross-record rules, as `table=locator`
    #[arg(long = "reference", value_parser = parse_reference)]
    references: Vec<(String, String)>,
}

impl ExtractArgs {
    fn request(&self) -> ExtractRequest {
        let mut request = ExtractRequest::new(&self.locator, &self.table, &self.schema_version);
        for (table, locator) in &self.references {
            request = request.with_reference(table, locator);
        }
        request
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Stage 1: validate, clean and commit one raw extract
    RawToCurated(ExtractArgs),
    /// Stage 2: transform and partition curated batches into prod
    CuratedToProd {
        #[arg(long)]
        table: String,
        /// A single curated object; every curated object of the table when omitted
        #[arg(long)]
        object_key: Option<String>,
    },
    /// Stage 1, then stage 2 on the committed batch
    Run(ExtractArgs),
    /// Stage 1 for every request in a JSON manifest, batches in parallel
    Manifest {
        #[arg(long)]
        path: PathBuf,
        /// Promote each committed batch to prod afterwards
        #[arg(long)]
        promote: bool,
    },
}

fn parse_reference(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((table, locator)) if !table.is_empty() && !locator.is_empty() => {
            Ok((table.to_string(), locator.to_string()))
        }
        _ => Err(format!("expected table=locator, got '{raw}'")),
    }
}

fn print_outcome(outcome: &PipelineOutcome) {
    let icon = match outcome.status {
        PipelineStatus::Success if outcome.warned() => "⚠️ ",
        PipelineStatus::Success => "✅",
        PipelineStatus::Quarantined => "🚧",
        PipelineStatus::Failed => "❌",
    };
    println!("\n{icon} {} ({}): {}", outcome.table_name, outcome.locator, outcome.status.as_str());
    let c = &outcome.counts;
    println!("   Read: {}", c.read);
    println!("   Rejected: {} schema, {} rules, {} masking", c.schema_rejected, c.rule_rejected, c.mask_dropped);
    println!("   Duplicates removed: {} ({} ties)", c.duplicates, c.dedup_conflicts);
    println!("   Anomalies flagged: {}", c.anomalies);
    println!("   Written: {}", c.written);
    if let Some(score) = outcome.quality_score() {
        println!("   Quality score: {score:.3}");
    }
    if let Some(key) = &outcome.object_key {
        println!("   Object: {key}");
    }
    if !outcome.issues.is_empty() {
        println!("   Issues: {}", outcome.issues.len());
    }
    if let Some(error) = &outcome.error {
        println!("   Error: {error}");
    }
}

fn print_prod(outcome: &ProdOutcome) {
    println!("\n📦 {} promoted to prod", outcome.table_name);
    println!("   Curated objects: {}", outcome.curated_objects);
    println!("   Records: {}", outcome.records);
    for partition in &outcome.partitions {
        println!("   - {partition}");
    }
}

/// Stage 2 runs off the completion event, so only committed batches move on.
async fn promote_outcome(ctx: &PipelineContext, outcome: &PipelineOutcome) -> anyhow::Result<()> {
    match &outcome.event {
        Some(event) => {
            let prod = curated_to_prod::handle_event(ctx, event).await?;
            print_prod(&prod);
        }
        None => println!("   Nothing committed for {}, skipping", outcome.table_name),
    }
    Ok(())
}

async fn run(cli: Cli, ctx: PipelineContext) -> anyhow::Result<()> {
    let now = Utc::now();
    match cli.command {
        Commands::RawToCurated(args) => {
            println!("🔄 Running raw-to-curated...");
            let outcome = raw_to_curated::process_batch(&ctx, &args.request(), now).await;
            print_outcome(&outcome);
            if outcome.status == PipelineStatus::Failed {
                bail!("stage 1 failed for {}", args.locator);
            }
        }
        Commands::CuratedToProd { table, object_key } => {
            println!("🔨 Running curated-to-prod...");
            let prod = match object_key {
                Some(key) => curated_to_prod::promote(&ctx, &table, &[key]).await?,
                None => curated_to_prod::backfill(&ctx, &table).await?,
            };
            print_prod(&prod);
        }
        Commands::Run(args) => {
            println!("🚀 Running full pipeline...");
            println!("\n📥 Step 1: raw-to-curated");
            let outcome = raw_to_curated::process_batch(&ctx, &args.request(), now).await;
            print_outcome(&outcome);
            println!("\n🔨 Step 2: curated-to-prod");
            promote_outcome(&ctx, &outcome).await?;
        }
        Commands::Manifest { path, promote } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read manifest {}", path.display()))?;
            let requests: Vec<ExtractRequest> = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse manifest {}", path.display()))?;
            println!("🗂️  Processing {} batches...", requests.len());

            let outcomes = raw_to_curated::process_manifest(&ctx, requests, now).await;
            for outcome in &outcomes {
                print_outcome(outcome);
            }
            if promote {
                for outcome in &outcomes {
                    promote_outcome(&ctx, outcome).await?;
                }
            }
            let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
            let failed = outcomes.iter().filter(|o| o.status == PipelineStatus::Failed).count();
            println!("\n📊 {} batches, {succeeded} succeeded, {failed} failed", outcomes.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = PipelineConfig::load(cli.config.as_deref())?;
    observability::init_logging(&config.logging)?;
    metrics::init()?;

    let registry = TableRegistry::load(cli.registry_dir.as_deref())?;
    info!(tables = ?registry.table_names(), "Registry resolved");
    let ctx = PipelineContext::from_config(config, registry)?;

    let print_metrics = cli.print_metrics;
    let result = run(cli, ctx).await;

    if print_metrics {
        if let Some(text) = metrics::render() {
            println!("\n{text}");
        }
    }
    result
}
