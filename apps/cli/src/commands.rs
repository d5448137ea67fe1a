//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use tunebook_core::{
    export_verified_index, load_catalogue, ClassificationOrchestrator, ProgressReporter,
    ScrapeOrchestrator,
};
use tunebook_fetch::RateLimitedFetcher;
use tunebook_judge::OpenRouterJudge;
use tunebook_shared::config::{
    self, checkpoint_path, init_config, load_config, validate_api_key, AppConfig, FetchConfig,
};
use tunebook_shared::retry::RetryPolicy;
use tunebook_shared::types::Stage;
use tunebook_storage::CheckpointStore;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// tunebook — verified hymn-to-tune metadata.
#[derive(Parser)]
#[command(
    name = "tunebook",
    version,
    about = "Scrape, classify, and export tune metadata for a hymn catalogue.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Scrape tune candidates for every hymn in the catalogue.
    Scrape {
        /// Path to the catalogue items.json file.
        input: PathBuf,

        /// Process only the first N hymns (for testing).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Classify scraped candidates with majority-voted judge runs.
    Classify {
        /// Override the configured model.
        #[arg(long)]
        model: Option<String>,

        /// Override the configured number of judge runs per hymn.
        #[arg(long)]
        runs: Option<usize>,

        /// Process only the first N eligible hymns (for testing).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show per-stage checkpoint counts.
    Status,

    /// Export the verified index of confirmed tunes.
    Export {
        /// Output path (defaults to <data_dir>/processed/verified_index.json).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Clear checkpoint progress. Raw HTML cache is always kept.
    Reset {
        /// Only demote classified items back to scraped.
        #[arg(long)]
        classification: bool,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match cli.verbose {
        0 => "tunebook=info",
        1 => "tunebook=debug",
        _ => "tunebook=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Scrape { input, limit } => cmd_scrape(&input, limit).await,
        Command::Classify { model, runs, limit } => {
            cmd_classify(model.as_deref(), runs, limit).await
        }
        Command::Status => cmd_status().await,
        Command::Export { out } => cmd_export(out).await,
        Command::Reset { classification } => cmd_reset(classification).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn open_store(config: &AppConfig) -> Result<CheckpointStore> {
    Ok(CheckpointStore::open(&checkpoint_path(config)).await?)
}

async fn cmd_scrape(input: &std::path::Path, limit: Option<usize>) -> Result<()> {
    let config = load_config()?;
    let fetch_config = FetchConfig::from_app(&config)?;

    let mut items = load_catalogue(input)?;
    if let Some(limit) = limit {
        items.truncate(limit);
        info!(limit, "limiting catalogue");
    }

    let store = open_store(&config).await?;
    let run_id = store.begin_run("scrape").await?;

    let fetcher = RateLimitedFetcher::new(fetch_config)?;
    let orchestrator = ScrapeOrchestrator::new(fetcher, config.defaults.max_item_retries);

    let reporter = CliProgress::new();
    let report = orchestrator.run(&items, &store, &reporter).await?;
    reporter.finish();

    let stats = serde_json::json!({
        "total": report.total,
        "processed": report.processed,
        "skipped": report.skipped,
        "failed": report.failed,
        "permanently_failed": report.permanently_failed.len(),
    });
    store.finish_run(&run_id, &stats.to_string()).await?;

    println!();
    println!("  Scrape run complete");
    println!("  Total:     {}", report.total);
    println!("  Processed: {}", report.processed);
    println!("  Skipped:   {} (already done)", report.skipped);
    println!("  Failed:    {} (will retry on next run)", report.failed);
    if !report.permanently_failed.is_empty() {
        println!("  Gave up on {} item(s):", report.permanently_failed.len());
        for (id, reason) in &report.permanently_failed {
            println!("    ✗ {id}: {reason}");
        }
    }
    println!();

    Ok(())
}

async fn cmd_classify(
    model: Option<&str>,
    runs: Option<usize>,
    limit: Option<usize>,
) -> Result<()> {
    let config = load_config()?;
    // Fail before touching any item, not on the first judge call.
    let api_key = validate_api_key(&config)?;

    let model = model.unwrap_or(&config.openrouter.default_model);
    let num_runs = runs.unwrap_or(config.classify.num_runs);

    let store = open_store(&config).await?;
    let run_id = store.begin_run("classify").await?;

    let judge = OpenRouterJudge::new(api_key, model)?;
    let orchestrator = ClassificationOrchestrator::new(
        Arc::new(judge),
        num_runs,
        RetryPolicy::new(config.classify.max_attempts, config.classify.backoff_base_secs),
        config.classify.tie_break,
        config.defaults.max_item_retries,
    )
    .with_limit(limit);

    info!(model, num_runs, "starting classification");

    let reporter = CliProgress::new();
    let report = orchestrator.run(&store, &reporter).await?;
    reporter.finish();

    let stats = serde_json::json!({
        "eligible": report.eligible,
        "classified": report.classified,
        "skipped": report.skipped,
        "failed": report.failed,
        "runs_lost": report.runs_lost,
    });
    store.finish_run(&run_id, &stats.to_string()).await?;

    println!();
    println!("  Classification run complete");
    println!("  Eligible:   {}", report.eligible);
    println!("  Classified: {}", report.classified);
    println!("  Skipped:    {}", report.skipped);
    println!("  Failed:     {}", report.failed);
    println!("  Runs lost:  {}", report.runs_lost);
    if !report.permanently_failed.is_empty() {
        println!("  Gave up on {} item(s):", report.permanently_failed.len());
        for (id, reason) in &report.permanently_failed {
            println!("    ✗ {id}: {reason}");
        }
    }
    println!();

    Ok(())
}

async fn cmd_status() -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config).await?;
    let counts = store.counts_by_stage().await?;

    let stages = [
        Stage::Pending,
        Stage::Scraped,
        Stage::Failed,
        Stage::Classified,
        Stage::ClassificationFailed,
    ];

    println!();
    println!("  Checkpoint: {}", checkpoint_path(&config).display());
    let mut total = 0;
    for stage in stages {
        let count = counts.get(&stage).copied().unwrap_or(0);
        total += count;
        println!("  {:<22} {count}", stage.to_string());
    }
    println!("  {:<22} {total}", "total");
    println!();

    Ok(())
}

async fn cmd_export(out: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config).await?;

    let out = out.unwrap_or_else(|| {
        config::data_dir(&config)
            .join("processed")
            .join("verified_index.json")
    });

    let entries = export_verified_index(&store, &out).await?;

    println!();
    println!("  Exported {entries} hymn(s) to {}", out.display());
    println!();

    Ok(())
}

async fn cmd_reset(classification_only: bool) -> Result<()> {
    let config = load_config()?;
    let store = open_store(&config).await?;

    if classification_only {
        let demoted = store.reset_classification().await?;
        println!("  Demoted {demoted} item(s) back to scraped.");
    } else {
        let deleted = store.reset().await?;
        println!("  Cleared {deleted} checkpoint record(s). Cached HTML kept.");
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("  Wrote default config to {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Progress reporter backed by an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("valid template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn item_progress(&self, current: usize, total: usize, detail: &str) {
        self.spinner
            .set_message(format!("[{current}/{total}] {detail}"));
    }
}
