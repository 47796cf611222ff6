//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{info, warn};

use mcpextract_core::{
    BatchOrchestrator, BatchProgress, BatchSummary, ConfidenceAggregator, ConfigGenerator,
    build_client, load_sources, validate,
};
use mcpextract_crawler::{CrawlerConfig, GitHubCrawler, SourceFetcher};
use mcpextract_shared::{
    AppConfig, BatchConfig, CandidateConfig, Disposition, GeneratorConfig, SourceId,
    init_config, load_config, validate_api_key,
};
use mcpextract_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// mcpextract: turn MCP server repositories into reviewed launch configurations.
#[derive(Parser)]
#[command(
    name = "mcpextract",
    version,
    about = "Extract, validate and score MCP server launch configurations from source repositories.",
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
    /// Run the extraction pipeline over a list of repositories.
    Extract {
        /// JSON array (URLs or objects with `github_url`) or one URL per line.
        sources_file: PathBuf,

        /// Process at most N sources not yet in the database.
        #[arg(long)]
        limit: Option<usize>,

        /// Sources processed concurrently per slice.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Database path (defaults to the configured storage path).
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Fetch one repository's source bundle and print it as JSON.
    Crawl {
        /// Repository URL.
        url: String,
    },

    /// Validate and score a candidate configuration file offline.
    Validate {
        /// Path to a candidate configuration JSON file.
        candidate_json: PathBuf,
    },

    /// Show record counts per disposition.
    Stats {
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Print stored output records as a JSON array.
    Export {
        #[arg(long)]
        db: Option<PathBuf>,

        /// Only records with this disposition (approved, needs_review, rejected).
        #[arg(long)]
        disposition: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
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
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "mcpextract=info",
        1 => "mcpextract=debug",
        _ => "mcpextract=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Extract {
            sources_file,
            limit,
            batch_size,
            db,
        } => cmd_extract(&sources_file, limit, batch_size, db).await,
        Command::Crawl { url } => cmd_crawl(&url).await,
        Command::Validate { candidate_json } => cmd_validate(&candidate_json).await,
        Command::Stats { db } => cmd_stats(db).await,
        Command::Export { db, disposition } => cmd_export(db, disposition.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_extract(
    sources_file: &Path,
    limit: Option<usize>,
    batch_size: Option<usize>,
    db: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config()?;
    if let Some(size) = batch_size {
        if size == 0 {
            return Err(eyre!("--batch-size must be at least 1"));
        }
        config.batch.batch_size = size;
    }
    // Validate API key before doing anything
    validate_api_key(&config)?;

    let sources = load_sources(sources_file)?;
    if sources.is_empty() {
        return Err(eyre!(
            "no valid repository URLs in '{}'",
            sources_file.display()
        ));
    }

    let db_path = db.unwrap_or_else(|| config.db_path());
    let storage = Arc::new(Storage::open(&db_path).await?);
    let fetcher = Arc::new(GitHubCrawler::new(CrawlerConfig::from(&config))?);

    let generator_config = GeneratorConfig::from(&config);
    let client = build_client(&generator_config)?;
    let generator = Arc::new(ConfigGenerator::new(client, generator_config));

    let mut batch = BatchConfig::from(&config);
    batch.limit = limit;

    let orchestrator = BatchOrchestrator::new(
        fetcher,
        generator,
        storage,
        ConfidenceAggregator::new(config.thresholds),
        batch,
    );

    info!(
        sources = sources.len(),
        db = %db_path.display(),
        model = %config.llm.model,
        "starting extraction"
    );

    // Ctrl-C stops dispatching new slices; in-flight sources still finish.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight sources");
            let _ = cancel_tx.send(true);
        }
    });

    let progress = CliProgress::new();
    let state = orchestrator.run(&sources, &progress, &cancel_rx).await;
    print_summary(&state.summary());

    match state.aborted {
        Some(reason) => Err(eyre!("run aborted: {reason}")),
        None => Ok(()),
    }
}

async fn cmd_crawl(url: &str) -> Result<()> {
    let config = load_config()?;
    let source = SourceId::parse(url)?;
    let crawler = GitHubCrawler::new(CrawlerConfig::from(&config))?;

    info!(%source, "fetching source bundle");
    let bundle = crawler.fetch(&source).await?;
    println!("{}", serde_json::to_string_pretty(&bundle)?);
    Ok(())
}

async fn cmd_validate(path: &Path) -> Result<()> {
    let config = load_config()?;
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre!("cannot read '{}': {e}", path.display()))?;
    let candidate = CandidateConfig::from_json(&text)?;

    let report = validate(&candidate);
    let scored = ConfidenceAggregator::new(config.thresholds).aggregate(&candidate, &report);

    let output = serde_json::json!({
        "report": report,
        "confidence": scored.confidence,
        "disposition": scored.disposition,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_stats(db: Option<PathBuf>) -> Result<()> {
    let storage = open_readonly(db).await?;
    let stats = storage.stats().await?;

    println!();
    println!("  Records:      {}", stats.total);
    println!("  Approved:     {}", stats.approved);
    println!("  Needs review: {}", stats.needs_review);
    println!("  Rejected:     {}", stats.rejected);
    if !stats.by_config_type.is_empty() {
        println!("  By install method:");
        for (config_type, count) in &stats.by_config_type {
            println!("    {config_type:<8} {count}");
        }
    }
    println!();
    Ok(())
}

async fn cmd_export(db: Option<PathBuf>, disposition: Option<&str>) -> Result<()> {
    let filter = disposition
        .map(|d| {
            d.parse::<Disposition>()
                .map_err(|_| eyre!("unknown disposition '{d}': expected approved, needs_review or rejected"))
        })
        .transpose()?;

    let storage = open_readonly(db).await?;
    let records = storage.list_records(filter).await?;
    info!(count = records.len(), "exporting records");
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

async fn open_readonly(db: Option<PathBuf>) -> Result<Storage> {
    let path = match db {
        Some(path) => path,
        None => load_config()?.db_path(),
    };
    Ok(Storage::open_readonly(&path).await?)
}

fn print_summary(summary: &BatchSummary) {
    println!();
    if summary.cancelled {
        println!("  Run cancelled; {} source(s) left pending.", summary.pending);
    }
    println!("  Run:          {}", summary.run_id);
    println!("  Processed:    {}", summary.processed);
    println!("  Approved:     {}", summary.approved);
    println!("  Needs review: {}", summary.needs_review);
    println!("  Rejected:     {}", summary.rejected);
    println!("  Failed:       {}", summary.failed);
    println!("  Skipped:      {} (already processed)", summary.skipped);
    if summary.duplicates > 0 {
        println!("  Duplicates:   {}", summary.duplicates);
    }
    if summary.deferred > 0 {
        println!("  Deferred:     {} (over --limit)", summary.deferred);
    }
    println!(
        "  Time:         {:.1}s",
        summary.elapsed_ms as f64 / 1000.0
    );

    if !summary.attention.is_empty() {
        println!();
        println!("  Needs manual attention:");
        for item in &summary.attention {
            match &item.error {
                Some(error) => println!("    [{}] {}: {error}", item.disposition, item.source),
                None => println!("    [{}] {}", item.disposition, item.source),
            }
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) =
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(
                style
                    .progress_chars("=> ")
                    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl BatchProgress for CliProgress {
    fn run_started(&self, to_process: usize, skipped: usize) {
        self.bar.set_length(to_process as u64);
        if skipped > 0 {
            self.bar
                .set_message(format!("{skipped} already processed, skipping"));
        }
    }

    fn slice_started(&self, index: usize, size: usize) {
        self.bar
            .set_message(format!("slice {} ({size} sources)", index + 1));
    }

    fn source_finished(&self, source: &SourceId, disposition: Disposition, confidence: f64) {
        self.bar.inc(1);
        self.bar
            .set_message(format!("{source}: {disposition} ({confidence:.2})"));
    }

    fn done(&self, _summary: &BatchSummary) {
        self.bar.finish_and_clear();
    }
}
