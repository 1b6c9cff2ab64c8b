use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use relink::cache;
use relink::config::{
    DEFAULT_API_BASE, DEFAULT_CACHE_MAX_AGE_HOURS, DEFAULT_REQUEST_INTERVAL_MS, DEFAULT_SCHEME,
    DEFAULT_STATE_DIR, DEFAULT_WORKERS,
};
use relink::extract::parse_scheme;
use relink::ledger::ExceptionLedger;
use relink::matcher::Strategy;
use relink::notion::NotionStore;
use relink::pipeline::{run_resolve, ResolveConfig, RunMode, RunSummary};
use relink::progress::ProgressStore;
use relink::snapshot::MemoryStore;
use relink::store::DocumentStore;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "relink")]
#[command(about = "Resolve legacy cross-references in migrated documents to native page mentions")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory for progress files, caches and local reports
    #[arg(long, default_value = DEFAULT_STATE_DIR, global = true)]
    state_dir: PathBuf,

    /// Destination API token
    #[arg(long, env = "NOTION_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Use a local JSON snapshot instead of the destination API; changes are written back to it
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,

    /// Destination API base URL
    #[arg(long, default_value = DEFAULT_API_BASE, global = true)]
    api_base: String,

    /// Minimum pause between API requests, in milliseconds
    #[arg(long, default_value_t = DEFAULT_REQUEST_INTERVAL_MS, global = true)]
    request_interval_ms: u64,

    /// URI scheme of legacy references
    #[arg(long, default_value = DEFAULT_SCHEME, value_parser = parse_scheme, global = true)]
    scheme: String,

    /// Force rebuild of the title index cache
    #[arg(long, global = true)]
    no_cache: bool,

    /// Maximum age of the title index cache, in hours
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE_HOURS, global = true)]
    cache_max_age_hours: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve legacy references and rewrite them as page mentions
    Resolve(ResolveArgs),
    /// Build (or refresh) the title index
    Index,
    /// Show progress of the current resolution run
    Status,
    /// Forget progress and exception records
    Reset(ResetArgs),
    /// List titles shared by more than one document
    Duplicates,
}

#[derive(Args)]
struct ResolveArgs {
    /// Process only the document with this id
    #[arg(long, conflicts_with_all = ["document", "full"])]
    document_id: Option<String>,

    /// Process only the document with this title
    #[arg(long, conflicts_with = "full")]
    document: Option<String>,

    /// Select every indexed document instead of resuming
    #[arg(long)]
    full: bool,

    /// Limit number of documents to process
    #[arg(long)]
    limit: Option<usize>,

    /// Number of documents processed concurrently
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Compute changes without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Title matching strategy
    #[arg(long, value_enum, default_value_t = Strategy::CaseInsensitive)]
    strategy: Strategy,

    /// Create the exception report document under this parent page
    #[arg(long)]
    report_parent: Option<String>,

    /// Write the run summary as JSON to this file
    #[arg(long)]
    summary: Option<PathBuf>,
}

#[derive(Args)]
struct ResetArgs {
    /// Also remove the title index cache
    #[arg(long)]
    cache: bool,
}

/// The store selected on the command line
enum Backend {
    Snapshot(Arc<MemoryStore>),
    Notion(Arc<NotionStore>),
}

impl Backend {
    fn open(cli: &Cli) -> Result<Self> {
        if let Some(path) = &cli.snapshot {
            let store = MemoryStore::load(path)?;
            info!(path = ?path, "Using snapshot store");
            return Ok(Backend::Snapshot(Arc::new(store)));
        }

        let Some(token) = cli.token.as_deref() else {
            bail!("No API token: pass --token or set NOTION_TOKEN (or use --snapshot)");
        };
        let store = NotionStore::new(
            token,
            &cli.api_base,
            Duration::from_millis(cli.request_interval_ms),
        )
        .context("Failed to create API client")?;
        Ok(Backend::Notion(Arc::new(store)))
    }

    fn handle(&self) -> Arc<dyn DocumentStore> {
        match self {
            Backend::Snapshot(store) => store.clone(),
            Backend::Notion(store) => store.clone(),
        }
    }
}

fn cache_max_age(cli: &Cli) -> Duration {
    Duration::from_secs(cli.cache_max_age_hours * 3600)
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("relink-worker")
        .enable_io()
        .enable_time()
        .build()
        .context("Failed to start async runtime")
}

fn print_summary(summary: &RunSummary, elapsed: Duration) {
    let stats = &summary.stats;

    println!();
    println!("=== Summary ===");
    println!("Mode:                {}", summary.mode);
    println!("Strategy:            {}", summary.strategy);
    if summary.dry_run {
        println!("Dry run:             no changes written");
    }
    println!("Total time:          {:.2}s", elapsed.as_secs_f64());
    println!();
    println!("Documents selected:  {}", summary.documents_selected);
    println!("Documents scanned:   {}", stats.documents_scanned);
    println!("With references:     {}", stats.documents_with_links);
    println!("Documents done:      {}", stats.documents_done);
    println!("Documents errored:   {}", stats.documents_errored);
    println!("Still pending:       {}", summary.pending_remaining);
    println!();
    println!("References found:    {}", stats.references_found);
    println!(
        "Matched:             {} ({:.1}%)",
        stats.references_matched,
        stats.match_rate()
    );
    println!("Unmatched:           {}", stats.references_unmatched);
    println!("Ambiguous:           {}", stats.references_ambiguous);
    println!("Links updated:       {}", stats.references_updated);
    println!("Blocks updated:      {}", stats.blocks_updated);
    if summary.dry_run {
        println!("Blocks to update:    {}", stats.blocks_planned);
    }
    println!();
    println!("Exceptions:          {}", summary.exceptions.total);
    for (reason, count) in &summary.exceptions.by_reason {
        println!("  {:<18} {}", reason, count);
    }
    if let Some(path) = &summary.exceptions.report_path {
        println!("Report:              {}", path.display());
    }
    if let Some(id) = &summary.exceptions.remote_report_id {
        println!("Report document:     {}", id);
    }
    if summary.stopped_early {
        println!();
        println!("Stopped early; run `relink resolve` again to continue.");
    }
}

fn run_resolve_command(cli: &Cli, args: &ResolveArgs) -> Result<()> {
    let mode = match (&args.document_id, &args.document, args.full) {
        (Some(id), _, _) => RunMode::DocumentId(id.clone()),
        (None, Some(title), _) => RunMode::DocumentTitle(title.clone()),
        (None, None, true) => RunMode::Full,
        (None, None, false) => RunMode::Resume,
    };

    let config = ResolveConfig {
        mode,
        strategy: args.strategy,
        workers: args.workers,
        dry_run: args.dry_run,
        limit: args.limit,
        scheme: cli.scheme.clone(),
        state_dir: cli.state_dir.clone(),
        report_parent: args.report_parent.clone(),
        use_cache: !cli.no_cache,
        cache_max_age: cache_max_age(cli),
    };

    let backend = Backend::open(cli)?;
    let rt = build_runtime()?;
    let start = Instant::now();

    let summary = rt.block_on(async {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flag.store(true, Ordering::Relaxed);
            }
        });
        run_resolve(backend.handle(), &config, stop).await
    })?;

    if let Some(path) = &args.summary {
        let json = serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?;
        fs::write(path, json).with_context(|| format!("Failed to write summary: {:?}", path))?;
        info!(path = ?path, "Run summary written");
    }

    print_summary(&summary, start.elapsed());
    Ok(())
}

fn run_index(cli: &Cli) -> Result<()> {
    let backend = Backend::open(cli)?;
    let rt = build_runtime()?;
    let start = Instant::now();

    fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("Failed to create state directory: {:?}", cli.state_dir))?;
    let index = rt.block_on(cache::load_or_build(
        backend.handle().as_ref(),
        &cli.state_dir,
        !cli.no_cache,
        cache_max_age(cli),
    ))?;

    println!();
    println!("=== Summary ===");
    println!("Indexing time:       {:.2}s", start.elapsed().as_secs_f64());
    println!("Documents:           {}", index.len());
    println!("Distinct titles:     {}", index.title_count());
    println!("Untitled documents:  {}", index.blank_titles());
    println!("Shared titles:       {}", index.collisions().len());
    Ok(())
}

fn run_duplicates(cli: &Cli) -> Result<()> {
    let backend = Backend::open(cli)?;
    let rt = build_runtime()?;

    fs::create_dir_all(&cli.state_dir)
        .with_context(|| format!("Failed to create state directory: {:?}", cli.state_dir))?;
    let index = rt.block_on(cache::load_or_build(
        backend.handle().as_ref(),
        &cli.state_dir,
        !cli.no_cache,
        cache_max_age(cli),
    ))?;

    let collisions = index.collisions();
    if collisions.is_empty() {
        println!("No shared titles.");
        return Ok(());
    }
    for entry in &collisions {
        println!("{} ({} documents)", entry.normalized_title, entry.documents.len());
        for doc in &entry.documents {
            println!("  {}  {}", doc.document_id, doc.raw_title);
        }
    }
    Ok(())
}

fn run_status(state_dir: &Path) -> Result<()> {
    let progress = ProgressStore::open(state_dir, true)?;
    let counts = progress.counts()?;

    println!();
    println!("=== Status ===");
    if counts.scope == 0 {
        println!("No run recorded in {}", state_dir.display());
        return Ok(());
    }
    println!("In scope:            {}", counts.scope);
    println!("Done:                {}", counts.done);
    println!("Pending:             {}", counts.pending);
    for (status, count) in &counts.by_status {
        println!("  {:<18} {}", status.as_str(), count);
    }

    let done = progress.current_done()?;
    let updated: usize = done.iter().map(|d| d.outcome.links_updated).sum();
    let unmatched: usize = done.iter().map(|d| d.outcome.unmatched).sum();
    let ambiguous: usize = done.iter().map(|d| d.outcome.ambiguous).sum();
    println!();
    println!("Links updated:       {}", updated);
    println!("Left unmatched:      {}", unmatched);
    println!("Left ambiguous:      {}", ambiguous);
    Ok(())
}

fn run_reset(state_dir: &Path, args: &ResetArgs) -> Result<()> {
    let progress = ProgressStore::open(state_dir, false)?;
    progress.reset()?;
    ExceptionLedger::clear(state_dir)?;

    if args.cache {
        let path = cache::cache_path(state_dir);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove cache: {:?}", path))?;
        }
    }

    info!(state_dir = ?state_dir, "State reset");
    println!("Progress and exception records cleared.");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let result = match &cli.command {
        Commands::Resolve(args) => run_resolve_command(&cli, args),
        Commands::Index => run_index(&cli),
        Commands::Status => run_status(&cli.state_dir),
        Commands::Reset(args) => run_reset(&cli.state_dir, args),
        Commands::Duplicates => run_duplicates(&cli),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
