use crate::cache::load_or_build;
use crate::config::{DEFAULT_CACHE_MAX_AGE_HOURS, DEFAULT_SCHEME, DEFAULT_WORKERS, MAX_WORKERS};
use crate::error::UnitError;
use crate::extract::Extractor;
use crate::index::{normalize, TitleIndex};
use crate::ledger::{ExceptionLedger, ExceptionRecord, LedgerSummary, Reason};
use crate::matcher::{MatchStatus, Matcher, Strategy};
use crate::models::{Block, DocumentSummary, ReferenceRecord};
use crate::progress::{DocumentOutcome, ProgressStore};
use crate::rewrite::{BlockRewriter, Resolution};
use crate::stats::{RunStatistics, StatsSnapshot};
use crate::store::{fetch_block_tree, DocumentStore};
use anyhow::{bail, Context, Result};
use dashmap::DashSet;
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which documents a run processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// The progress store's pending set; the first run selects every document
    Resume,
    /// Every indexed document not already done
    Full,
    DocumentId(String),
    /// The one document whose normalized title matches
    DocumentTitle(String),
}

impl RunMode {
    fn name(&self) -> &'static str {
        match self {
            RunMode::Resume => "resume",
            RunMode::Full => "full",
            RunMode::DocumentId(_) | RunMode::DocumentTitle(_) => "single",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolveConfig {
    pub mode: RunMode,
    pub strategy: Strategy,
    pub workers: usize,
    pub dry_run: bool,
    pub limit: Option<usize>,
    pub scheme: String,
    pub state_dir: PathBuf,
    pub report_parent: Option<String>,
    pub use_cache: bool,
    pub cache_max_age: Duration,
}

impl ResolveConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: RunMode::Resume,
            strategy: Strategy::default(),
            workers: DEFAULT_WORKERS,
            dry_run: false,
            limit: None,
            scheme: DEFAULT_SCHEME.to_string(),
            state_dir: state_dir.into(),
            report_parent: None,
            use_cache: true,
            cache_max_age: Duration::from_secs(DEFAULT_CACHE_MAX_AGE_HOURS * 3600),
        }
    }
}

/// A block update computed but not written (dry-run)
#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    pub document_id: String,
    pub block_id: String,
    pub references: usize,
    pub runs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: String,
    pub strategy: Strategy,
    pub dry_run: bool,
    pub documents_selected: usize,
    pub stopped_early: bool,
    pub pending_remaining: usize,
    pub stats: StatsSnapshot,
    pub exceptions: LedgerSummary,
    pub planned: Vec<PlannedChange>,
}

/// Everything a unit of work needs, shared read-only (or internally synchronized) by workers.
struct UnitContext {
    store: Arc<dyn DocumentStore>,
    extractor: Extractor,
    matcher: Matcher,
    rewriter: BlockRewriter,
    progress: Arc<ProgressStore>,
    ledger: Arc<ExceptionLedger>,
    stats: Arc<RunStatistics>,
    claims: DashSet<String>,
    planned: Mutex<Vec<PlannedChange>>,
    dry_run: bool,
}

fn make_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} documents {msg}")
        .map(|s| s.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn index_blocks(blocks: &[Block]) -> FxHashMap<&str, &Block> {
    let mut by_id = FxHashMap::default();
    let mut stack: Vec<&Block> = blocks.iter().rev().collect();
    while let Some(block) = stack.pop() {
        by_id.insert(block.id.as_str(), block);
        stack.extend(block.children.iter().rev());
    }
    by_id
}

fn exception(
    doc: &DocumentSummary,
    reference: Option<ReferenceRecord>,
    reason: Reason,
) -> ExceptionRecord {
    ExceptionRecord {
        document_id: doc.id.clone(),
        document_title: doc.title.clone(),
        reference,
        reason,
        suggestion: None,
    }
}

/// One document's unit of work: fetch, extract, match, rewrite, then mark done.
async fn process_document(
    ctx: &UnitContext,
    doc: &DocumentSummary,
) -> Result<DocumentOutcome, UnitError> {
    ctx.stats.inc_scanned();
    let blocks = fetch_block_tree(ctx.store.as_ref(), &doc.id).await?;

    let mut found = 0usize;
    let mut matched = 0usize;
    let mut unmatched = 0usize;
    let mut ambiguous = 0usize;
    // Block order is extraction order, so a block's references are contiguous.
    let mut groups: Vec<(String, Vec<Resolution>)> = Vec::new();

    for record in ctx.extractor.references(&doc.id, &blocks) {
        found += 1;
        let verdict = ctx.matcher.match_label(&record.display_label);
        match verdict.status {
            MatchStatus::Matched => {
                matched += 1;
                let Some(target_id) = verdict.resolved_document_id else {
                    continue;
                };
                let same_block = groups
                    .last()
                    .is_some_and(|(block_id, _)| *block_id == record.block_id);
                let resolution = Resolution { record, target_id };
                match groups.last_mut() {
                    Some((_, list)) if same_block => list.push(resolution),
                    _ => {
                        let block_id = resolution.record.block_id.clone();
                        groups.push((block_id, vec![resolution]));
                    }
                }
            }
            MatchStatus::Unmatched => {
                unmatched += 1;
                let suggestion = ctx.matcher.suggest(&record.display_label).map(|s| s.title);
                let mut entry = exception(doc, Some(record), Reason::Unmatched);
                entry.suggestion = suggestion;
                ctx.ledger.record(entry).await;
            }
            MatchStatus::Ambiguous => {
                ambiguous += 1;
                let reason = Reason::Ambiguous {
                    candidates: verdict.candidates,
                };
                ctx.ledger.record(exception(doc, Some(record), reason)).await;
            }
        }
    }

    ctx.stats.add_found(found as u64);
    ctx.stats.add_matched(matched as u64);
    ctx.stats.add_unmatched(unmatched as u64);
    ctx.stats.add_ambiguous(ambiguous as u64);
    if found > 0 {
        ctx.stats.inc_with_links();
    }

    let by_id = index_blocks(&blocks);
    let mut links_updated = 0usize;
    let mut blocks_updated = 0usize;
    let mut failures = Vec::new();

    for (block_id, resolutions) in groups {
        let Some(block) = by_id.get(block_id.as_str()) else {
            continue;
        };
        match ctx.rewriter.apply(block, &resolutions).await {
            Ok(change) if change.applied => {
                blocks_updated += 1;
                links_updated += change.references;
            }
            Ok(change) => {
                ctx.stats.add_blocks_planned(1);
                if let Ok(mut planned) = ctx.planned.lock() {
                    planned.push(PlannedChange {
                        document_id: doc.id.clone(),
                        block_id: change.block_id,
                        references: change.references,
                        runs: change.runs.len(),
                    });
                }
            }
            Err(e) => {
                warn!(document_id = %doc.id, block_id = %block_id, error = %e, "Block rewrite failed");
                for resolution in &resolutions {
                    let reason = Reason::RewriteFailed {
                        message: e.to_string(),
                    };
                    let record = exception(doc, Some(resolution.record.clone()), reason);
                    ctx.ledger.record(record).await;
                }
                failures.push(e);
            }
        }
    }

    ctx.stats.add_updated(links_updated as u64);
    ctx.stats.add_blocks_updated(blocks_updated as u64);

    if !failures.is_empty() {
        let failed = failures.len();
        let first = failures.swap_remove(0);
        return Err(UnitError::Rewrite { failed, first });
    }

    let outcome = DocumentOutcome::new(
        found,
        matched,
        unmatched,
        ambiguous,
        links_updated,
        blocks_updated,
    );

    if !ctx.dry_run {
        ctx.progress
            .mark_done(doc, outcome.clone())
            .map_err(UnitError::Progress)?;
    }

    debug!(
        document_id = %doc.id,
        found = found,
        matched = matched,
        updated = links_updated,
        status = outcome.status.as_str(),
        "Document processed"
    );
    Ok(outcome)
}

/// Runs one unit of work and converts its failure into a ledger entry; never fails the run.
async fn run_unit(ctx: Arc<UnitContext>, doc: DocumentSummary) {
    if !ctx.claims.insert(doc.id.clone()) {
        warn!(document_id = %doc.id, "Document already in flight, skipped");
        return;
    }
    ctx.ledger.begin_document(&doc.id);

    match process_document(&ctx, &doc).await {
        Ok(_) => {
            if !ctx.dry_run {
                ctx.stats.inc_done();
            }
        }
        Err(e) => {
            ctx.stats.inc_errored();
            warn!(document_id = %doc.id, title = %doc.title, error = %e, "Document left pending");
            // Rewrite failures were already recorded per reference.
            let reason = match &e {
                UnitError::Scan(scan) => Some(Reason::ScanFailed {
                    message: scan.to_string(),
                }),
                UnitError::Progress(err) => Some(Reason::ProgressFailed {
                    message: format!("{err:#}"),
                }),
                UnitError::Rewrite { .. } => None,
            };
            if let Some(reason) = reason {
                ctx.ledger.record(exception(&doc, None, reason)).await;
            }
        }
    }

    ctx.claims.remove(&doc.id);
}

/// Resolves the run mode into the ordered list of documents to process.
async fn select_documents(
    store: &dyn DocumentStore,
    index: &TitleIndex,
    progress: &ProgressStore,
    mode: &RunMode,
) -> Result<Vec<DocumentSummary>> {
    let single = match mode {
        RunMode::DocumentId(id) => {
            let doc = match index.documents().iter().find(|d| &d.id == id) {
                Some(doc) => doc.clone(),
                None => store
                    .document(id)
                    .await
                    .with_context(|| format!("Document {id} could not be loaded"))?,
            };
            Some(doc)
        }
        RunMode::DocumentTitle(title) => {
            let candidates = index.candidates(&normalize(title));
            match candidates {
                [only] => Some(DocumentSummary {
                    id: only.document_id.clone(),
                    title: only.raw_title.clone(),
                }),
                [] => bail!("No document titled {title:?}"),
                many => bail!(
                    "{} documents are titled {title:?}; use --document-id instead",
                    many.len()
                ),
            }
        }
        RunMode::Full => {
            progress.mark_scope(index.documents())?;
            None
        }
        RunMode::Resume => {
            if !progress.has_scope()? {
                info!("No previous run found, selecting every document");
                progress.mark_scope(index.documents())?;
            }
            None
        }
    };

    if let Some(doc) = single {
        // Later resumes still cover the whole workspace.
        if !progress.has_scope()? {
            progress.mark_scope(index.documents())?;
        }
        progress.reopen(&doc)?;
        return Ok(vec![doc]);
    }

    Ok(progress
        .current_pending()?
        .into_iter()
        .map(|entry| DocumentSummary {
            id: entry.document_id,
            title: entry.title,
        })
        .collect())
}

/// Runs the resolution pipeline over the selected documents with a bounded worker pool.
///
/// Only setup failures are returned as errors. Per-document failures end up in the exception
/// ledger and leave the document pending for the next run.
pub async fn run_resolve(
    store: Arc<dyn DocumentStore>,
    config: &ResolveConfig,
    stop: Arc<AtomicBool>,
) -> Result<RunSummary> {
    store
        .verify_access()
        .await
        .context("Destination store rejected access")?;

    fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("Failed to create state directory: {:?}", config.state_dir))?;

    let index = Arc::new(
        load_or_build(
            store.as_ref(),
            &config.state_dir,
            config.use_cache,
            config.cache_max_age,
        )
        .await?,
    );
    let progress = Arc::new(ProgressStore::open(&config.state_dir, config.dry_run)?);

    let mut work = select_documents(store.as_ref(), &index, &progress, &config.mode).await?;
    let mut seen = FxHashSet::default();
    work.retain(|d| seen.insert(d.id.clone()));
    if let Some(limit) = config.limit {
        work.truncate(limit);
    }

    let ledger = Arc::new(ExceptionLedger::open(
        &config.state_dir,
        store.clone(),
        config.report_parent.clone(),
        config.dry_run,
    )?);
    let stats = Arc::new(RunStatistics::new());
    let extractor = Extractor::new(&config.scheme)
        .with_context(|| format!("Invalid legacy scheme: {:?}", config.scheme))?;

    let ctx = Arc::new(UnitContext {
        store: store.clone(),
        extractor,
        matcher: Matcher::new(index.clone(), config.strategy),
        rewriter: BlockRewriter::new(store.clone(), config.dry_run),
        progress: progress.clone(),
        ledger: ledger.clone(),
        stats: stats.clone(),
        claims: DashSet::new(),
        planned: Mutex::new(Vec::new()),
        dry_run: config.dry_run,
    });

    let workers = config.workers.clamp(1, MAX_WORKERS);
    info!(
        documents = work.len(),
        workers = workers,
        strategy = %config.strategy,
        dry_run = config.dry_run,
        "Resolving references"
    );

    let pb = make_progress_bar(work.len() as u64);
    let mut in_flight = FuturesUnordered::new();
    let mut queue = work.iter().cloned();
    let mut stopped_early = false;

    for _ in 0..workers.min(work.len()) {
        if let Some(doc) = queue.next() {
            in_flight.push(tokio::spawn(run_unit(ctx.clone(), doc)));
        }
    }

    while let Some(join_result) = in_flight.next().await {
        if let Err(e) = join_result {
            stats.inc_errored();
            warn!(error = %e, "Worker task failed");
        }
        pb.inc(1);

        if stop.load(Ordering::Relaxed) {
            if !stopped_early {
                stopped_early = true;
                pb.set_message("stopping...");
                warn!("Stop requested, waiting for in-flight documents");
            }
            continue;
        }
        if let Some(doc) = queue.next() {
            in_flight.push(tokio::spawn(run_unit(ctx.clone(), doc)));
        }
    }
    stopped_early = stopped_early || queue.next().is_some();
    pb.finish_and_clear();

    let exceptions = ledger.finish().await?;
    let planned = ctx.planned.lock().map(|p| p.clone()).unwrap_or_default();
    let pending_remaining = progress.current_pending()?.len();

    Ok(RunSummary {
        mode: config.mode.name().to_string(),
        strategy: config.strategy,
        dry_run: config.dry_run,
        documents_selected: work.len(),
        stopped_early,
        pending_remaining,
        stats: stats.snapshot(),
        exceptions,
        planned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Annotations, RichText};

    #[test]
    fn block_index_covers_nested_blocks() {
        let text = |s: &str| vec![RichText::text(s, Annotations::default())];
        let blocks = vec![
            Block::paragraph("a", text("a")).with_children(vec![Block::paragraph("b", text("b"))]),
            Block::paragraph("c", text("c")),
        ];
        let by_id = index_blocks(&blocks);
        assert_eq!(by_id.len(), 3);
        assert_eq!(by_id["b"].id, "b");
    }

    #[test]
    fn default_config_resumes_with_three_workers() {
        let config = ResolveConfig::new("state");
        assert_eq!(config.mode, RunMode::Resume);
        assert_eq!(config.workers, 3);
        assert_eq!(config.strategy, Strategy::CaseInsensitive);
        assert!(!config.dry_run);
    }
}
