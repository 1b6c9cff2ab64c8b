use crate::config::{MAX_APPEND_BLOCKS, MAX_RICH_TEXT_LENGTH, REPORT_TITLE};
use crate::index::IndexedDocument;
use crate::models::{Annotations, Block, BlockContent, ReferenceRecord, RichText, TextBlock};
use crate::store::DocumentStore;
use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const JOURNAL_FILE: &str = "exceptions.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reason {
    Unmatched,
    Ambiguous { candidates: Vec<IndexedDocument> },
    ScanFailed { message: String },
    RewriteFailed { message: String },
    /// The document's progress could not be recorded
    ProgressFailed { message: String },
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Unmatched => "unmatched",
            Reason::Ambiguous { .. } => "ambiguous",
            Reason::ScanFailed { .. } => "scan_failed",
            Reason::RewriteFailed { .. } => "rewrite_failed",
            Reason::ProgressFailed { .. } => "progress_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub document_id: String,
    #[serde(default)]
    pub document_title: String,
    /// Absent when the failure concerns the whole document
    #[serde(default)]
    pub reference: Option<ReferenceRecord>,
    pub reason: Reason,
    #[serde(default)]
    pub suggestion: Option<String>,
}

impl ExceptionRecord {
    fn label(&self) -> &str {
        self.reference
            .as_ref()
            .map(|r| r.display_label.as_str())
            .unwrap_or("")
    }

    fn target(&self) -> &str {
        self.reference
            .as_ref()
            .map(|r| r.raw_target.as_str())
            .unwrap_or("")
    }

    /// One-line human description, shared by the markdown and remote reports
    fn describe(&self) -> String {
        let mut line = self.reason.as_str().replace('_', " ");
        if self.reference.is_some() {
            let _ = write!(line, " \"{}\" -> {}", self.label(), self.target());
        }
        match &self.reason {
            Reason::Unmatched => {}
            Reason::Ambiguous { candidates } => {
                let listed: Vec<String> = candidates
                    .iter()
                    .map(|c| format!("{} ({})", c.raw_title, c.document_id))
                    .collect();
                let _ = write!(line, "; candidates: {}", listed.join(", "));
            }
            Reason::ScanFailed { message }
            | Reason::RewriteFailed { message }
            | Reason::ProgressFailed { message } => {
                let _ = write!(line, ": {message}");
            }
        }
        if let Some(suggestion) = &self.suggestion {
            let _ = write!(line, " (did you mean \"{suggestion}\"?)");
        }
        line
    }
}

/// One line of the exception journal.
///
/// A `Begin` line marks a document as (re)processed; records of that document journaled before
/// it are superseded.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum JournalLine {
    Begin { begin: String },
    Record(ExceptionRecord),
}

/// Totals reported at the end of a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerSummary {
    pub total: usize,
    pub documents: usize,
    pub by_reason: BTreeMap<String, usize>,
    pub report_path: Option<PathBuf>,
    pub remote_report_id: Option<String>,
}

/// Collects unresolved and failed references from every worker.
///
/// The local journal is opened on first use and the remote report document is created by the
/// first record of a run; each happens exactly once however many workers race for it. Records
/// from earlier runs are carried over for documents this run does not touch, so a resumed run
/// ends with the same ledger as an uninterrupted one.
pub struct ExceptionLedger {
    state_dir: PathBuf,
    store: Arc<dyn DocumentStore>,
    report_parent: Option<String>,
    dry_run: bool,
    carried: Vec<ExceptionRecord>,
    records: Mutex<Vec<ExceptionRecord>>,
    touched: Mutex<FxHashSet<String>>,
    journal: once_cell::sync::OnceCell<Option<Mutex<BufWriter<File>>>>,
    remote_report: tokio::sync::OnceCell<Option<String>>,
}

impl ExceptionLedger {
    pub fn open(
        state_dir: &Path,
        store: Arc<dyn DocumentStore>,
        report_parent: Option<String>,
        dry_run: bool,
    ) -> Result<Self> {
        let carried = load_journal(&state_dir.join(JOURNAL_FILE))?;
        if !carried.is_empty() {
            debug!(records = carried.len(), "Exception records carried from earlier runs");
        }
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            store,
            report_parent,
            dry_run,
            carried,
            records: Mutex::new(Vec::new()),
            touched: Mutex::new(FxHashSet::default()),
            journal: once_cell::sync::OnceCell::new(),
            remote_report: tokio::sync::OnceCell::new(),
        })
    }

    /// Marks a document as processed by this run; its earlier records are superseded.
    pub fn begin_document(&self, document_id: &str) {
        if let Ok(mut touched) = self.touched.lock() {
            touched.insert(document_id.to_string());
        }
        self.journal_line(&JournalLine::Begin {
            begin: document_id.to_string(),
        });
    }

    pub async fn record(&self, record: ExceptionRecord) {
        self.remote_report
            .get_or_init(|| self.create_remote_report())
            .await;
        self.journal_line(&record);

        debug!(
            document_id = %record.document_id,
            reason = record.reason.as_str(),
            label = record.label(),
            "Exception recorded"
        );

        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    fn journal_line<T: Serialize>(&self, line: &T) {
        let journal = self.journal.get_or_init(|| {
            if self.dry_run {
                return None;
            }
            match open_journal(&self.state_dir) {
                Ok(writer) => Some(Mutex::new(writer)),
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Could not open exception journal");
                    None
                }
            }
        });
        let Some(journal) = journal else {
            return;
        };
        match journal.lock() {
            Ok(mut writer) => {
                if let Err(e) = append_line(&mut writer, line) {
                    warn!(error = %format!("{:#}", e), "Could not write exception journal line");
                }
            }
            Err(_) => warn!("Exception journal lock poisoned"),
        }
    }

    async fn create_remote_report(&self) -> Option<String> {
        let parent = self.report_parent.as_ref().filter(|_| !self.dry_run)?;
        match self.store.create_document(parent, REPORT_TITLE).await {
            Ok(id) => {
                info!(document_id = %id, "Exception report document created");
                Some(id)
            }
            Err(e) => {
                warn!(error = %e, "Could not create exception report document");
                None
            }
        }
    }

    /// Records of this run only
    pub fn run_records(&self) -> Vec<ExceptionRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Carried records of untouched documents plus this run's records, grouped by document.
    pub fn merged_records(&self) -> Vec<ExceptionRecord> {
        let touched = self.touched.lock().map(|t| t.clone()).unwrap_or_default();
        let mut merged: Vec<ExceptionRecord> = self
            .carried
            .iter()
            .filter(|r| !touched.contains(&r.document_id))
            .cloned()
            .collect();
        merged.extend(self.run_records());
        merged.sort_by(|a, b| {
            a.document_title
                .cmp(&b.document_title)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        merged
    }

    pub fn report_id(&self) -> Option<&str> {
        self.remote_report.get().and_then(|id| id.as_deref())
    }

    /// Writes the final local reports and fills the remote report document.
    pub async fn finish(&self) -> Result<LedgerSummary> {
        let merged = self.merged_records();
        let prefix = if self.dry_run { "dry-run-" } else { "" };

        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("Failed to create directory: {:?}", self.state_dir))?;

        if !self.dry_run {
            compact_journal(&self.state_dir.join(JOURNAL_FILE), &merged)?;
        }

        let md_path = self.state_dir.join(format!("{prefix}exceptions.md"));
        fs::write(&md_path, render_markdown(&merged))
            .with_context(|| format!("Failed to write report: {:?}", md_path))?;
        let csv_path = self.state_dir.join(format!("{prefix}exceptions.csv"));
        write_csv(&csv_path, &merged)?;

        if let Some(report_id) = self.report_id() {
            self.publish(report_id, &merged).await;
        }

        let mut by_reason = BTreeMap::new();
        for record in &merged {
            *by_reason.entry(record.reason.as_str().to_string()).or_insert(0) += 1;
        }
        let documents = merged
            .iter()
            .map(|r| r.document_id.as_str())
            .collect::<FxHashSet<_>>()
            .len();

        info!(
            exceptions = merged.len(),
            documents = documents,
            path = ?md_path,
            "Exception report written"
        );

        Ok(LedgerSummary {
            total: merged.len(),
            documents,
            by_reason,
            report_path: Some(md_path),
            remote_report_id: self.report_id().map(str::to_string),
        })
    }

    async fn publish(&self, report_id: &str, records: &[ExceptionRecord]) {
        let blocks = report_blocks(records);
        for (i, chunk) in blocks.chunks(MAX_APPEND_BLOCKS).enumerate() {
            if let Err(e) = self.store.append_blocks(report_id, chunk).await {
                warn!(
                    error = %e,
                    chunk = i,
                    "Could not append to exception report document"
                );
                return;
            }
        }
        info!(blocks = blocks.len(), document_id = report_id, "Exception report published");
    }

    /// Removes every ledger file from `state_dir`.
    pub fn clear(state_dir: &Path) -> Result<()> {
        for name in [
            JOURNAL_FILE,
            "exceptions.md",
            "exceptions.csv",
            "dry-run-exceptions.md",
            "dry-run-exceptions.csv",
        ] {
            let path = state_dir.join(name);
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove: {:?}", path))?;
            }
        }
        Ok(())
    }
}

fn open_journal(state_dir: &Path) -> Result<BufWriter<File>> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create directory: {:?}", state_dir))?;
    let path = state_dir.join(JOURNAL_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open journal: {:?}", path))?;
    Ok(BufWriter::new(file))
}

fn append_line<T: Serialize>(writer: &mut BufWriter<File>, line: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, line).context("Failed to serialize journal line")?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Reads a journal, skipping lines torn by an interrupted write.
///
/// Only the records a document received after its last `Begin` line are kept.
fn load_journal(path: &Path) -> Result<Vec<ExceptionRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("Failed to open: {:?}", path))?;
    let mut records = Vec::new();
    let mut last_begin: FxHashMap<String, usize> = FxHashMap::default();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read: {:?}", path))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(JournalLine::Begin { begin }) => {
                last_begin.insert(begin, n);
            }
            Ok(JournalLine::Record(record)) => records.push((n, record)),
            Err(e) => warn!(line = n + 1, error = %e, "Skipping unreadable journal line"),
        }
    }

    let total = records.len();
    let records: Vec<ExceptionRecord> = records
        .into_iter()
        .filter(|(n, record)| {
            last_begin
                .get(&record.document_id)
                .map_or(true, |begin| n > begin)
        })
        .map(|(_, record)| record)
        .collect();
    if records.len() < total {
        debug!(
            superseded = total - records.len(),
            "Dropped journal records superseded by a later run"
        );
    }
    Ok(records)
}

fn compact_journal(path: &Path, records: &[ExceptionRecord]) -> Result<()> {
    let mut body = Vec::new();
    for record in records {
        serde_json::to_writer(&mut body, record).context("Failed to serialize exception")?;
        body.push(b'\n');
    }
    let tmp_path = path.with_extension("jsonl.tmp");
    fs::write(&tmp_path, &body).with_context(|| format!("Failed to write: {:?}", tmp_path))?;
    fs::rename(&tmp_path, path).with_context(|| format!("Failed to replace: {:?}", path))?;
    Ok(())
}

/// Consecutive runs of records sharing a document; input must be grouped already.
fn by_document(records: &[ExceptionRecord]) -> Vec<&[ExceptionRecord]> {
    records
        .chunk_by(|a, b| a.document_id == b.document_id)
        .collect()
}

pub fn render_markdown(records: &[ExceptionRecord]) -> String {
    let groups = by_document(records);
    let mut out = format!("# {REPORT_TITLE}\n\n");
    let _ = writeln!(
        out,
        "{} exception(s) across {} document(s).",
        records.len(),
        groups.len()
    );

    for group in groups {
        let first = &group[0];
        let title = if first.document_title.is_empty() {
            "(untitled)"
        } else {
            first.document_title.as_str()
        };
        let _ = write!(out, "\n## {} (`{}`)\n\n", title, first.document_id);
        for record in group {
            let _ = writeln!(out, "- {}", record.describe());
        }
    }
    out
}

fn write_csv(path: &Path, records: &[ExceptionRecord]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("Failed to create: {:?}", path))?;
    writer.write_record([
        "document_id",
        "document_title",
        "block_id",
        "reason",
        "label",
        "target",
        "candidates",
        "suggestion",
        "message",
    ])?;
    for record in records {
        let candidates = match &record.reason {
            Reason::Ambiguous { candidates } => candidates
                .iter()
                .map(|c| c.document_id.as_str())
                .collect::<Vec<_>>()
                .join(";"),
            _ => String::new(),
        };
        let message = match &record.reason {
            Reason::ScanFailed { message }
            | Reason::RewriteFailed { message }
            | Reason::ProgressFailed { message } => message.as_str(),
            _ => "",
        };
        writer.write_record([
            record.document_id.as_str(),
            record.document_title.as_str(),
            record
                .reference
                .as_ref()
                .map(|r| r.block_id.as_str())
                .unwrap_or(""),
            record.reason.as_str(),
            record.label(),
            record.target(),
            candidates.as_str(),
            record.suggestion.as_deref().unwrap_or(""),
            message,
        ])?;
    }
    writer.flush().context("Failed to flush exception csv")?;
    Ok(())
}

fn truncated(text: &str) -> String {
    text.chars().take(MAX_RICH_TEXT_LENGTH).collect()
}

fn report_blocks(records: &[ExceptionRecord]) -> Vec<Block> {
    let plain = |text: &str| vec![RichText::text(truncated(text), Annotations::default())];
    let mut blocks = vec![Block::paragraph(
        "",
        plain(&format!("{} exception(s) recorded.", records.len())),
    )];
    for group in by_document(records) {
        let first = &group[0];
        blocks.push(Block::new(
            "",
            BlockContent::Heading2(TextBlock::new(plain(&format!(
                "{} ({})",
                first.document_title, first.document_id
            )))),
        ));
        for record in group {
            blocks.push(Block::new(
                "",
                BlockContent::BulletedListItem(TextBlock::new(plain(&record.describe()))),
            ));
        }
    }
    blocks
}
