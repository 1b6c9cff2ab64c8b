use crate::models::DocumentSummary;
use anyhow::{Context, Result};
use rustc_hash::FxHashSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, info, warn};

const SCOPE_FILE: &str = "scope.json";
const PENDING_FILE: &str = "pending.json";
const DONE_FILE: &str = "done.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    NoLinks,
    Resolved,
    Partial,
    Ambiguous,
    Unresolved,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::NoLinks => "no_links",
            PageStatus::Resolved => "resolved",
            PageStatus::Partial => "partial",
            PageStatus::Ambiguous => "ambiguous",
            PageStatus::Unresolved => "unresolved",
        }
    }
}

/// What one completed unit of work found and changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub links_found: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub ambiguous: usize,
    pub links_updated: usize,
    pub blocks_updated: usize,
    pub status: PageStatus,
}

impl DocumentOutcome {
    pub fn new(
        links_found: usize,
        matched: usize,
        unmatched: usize,
        ambiguous: usize,
        links_updated: usize,
        blocks_updated: usize,
    ) -> Self {
        let status = if links_found == 0 {
            PageStatus::NoLinks
        } else if matched == links_found {
            PageStatus::Resolved
        } else if matched > 0 {
            PageStatus::Partial
        } else if ambiguous > 0 {
            PageStatus::Ambiguous
        } else {
            PageStatus::Unresolved
        };
        Self {
            links_found,
            matched,
            unmatched,
            ambiguous,
            links_updated,
            blocks_updated,
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub document_id: String,
    #[serde(default)]
    pub title: String,
}

impl From<&DocumentSummary> for ProgressEntry {
    fn from(doc: &DocumentSummary) -> Self {
        Self {
            document_id: doc.id.clone(),
            title: doc.title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneEntry {
    pub document_id: String,
    #[serde(default)]
    pub title: String,
    pub outcome: DocumentOutcome,
    /// Seconds since the Unix epoch
    #[serde(default)]
    pub completed_at: u64,
}

#[derive(Default)]
struct ProgressState {
    scope: Vec<ProgressEntry>,
    pending: Vec<ProgressEntry>,
    done: Vec<DoneEntry>,
}

impl ProgressState {
    fn done_ids(&self) -> FxHashSet<&str> {
        self.done.iter().map(|d| d.document_id.as_str()).collect()
    }

    /// Repairs a crash between two file writes: done wins over pending, scope covers both.
    fn reconcile(&mut self) -> bool {
        let done: FxHashSet<String> = self.done.iter().map(|d| d.document_id.clone()).collect();
        let before = (self.scope.len(), self.pending.len());

        self.pending.retain(|p| !done.contains(&p.document_id));

        let in_scope: FxHashSet<String> =
            self.scope.iter().map(|s| s.document_id.clone()).collect();
        let missing: Vec<ProgressEntry> = self
            .pending
            .iter()
            .cloned()
            .chain(self.done.iter().map(|d| ProgressEntry {
                document_id: d.document_id.clone(),
                title: d.title.clone(),
            }))
            .filter(|e| !in_scope.contains(&e.document_id))
            .collect();
        self.scope.extend(missing);

        before != (self.scope.len(), self.pending.len())
    }
}

/// Counts shown by the `status` command
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressCounts {
    pub scope: usize,
    pub pending: usize,
    pub done: usize,
    pub by_status: BTreeMap<PageStatus, usize>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let file = File::open(path).with_context(|| format!("Failed to open: {:?}", path))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse progress file: {:?}", path))
}

/// Writes `value` to a temp file, syncs it, then renames it over `path`.
pub(crate) fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", tmp_path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("Failed to serialize: {:?}", path))?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("Failed to flush: {:?}", tmp_path))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync: {:?}", tmp_path))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename temp file to: {:?}", path))?;
    Ok(())
}

/// File-backed scope, pending and done sets.
///
/// Every mutation is on disk before it returns. A document only ever leaves `pending` through
/// [`ProgressStore::mark_done`], which writes `done.json` before `pending.json` so an
/// interrupted write is repaired on the next load instead of losing an outcome.
pub struct ProgressStore {
    dir: PathBuf,
    read_only: bool,
    state: Mutex<ProgressState>,
}

impl ProgressStore {
    /// Loads the store from `dir`; a missing store starts empty. With `read_only` every
    /// mutation stays in memory.
    pub fn open(dir: &Path, read_only: bool) -> Result<Self> {
        let mut state = ProgressState {
            scope: read_json(&dir.join(SCOPE_FILE))?,
            pending: read_json(&dir.join(PENDING_FILE))?,
            done: read_json(&dir.join(DONE_FILE))?,
        };

        if state.reconcile() {
            warn!("Progress files were out of step and have been reconciled");
        }

        info!(
            scope = state.scope.len(),
            pending = state.pending.len(),
            done = state.done.len(),
            "Progress store loaded"
        );

        let store = Self {
            dir: dir.to_path_buf(),
            read_only,
            state: Mutex::new(state),
        };
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ProgressState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("Progress store lock poisoned"))
    }

    fn persist<T: Serialize + ?Sized>(&self, file: &str, value: &T) -> Result<()> {
        if self.read_only {
            debug!(file = file, "Read-only progress store, write skipped");
            return Ok(());
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory: {:?}", self.dir))?;
        write_atomic(&self.dir.join(file), value)
    }

    pub fn has_scope(&self) -> Result<bool> {
        Ok(!self.lock()?.scope.is_empty())
    }

    /// Selects `docs` for the run: pending becomes `docs` minus done, scope `docs` plus done.
    pub fn mark_scope(&self, docs: &[DocumentSummary]) -> Result<()> {
        let mut state = self.lock()?;

        let (scope, pending) = {
            let done = state.done_ids();
            let mut seen = FxHashSet::default();
            let requested: Vec<ProgressEntry> = docs
                .iter()
                .filter(|d| seen.insert(d.id.as_str()))
                .map(ProgressEntry::from)
                .collect();
            let pending: Vec<ProgressEntry> = requested
                .iter()
                .filter(|e| !done.contains(e.document_id.as_str()))
                .cloned()
                .collect();
            let mut scope = requested;
            scope.extend(
                state
                    .done
                    .iter()
                    .filter(|d| !seen.contains(d.document_id.as_str()))
                    .map(|d| ProgressEntry {
                        document_id: d.document_id.clone(),
                        title: d.title.clone(),
                    }),
            );
            (scope, pending)
        };

        state.scope = scope;
        state.pending = pending;
        self.persist(SCOPE_FILE, &state.scope)?;
        self.persist(PENDING_FILE, &state.pending)?;

        info!(
            scope = state.scope.len(),
            pending = state.pending.len(),
            done = state.done.len(),
            "Run scope recorded"
        );
        Ok(())
    }

    /// Moves a document to done with its outcome.
    pub fn mark_done(&self, doc: &DocumentSummary, outcome: DocumentOutcome) -> Result<()> {
        let mut state = self.lock()?;

        state.done.retain(|d| d.document_id != doc.id);
        state.done.push(DoneEntry {
            document_id: doc.id.clone(),
            title: doc.title.clone(),
            outcome,
            completed_at: now_secs(),
        });
        state.pending.retain(|p| p.document_id != doc.id);
        let new_in_scope = !state.scope.iter().any(|s| s.document_id == doc.id);
        if new_in_scope {
            state.scope.push(ProgressEntry::from(doc));
        }

        self.persist(DONE_FILE, &state.done)?;
        self.persist(PENDING_FILE, &state.pending)?;
        if new_in_scope {
            self.persist(SCOPE_FILE, &state.scope)?;
        }

        debug!(document_id = %doc.id, "Document marked done");
        Ok(())
    }

    /// Puts a document back to pending so that it is processed again.
    pub fn reopen(&self, doc: &DocumentSummary) -> Result<()> {
        let mut state = self.lock()?;

        let was_done = state.done.iter().any(|d| d.document_id == doc.id);
        state.done.retain(|d| d.document_id != doc.id);
        if !state.pending.iter().any(|p| p.document_id == doc.id) {
            state.pending.push(ProgressEntry::from(doc));
        }
        if !state.scope.iter().any(|s| s.document_id == doc.id) {
            state.scope.push(ProgressEntry::from(doc));
        }

        self.persist(SCOPE_FILE, &state.scope)?;
        self.persist(PENDING_FILE, &state.pending)?;
        if was_done {
            self.persist(DONE_FILE, &state.done)?;
        }
        Ok(())
    }

    pub fn current_pending(&self) -> Result<Vec<ProgressEntry>> {
        Ok(self.lock()?.pending.clone())
    }

    pub fn current_done(&self) -> Result<Vec<DoneEntry>> {
        Ok(self.lock()?.done.clone())
    }

    pub fn counts(&self) -> Result<ProgressCounts> {
        let state = self.lock()?;
        let mut by_status = BTreeMap::new();
        for entry in &state.done {
            *by_status.entry(entry.outcome.status).or_insert(0) += 1;
        }
        Ok(ProgressCounts {
            scope: state.scope.len(),
            pending: state.pending.len(),
            done: state.done.len(),
            by_status,
        })
    }

    /// Forgets all progress, removing the files from disk.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock()?;
        *state = ProgressState::default();
        if self.read_only {
            return Ok(());
        }
        for name in [SCOPE_FILE, PENDING_FILE, DONE_FILE] {
            let path = self.dir.join(name);
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove progress file: {:?}", path))?;
            }
        }
        info!("Progress store cleared");
        Ok(())
    }
}
