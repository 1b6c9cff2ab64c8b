use crate::config::API_PAGE_SIZE;
use crate::error::StoreError;
use crate::models::{Block, DocumentSummary, RichText};
use crate::progress::write_atomic;
use crate::store::{DocumentStore, Page};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub documents: Vec<SnapshotDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl Snapshot {
    /// Writes the snapshot atomically via rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, self)
            .with_context(|| format!("Failed to save snapshot: {}", path.display()))?;
        debug!(path = %path.display(), "Snapshot saved");
        Ok(())
    }
}

impl SnapshotDocument {
    pub fn new(id: impl Into<String>, title: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            parent_id: None,
            blocks,
        }
    }
}

/// A workspace held in memory, loaded from and saved to a JSON snapshot.
///
/// Behaves like the remote store: listings are paginated and children are returned one level
/// at a time, so the pipeline runs unchanged against it.
///
/// A store opened with [`MemoryStore::load`] writes every mutation back to its file before the
/// call returns, so a block update is on disk before the document is marked done.
pub struct MemoryStore {
    name: String,
    path: Option<PathBuf>,
    state: RwLock<Snapshot>,
    page_size: usize,
    update_calls: AtomicUsize,
    failing_blocks: Mutex<FxHashSet<String>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>, snapshot: Snapshot) -> Self {
        Self {
            name: name.into(),
            path: None,
            state: RwLock::new(snapshot),
            page_size: API_PAGE_SIZE,
            update_calls: AtomicUsize::new(0),
            failing_blocks: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open snapshot: {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;
        info!(
            documents = snapshot.documents.len(),
            path = %path.display(),
            "Snapshot loaded"
        );
        let name = fs::canonicalize(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .display()
            .to_string();
        let mut store = Self::new(name, snapshot);
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    /// Writes `state` back to the file the store was loaded from, if any.
    ///
    /// Called with the write lock held so concurrent mutations reach the file in order.
    fn write_through(&self, state: &Snapshot) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        state.save(path).map_err(|e| StoreError::Api {
            status: 500,
            message: format!("failed to write snapshot {}: {e:#}", path.display()),
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn snapshot(&self) -> Snapshot {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of update calls issued so far, failed ones included
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::Relaxed)
    }

    /// Makes every later update of `block_id` fail with a server error.
    pub fn fail_updates_for(&self, block_id: &str) {
        if let Ok(mut failing) = self.failing_blocks.lock() {
            failing.insert(block_id.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing_blocks.lock() {
            failing.clear();
        }
    }

    pub fn document_blocks(&self, id: &str) -> Option<Vec<Block>> {
        self.snapshot()
            .documents
            .into_iter()
            .find(|d| d.id == id)
            .map(|d| d.blocks)
    }

    fn paginate<T: Clone>(&self, items: &[T], cursor: Option<&str>) -> Result<Page<T>, StoreError> {
        let start = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| StoreError::Decode(format!("invalid cursor: {c}")))?,
            None => 0,
        };
        let start = start.min(items.len());
        let end = (start + self.page_size).min(items.len());
        Ok(Page {
            items: items[start..end].to_vec(),
            next_cursor: (end < items.len()).then(|| end.to_string()),
        })
    }
}

fn lock_poisoned() -> StoreError {
    StoreError::Network("snapshot state lock poisoned".to_string())
}

fn find_block<'a>(blocks: &'a [Block], id: &str) -> Option<&'a Block> {
    for block in blocks {
        if block.id == id {
            return Some(block);
        }
        if let Some(found) = find_block(&block.children, id) {
            return Some(found);
        }
    }
    None
}

fn find_block_mut<'a>(blocks: &'a mut [Block], id: &str) -> Option<&'a mut Block> {
    for block in blocks {
        if block.id == id {
            return Some(block);
        }
        if let Some(found) = find_block_mut(&mut block.children, id) {
            return Some(found);
        }
    }
    None
}

/// Children as the remote API returns them: one level, grandchildren only flagged.
fn shallow(blocks: &[Block]) -> Vec<Block> {
    blocks
        .iter()
        .map(|b| Block {
            id: b.id.clone(),
            has_children: b.has_children || !b.children.is_empty(),
            content: b.content.clone(),
            children: Vec::new(),
        })
        .collect()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn source_key(&self) -> String {
        format!("snapshot:{}", self.name)
    }

    async fn verify_access(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn search_documents(
        &self,
        cursor: Option<&str>,
    ) -> Result<Page<DocumentSummary>, StoreError> {
        let state = self.state.read().map_err(|_| lock_poisoned())?;
        let summaries: Vec<DocumentSummary> = state
            .documents
            .iter()
            .map(|d| DocumentSummary {
                id: d.id.clone(),
                title: d.title.clone(),
            })
            .collect();
        self.paginate(&summaries, cursor)
    }

    async fn document(&self, id: &str) -> Result<DocumentSummary, StoreError> {
        let state = self.state.read().map_err(|_| lock_poisoned())?;
        state
            .documents
            .iter()
            .find(|d| d.id == id)
            .map(|d| DocumentSummary {
                id: d.id.clone(),
                title: d.title.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(format!("document {id}")))
    }

    async fn list_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<Block>, StoreError> {
        let state = self.state.read().map_err(|_| lock_poisoned())?;
        let children = if let Some(doc) = state.documents.iter().find(|d| d.id == block_id) {
            shallow(&doc.blocks)
        } else {
            let block = state
                .documents
                .iter()
                .find_map(|d| find_block(&d.blocks, block_id))
                .ok_or_else(|| StoreError::NotFound(format!("block {block_id}")))?;
            shallow(&block.children)
        };
        self.paginate(&children, cursor)
    }

    async fn update_rich_text(
        &self,
        block_id: &str,
        kind: &str,
        runs: &[RichText],
    ) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::Relaxed);

        let failing = self
            .failing_blocks
            .lock()
            .map(|f| f.contains(block_id))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Api {
                status: 500,
                message: format!("injected failure for block {block_id}"),
            });
        }

        let mut state = self.state.write().map_err(|_| lock_poisoned())?;
        let block = state
            .documents
            .iter_mut()
            .find_map(|d| find_block_mut(&mut d.blocks, block_id))
            .ok_or_else(|| StoreError::NotFound(format!("block {block_id}")))?;

        if block.kind() != kind {
            return Err(StoreError::Api {
                status: 400,
                message: format!("block {block_id} is a {}, not a {kind}", block.kind()),
            });
        }
        let previous = block.content.rich_text().map(<[RichText]>::to_vec);
        if !block.content.set_rich_text(runs.to_vec()) {
            return Err(StoreError::Api {
                status: 400,
                message: format!("block {block_id} has no rich text"),
            });
        }

        if let Err(err) = self.write_through(&state) {
            let restored = state
                .documents
                .iter_mut()
                .find_map(|d| find_block_mut(&mut d.blocks, block_id));
            if let (Some(block), Some(previous)) = (restored, previous) {
                block.content.set_rich_text(previous);
            }
            return Err(err);
        }

        debug!(block_id = block_id, runs = runs.len(), "Snapshot block updated");
        Ok(())
    }

    async fn create_document(&self, parent_id: &str, title: &str) -> Result<String, StoreError> {
        let mut state = self.state.write().map_err(|_| lock_poisoned())?;
        let taken: FxHashSet<&str> = state.documents.iter().map(|d| d.id.as_str()).collect();
        let id = (state.documents.len() + 1..)
            .map(|n| format!("doc-{n}"))
            .find(|candidate| !taken.contains(candidate.as_str()))
            .ok_or_else(|| StoreError::Api {
                status: 500,
                message: "no free document id".to_string(),
            })?;
        state.documents.push(SnapshotDocument {
            id: id.clone(),
            title: title.to_string(),
            parent_id: Some(parent_id.to_string()),
            blocks: Vec::new(),
        });
        if let Err(err) = self.write_through(&state) {
            state.documents.pop();
            return Err(err);
        }
        Ok(id)
    }

    async fn append_blocks(&self, parent_id: &str, blocks: &[Block]) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| lock_poisoned())?;
        let rollback = state.clone();
        if let Some(doc) = state.documents.iter_mut().find(|d| d.id == parent_id) {
            doc.blocks.extend_from_slice(blocks);
        } else {
            let block = state
                .documents
                .iter_mut()
                .find_map(|d| find_block_mut(&mut d.blocks, parent_id))
                .ok_or_else(|| StoreError::NotFound(format!("block {parent_id}")))?;
            block.children.extend_from_slice(blocks);
            block.has_children = true;
        }
        if let Err(err) = self.write_through(&state) {
            *state = rollback;
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Annotations;
    use crate::store::{fetch_block_tree, list_all_children};
    use tempfile::TempDir;

    fn text(s: &str) -> RichText {
        RichText::text(s, Annotations::default())
    }

    fn sample() -> Snapshot {
        let nested = Block::paragraph("outer", vec![text("outer")])
            .with_children(vec![Block::paragraph("inner", vec![text("inner")])]);
        Snapshot {
            documents: vec![
                SnapshotDocument::new(
                    "d1",
                    "First",
                    vec![
                        Block::paragraph("a", vec![text("one")]),
                        Block::paragraph("b", vec![text("two")]),
                        Block::paragraph("c", vec![text("three")]),
                        nested,
                    ],
                ),
                SnapshotDocument::new("d2", "Second", vec![]),
            ],
        }
    }

    #[tokio::test]
    async fn search_paginates() {
        let store = MemoryStore::new("t", sample()).with_page_size(1);
        let first = store.search_documents(None).await.unwrap();
        assert_eq!(first.items.len(), 1);
        assert_eq!(first.items[0].title, "First");
        let second = store
            .search_documents(first.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(second.items[0].title, "Second");
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn children_follow_pagination() {
        let store = MemoryStore::new("t", sample()).with_page_size(2);
        let blocks = list_all_children(&store, "d1").await.unwrap();
        assert_eq!(blocks.len(), 4);
        assert!(blocks[3].children.is_empty());
        assert!(blocks[3].has_children);
    }

    #[tokio::test]
    async fn block_tree_includes_nested_children() {
        let store = MemoryStore::new("t", sample()).with_page_size(2);
        let tree = fetch_block_tree(&store, "d1").await.unwrap();
        assert_eq!(tree[3].children.len(), 1);
        assert_eq!(tree[3].children[0].id, "inner");
    }

    #[tokio::test]
    async fn unknown_block_is_not_found() {
        let store = MemoryStore::new("t", sample());
        let err = store.list_children("missing", None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_replaces_nested_rich_text() {
        let store = MemoryStore::new("t", sample());
        store
            .update_rich_text("inner", "paragraph", &[text("changed")])
            .await
            .unwrap();
        let blocks = store.document_blocks("d1").unwrap();
        let inner = &blocks[3].children[0];
        assert_eq!(inner.content.rich_text().unwrap()[0].plain_text(), "changed");
        assert_eq!(store.update_calls(), 1);
    }

    #[tokio::test]
    async fn injected_failure_is_reported_and_counted() {
        let store = MemoryStore::new("t", sample());
        store.fail_updates_for("a");
        let err = store
            .update_rich_text("a", "paragraph", &[text("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Api { status: 500, .. }));
        assert_eq!(store.update_calls(), 1);

        store.clear_failures();
        assert!(store
            .update_rich_text("a", "paragraph", &[text("x")])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn update_rejects_kind_mismatch() {
        let store = MemoryStore::new("t", sample());
        let err = store
            .update_rich_text("a", "heading_1", &[text("x")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Api { status: 400, .. }));
    }

    #[tokio::test]
    async fn create_and_append_report_document() {
        let store = MemoryStore::new("t", sample());
        let id = store.create_document("d1", "Report").await.unwrap();
        store
            .append_blocks(&id, &[Block::paragraph("", vec![text("line")])])
            .await
            .unwrap();
        let summary = store.document(&id).await.unwrap();
        assert_eq!(summary.title, "Report");
        assert_eq!(store.document_blocks(&id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn created_document_ids_skip_existing_ones() {
        let mut snapshot = sample();
        snapshot
            .documents
            .push(SnapshotDocument::new("doc-3", "Taken", vec![]));
        let store = MemoryStore::new("t", snapshot);

        let id = store.create_document("d1", "Report").await.unwrap();
        assert_ne!(id, "doc-3");
        let snapshot = store.snapshot();
        assert_eq!(snapshot.documents.iter().filter(|d| d.id == id).count(), 1);
        assert_eq!(
            store.document("doc-3").await.unwrap().title,
            "Taken",
            "existing document must stay addressable"
        );
    }

    #[tokio::test]
    async fn loaded_store_writes_updates_through_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workspace.json");
        sample().save(&path).unwrap();

        let store = MemoryStore::load(&path).unwrap();
        store
            .update_rich_text("b", "paragraph", &[text("rewritten")])
            .await
            .unwrap();
        let report = store.create_document("d1", "Report").await.unwrap();
        store
            .append_blocks(&report, &[Block::paragraph("", vec![text("line")])])
            .await
            .unwrap();

        let reloaded = MemoryStore::load(&path).unwrap();
        let blocks = reloaded.document_blocks("d1").unwrap();
        assert_eq!(blocks[1].content.rich_text().unwrap()[0].plain_text(), "rewritten");
        assert_eq!(reloaded.document_blocks(&report).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_write_through_leaves_block_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workspace.json");
        sample().save(&path).unwrap();
        let store = MemoryStore::load(&path).unwrap();

        // The temp file cannot be created while a directory holds its name.
        fs::create_dir(path.with_extension("json.tmp")).unwrap();
        let err = store
            .update_rich_text("b", "paragraph", &[text("lost")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Api { status: 500, .. }));

        let blocks = store.document_blocks("d1").unwrap();
        assert_eq!(blocks[1].content.rich_text().unwrap()[0].plain_text(), "two");
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("workspace.json");
        sample().save(&path).unwrap();

        let loaded = MemoryStore::load(&path).unwrap();
        let snapshot = loaded.snapshot();
        assert_eq!(snapshot.documents.len(), 2);
        assert_eq!(snapshot.documents[0].blocks[3].children[0].id, "inner");
        assert!(loaded.source_key().starts_with("snapshot:"));
    }
}
