use crate::error::{ScanError, StoreError};
use crate::models::{Block, DocumentSummary, RichText};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::trace;

/// One page of a paginated listing
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// The destination document store.
///
/// The pipeline needs title search, block-tree retrieval and an atomic multi-run update of one
/// block's rich text. Report publishing additionally creates a document and appends blocks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stable identity of the workspace behind this store, used to key caches
    fn source_key(&self) -> String;

    async fn verify_access(&self) -> Result<(), StoreError>;

    async fn search_documents(
        &self,
        cursor: Option<&str>,
    ) -> Result<Page<DocumentSummary>, StoreError>;

    async fn document(&self, id: &str) -> Result<DocumentSummary, StoreError>;

    async fn list_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<Block>, StoreError>;

    async fn update_rich_text(
        &self,
        block_id: &str,
        kind: &str,
        runs: &[RichText],
    ) -> Result<(), StoreError>;

    /// Returns the new document's id
    async fn create_document(&self, parent_id: &str, title: &str) -> Result<String, StoreError>;

    async fn append_blocks(&self, parent_id: &str, blocks: &[Block]) -> Result<(), StoreError>;
}

/// Fetches every child of `block_id`, following pagination.
pub async fn list_all_children(
    store: &dyn DocumentStore,
    block_id: &str,
) -> Result<Vec<Block>, StoreError> {
    let mut blocks = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = store.list_children(block_id, cursor.as_deref()).await?;
        blocks.extend(page.items);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(blocks)
}

/// Fetches a document's full block tree, descending into nested containers.
///
/// Child documents are left as leaves; each is its own unit of work.
pub fn fetch_block_tree<'a>(
    store: &'a dyn DocumentStore,
    block_id: &'a str,
) -> BoxFuture<'a, Result<Vec<Block>, ScanError>> {
    async move {
        let mut blocks = list_all_children(store, block_id)
            .await
            .map_err(|source| ScanError::Fetch {
                block_id: block_id.to_string(),
                source,
            })?;

        for block in blocks.iter_mut() {
            if block.has_children && !block.content.is_child_document() {
                trace!(block_id = %block.id, "Descending into container");
                block.children = fetch_block_tree(store, &block.id).await?;
            }
        }

        Ok(blocks)
    }
    .boxed()
}
