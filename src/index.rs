use crate::error::IndexBuildError;
use crate::models::DocumentSummary;
use crate::store::DocumentStore;
use indicatif::ProgressBar;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Index key for a title: whitespace runs (NBSP included) collapsed, trimmed, lowercased.
pub fn normalize(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub document_id: String,
    pub raw_title: String,
}

/// All documents sharing one normalized title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleIndexEntry {
    pub normalized_title: String,
    pub documents: Vec<IndexedDocument>,
}

/// Read-only mapping from normalized titles to candidate documents.
///
/// Built once per run and shared by every worker. Documents with a blank title are kept in
/// the document list (they can still hold references) but are never match candidates.
pub struct TitleIndex {
    by_title: FxHashMap<String, Vec<IndexedDocument>>,
    documents: Vec<DocumentSummary>,
    blank_titles: usize,
}

impl TitleIndex {
    pub fn from_documents(docs: impl IntoIterator<Item = DocumentSummary>) -> Self {
        let mut by_title: FxHashMap<String, Vec<IndexedDocument>> = FxHashMap::default();
        let mut documents = Vec::new();
        let mut seen = FxHashSet::default();
        let mut blank_titles = 0;

        for doc in docs {
            if !seen.insert(doc.id.clone()) {
                debug!(document_id = %doc.id, "Duplicate search result skipped");
                continue;
            }
            let key = normalize(&doc.title);
            if key.is_empty() {
                blank_titles += 1;
            } else {
                by_title.entry(key).or_default().push(IndexedDocument {
                    document_id: doc.id.clone(),
                    raw_title: doc.title.clone(),
                });
            }
            documents.push(doc);
        }

        Self {
            by_title,
            documents,
            blank_titles,
        }
    }

    /// Rebuilds an index from its flat form; `untitled` are the ids of blank-titled documents.
    pub fn from_entries(entries: Vec<TitleIndexEntry>, untitled: Vec<String>) -> Self {
        let docs = entries
            .into_iter()
            .flat_map(|e| e.documents)
            .map(|d| DocumentSummary {
                id: d.document_id,
                title: d.raw_title,
            })
            .chain(untitled.into_iter().map(|id| DocumentSummary {
                id,
                title: String::new(),
            }));
        Self::from_documents(docs)
    }

    /// Pages through the store's title search until exhausted.
    pub async fn build(store: &dyn DocumentStore) -> Result<Self, IndexBuildError> {
        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message("Indexing document titles...");

        let mut docs = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = match store.search_documents(cursor.as_deref()).await {
                Ok(page) => page,
                Err(source) => {
                    pb.finish_and_clear();
                    return Err(IndexBuildError::Search {
                        fetched: docs.len(),
                        source,
                    });
                }
            };
            docs.extend(page.items);
            pb.set_message(format!("Indexing document titles... {}", docs.len()));

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        pb.finish_and_clear();

        let index = Self::from_documents(docs);
        if index.blank_titles > 0 {
            warn!(count = index.blank_titles, "Documents with blank titles are not indexed");
        }
        info!(
            documents = index.documents.len(),
            titles = index.by_title.len(),
            collisions = index.collisions().len(),
            "Title index built"
        );

        Ok(index)
    }

    /// Documents whose normalized title equals `normalized_title`.
    pub fn candidates(&self, normalized_title: &str) -> &[IndexedDocument] {
        self.by_title
            .get(normalized_title)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[IndexedDocument])> {
        self.by_title
            .iter()
            .map(|(title, docs)| (title.as_str(), docs.as_slice()))
    }

    /// Every document seen by the search, in discovery order.
    pub fn documents(&self) -> &[DocumentSummary] {
        &self.documents
    }

    /// Flat serializable form, sorted by normalized title.
    pub fn entries(&self) -> Vec<TitleIndexEntry> {
        let mut entries: Vec<TitleIndexEntry> = self
            .by_title
            .iter()
            .map(|(title, docs)| TitleIndexEntry {
                normalized_title: title.clone(),
                documents: docs.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.normalized_title.cmp(&b.normalized_title));
        entries
    }

    pub fn untitled(&self) -> Vec<String> {
        self.documents
            .iter()
            .filter(|d| normalize(&d.title).is_empty())
            .map(|d| d.id.clone())
            .collect()
    }

    /// Normalized titles shared by two or more documents.
    pub fn collisions(&self) -> Vec<TitleIndexEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.documents.len() > 1)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn title_count(&self) -> usize {
        self.by_title.len()
    }

    pub fn blank_titles(&self) -> usize {
        self.blank_titles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{MemoryStore, Snapshot, SnapshotDocument};

    fn doc(id: &str, title: &str) -> DocumentSummary {
        DocumentSummary {
            id: id.to_string(),
            title: title.to_string(),
        }
    }

    fn make_index(docs: Vec<(&str, &str)>) -> TitleIndex {
        TitleIndex::from_documents(docs.into_iter().map(|(id, t)| doc(id, t)))
    }

    #[test]
    fn normalize_folds_case_and_whitespace() {
        assert_eq!(normalize("  Packing   List "), "packing list");
        assert_eq!(normalize("Trip\u{a0}Notes"), "trip notes");
        assert_eq!(normalize("ÉTÉ"), "été");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn lookup_by_normalized_title() {
        let index = make_index(vec![("1", "Packing List"), ("2", "Trip Notes")]);
        let found = index.candidates("packing list");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].document_id, "1");
        assert_eq!(found[0].raw_title, "Packing List");
        assert!(index.candidates("Packing List").is_empty());
    }

    #[test]
    fn colliding_titles_share_an_entry() {
        let index = make_index(vec![("1", "Notes"), ("2", "notes"), ("3", "Other")]);
        assert_eq!(index.candidates("notes").len(), 2);
        let collisions = index.collisions();
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].normalized_title, "notes");
    }

    #[test]
    fn blank_titles_are_listed_but_not_indexed() {
        let index = make_index(vec![("1", ""), ("2", "  "), ("3", "Real")]);
        assert_eq!(index.blank_titles(), 2);
        assert_eq!(index.title_count(), 1);
        assert_eq!(index.len(), 3);
        assert_eq!(index.untitled(), vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn duplicate_ids_are_skipped() {
        let index = make_index(vec![("1", "A"), ("1", "A")]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.candidates("a").len(), 1);
    }

    #[test]
    fn entries_rebuild_the_same_index() {
        let index = make_index(vec![("1", "Notes"), ("2", "notes"), ("3", ""), ("4", "B")]);
        let rebuilt = TitleIndex::from_entries(index.entries(), index.untitled());
        assert_eq!(rebuilt.entries(), index.entries());
        assert_eq!(rebuilt.len(), 4);
        assert_eq!(rebuilt.documents().len(), 4);
        assert_eq!(rebuilt.blank_titles(), 1);
    }

    #[tokio::test]
    async fn build_follows_search_pagination() {
        let snapshot = Snapshot {
            documents: (0..5)
                .map(|i| SnapshotDocument::new(format!("d{i}"), format!("Doc {i}"), vec![]))
                .collect(),
        };
        let store = MemoryStore::new("t", snapshot).with_page_size(2);
        let index = TitleIndex::build(&store).await.unwrap();
        assert_eq!(index.len(), 5);
        assert_eq!(index.candidates("doc 4")[0].document_id, "d4");
    }
}
