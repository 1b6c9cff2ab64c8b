use crate::config::{MAX_RICH_TEXT_LENGTH, MAX_RUNS_PER_BLOCK};
use crate::error::RewriteError;
use crate::models::{Annotations, Block, Encoding, Link, ReferenceRecord, RichText, TextSpan};
use crate::store::DocumentStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// A reference paired with the document it resolved to
#[derive(Debug, Clone)]
pub struct Resolution {
    pub record: ReferenceRecord,
    pub target_id: String,
}

/// The replacement computed for one block
#[derive(Debug, Clone, Serialize)]
pub struct BlockChange {
    pub block_id: String,
    pub block_kind: String,
    pub references: usize,
    pub runs: Vec<RichText>,
    /// False in dry-run: the change was computed but not written
    pub applied: bool,
}

fn text_piece(content: &str, link: Option<&Link>, annotations: &Annotations) -> RichText {
    RichText::Text {
        text: TextSpan {
            content: content.to_string(),
            link: link.cloned(),
        },
        annotations: annotations.clone(),
        href: None,
    }
}

/// Splits `content` into pieces of at most `max` characters, preferring to cut after whitespace.
fn split_text(content: &str, max: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = content;

    while rest.chars().count() > max {
        let hard = rest
            .char_indices()
            .nth(max)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let cut = rest[..hard]
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(hard);
        pieces.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

/// Merges adjacent text pieces that carry the same formatting and link.
fn consolidate(pieces: Vec<RichText>) -> Vec<RichText> {
    let mut out: Vec<RichText> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if let (
            Some(RichText::Text {
                text: prev,
                annotations: prev_ann,
                ..
            }),
            RichText::Text {
                text, annotations, ..
            },
        ) = (out.last_mut(), &piece)
        {
            if prev_ann == annotations && prev.link == text.link {
                prev.content.push_str(&text.content);
                continue;
            }
        }
        out.push(piece);
    }
    out
}

/// Enforces the per-run length limit on freshly produced text pieces.
fn enforce_length(pieces: Vec<RichText>) -> Vec<RichText> {
    let mut out = Vec::with_capacity(pieces.len());
    for piece in pieces {
        match piece {
            RichText::Text {
                ref text,
                ref annotations,
                ..
            } if text.content.chars().count() > MAX_RICH_TEXT_LENGTH => {
                for part in split_text(&text.content, MAX_RICH_TEXT_LENGTH) {
                    out.push(text_piece(part, text.link.as_ref(), annotations));
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Replacement pieces for one run holding one or more resolved references.
fn rewrite_run(
    block_id: &str,
    run_index: usize,
    run: &RichText,
    resolutions: &[&Resolution],
) -> Result<Vec<RichText>, RewriteError> {
    let RichText::Text {
        text, annotations, ..
    } = run
    else {
        return Err(RewriteError::UnsupportedRun {
            block_id: block_id.to_string(),
            run_index,
        });
    };

    let stale = || RewriteError::StaleRun {
        block_id: block_id.to_string(),
        run_index,
    };

    if let Some(inline) = resolutions
        .iter()
        .find(|r| r.record.encoding == Encoding::InlineRichText)
    {
        return Ok(vec![RichText::page_mention(
            &inline.target_id,
            &inline.record.display_label,
            annotations.clone(),
        )]);
    }

    let content = text.content.as_str();
    let link = text.link.as_ref();
    let mut spans: Vec<(usize, usize, &Resolution)> = resolutions
        .iter()
        .map(|r| r.record.span.map(|(s, e)| (s, e, *r)).ok_or_else(stale))
        .collect::<Result<_, _>>()?;
    spans.sort_by_key(|(start, _, _)| *start);

    let mut pieces = Vec::new();
    let mut cursor = 0;
    for (start, end, resolution) in spans {
        let expected = format!(
            "[{}]({})",
            resolution.record.display_label, resolution.record.raw_target
        );
        if start < cursor || content.get(start..end) != Some(expected.as_str()) {
            return Err(stale());
        }
        if start > cursor {
            pieces.push(text_piece(&content[cursor..start], link, annotations));
        }
        pieces.push(RichText::page_mention(
            &resolution.target_id,
            &resolution.record.display_label,
            annotations.clone(),
        ));
        cursor = end;
    }
    if cursor < content.len() {
        pieces.push(text_piece(&content[cursor..], link, annotations));
    }

    Ok(enforce_length(consolidate(pieces)))
}

/// Computes a block's new rich-text list with every resolved reference turned into a page
/// mention. Runs without a resolution are kept as they are.
pub fn rewrite_runs(
    block_id: &str,
    runs: &[RichText],
    resolutions: &[Resolution],
) -> Result<Vec<RichText>, RewriteError> {
    let mut out = Vec::with_capacity(runs.len() + resolutions.len() * 2);

    for (index, run) in runs.iter().enumerate() {
        let here: Vec<&Resolution> = resolutions
            .iter()
            .filter(|r| r.record.position_in_block == index)
            .collect();
        if here.is_empty() {
            out.push(run.clone());
        } else {
            out.extend(rewrite_run(block_id, index, run, &here)?);
        }
    }

    if let Some(orphan) = resolutions
        .iter()
        .find(|r| r.record.position_in_block >= runs.len())
    {
        return Err(RewriteError::StaleRun {
            block_id: block_id.to_string(),
            run_index: orphan.record.position_in_block,
        });
    }

    if out.len() > MAX_RUNS_PER_BLOCK {
        return Err(RewriteError::TooManyRuns {
            block_id: block_id.to_string(),
            count: out.len(),
            max: MAX_RUNS_PER_BLOCK,
        });
    }

    Ok(out)
}

/// Writes resolved references back to the store, one update call per block.
#[derive(Clone)]
pub struct BlockRewriter {
    store: Arc<dyn DocumentStore>,
    dry_run: bool,
}

impl BlockRewriter {
    pub fn new(store: Arc<dyn DocumentStore>, dry_run: bool) -> Self {
        Self { store, dry_run }
    }

    pub async fn apply(
        &self,
        block: &Block,
        resolutions: &[Resolution],
    ) -> Result<BlockChange, RewriteError> {
        let runs = block
            .content
            .rich_text()
            .ok_or_else(|| RewriteError::UnsupportedRun {
                block_id: block.id.clone(),
                run_index: resolutions
                    .first()
                    .map(|r| r.record.position_in_block)
                    .unwrap_or(0),
            })?;
        let new_runs = rewrite_runs(&block.id, runs, resolutions)?;

        if self.dry_run {
            debug!(
                block_id = %block.id,
                references = resolutions.len(),
                "Dry run: block update skipped"
            );
        } else {
            self.store
                .update_rich_text(&block.id, block.kind(), &new_runs)
                .await
                .map_err(|source| RewriteError::Update {
                    block_id: block.id.clone(),
                    source,
                })?;
            debug!(
                block_id = %block.id,
                references = resolutions.len(),
                runs = new_runs.len(),
                "Block updated"
            );
        }

        Ok(BlockChange {
            block_id: block.id.clone(),
            block_kind: block.kind().to_string(),
            references: resolutions.len(),
            runs: new_runs,
            applied: !self.dry_run,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Extractor;
    use crate::snapshot::{MemoryStore, Snapshot, SnapshotDocument};

    fn bold() -> Annotations {
        Annotations {
            bold: true,
            ..Annotations::default()
        }
    }

    fn resolve_all(block: &Block, target: &str) -> Vec<Resolution> {
        let extractor = Extractor::new("legacy").unwrap();
        extractor
            .block_references("doc", block)
            .into_iter()
            .map(|record| Resolution {
                record,
                target_id: target.to_string(),
            })
            .collect()
    }

    #[test]
    fn markdown_link_becomes_mention_between_text() {
        let block = Block::paragraph(
            "b",
            vec![RichText::text("See [Packing List](legacy://g1) today", bold())],
        );
        let res = resolve_all(&block, "p-1");
        let runs = rewrite_runs("b", block.content.rich_text().unwrap(), &res).unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].plain_text(), "See ");
        assert_eq!(runs[1].mentioned_page(), Some("p-1"));
        assert_eq!(runs[1].plain_text(), "Packing List");
        assert_eq!(runs[2].plain_text(), " today");
        assert!(runs.iter().all(|r| r.annotations().bold));
    }

    #[test]
    fn several_links_in_one_run() {
        let block = Block::paragraph(
            "b",
            vec![RichText::text(
                "[A](legacy://1) and [B](legacy://2)",
                Annotations::default(),
            )],
        );
        let res = resolve_all(&block, "p");
        let runs = rewrite_runs("b", block.content.rich_text().unwrap(), &res).unwrap();
        let kinds: Vec<_> = runs.iter().map(|r| r.mentioned_page().is_some()).collect();
        assert_eq!(kinds, vec![true, false, true]);
        assert_eq!(runs[1].plain_text(), " and ");
    }

    #[test]
    fn unresolved_references_are_left_in_place() {
        let block = Block::paragraph(
            "b",
            vec![RichText::text(
                "[A](legacy://1) and [B](legacy://2)",
                Annotations::default(),
            )],
        );
        let mut res = resolve_all(&block, "p");
        res.truncate(1);
        let runs = rewrite_runs("b", block.content.rich_text().unwrap(), &res).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].plain_text(), " and [B](legacy://2)");
    }

    #[test]
    fn inline_run_is_replaced_whole() {
        let block = Block::paragraph(
            "b",
            vec![
                RichText::text("before ", Annotations::default()),
                RichText::text("legacy://Packing", bold()),
                RichText::text(" after", Annotations::default()),
            ],
        );
        let res = resolve_all(&block, "p-9");
        let runs = rewrite_runs("b", block.content.rich_text().unwrap(), &res).unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[1].mentioned_page(), Some("p-9"));
        assert!(runs[1].annotations().bold);
        assert_eq!(runs[0], block.content.rich_text().unwrap()[0]);
    }

    #[test]
    fn changed_run_is_stale() {
        let original = Block::paragraph(
            "b",
            vec![RichText::text("x [A](legacy://1)", Annotations::default())],
        );
        let res = resolve_all(&original, "p");
        let edited = vec![RichText::text("[A](legacy://1) x", Annotations::default())];
        let err = rewrite_runs("b", &edited, &res).unwrap_err();
        assert!(matches!(err, RewriteError::StaleRun { run_index: 0, .. }));
    }

    #[test]
    fn non_text_run_is_unsupported() {
        let block = Block::paragraph(
            "b",
            vec![RichText::text("[A](legacy://1)", Annotations::default())],
        );
        let res = resolve_all(&block, "p");
        let mention = vec![RichText::page_mention("x", "A", Annotations::default())];
        let err = rewrite_runs("b", &mention, &res).unwrap_err();
        assert!(matches!(err, RewriteError::UnsupportedRun { .. }));
    }

    #[test]
    fn long_text_is_split_on_word_boundaries() {
        let long = "word ".repeat(900);
        let content = format!("{long}[A](legacy://1){long}");
        let block = Block::paragraph("b", vec![RichText::text(content, Annotations::default())]);
        let res = resolve_all(&block, "p");
        let runs = rewrite_runs("b", block.content.rich_text().unwrap(), &res).unwrap();
        for run in &runs {
            assert!(run.plain_text().chars().count() <= MAX_RICH_TEXT_LENGTH);
        }
        let text_runs: Vec<_> = runs.iter().filter(|r| r.mentioned_page().is_none()).collect();
        assert!(text_runs.len() >= 4);
        assert!(text_runs[0].plain_text().ends_with(' '));
    }

    #[test]
    fn split_without_whitespace_is_hard() {
        let s = "a".repeat(25);
        let parts = split_text(&s, 10);
        assert_eq!(parts, vec!["a".repeat(10), "a".repeat(10), "a".repeat(5)]);
    }

    #[test]
    fn too_many_runs_is_rejected() {
        let content = "[A](legacy://1) ".repeat(60);
        let block = Block::paragraph("b", vec![RichText::text(content, Annotations::default())]);
        let res = resolve_all(&block, "p");
        let err = rewrite_runs("b", block.content.rich_text().unwrap(), &res).unwrap_err();
        assert!(matches!(err, RewriteError::TooManyRuns { count: 120, .. }));
    }

    fn store_with(block: Block) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(
            "t",
            Snapshot {
                documents: vec![SnapshotDocument::new("doc", "Doc", vec![block])],
            },
        ))
    }

    #[tokio::test]
    async fn apply_issues_one_update_per_block() {
        let block = Block::paragraph(
            "b",
            vec![RichText::text(
                "[A](legacy://1) [B](legacy://2)",
                Annotations::default(),
            )],
        );
        let store = store_with(block.clone());
        let rewriter = BlockRewriter::new(store.clone(), false);
        let change = rewriter
            .apply(&block, &resolve_all(&block, "p"))
            .await
            .unwrap();
        assert!(change.applied);
        assert_eq!(change.references, 2);
        assert_eq!(store.update_calls(), 1);
        let stored = store.document_blocks("doc").unwrap();
        assert_eq!(stored[0].content.rich_text().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn dry_run_issues_no_update() {
        let block = Block::paragraph(
            "b",
            vec![RichText::text("[A](legacy://1)", Annotations::default())],
        );
        let store = store_with(block.clone());
        let rewriter = BlockRewriter::new(store.clone(), true);
        let change = rewriter
            .apply(&block, &resolve_all(&block, "p"))
            .await
            .unwrap();
        assert!(!change.applied);
        assert_eq!(change.runs.len(), 1);
        assert_eq!(store.update_calls(), 0);
    }

    #[tokio::test]
    async fn failed_update_is_rewrite_error() {
        let block = Block::paragraph(
            "b",
            vec![RichText::text("[A](legacy://1)", Annotations::default())],
        );
        let store = store_with(block.clone());
        store.fail_updates_for("b");
        let rewriter = BlockRewriter::new(store.clone(), false);
        let err = rewriter
            .apply(&block, &resolve_all(&block, "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, RewriteError::Update { .. }));
    }
}
