use crate::models::{Block, Encoding, ReferenceRecord, RichText};
use memchr::memmem::Finder;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;

static SCHEME_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*$").unwrap());

/// RFC 3986 unreserved and reserved characters, parentheses excluded so that a markdown
/// link's closing `)` terminates the address.
const ADDRESS_CHARS: &str = r"[A-Za-z0-9\-._~:/?#\[\]@!$&'*+,;=%]";

/// Validates a URI scheme name given on the command line (without the trailing colon).
pub fn parse_scheme(value: &str) -> Result<String, String> {
    let scheme = value.trim_end_matches(':');
    if SCHEME_NAME.is_match(scheme) {
        Ok(scheme.to_string())
    } else {
        Err(format!("{value:?} is not a valid URI scheme"))
    }
}

/// Finds legacy-scheme references in rich-text runs.
pub struct Extractor {
    prefix: String,
    finder: Finder<'static>,
    markdown: Regex,
    bare_address: Regex,
}

impl Extractor {
    pub fn new(scheme: &str) -> Result<Self, regex::Error> {
        let prefix = format!("{scheme}:");
        let escaped = regex::escape(&prefix);
        let markdown = Regex::new(&format!(
            r"\[([^\]]*)\]\(({escaped}{ADDRESS_CHARS}*)\)"
        ))?;
        let bare_address = Regex::new(&format!(r"^{escaped}{ADDRESS_CHARS}*$"))?;
        let finder = Finder::new(prefix.as_bytes()).into_owned();

        Ok(Self {
            prefix,
            finder,
            markdown,
            bare_address,
        })
    }

    /// Lazily walks `blocks` depth-first, in document order, yielding each reference.
    pub fn references<'a>(
        &'a self,
        document_id: &'a str,
        blocks: &'a [Block],
    ) -> References<'a> {
        References {
            extractor: self,
            document_id,
            stack: vec![blocks.iter()],
            ready: VecDeque::new(),
        }
    }

    /// References held directly by one block, in run order.
    pub fn block_references(&self, document_id: &str, block: &Block) -> Vec<ReferenceRecord> {
        let Some(runs) = block.content.rich_text() else {
            return Vec::new();
        };

        let mut found = Vec::new();
        for (position, run) in runs.iter().enumerate() {
            let RichText::Text { text, .. } = run else {
                continue;
            };
            let content = text.content.as_str();
            let record = |span, raw_target: &str, label: &str, encoding| ReferenceRecord {
                document_id: document_id.to_string(),
                block_id: block.id.clone(),
                block_kind: block.kind().to_string(),
                position_in_block: position,
                span,
                raw_target: raw_target.to_string(),
                display_label: label.to_string(),
                encoding,
            };

            if self.finder.find(content.as_bytes()).is_some() {
                let before = found.len();
                for caps in self.markdown.captures_iter(content) {
                    let (Some(whole), Some(label), Some(target)) =
                        (caps.get(0), caps.get(1), caps.get(2))
                    else {
                        continue;
                    };
                    found.push(record(
                        Some((whole.start(), whole.end())),
                        target.as_str(),
                        label.as_str(),
                        Encoding::Markdown,
                    ));
                }
                if found.len() > before {
                    continue;
                }
            }

            if let Some(url) = run.link_url().filter(|u| u.starts_with(&self.prefix)) {
                found.push(record(None, url, content, Encoding::InlineRichText));
                continue;
            }

            let trimmed = content.trim();
            if self.bare_address.is_match(trimmed) {
                let label = trimmed[self.prefix.len()..].trim_start_matches('/');
                found.push(record(None, trimmed, label, Encoding::InlineRichText));
            }
        }
        found
    }
}

/// Depth-first iterator over a block tree's references.
pub struct References<'a> {
    extractor: &'a Extractor,
    document_id: &'a str,
    stack: Vec<std::slice::Iter<'a, Block>>,
    ready: VecDeque<ReferenceRecord>,
}

impl Iterator for References<'_> {
    type Item = ReferenceRecord;

    fn next(&mut self) -> Option<ReferenceRecord> {
        loop {
            if let Some(record) = self.ready.pop_front() {
                return Some(record);
            }

            let top = self.stack.last_mut()?;
            let Some(block) = top.next() else {
                self.stack.pop();
                continue;
            };

            self.ready
                .extend(self.extractor.block_references(self.document_id, block));
            if !block.children.is_empty() {
                self.stack.push(block.children.iter());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Annotations, BlockContent, Link, TextBlock, TextSpan};
    use serde_json::json;

    fn text(s: &str) -> RichText {
        RichText::text(s, Annotations::default())
    }

    #[test]
    fn scheme_names_are_validated() {
        assert_eq!(parse_scheme("evernote").unwrap(), "evernote");
        assert_eq!(parse_scheme("x-legacy:").unwrap(), "x-legacy");
        assert!(parse_scheme("1note").is_err());
        assert!(parse_scheme("has space").is_err());
        assert!(parse_scheme("").is_err());
    }

    fn linked(s: &str, url: &str) -> RichText {
        RichText::Text {
            text: TextSpan {
                content: s.to_string(),
                link: Some(Link {
                    url: url.to_string(),
                }),
            },
            annotations: Annotations::default(),
            href: Some(url.to_string()),
        }
    }

    fn extractor() -> Extractor {
        Extractor::new("legacy").unwrap()
    }

    fn collect(blocks: &[Block]) -> Vec<ReferenceRecord> {
        let ex = extractor();
        ex.references("doc", blocks).collect()
    }

    #[test]
    fn finds_markdown_link_with_span() {
        let run = "See [Packing List](legacy://guid123) today";
        let refs = collect(&[Block::paragraph("b1", vec![text(run)])]);
        assert_eq!(refs.len(), 1);
        let r = &refs[0];
        assert_eq!(r.display_label, "Packing List");
        assert_eq!(r.raw_target, "legacy://guid123");
        assert_eq!(r.encoding, Encoding::Markdown);
        assert_eq!(r.block_id, "b1");
        assert_eq!(r.block_kind, "paragraph");
        assert_eq!(r.position_in_block, 0);
        let (start, end) = r.span.unwrap();
        assert_eq!(&run[start..end], "[Packing List](legacy://guid123)");
    }

    #[test]
    fn finds_several_markdown_links_in_one_run() {
        let run = "[A](legacy://1) and [B](legacy://2), also [C](legacy://3)";
        let refs = collect(&[Block::paragraph("b", vec![text(run)])]);
        let labels: Vec<_> = refs.iter().map(|r| r.display_label.as_str()).collect();
        assert_eq!(labels, vec!["A", "B", "C"]);
    }

    #[test]
    fn other_schemes_are_ignored() {
        let refs = collect(&[Block::paragraph(
            "b",
            vec![text("[Site](https://example.com) and [N](evernote://x)")],
        )]);
        assert!(refs.is_empty());
    }

    #[test]
    fn hyperlinked_run_is_inline_reference() {
        let refs = collect(&[Block::paragraph(
            "b",
            vec![text("see "), linked("Packing List", "legacy://view/1/s1/abc/")],
        )]);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].encoding, Encoding::InlineRichText);
        assert_eq!(refs[0].display_label, "Packing List");
        assert_eq!(refs[0].raw_target, "legacy://view/1/s1/abc/");
        assert_eq!(refs[0].position_in_block, 1);
        assert!(refs[0].span.is_none());
    }

    #[test]
    fn bare_address_run_drops_scheme_from_label() {
        let refs = collect(&[Block::paragraph("b", vec![text("  legacy://Packing  ")])]);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].display_label, "Packing");
        assert_eq!(refs[0].raw_target, "legacy://Packing");
    }

    #[test]
    fn address_inside_prose_is_not_bare() {
        let refs = collect(&[Block::paragraph("b", vec![text("go to legacy://x now")])]);
        assert!(refs.is_empty());
    }

    #[test]
    fn markdown_takes_precedence_over_run_link() {
        let refs = collect(&[Block::paragraph(
            "b",
            vec![linked("[A](legacy://1)", "legacy://2")],
        )]);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].encoding, Encoding::Markdown);
        assert_eq!(refs[0].raw_target, "legacy://1");
    }

    #[test]
    fn walks_nested_blocks_in_document_order() {
        let blocks = vec![
            Block::paragraph("p1", vec![text("[One](legacy://1)")]).with_children(vec![
                Block::paragraph("p1a", vec![text("[Two](legacy://2)")]),
            ]),
            Block::new(
                "h",
                BlockContent::Heading2(TextBlock::new(vec![text("[Three](legacy://3)")])),
            ),
        ];
        let refs = collect(&blocks);
        let order: Vec<_> = refs.iter().map(|r| r.block_id.as_str()).collect();
        assert_eq!(order, vec!["p1", "p1a", "h"]);
        assert_eq!(refs[2].block_kind, "heading_2");
    }

    #[test]
    fn unsupported_blocks_yield_nothing() {
        let blocks = vec![Block::new(
            "img",
            BlockContent::Unsupported {
                kind: "image".into(),
                body: json!({ "caption": "[A](legacy://1)" }),
            },
        )];
        assert!(collect(&blocks).is_empty());
    }

    #[test]
    fn mentions_are_not_references() {
        let blocks = vec![Block::paragraph(
            "b",
            vec![RichText::page_mention("p", "legacy://1", Annotations::default())],
        )];
        assert!(collect(&blocks).is_empty());
    }

    #[test]
    fn empty_label_is_still_extracted() {
        let refs = collect(&[Block::paragraph("b", vec![text("[](legacy://1)")])]);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].display_label, "");
    }
}
