use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Block types whose body is a rich-text list that may hold references
pub const TEXT_BLOCK_KINDS: &[&str] = &[
    "paragraph",
    "heading_1",
    "heading_2",
    "heading_3",
    "bulleted_list_item",
    "numbered_list_item",
    "to_do",
    "quote",
    "callout",
    "toggle",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub strikethrough: bool,
    #[serde(default)]
    pub underline: bool,
    #[serde(default)]
    pub code: bool,
    #[serde(default = "default_color")]
    pub color: String,
}

fn default_color() -> String {
    "default".to_string()
}

impl Default for Annotations {
    fn default() -> Self {
        Self {
            bold: false,
            italic: false,
            strikethrough: false,
            underline: false,
            code: false,
            color: default_color(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSpan {
    pub content: String,
    #[serde(default)]
    pub link: Option<Link>,
}

/// One run of a block's rich-text list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RichText {
    Text {
        text: TextSpan,
        #[serde(default)]
        annotations: Annotations,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        href: Option<String>,
    },
    Mention {
        mention: Value,
        #[serde(default)]
        annotations: Annotations,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plain_text: Option<String>,
    },
    Equation {
        equation: Value,
        #[serde(default)]
        annotations: Annotations,
    },
}

impl RichText {
    pub fn text(content: impl Into<String>, annotations: Annotations) -> Self {
        RichText::Text {
            text: TextSpan {
                content: content.into(),
                link: None,
            },
            annotations,
            href: None,
        }
    }

    /// Internal reference to another document, rendered by the destination as its title
    pub fn page_mention(page_id: &str, label: &str, annotations: Annotations) -> Self {
        RichText::Mention {
            mention: json!({ "type": "page", "page": { "id": page_id } }),
            annotations,
            plain_text: Some(label.to_string()),
        }
    }

    pub fn plain_text(&self) -> &str {
        match self {
            RichText::Text { text, .. } => &text.content,
            RichText::Mention { plain_text, .. } => plain_text.as_deref().unwrap_or(""),
            RichText::Equation { .. } => "",
        }
    }

    /// Hyperlink target of a text run, from either the link or the resolved href
    pub fn link_url(&self) -> Option<&str> {
        match self {
            RichText::Text { text, href, .. } => text
                .link
                .as_ref()
                .map(|l| l.url.as_str())
                .or(href.as_deref()),
            _ => None,
        }
    }

    pub fn annotations(&self) -> &Annotations {
        match self {
            RichText::Text { annotations, .. }
            | RichText::Mention { annotations, .. }
            | RichText::Equation { annotations, .. } => annotations,
        }
    }

    /// Referenced document id when this run is a page mention
    pub fn mentioned_page(&self) -> Option<&str> {
        match self {
            RichText::Mention { mention, .. } => mention
                .get("page")
                .and_then(|p| p.get("id"))
                .and_then(Value::as_str),
            _ => None,
        }
    }

    /// Wire form accepted by update calls: read-only fields are dropped.
    pub fn to_request_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("href");
            map.remove("plain_text");
        }
        value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub rich_text: Vec<RichText>,
    /// Sibling properties (color, checked, icon...) carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TextBlock {
    pub fn new(rich_text: Vec<RichText>) -> Self {
        Self {
            rich_text,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockContent {
    Paragraph(TextBlock),
    Heading1(TextBlock),
    Heading2(TextBlock),
    Heading3(TextBlock),
    BulletedListItem(TextBlock),
    NumberedListItem(TextBlock),
    ToDo(TextBlock),
    Quote(TextBlock),
    Callout(TextBlock),
    Toggle(TextBlock),
    /// A nested document; processed as its own unit of work, never as part of its parent
    ChildDocument { kind: String, title: String },
    Unsupported { kind: String, body: Value },
}

impl BlockContent {
    pub fn from_wire(kind: &str, body: Value) -> Self {
        if kind == "child_page" || kind == "child_database" {
            let title = body
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return BlockContent::ChildDocument {
                kind: kind.to_string(),
                title,
            };
        }

        if !TEXT_BLOCK_KINDS.contains(&kind) {
            return BlockContent::Unsupported {
                kind: kind.to_string(),
                body,
            };
        }

        let text: TextBlock = match serde_json::from_value(body.clone()) {
            Ok(t) => t,
            Err(_) => {
                return BlockContent::Unsupported {
                    kind: kind.to_string(),
                    body,
                }
            }
        };

        match kind {
            "paragraph" => BlockContent::Paragraph(text),
            "heading_1" => BlockContent::Heading1(text),
            "heading_2" => BlockContent::Heading2(text),
            "heading_3" => BlockContent::Heading3(text),
            "bulleted_list_item" => BlockContent::BulletedListItem(text),
            "numbered_list_item" => BlockContent::NumberedListItem(text),
            "to_do" => BlockContent::ToDo(text),
            "quote" => BlockContent::Quote(text),
            "callout" => BlockContent::Callout(text),
            _ => BlockContent::Toggle(text),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            BlockContent::Paragraph(_) => "paragraph",
            BlockContent::Heading1(_) => "heading_1",
            BlockContent::Heading2(_) => "heading_2",
            BlockContent::Heading3(_) => "heading_3",
            BlockContent::BulletedListItem(_) => "bulleted_list_item",
            BlockContent::NumberedListItem(_) => "numbered_list_item",
            BlockContent::ToDo(_) => "to_do",
            BlockContent::Quote(_) => "quote",
            BlockContent::Callout(_) => "callout",
            BlockContent::Toggle(_) => "toggle",
            BlockContent::ChildDocument { kind, .. } | BlockContent::Unsupported { kind, .. } => {
                kind
            }
        }
    }

    pub fn text_block(&self) -> Option<&TextBlock> {
        match self {
            BlockContent::Paragraph(t)
            | BlockContent::Heading1(t)
            | BlockContent::Heading2(t)
            | BlockContent::Heading3(t)
            | BlockContent::BulletedListItem(t)
            | BlockContent::NumberedListItem(t)
            | BlockContent::ToDo(t)
            | BlockContent::Quote(t)
            | BlockContent::Callout(t)
            | BlockContent::Toggle(t) => Some(t),
            BlockContent::ChildDocument { .. } | BlockContent::Unsupported { .. } => None,
        }
    }

    fn text_block_mut(&mut self) -> Option<&mut TextBlock> {
        match self {
            BlockContent::Paragraph(t)
            | BlockContent::Heading1(t)
            | BlockContent::Heading2(t)
            | BlockContent::Heading3(t)
            | BlockContent::BulletedListItem(t)
            | BlockContent::NumberedListItem(t)
            | BlockContent::ToDo(t)
            | BlockContent::Quote(t)
            | BlockContent::Callout(t)
            | BlockContent::Toggle(t) => Some(t),
            BlockContent::ChildDocument { .. } | BlockContent::Unsupported { .. } => None,
        }
    }

    /// Rich-text runs of a text-bearing block; `None` for every other variant.
    pub fn rich_text(&self) -> Option<&[RichText]> {
        self.text_block().map(|t| t.rich_text.as_slice())
    }

    /// Returns false when the block carries no rich text to replace.
    pub fn set_rich_text(&mut self, runs: Vec<RichText>) -> bool {
        match self.text_block_mut() {
            Some(t) => {
                t.rich_text = runs;
                true
            }
            None => false,
        }
    }

    pub fn is_child_document(&self) -> bool {
        matches!(self, BlockContent::ChildDocument { .. })
    }

    fn to_wire(&self) -> (String, Value) {
        let body = match self {
            BlockContent::ChildDocument { title, .. } => json!({ "title": title }),
            BlockContent::Unsupported { body, .. } => body.clone(),
            other => other
                .text_block()
                .and_then(|t| serde_json::to_value(t).ok())
                .unwrap_or(Value::Null),
        };
        (self.kind().to_string(), body)
    }
}

/// A node of a document's block tree.
///
/// Serialized in the destination's wire shape (`{"id", "type", "<type>": {...}}`) with an
/// optional nested `children` list used by snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireBlock", into = "WireBlock")]
pub struct Block {
    pub id: String,
    pub has_children: bool,
    pub content: BlockContent,
    pub children: Vec<Block>,
}

impl Block {
    pub fn new(id: impl Into<String>, content: BlockContent) -> Self {
        Self {
            id: id.into(),
            has_children: false,
            content,
            children: Vec::new(),
        }
    }

    pub fn paragraph(id: impl Into<String>, runs: Vec<RichText>) -> Self {
        Self::new(id, BlockContent::Paragraph(TextBlock::new(runs)))
    }

    pub fn with_children(mut self, children: Vec<Block>) -> Self {
        self.has_children = !children.is_empty();
        self.children = children;
        self
    }

    pub fn kind(&self) -> &str {
        self.content.kind()
    }
}

#[derive(Serialize, Deserialize)]
struct WireBlock {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    has_children: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<Block>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl From<WireBlock> for Block {
    fn from(mut wire: WireBlock) -> Self {
        let body = wire.rest.remove(&wire.kind).unwrap_or(Value::Null);
        Block {
            content: BlockContent::from_wire(&wire.kind, body),
            has_children: wire.has_children || !wire.children.is_empty(),
            id: wire.id,
            children: wire.children,
        }
    }
}

impl From<Block> for WireBlock {
    fn from(block: Block) -> Self {
        let (kind, body) = block.content.to_wire();
        let mut rest = Map::new();
        rest.insert("object".to_string(), Value::String("block".to_string()));
        rest.insert(kind.clone(), body);
        WireBlock {
            id: block.id,
            kind,
            has_children: block.has_children,
            children: block.children,
            rest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// `[label](scheme:...)` written out as text inside a run
    Markdown,
    /// A run hyperlinked to, or consisting of, a legacy address
    InlineRichText,
}

/// One legacy reference found in a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub document_id: String,
    pub block_id: String,
    pub block_kind: String,
    /// Index of the run inside the block's rich-text list
    pub position_in_block: usize,
    /// Byte range of the markdown link inside the run's text
    pub span: Option<(usize, usize)>,
    pub raw_target: String,
    pub display_label: String,
    pub encoding: Encoding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraph_block_deserializes_from_wire() {
        let raw = json!({
            "object": "block",
            "id": "b1",
            "type": "paragraph",
            "has_children": false,
            "paragraph": {
                "rich_text": [{
                    "type": "text",
                    "text": { "content": "hello", "link": null },
                    "annotations": { "bold": true, "italic": false, "strikethrough": false,
                                     "underline": false, "code": false, "color": "red" },
                    "plain_text": "hello",
                    "href": null
                }],
                "color": "default"
            }
        });
        let block: Block = serde_json::from_value(raw).unwrap();
        assert_eq!(block.id, "b1");
        assert_eq!(block.kind(), "paragraph");
        let runs = block.content.rich_text().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].plain_text(), "hello");
        assert!(runs[0].annotations().bold);
        assert_eq!(runs[0].annotations().color, "red");
    }

    #[test]
    fn unknown_block_kind_is_unsupported() {
        let raw = json!({ "id": "b2", "type": "image", "image": { "type": "external" } });
        let block: Block = serde_json::from_value(raw).unwrap();
        assert!(matches!(block.content, BlockContent::Unsupported { .. }));
        assert!(block.content.rich_text().is_none());
        assert_eq!(block.kind(), "image");
    }

    #[test]
    fn malformed_text_block_degrades_to_unsupported() {
        let raw = json!({ "id": "b3", "type": "paragraph", "paragraph": { "rich_text": 5 } });
        let block: Block = serde_json::from_value(raw).unwrap();
        assert!(matches!(block.content, BlockContent::Unsupported { .. }));
    }

    #[test]
    fn child_page_is_child_document() {
        let raw = json!({ "id": "c1", "type": "child_page", "has_children": true,
                          "child_page": { "title": "Sub" } });
        let block: Block = serde_json::from_value(raw).unwrap();
        assert!(block.content.is_child_document());
        assert!(block.has_children);
    }

    #[test]
    fn block_wire_shape_keeps_extra_properties() {
        let raw = json!({ "id": "t1", "type": "to_do",
                          "to_do": { "rich_text": [], "checked": true, "color": "blue" } });
        let block: Block = serde_json::from_value(raw).unwrap();
        let back = serde_json::to_value(&block).unwrap();
        assert_eq!(back["type"], "to_do");
        assert_eq!(back["to_do"]["checked"], true);
        assert_eq!(back["to_do"]["color"], "blue");
    }

    #[test]
    fn nested_children_survive_snapshot_shape() {
        let block = Block::paragraph("p", vec![RichText::text("x", Annotations::default())])
            .with_children(vec![Block::paragraph("q", vec![])]);
        let value = serde_json::to_value(&block).unwrap();
        let back: Block = serde_json::from_value(value).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn request_value_drops_read_only_fields() {
        let run = RichText::page_mention("abc", "Packing List", Annotations::default());
        let value = run.to_request_value();
        assert!(value.get("plain_text").is_none());
        assert_eq!(value["mention"]["page"]["id"], "abc");
        assert_eq!(value["type"], "mention");
    }

    #[test]
    fn link_url_prefers_text_link() {
        let raw = json!({ "type": "text", "text": { "content": "x", "link": { "url": "a://1" } },
                          "href": "a://2" });
        let run: RichText = serde_json::from_value(raw).unwrap();
        assert_eq!(run.link_url(), Some("a://1"));
    }

    #[test]
    fn mentioned_page_reads_page_id() {
        let run = RichText::page_mention("p-1", "T", Annotations::default());
        assert_eq!(run.mentioned_page(), Some("p-1"));
        assert_eq!(run.plain_text(), "T");
    }
}
