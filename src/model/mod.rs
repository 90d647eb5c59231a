//! Block model: typed, uniquely identified, hash-addressed spans over a text
//! buffer, plus the container that bundles them with styles, manifest and
//! assets.
//!
//! Blocks are kept in one flat vector in document order. A list block is
//! immediately followed by its items; the list's `children` name them and
//! each item id is hierarchical under the list id (`block-4` -> `block-4.1`).

use crate::error::VersionError;
use crate::hash::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

pub mod style;

pub use style::{
    Alignment, DocumentDefaults, ImageDimensions, ListClass, RunOverlay, StyleRecord, StyleSheet,
};

/// Container format version written by this crate.
pub const FORMAT_VERSION: &str = "1.0.0";
const SUPPORTED_MAJOR: &str = "1";

/// Directory inside a package holding binary assets.
pub const ASSETS_DIR: &str = "assets";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn top_level(number: u64) -> Self {
        Self(format!("block-{number}"))
    }

    pub fn child(&self, number: u64) -> Self {
        Self(format!("{}.{number}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parent(&self) -> Option<BlockId> {
        self.0
            .rsplit_once('.')
            .map(|(parent, _)| BlockId(parent.to_string()))
    }

    /// `n` for ids of the form `block-<n>`.
    pub fn top_level_number(&self) -> Option<u64> {
        self.0.strip_prefix("block-")?.parse().ok()
    }

    /// `k` for ids of the form `<parent>.<k>`.
    pub fn child_number(&self) -> Option<u64> {
        self.0.rsplit_once('.')?.1.parse().ok()
    }

    fn natural_key(&self) -> Vec<NaturalPart<'_>> {
        let mut parts = Vec::new();
        let bytes = self.0.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            let digit = bytes[start].is_ascii_digit();
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() == digit {
                end += 1;
            }
            let chunk = &self.0[start..end];
            parts.push(match chunk.parse::<u64>() {
                Ok(n) if digit => NaturalPart::Number(n),
                _ => NaturalPart::Text(chunk),
            });
            start = end;
        }
        parts
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum NaturalPart<'a> {
    Number(u64),
    Text(&'a str),
}

/// Orders by numeric segments so `block-9` sorts before `block-10`.
impl Ord for BlockId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.natural_key()
            .cmp(&other.natural_key())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for BlockId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BlockKind {
    Heading { level: u8 },
    Paragraph,
    List { ordered: bool },
    ListItem,
    Image { image_path: String },
}

impl BlockKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            BlockKind::Heading { .. } => "heading",
            BlockKind::Paragraph => "paragraph",
            BlockKind::List { .. } => "list",
            BlockKind::ListItem => "list-item",
            BlockKind::Image { .. } => "image",
        }
    }

    pub fn level(&self) -> Option<u8> {
        match self {
            BlockKind::Heading { level } => Some(*level),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, BlockKind::List { .. })
    }

    /// Same type and, for headings and lists, the same level or class.
    pub fn same_shape(&self, other: &BlockKind) -> bool {
        match (self, other) {
            (BlockKind::Heading { level: a }, BlockKind::Heading { level: b }) => a == b,
            (BlockKind::List { ordered: a }, BlockKind::List { ordered: b }) => a == b,
            (BlockKind::Image { .. }, BlockKind::Image { .. }) => true,
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }

    /// Kinds that carry editable text and may turn into one another
    /// (a paragraph promoted to a heading, a heading changing level).
    pub fn is_text_leaf(&self) -> bool {
        matches!(
            self,
            BlockKind::Heading { .. } | BlockKind::Paragraph | BlockKind::ListItem
        )
    }
}

/// Half-open byte range `[start, end)` into the text buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    #[serde(rename = "content_start")]
    pub start: usize,
    #[serde(rename = "content_end")]
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InlineKind {
    Bold,
    Italic,
    Hyperlink { url: String },
}

/// Inline formatting over a block's plain text (markers stripped), in bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InlineSpan {
    pub start: usize,
    pub end: usize,
    #[serde(flatten)]
    pub kind: InlineKind,
}

impl InlineSpan {
    pub fn new(kind: InlineKind, start: usize, end: usize) -> Self {
        Self { start, end, kind }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.kind {
            InlineKind::Hyperlink { url } => Some(url),
            _ => None,
        }
    }
}

/// Sorts spans and joins touching or overlapping spans of the same kind.
pub fn coalesce_inline(spans: &mut Vec<InlineSpan>) {
    spans.retain(|span| span.start < span.end);
    spans.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then(a.start.cmp(&b.start))
            .then(a.end.cmp(&b.end))
    });
    let mut merged: Vec<InlineSpan> = Vec::with_capacity(spans.len());
    for span in spans.drain(..) {
        match merged.last_mut() {
            Some(last) if last.kind == span.kind && span.start <= last.end => {
                last.end = last.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
    *spans = merged;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    #[serde(flatten)]
    pub kind: BlockKind,
    #[serde(rename = "docx_paragraph_index")]
    pub external_index: usize,
    #[serde(flatten)]
    pub span: Span,
    pub content_hash: ContentHash,
    #[serde(
        rename = "inline_formatting",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub inline: Vec<InlineSpan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<BlockId>,
}

impl Block {
    /// The exact bytes this block covers, if the span is valid for `text`.
    pub fn text<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.get(self.span.start..self.span.end)
    }

    pub fn is_child(&self) -> bool {
        matches!(self.kind, BlockKind::ListItem)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "sidedoc_version")]
    pub format_version: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub source_file: String,
    #[serde(rename = "source_hash")]
    pub source_fingerprint: ContentHash,
    #[serde(rename = "content_hash")]
    pub content_fingerprint: ContentHash,
    pub generator: String,
    pub next_block_id: u64,
}

impl Manifest {
    pub fn check_version(&self) -> Result<(), VersionError> {
        let major = self.format_version.split('.').next().unwrap_or_default();
        if major == SUPPORTED_MAJOR {
            Ok(())
        } else {
            Err(VersionError {
                found: self.format_version.clone(),
                supported: format!("{SUPPORTED_MAJOR}.x"),
            })
        }
    }
}

/// Binary assets keyed by their package-relative path (`assets/image1.png`).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AssetStore {
    entries: BTreeMap<String, Vec<u8>>,
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: Vec<u8>) {
        self.entries.insert(path.into(), bytes);
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(path, bytes)| (path.as_str(), bytes.as_slice()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub text: String,
    pub blocks: Vec<Block>,
    pub styles: StyleSheet,
    pub manifest: Manifest,
    pub assets: AssetStore,
}

impl Container {
    pub fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.iter().find(|block| &block.id == id)
    }

    pub fn block_text(&self, block: &Block) -> Option<&str> {
        block.text(&self.text)
    }

    pub fn style(&self, id: &BlockId) -> Option<&StyleRecord> {
        self.styles.block_styles.get(id)
    }

    /// Blocks that sit directly in the document, not inside a list.
    pub fn top_level(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|block| !block.is_child())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_hierarchy() {
        let list = BlockId::top_level(4);
        let item = list.child(2);
        assert_eq!(item.as_str(), "block-4.2");
        assert_eq!(item.parent(), Some(list.clone()));
        assert_eq!(item.child_number(), Some(2));
        assert_eq!(list.top_level_number(), Some(4));
        assert_eq!(item.top_level_number(), None);
        assert_eq!(list.parent(), None);
    }

    #[test]
    fn test_block_id_natural_order() {
        let mut ids = vec![
            BlockId::top_level(10),
            BlockId::top_level(9),
            BlockId::top_level(9).child(10),
            BlockId::top_level(9).child(2),
        ];
        ids.sort();
        let rendered: Vec<_> = ids.iter().map(BlockId::as_str).collect();
        assert_eq!(
            rendered,
            vec!["block-9", "block-9.2", "block-9.10", "block-10"]
        );
    }

    #[test]
    fn test_block_serializes_with_structure_field_names() {
        let block = Block {
            id: BlockId::top_level(0),
            kind: BlockKind::Heading { level: 2 },
            external_index: 3,
            span: Span::new(0, 8),
            content_hash: ContentHash::from("abc"),
            inline: vec![InlineSpan::new(
                InlineKind::Hyperlink {
                    url: "https://example.com".into(),
                },
                0,
                4,
            )],
            children: Vec::new(),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "heading");
        assert_eq!(value["level"], 2);
        assert_eq!(value["docx_paragraph_index"], 3);
        assert_eq!(value["content_start"], 0);
        assert_eq!(value["content_end"], 8);
        assert_eq!(value["inline_formatting"][0]["type"], "hyperlink");
        assert_eq!(value["inline_formatting"][0]["url"], "https://example.com");
        assert!(value.get("children").is_none());

        let back: Block = serde_json::from_value(value).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn test_coalesce_inline_merges_touching_spans() {
        let mut spans = vec![
            InlineSpan::new(InlineKind::Bold, 4, 8),
            InlineSpan::new(InlineKind::Italic, 0, 2),
            InlineSpan::new(InlineKind::Bold, 0, 4),
            InlineSpan::new(InlineKind::Italic, 5, 5),
        ];
        coalesce_inline(&mut spans);
        assert_eq!(
            spans,
            vec![
                InlineSpan::new(InlineKind::Italic, 0, 2),
                InlineSpan::new(InlineKind::Bold, 0, 8),
            ]
        );
    }

    #[test]
    fn test_manifest_version_check() {
        let mut manifest = Manifest {
            format_version: FORMAT_VERSION.to_string(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
            source_file: "doc.docx".into(),
            source_fingerprint: ContentHash::from("s"),
            content_fingerprint: ContentHash::from("c"),
            generator: "test".into(),
            next_block_id: 0,
        };
        assert!(manifest.check_version().is_ok());
        manifest.format_version = "2.0.0".into();
        let err = manifest.check_version().unwrap_err();
        assert_eq!(err.found, "2.0.0");
    }
}
