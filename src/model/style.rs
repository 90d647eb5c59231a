//! Presentational metadata kept next to the text: one style record per block
//! and a document-default table used for blocks that did not exist at
//! extraction time.

use super::{BlockId, BlockKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    #[default]
    Left,
    Center,
    Right,
    Justify,
}

/// Run-level formatting with no plain-text spelling (underline, colour),
/// positioned in the block's plain-text bytes like inline spans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunOverlay {
    pub start: usize,
    pub end: usize,
    #[serde(default, skip_serializing_if = "is_false")]
    pub underline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Image extent in EMU (914400 per inch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: u64,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleRecord {
    #[serde(rename = "docx_style")]
    pub style_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f32>,
    #[serde(default)]
    pub alignment: Alignment,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overlays: Vec<RunOverlay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageDimensions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDefaults {
    pub font_name: String,
    pub font_size: f32,
    #[serde(default)]
    pub alignment: Alignment,
}

impl Default for DocumentDefaults {
    fn default() -> Self {
        Self {
            font_name: "Calibri".to_string(),
            font_size: 11.0,
            alignment: Alignment::Left,
        }
    }
}

impl DocumentDefaults {
    /// Style for a block that has no recorded formatting of its own.
    pub fn style_for(&self, kind: &BlockKind, parent: Option<&BlockKind>) -> StyleRecord {
        StyleRecord {
            style_name: default_style_name(kind, parent).to_string(),
            font_name: Some(self.font_name.clone()),
            font_size: Some(self.font_size),
            alignment: self.alignment,
            overlays: Vec::new(),
            image: None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleSheet {
    pub block_styles: BTreeMap<BlockId, StyleRecord>,
    #[serde(default)]
    pub document_defaults: DocumentDefaults,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListClass {
    Bullet,
    Ordered,
}

const HEADING_STYLES: [&str; 6] = [
    "Heading 1",
    "Heading 2",
    "Heading 3",
    "Heading 4",
    "Heading 5",
    "Heading 6",
];

/// Heading level for a paragraph style name, if it is one of the
/// conventional heading styles.
pub fn heading_level_for_style(style_name: &str) -> Option<u8> {
    if style_name == "Title" {
        return Some(1);
    }
    HEADING_STYLES
        .iter()
        .position(|name| *name == style_name)
        .map(|index| index as u8 + 1)
}

pub fn list_class_for_style(style_name: &str) -> Option<ListClass> {
    if style_name.starts_with("List Number") {
        Some(ListClass::Ordered)
    } else if style_name.starts_with("List Bullet") || style_name == "List Paragraph" {
        Some(ListClass::Bullet)
    } else {
        None
    }
}

pub fn default_style_name(kind: &BlockKind, parent: Option<&BlockKind>) -> &'static str {
    match kind {
        BlockKind::Heading { level } => {
            let index = usize::from((*level).clamp(1, 6)) - 1;
            HEADING_STYLES[index]
        }
        BlockKind::List { .. } => "List Paragraph",
        BlockKind::ListItem => match parent {
            Some(BlockKind::List { ordered: true }) => "List Number",
            _ => "List Bullet",
        },
        BlockKind::Paragraph | BlockKind::Image { .. } => "Normal",
    }
}
