//! Extraction: formatted document -> container.
//!
//! Each non-empty backend paragraph becomes one block. Consecutive paragraphs
//! of one list class are grouped under a list block. The text buffer is
//! produced by the markdown serializer and parsed back, so stored spans and
//! inline offsets are exactly what a later parse of the buffer will see.

use crate::backend::{FormattedDocument, Paragraph, heading_level_for_style, list_class_for_style};
use crate::error::{AssetError, FormatError, IntegrityError, IntegrityKind, Location};
use crate::hash::{ContentHash, hash, hash_str};
use crate::markdown::{self, BlockContent};
use crate::model::style::ListClass;
use crate::model::{
    ASSETS_DIR, AssetStore, Block, BlockId, BlockKind, Container, DocumentDefaults, FORMAT_VERSION,
    InlineKind, InlineSpan, Manifest, RunOverlay, StyleRecord, StyleSheet, coalesce_inline,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Largest embedded image accepted, in bytes.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractConfig {
    pub source_file: String,
    pub source_fingerprint: ContentHash,
    pub generator: String,
    pub max_image_bytes: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            source_file: String::new(),
            source_fingerprint: hash(b""),
            generator: crate::GENERATOR.to_string(),
            max_image_bytes: MAX_IMAGE_BYTES,
        }
    }
}

impl ExtractConfig {
    /// Config for a source file, fingerprinting its raw bytes.
    pub fn for_source(source_file: impl Into<String>, source_bytes: &[u8]) -> Self {
        Self {
            source_file: source_file.into(),
            source_fingerprint: hash(source_bytes),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// One block before ids and spans are known.
struct Pending {
    content: BlockContent,
    external_index: usize,
    style: StyleRecord,
}

pub fn extract(doc: &FormattedDocument, config: &ExtractConfig) -> Result<Container, ExtractError> {
    extract_at(doc, config, Utc::now())
}

pub fn extract_at(
    doc: &FormattedDocument,
    config: &ExtractConfig,
    now: DateTime<Utc>,
) -> Result<Container, ExtractError> {
    let defaults = DocumentDefaults::default();
    let mut pending: Vec<Pending> = Vec::new();
    let mut assets = AssetStore::new();
    let mut open_list: Option<(usize, ListClass)> = None;
    let mut top_level_count = 0u64;

    for (paragraph_index, paragraph) in doc.paragraphs.iter().enumerate() {
        if let Some(image) = &paragraph.image {
            open_list = None;
            let number = assets.len() + 1;
            let path = format!("{ASSETS_DIR}/image{number}.{}", image.extension);
            if image.data.len() > config.max_image_bytes {
                return Err(AssetError {
                    path,
                    block_id: Some(BlockId::top_level(top_level_count)),
                    reason: format!(
                        "image is {} bytes, limit is {}",
                        image.data.len(),
                        config.max_image_bytes
                    ),
                }
                .into());
            }
            assets.insert(path.clone(), image.data.clone());
            let mut style = style_record(paragraph, Vec::new());
            style.image = image.dimensions;
            pending.push(Pending {
                content: BlockContent::new(
                    BlockKind::Image { image_path: path },
                    flatten_breaks(&image.alt),
                ),
                external_index: paragraph_index,
                style,
            });
            top_level_count += 1;
            continue;
        }

        let (plain, inline, overlays) = flatten_runs(paragraph);
        if plain.is_empty() {
            debug!(paragraph_index, "skipping empty paragraph");
            continue;
        }
        let style = style_record(paragraph, overlays);

        if let Some(class) = list_class_for_style(&paragraph.style_name) {
            let list_index = match open_list {
                Some((list_index, open_class)) if open_class == class => list_index,
                _ => {
                    let ordered = class == ListClass::Ordered;
                    let kind = BlockKind::List { ordered };
                    let list_style = defaults.style_for(&kind, None);
                    pending.push(Pending {
                        content: BlockContent::new(kind, ""),
                        external_index: paragraph_index,
                        style: list_style,
                    });
                    top_level_count += 1;
                    open_list = Some((pending.len() - 1, class));
                    pending.len() - 1
                }
            };
            pending.push(Pending {
                content: BlockContent::new(BlockKind::ListItem, plain)
                    .with_inline(inline)
                    .with_parent(list_index),
                external_index: paragraph_index,
                style,
            });
            continue;
        }

        open_list = None;
        let kind = match heading_level_for_style(&paragraph.style_name) {
            Some(level) => BlockKind::Heading { level },
            None => BlockKind::Paragraph,
        };
        pending.push(Pending {
            content: BlockContent::new(kind, plain).with_inline(inline),
            external_index: paragraph_index,
            style,
        });
        top_level_count += 1;
    }

    let contents: Vec<BlockContent> = pending.iter().map(|p| p.content.clone()).collect();
    let serialized = markdown::serialize(&contents);
    let reparsed = markdown::parse(&serialized.text)?;
    if reparsed.len() != pending.len() {
        return Err(IntegrityError::new(
            IntegrityKind::StructureMismatch,
            Location::Document,
            format!(
                "serialized text parses into {} blocks, expected {}",
                reparsed.len(),
                pending.len()
            ),
        )
        .into());
    }

    let text = serialized.text;
    let mut blocks: Vec<Block> = Vec::with_capacity(pending.len());
    let mut block_styles = std::collections::BTreeMap::new();
    let mut next_top_level = 0u64;
    let mut child_counter = 0u64;

    for (index, (item, parsed)) in pending.into_iter().zip(reparsed).enumerate() {
        let id = match item.content.parent {
            Some(parent) => {
                child_counter += 1;
                blocks[parent].id.child(child_counter)
            }
            None => {
                child_counter = 0;
                next_top_level += 1;
                BlockId::top_level(next_top_level - 1)
            }
        };
        if !parsed.content.kind.same_shape(&item.content.kind)
            || parsed.span != serialized.spans[index]
        {
            return Err(IntegrityError::new(
                IntegrityKind::StructureMismatch,
                Location::Block(id),
                "serialized block did not parse back to itself",
            )
            .into());
        }
        if let Some(parent) = item.content.parent {
            blocks[parent].children.push(id.clone());
        }
        let span = parsed.span;
        blocks.push(Block {
            id: id.clone(),
            kind: item.content.kind,
            external_index: item.external_index,
            span,
            content_hash: hash_str(&text[span.start..span.end]),
            inline: parsed.content.inline,
            children: Vec::new(),
        });
        block_styles.insert(id, item.style);
    }

    info!(
        blocks = blocks.len(),
        assets = assets.len(),
        source = %config.source_file,
        "extracted container"
    );

    let manifest = Manifest {
        format_version: FORMAT_VERSION.to_string(),
        created_at: now,
        modified_at: now,
        source_file: config.source_file.clone(),
        source_fingerprint: config.source_fingerprint.clone(),
        content_fingerprint: hash_str(&text),
        generator: config.generator.clone(),
        next_block_id: next_top_level,
    };

    Ok(Container {
        text,
        blocks,
        styles: StyleSheet {
            block_styles,
            document_defaults: defaults,
        },
        manifest,
        assets,
    })
}

fn style_record(paragraph: &Paragraph, overlays: Vec<RunOverlay>) -> StyleRecord {
    StyleRecord {
        style_name: paragraph.style_name.clone(),
        font_name: paragraph.font_name.clone(),
        font_size: paragraph.font_size,
        alignment: paragraph.alignment,
        overlays,
        image: None,
    }
}

/// Joins runs into trimmed plain text, collecting inline spans for
/// bold/italic/links and overlays for underline/colour.
/// Soft line breaks and tabs become spaces so a block stays on its line.
fn flatten_breaks(text: &str) -> String {
    text.chars()
        .map(|c| if matches!(c, '\n' | '\r' | '\u{b}' | '\t') { ' ' } else { c })
        .collect()
}

fn flatten_runs(paragraph: &Paragraph) -> (String, Vec<InlineSpan>, Vec<RunOverlay>) {
    let mut plain = String::new();
    let mut inline = Vec::new();
    let mut overlays: Vec<RunOverlay> = Vec::new();

    for run in &paragraph.runs {
        let start = plain.len();
        plain.push_str(&flatten_breaks(&run.text));
        let end = plain.len();
        if start == end {
            continue;
        }
        if run.bold {
            inline.push(InlineSpan::new(InlineKind::Bold, start, end));
        }
        if run.italic {
            inline.push(InlineSpan::new(InlineKind::Italic, start, end));
        }
        if let Some(url) = &run.hyperlink {
            inline.push(InlineSpan::new(
                InlineKind::Hyperlink { url: url.clone() },
                start,
                end,
            ));
        }
        if run.underline || run.color.is_some() {
            match overlays.last_mut() {
                Some(last)
                    if last.end == start
                        && last.underline == run.underline
                        && last.color == run.color =>
                {
                    last.end = end;
                }
                _ => overlays.push(RunOverlay {
                    start,
                    end,
                    underline: run.underline,
                    color: run.color.clone(),
                }),
            }
        }
    }

    let lead = plain.len() - plain.trim_start().len();
    let trimmed_len = plain.trim().len();
    let plain = plain.trim().to_string();
    let shift = |offset: usize| offset.saturating_sub(lead).min(trimmed_len);

    for span in &mut inline {
        span.start = shift(span.start);
        span.end = shift(span.end);
    }
    coalesce_inline(&mut inline);
    overlays = overlays
        .into_iter()
        .map(|overlay| RunOverlay {
            start: shift(overlay.start),
            end: shift(overlay.end),
            ..overlay
        })
        .filter(|overlay| overlay.start < overlay.end)
        .collect();

    (plain, inline, overlays)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EmbeddedImage, Run};

    fn config() -> ExtractConfig {
        ExtractConfig::for_source("report.docx", b"docx bytes")
    }

    #[test]
    fn test_heading_and_paragraph() {
        let doc = FormattedDocument::new(vec![
            Paragraph::new("Heading 1").with_text("Title"),
            Paragraph::new("Normal").with_text("Hello world."),
        ]);
        let container = extract(&doc, &config()).unwrap();
        assert_eq!(container.text, "# Title\n\nHello world.");
        assert_eq!(container.blocks.len(), 2);

        let heading = &container.blocks[0];
        assert_eq!(heading.id.as_str(), "block-0");
        assert_eq!(heading.kind, BlockKind::Heading { level: 1 });
        assert_eq!(container.block_text(heading), Some("# Title"));
        assert_eq!(container.block_text(&container.blocks[1]), Some("Hello world."));
        assert_eq!(container.manifest.next_block_id, 2);
        assert_eq!(container.manifest.source_file, "report.docx");
        assert_eq!(container.manifest.content_fingerprint, hash_str(&container.text));
    }

    #[test]
    fn test_inline_offsets_are_plain_text_offsets() {
        let doc = FormattedDocument::new(vec![
            Paragraph::new("Normal")
                .with_run(Run::new("This is "))
                .with_run(Run::new("bold").bold())
                .with_run(Run::new(" and "))
                .with_run(Run::new("linked").link("https://example.com"))
                .with_run(Run::new(" and "))
                .with_run(Run::new("underlined").underline()),
        ]);
        let container = extract(&doc, &config()).unwrap();
        assert_eq!(
            container.text,
            "This is **bold** and [linked](https://example.com) and underlined"
        );
        let block = &container.blocks[0];
        assert_eq!(
            block.inline,
            vec![
                InlineSpan::new(InlineKind::Bold, 8, 12),
                InlineSpan::new(
                    InlineKind::Hyperlink {
                        url: "https://example.com".into()
                    },
                    17,
                    23
                ),
            ]
        );
        let style = container.style(&block.id).unwrap();
        assert_eq!(
            style.overlays,
            vec![RunOverlay {
                start: 28,
                end: 38,
                underline: true,
                color: None
            }]
        );
    }

    #[test]
    fn test_lists_group_consecutive_items() {
        let doc = FormattedDocument::new(vec![
            Paragraph::new("List Bullet").with_text("one"),
            Paragraph::new("List Bullet").with_text("two"),
            Paragraph::new("List Number").with_text("first"),
            Paragraph::new("Normal").with_text("after"),
        ]);
        let container = extract(&doc, &config()).unwrap();
        assert_eq!(container.text, "- one\n- two\n\n1. first\n\nafter");
        let ids: Vec<_> = container.blocks.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["block-0", "block-0.1", "block-0.2", "block-1", "block-1.1", "block-2"]
        );
        assert_eq!(
            container.blocks[0].children,
            vec![BlockId::new("block-0.1"), BlockId::new("block-0.2")]
        );
        assert_eq!(container.blocks[0].external_index, 0);
        assert_eq!(container.blocks[3].external_index, 2);
        assert_eq!(container.style(&BlockId::new("block-0.2")).unwrap().style_name, "List Bullet");
    }

    #[test]
    fn test_empty_paragraphs_skipped_and_unknown_styles_kept() {
        let doc = FormattedDocument::new(vec![
            Paragraph::new("Normal").with_text("   "),
            Paragraph::new("Fancy Quote").with_text("  quoted\ntext "),
        ]);
        let container = extract(&doc, &config()).unwrap();
        assert_eq!(container.text, "quoted text");
        let block = &container.blocks[0];
        assert_eq!(block.kind, BlockKind::Paragraph);
        assert_eq!(block.external_index, 1);
        assert_eq!(container.style(&block.id).unwrap().style_name, "Fancy Quote");
    }

    #[test]
    fn test_images_go_to_asset_store() {
        let doc = FormattedDocument::new(vec![
            Paragraph::new("Normal")
                .with_image(EmbeddedImage::new(vec![1, 2, 3], "png").with_alt("chart").with_dimensions(100, 50)),
        ]);
        let container = extract(&doc, &config()).unwrap();
        assert_eq!(container.text, "![chart](assets/image1.png)");
        assert_eq!(container.assets.get("assets/image1.png"), Some(&[1u8, 2, 3][..]));
        let style = container.style(&container.blocks[0].id).unwrap();
        assert_eq!(style.image.map(|d| d.width), Some(100));
    }

    #[test]
    fn test_image_alt_line_breaks_are_flattened() {
        let doc = FormattedDocument::new(vec![
            Paragraph::new("Normal").with_text("Before."),
            Paragraph::new("Normal")
                .with_image(EmbeddedImage::new(vec![1], "png").with_alt("two\nline\r\nalt")),
        ]);
        let container = extract(&doc, &config()).unwrap();
        assert_eq!(container.text, "Before.\n\n![two line  alt](assets/image1.png)");
        assert_eq!(
            container.block_text(&container.blocks[1]),
            Some("![two line  alt](assets/image1.png)")
        );
    }

    #[test]
    fn test_oversized_image_rejected() {
        let doc = FormattedDocument::new(vec![
            Paragraph::new("Normal").with_image(EmbeddedImage::new(vec![0; 16], "png")),
        ]);
        let config = ExtractConfig {
            max_image_bytes: 8,
            ..config()
        };
        let err = extract(&doc, &config).unwrap_err();
        assert!(matches!(err, ExtractError::Asset(ref asset) if asset.path == "assets/image1.png"));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let doc = FormattedDocument::new(vec![
            Paragraph::new("Title").with_text("Doc"),
            Paragraph::new("Normal").with_run(Run::new("x").italic()),
        ]);
        let now = Utc::now();
        let a = extract_at(&doc, &config(), now).unwrap();
        let b = extract_at(&doc, &config(), now).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.blocks[0].kind, BlockKind::Heading { level: 1 });
    }
}
