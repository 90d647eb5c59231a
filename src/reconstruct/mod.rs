//! Reconstruction: container -> formatted document.
//!
//! Every non-list block becomes one paragraph with its style record applied
//! as stored. Runs are cut at every inline and overlay boundary and carry the
//! union of the attributes covering them. All checks run before the first
//! paragraph is built, so a failure never yields a partial document.

use crate::backend::{EmbeddedImage, FormattedDocument, Paragraph, Run};
use crate::error::{AssetError, FormatError, IntegrityError, IntegrityKind, Location, VersionError};
use crate::markdown::{self, floor_char_boundary};
use crate::model::{BlockKind, Container, InlineKind, InlineSpan, RunOverlay};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ReconstructError {
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Version(#[from] VersionError),
}

pub fn reconstruct(container: &Container) -> Result<FormattedDocument, ReconstructError> {
    container.manifest.check_version()?;

    for block in &container.blocks {
        let BlockKind::Image { image_path } = &block.kind else {
            continue;
        };
        if !container.assets.contains(image_path) {
            return Err(AssetError {
                path: image_path.clone(),
                block_id: Some(block.id.clone()),
                reason: "missing from asset store".to_string(),
            }
            .into());
        }
    }

    let parsed = markdown::parse(&container.text)?;
    if parsed.len() != container.blocks.len() {
        return Err(IntegrityError::new(
            IntegrityKind::StructureMismatch,
            Location::Document,
            format!(
                "text holds {} blocks, structure lists {}",
                parsed.len(),
                container.blocks.len()
            ),
        )
        .into());
    }

    let mut plans = Vec::with_capacity(parsed.len());
    for (block, parsed) in container.blocks.iter().zip(&parsed) {
        if parsed.span != block.span || !parsed.content.kind.same_shape(&block.kind) {
            return Err(IntegrityError::new(
                IntegrityKind::StructureMismatch,
                Location::Block(block.id.clone()),
                format!(
                    "structure says {} at {}..{}, text has {} at {}..{}",
                    block.kind.type_name(),
                    block.span.start,
                    block.span.end,
                    parsed.content.kind.type_name(),
                    parsed.span.start,
                    parsed.span.end
                ),
            )
            .into());
        }
        let Some(style) = container.style(&block.id) else {
            return Err(IntegrityError::new(
                IntegrityKind::DanglingStyle,
                Location::Block(block.id.clone()),
                "no style record for block",
            )
            .into());
        };
        let plain = &parsed.content.plain;
        if let Some(span) = block.inline.iter().find(|s| s.start > s.end || s.end > plain.len()) {
            return Err(IntegrityError::new(
                IntegrityKind::InlineOutOfBounds,
                Location::Block(block.id.clone()),
                format!(
                    "inline span {}..{} exceeds {} bytes of text",
                    span.start,
                    span.end,
                    plain.len()
                ),
            )
            .into());
        }
        plans.push((block, style, plain));
    }

    let mut paragraphs = Vec::with_capacity(plans.len());
    for (block, style, plain) in plans {
        let mut paragraph = Paragraph::new(style.style_name.clone());
        paragraph.alignment = style.alignment;
        paragraph.font_name = style.font_name.clone();
        paragraph.font_size = style.font_size;

        match &block.kind {
            BlockKind::List { .. } => continue,
            BlockKind::Image { image_path } => {
                let data = container
                    .assets
                    .get(image_path)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                let extension = image_path
                    .rsplit_once('.')
                    .map(|(_, ext)| ext.to_string())
                    .unwrap_or_default();
                paragraph.image = Some(EmbeddedImage {
                    data,
                    extension,
                    dimensions: style.image,
                    alt: plain.clone(),
                });
            }
            BlockKind::Heading { .. } | BlockKind::Paragraph | BlockKind::ListItem => {
                paragraph.runs = build_runs(plain, &block.inline, &style.overlays);
            }
        }
        paragraphs.push(paragraph);
    }

    debug!(paragraphs = paragraphs.len(), "reconstructed document");
    Ok(FormattedDocument::new(paragraphs))
}

/// Splits `plain` at every span boundary and composes the attributes of all
/// spans covering each piece into one run.
pub fn build_runs(plain: &str, inline: &[InlineSpan], overlays: &[RunOverlay]) -> Vec<Run> {
    let mut cuts = vec![0, plain.len()];
    cuts.extend(inline.iter().flat_map(|s| [s.start, s.end]));
    cuts.extend(overlays.iter().flat_map(|o| [o.start, o.end]));
    let mut cuts: Vec<usize> = cuts
        .into_iter()
        .map(|cut| floor_char_boundary(plain, cut.min(plain.len())))
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut runs = Vec::with_capacity(cuts.len());
    for window in cuts.windows(2) {
        let (start, end) = (window[0], window[1]);
        let covers = |s: usize, e: usize| s <= start && end <= e;
        let mut run = Run::new(&plain[start..end]);
        for span in inline.iter().filter(|s| covers(s.start, s.end)) {
            match &span.kind {
                InlineKind::Bold => run.bold = true,
                InlineKind::Italic => run.italic = true,
                InlineKind::Hyperlink { url } => {
                    run.hyperlink.get_or_insert_with(|| url.clone());
                }
            }
        }
        for overlay in overlays.iter().filter(|o| covers(o.start, o.end)) {
            run.underline |= overlay.underline;
            if run.color.is_none() {
                run.color = overlay.color.clone();
            }
        }
        runs.push(run);
    }
    runs
}
