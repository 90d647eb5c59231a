//! Synchronization engine: reconcile an edited text buffer with the
//! container it was produced from.
//!
//! The previous container is never modified. The result is a brand-new
//! container plus a report of how every block was classified. Any fatal
//! error (unparsable text, inline span outside its block, missing image
//! asset) is returned before anything is built.

mod passes;

use crate::error::{AssetError, FormatError, IntegrityError, IntegrityKind, Location, VersionError};
use crate::hash::{ContentHash, hash_str};
use crate::markdown::{self, ParsedBlock};
use crate::model::style::default_style_name;
use crate::model::{
    Block, BlockId, BlockKind, Container, FORMAT_VERSION, Manifest, StyleRecord, StyleSheet,
};
use chrono::{DateTime, Utc};
use passes::{NewEntry, OldEntry, Pair, PairKind, Unmatched, strip_whitespace};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};
use unicode_segmentation::UnicodeSegmentation;

/// Similarity out of 10000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Score(pub u32);

impl Score {
    pub const MAX: Score = Score(10000);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// How far from its expected position the positional pass looks for a
    /// partner, in blocks.
    pub window: usize,
    /// Minimum token similarity for pairing blocks whose type or heading
    /// level changed.
    pub structural_threshold: Score,
    pub generator: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window: 8,
            structural_threshold: Score(5000),
            generator: crate::GENERATOR.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Version(#[from] VersionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningKind {
    /// Several old blocks were equally good partners; the lowest id won.
    Ambiguity,
    /// A list item moved to another list and was given a new id.
    Reparented,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncWarning {
    pub kind: WarningKind,
    pub block_id: BlockId,
    /// Byte offset of the affected block in the edited text.
    pub offset: usize,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Unchanged,
    Moved,
    Modified,
    /// Modified, with a different type or heading level.
    Restructured,
    Inserted,
    Deleted,
    Split,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockChange {
    pub change: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_id: Option<BlockId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_id: Option<BlockId>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Blocks found unchanged, moved or not. A list that keeps its identity
    /// counts here; edits inside it are counted on its items.
    pub matched: usize,
    pub modified: usize,
    pub inserted: usize,
    pub deleted: usize,
    /// Subset of `matched` whose order relative to other matched blocks changed.
    pub moved: usize,
    pub split: usize,
    pub merged: usize,
    pub warnings: Vec<SyncWarning>,
    pub changes: Vec<BlockChange>,
}

impl SyncReport {
    pub fn has_changes(&self) -> bool {
        self.modified + self.inserted + self.deleted + self.moved + self.split + self.merged > 0
            || self
                .changes
                .iter()
                .any(|c| c.change != ChangeKind::Unchanged || c.old_id != c.new_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub container: Container,
    pub report: SyncReport,
}

/// Where a new block's identity and style come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Exact(usize),
    Positional(usize),
    Structural(usize),
    SplitFirst(usize),
    SplitSecond(usize),
    Merged { keep: usize, absorbed: usize },
    Inserted,
}

impl Origin {
    /// The old block whose id this block may keep.
    fn id_source(self) -> Option<usize> {
        match self {
            Origin::Exact(o)
            | Origin::Positional(o)
            | Origin::Structural(o)
            | Origin::SplitFirst(o)
            | Origin::Merged { keep: o, .. } => Some(o),
            Origin::SplitSecond(_) | Origin::Inserted => None,
        }
    }

    fn style_source(self) -> Option<usize> {
        match self {
            Origin::SplitSecond(o) => Some(o),
            other => other.id_source(),
        }
    }
}

pub fn sync(old: &Container, edited: &str, config: &SyncConfig) -> Result<SyncOutcome, SyncError> {
    sync_at(old, edited, config, Utc::now())
}

pub fn sync_at(
    old: &Container,
    edited: &str,
    config: &SyncConfig,
    now: DateTime<Utc>,
) -> Result<SyncOutcome, SyncError> {
    old.manifest.check_version()?;
    let parsed = markdown::parse(edited)?;
    let new = new_entries(old, edited, parsed)?;
    let previous = old_entries(old)?;

    let all = Unmatched::all(previous.len(), new.len());
    let exact = passes::exact_hash_pass(&previous, &new, &all);
    let after_exact = all.without(&exact);
    let regrouping = passes::split_merge_pass(&previous, &new, &after_exact);
    let regrouped = regrouping.anchors();
    let after_regrouping = after_exact.without(&regrouped);
    let anchors: Vec<Pair> = exact.iter().chain(&regrouped).copied().collect();
    let positional =
        passes::positional_pass(&previous, &new, &after_regrouping, &anchors, config);
    debug!(
        exact = exact.len(),
        splits = regrouping.splits.len(),
        merges = regrouping.merges.len(),
        positional = positional.pairs.len(),
        "matcher passes finished"
    );

    let mut origins = vec![Origin::Inserted; new.len()];
    for pair in exact.iter().chain(&positional.pairs) {
        origins[pair.new] = match pair.kind {
            PairKind::Exact => Origin::Exact(pair.old),
            PairKind::Positional => Origin::Positional(pair.old),
            PairKind::Structural => Origin::Structural(pair.old),
            PairKind::Regrouped => continue,
        };
    }
    for split in &regrouping.splits {
        origins[split.first] = Origin::SplitFirst(split.old);
        origins[split.second] = Origin::SplitSecond(split.old);
    }
    for merge in &regrouping.merges {
        origins[merge.new] = Origin::Merged {
            keep: merge.first,
            absorbed: merge.second,
        };
    }
    let mut old_claimed = vec![false; previous.len()];
    for origin in &origins {
        match *origin {
            Origin::Merged { keep, absorbed } => {
                old_claimed[keep] = true;
                old_claimed[absorbed] = true;
            }
            other => {
                if let Some(o) = other.style_source() {
                    old_claimed[o] = true;
                }
            }
        }
    }

    let mut report = SyncReport {
        warnings: positional.warnings,
        split: regrouping.splits.len(),
        merged: regrouping.merges.len(),
        ..SyncReport::default()
    };
    let ids = assign_ids(old, &previous, &new, &origins, &mut report);
    let moved = moved_blocks(&exact);

    let mut blocks: Vec<Block> = Vec::with_capacity(new.len());
    let mut block_styles = BTreeMap::new();
    for (n, entry) in new.iter().enumerate() {
        let id = ids.ids[n].clone();
        let parent_kind = entry.content.parent.map(|p| &new[p].content.kind);
        let style = match origins[n].style_source() {
            Some(o) => {
                let old_parent_kind = previous[o].parent.map(|p| &previous[p].block.kind);
                let parents = (old_parent_kind, parent_kind);
                carried_style(old, &previous[o], entry, parents, origins[n])?
            }
            None => old
                .styles
                .document_defaults
                .style_for(&entry.content.kind, parent_kind),
        };

        let change = match origins[n] {
            Origin::Exact(_) if moved.contains(&n) => ChangeKind::Moved,
            Origin::Exact(_) => ChangeKind::Unchanged,
            // A list's edits are reported on its items.
            Origin::Positional(_) if entry.content.kind.is_list() => ChangeKind::Unchanged,
            Origin::Positional(_) => ChangeKind::Modified,
            Origin::Structural(_) => ChangeKind::Restructured,
            Origin::SplitFirst(_) | Origin::SplitSecond(_) => ChangeKind::Split,
            Origin::Merged { .. } => ChangeKind::Merged,
            Origin::Inserted => ChangeKind::Inserted,
        };
        match change {
            ChangeKind::Unchanged => report.matched += 1,
            ChangeKind::Moved => {
                report.matched += 1;
                report.moved += 1;
            }
            ChangeKind::Modified | ChangeKind::Restructured => report.modified += 1,
            ChangeKind::Inserted => report.inserted += 1,
            ChangeKind::Deleted | ChangeKind::Split | ChangeKind::Merged => {}
        }
        report.changes.push(BlockChange {
            change,
            old_id: origins[n].style_source().map(|o| previous[o].block.id.clone()),
            new_id: Some(id.clone()),
        });

        let children = if entry.content.kind.is_list() {
            new.iter()
                .enumerate()
                .skip(n + 1)
                .take_while(|(_, item)| item.content.parent == Some(n))
                .map(|(i, _)| ids.ids[i].clone())
                .collect()
        } else {
            Vec::new()
        };
        blocks.push(Block {
            id: id.clone(),
            kind: entry.content.kind.clone(),
            external_index: 0,
            span: entry.span,
            content_hash: entry.hash.clone(),
            inline: entry.content.inline.clone(),
            children,
        });
        block_styles.insert(id, style);
    }
    assign_external_indices(&mut blocks, &previous, &origins);

    for (o, entry) in previous.iter().enumerate() {
        if !old_claimed[o] {
            report.deleted += 1;
            report.changes.push(BlockChange {
                change: ChangeKind::Deleted,
                old_id: Some(entry.block.id.clone()),
                new_id: None,
            });
        }
    }

    let manifest = Manifest {
        format_version: FORMAT_VERSION.to_string(),
        created_at: old.manifest.created_at,
        modified_at: now,
        source_file: old.manifest.source_file.clone(),
        source_fingerprint: old.manifest.source_fingerprint.clone(),
        content_fingerprint: hash_str(edited),
        generator: config.generator.clone(),
        next_block_id: ids.next_block_id,
    };

    info!(
        matched = report.matched,
        modified = report.modified,
        inserted = report.inserted,
        deleted = report.deleted,
        moved = report.moved,
        split = report.split,
        merged = report.merged,
        warnings = report.warnings.len(),
        "sync complete"
    );

    Ok(SyncOutcome {
        container: Container {
            text: edited.to_string(),
            blocks,
            styles: StyleSheet {
                block_styles,
                document_defaults: old.styles.document_defaults.clone(),
            },
            manifest,
            assets: old.assets.clone(),
        },
        report,
    })
}

/// Hashes candidates and checks what the new container will depend on.
fn new_entries(
    old: &Container,
    edited: &str,
    parsed: Vec<ParsedBlock>,
) -> Result<Vec<NewEntry>, SyncError> {
    let mut out: Vec<NewEntry> = Vec::with_capacity(parsed.len());
    for block in parsed {
        let plain_len = block.content.plain.len();
        if let Some(span) = block
            .content
            .inline
            .iter()
            .find(|s| s.start > s.end || s.end > plain_len)
        {
            return Err(IntegrityError::new(
                IntegrityKind::InlineOutOfBounds,
                Location::Offset(block.span.start),
                format!(
                    "inline span {}..{} outside {plain_len} bytes of text",
                    span.start, span.end
                ),
            )
            .into());
        }
        if let BlockKind::Image { image_path } = &block.content.kind {
            if !old.assets.contains(image_path) {
                return Err(AssetError {
                    path: image_path.clone(),
                    block_id: None,
                    reason: format!(
                        "referenced at offset {} but not in the asset store",
                        block.span.start
                    ),
                }
                .into());
            }
        }
        let text = &edited[block.span.start..block.span.end];
        let key = match block.content.parent {
            Some(p) => item_key(&out[p].content.kind, text),
            None => hash_str(text),
        };
        out.push(NewEntry {
            hash: hash_str(text),
            key,
            stripped: strip_whitespace(&block.content.plain),
            span: block.span,
            content: block.content,
        });
    }
    for n in 0..out.len() {
        if let BlockKind::List { ordered } = out[n].content.kind {
            let items = out[n + 1..]
                .iter()
                .take_while(|item| item.content.parent == Some(n))
                .map(|item| &item.key);
            let key = list_key(ordered, items);
            out[n].key = key;
        }
    }
    Ok(out)
}

fn old_entries(old: &Container) -> Result<Vec<OldEntry<'_>>, SyncError> {
    let plains = old_plain_texts(old);
    let mut entries: Vec<OldEntry<'_>> = Vec::with_capacity(old.blocks.len());
    let mut current_list = None;
    for (index, block) in old.blocks.iter().enumerate() {
        let Some(text) = block.text(&old.text) else {
            return Err(IntegrityError::new(
                IntegrityKind::StructureMismatch,
                Location::Block(block.id.clone()),
                format!(
                    "span {}..{} is outside the {}-byte text",
                    block.span.start,
                    block.span.end,
                    old.text.len()
                ),
            )
            .into());
        };
        let parent = if block.is_child() {
            current_list
        } else {
            current_list = block.kind.is_list().then_some(index);
            None
        };
        let plain = match &plains {
            Some(plains) => plains[index].clone(),
            None => text.to_string(),
        };
        let key = match parent {
            Some(p) => item_key(&entries[p].block.kind, text),
            None => hash_str(text),
        };
        entries.push(OldEntry {
            block,
            parent,
            key,
            stripped: strip_whitespace(&plain),
            plain,
        });
    }
    for index in 0..entries.len() {
        if let BlockKind::List { ordered } = entries[index].block.kind {
            let items = entries[index + 1..]
                .iter()
                .take_while(|item| item.parent == Some(index))
                .map(|item| &item.key);
            let key = list_key(ordered, items);
            entries[index].key = key;
        }
    }
    Ok(entries)
}

fn list_class(ordered: bool) -> &'static str {
    if ordered { "ordered" } else { "bullet" }
}

/// Exact-match key of a list item: its list's kind plus the text after the
/// marker, so renumbering keeps the key and switching list kind does not.
fn item_key(list: &BlockKind, line: &str) -> ContentHash {
    let ordered = matches!(list, BlockKind::List { ordered: true });
    hash_str(&format!("{}\n{}", list_class(ordered), markdown::item_body(line)))
}

/// Exact-match key of a list: its kind plus its item keys as a multiset, so
/// reordering items leaves the list itself unchanged.
fn list_key<'a>(ordered: bool, items: impl Iterator<Item = &'a ContentHash>) -> ContentHash {
    let mut items: Vec<&str> = items.map(ContentHash::as_str).collect();
    items.sort_unstable();
    let mut joined = String::from(list_class(ordered));
    for item in items {
        joined.push('\n');
        joined.push_str(item);
    }
    hash_str(&joined)
}

/// Plain text of each stored block, if the stored text still parses into
/// exactly the stored spans.
fn old_plain_texts(old: &Container) -> Option<Vec<String>> {
    match markdown::parse(&old.text) {
        Ok(parsed)
            if parsed.len() == old.blocks.len()
                && parsed.iter().zip(&old.blocks).all(|(p, b)| p.span == b.span) =>
        {
            Some(parsed.into_iter().map(|p| p.content.plain).collect())
        }
        Ok(_) => {
            warn!("stored structure does not line up with stored text; comparing raw text");
            None
        }
        Err(err) => {
            warn!(%err, "stored text does not parse; comparing raw text");
            None
        }
    }
}

struct AssignedIds {
    ids: Vec<BlockId>,
    next_block_id: u64,
}

/// Keeps old ids where the origin allows it and mints the rest: top-level
/// ids from the manifest counter, item ids one past the highest child
/// number ever used under their list.
fn assign_ids(
    old: &Container,
    previous: &[OldEntry<'_>],
    new: &[NewEntry],
    origins: &[Origin],
    report: &mut SyncReport,
) -> AssignedIds {
    let mut next_block_id = previous
        .iter()
        .filter_map(|entry| entry.block.id.top_level_number())
        .map(|n| n + 1)
        .fold(old.manifest.next_block_id, u64::max);

    let mut highest_child: HashMap<BlockId, u64> = HashMap::new();
    for entry in previous {
        if let (Some(parent), Some(k)) = (entry.block.id.parent(), entry.block.id.child_number()) {
            let highest = highest_child.entry(parent).or_insert(0);
            *highest = (*highest).max(k);
        }
    }

    let mut ids: Vec<BlockId> = Vec::with_capacity(new.len());
    for (n, entry) in new.iter().enumerate() {
        let source = origins[n].id_source().map(|o| &previous[o].block.id);
        let id = match entry.content.parent {
            None => match source {
                Some(id) => id.clone(),
                None => {
                    next_block_id += 1;
                    BlockId::top_level(next_block_id - 1)
                }
            },
            Some(p) => {
                let parent_id = ids[p].clone();
                match source {
                    Some(id) if id.parent().as_ref() == Some(&parent_id) => id.clone(),
                    _ => {
                        let highest = highest_child.entry(parent_id.clone()).or_insert(0);
                        *highest += 1;
                        let fresh = parent_id.child(*highest);
                        if let Some(old_id) = source {
                            report.warnings.push(SyncWarning {
                                kind: WarningKind::Reparented,
                                block_id: fresh.clone(),
                                offset: entry.span.start,
                                detail: format!(
                                    "list item {old_id} moved under {parent_id} and is now {fresh}"
                                ),
                            });
                        }
                        fresh
                    }
                }
            }
        };
        ids.push(id);
    }

    AssignedIds { ids, next_block_id }
}

/// Keeps each block's previous backend index while the sequence stays
/// strictly increasing; any other block is numbered right after its
/// predecessor. A list carries its first item's index.
fn assign_external_indices(blocks: &mut [Block], previous: &[OldEntry<'_>], origins: &[Origin]) {
    let mut last: Option<usize> = None;
    for (n, block) in blocks.iter_mut().enumerate() {
        if block.kind.is_list() {
            continue;
        }
        let next = last.map_or(0, |last| last + 1);
        let index = origins[n]
            .id_source()
            .map(|o| previous[o].block.external_index)
            .filter(|&index| index >= next)
            .unwrap_or(next);
        block.external_index = index;
        last = Some(index);
    }
    for n in (0..blocks.len()).rev() {
        if !blocks[n].kind.is_list() {
            continue;
        }
        let first_item = blocks
            .get(n + 1)
            .filter(|item| item.is_child())
            .map(|item| item.external_index);
        if let Some(index) = first_item {
            blocks[n].external_index = index;
        }
    }
}

/// New indices of exact matches whose rank among all exact matches changed.
fn moved_blocks(exact: &[Pair]) -> HashSet<usize> {
    let mut by_old: Vec<&Pair> = exact.iter().collect();
    by_old.sort_by_key(|pair| pair.old);
    let old_rank: HashMap<usize, usize> = by_old
        .iter()
        .enumerate()
        .map(|(rank, pair)| (pair.new, rank))
        .collect();

    let mut by_new: Vec<&Pair> = exact.iter().collect();
    by_new.sort_by_key(|pair| pair.new);
    by_new
        .iter()
        .enumerate()
        .filter(|(rank, pair)| old_rank.get(&pair.new) != Some(rank))
        .map(|(_, pair)| pair.new)
        .collect()
}

/// Style for a block that inherits from an old one. Exact matches copy the
/// record as is; everything else has overlays clamped to the new text, and
/// a change of type or of list kind picks up the default style name.
/// `parents` holds the old and new parent list kinds.
fn carried_style(
    old: &Container,
    source: &OldEntry<'_>,
    entry: &NewEntry,
    parents: (Option<&BlockKind>, Option<&BlockKind>),
    origin: Origin,
) -> Result<StyleRecord, SyncError> {
    let Some(style) = old.style(&source.block.id) else {
        return Err(IntegrityError::new(
            IntegrityKind::DanglingStyle,
            Location::Block(source.block.id.clone()),
            "no style record for matched block",
        )
        .into());
    };
    let mut style = style.clone();
    if matches!(origin, Origin::Exact(_)) {
        return Ok(style);
    }
    let (old_parent, new_parent) = parents;
    let list_changed = match (old_parent, new_parent) {
        (Some(a), Some(b)) => !a.same_shape(b),
        _ => false,
    };
    if !source.block.kind.same_shape(&entry.content.kind) || list_changed {
        style.style_name = default_style_name(&entry.content.kind, new_parent).to_string();
    }
    clamp_overlays(&mut style, &entry.content.plain);
    Ok(style)
}

/// Snaps overlays onto grapheme boundaries of `plain` and drops the ones
/// left empty.
fn clamp_overlays(style: &mut StyleRecord, plain: &str) {
    if style.overlays.is_empty() {
        return;
    }
    let boundaries: Vec<usize> = plain
        .grapheme_indices(true)
        .map(|(index, _)| index)
        .chain(std::iter::once(plain.len()))
        .collect();
    let snap = |offset: usize| {
        let after = boundaries.partition_point(|&b| b <= offset);
        boundaries[after.saturating_sub(1)]
    };
    style.overlays.retain_mut(|overlay| {
        overlay.start = snap(overlay.start);
        overlay.end = snap(overlay.end);
        overlay.start < overlay.end
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunOverlay;

    #[test]
    fn test_moved_counts_rank_changes() {
        let pair = |old, new| Pair {
            old,
            new,
            kind: PairKind::Exact,
        };
        assert!(moved_blocks(&[pair(0, 0), pair(1, 1)]).is_empty());
        let swapped = moved_blocks(&[pair(0, 1), pair(1, 0)]);
        assert_eq!(swapped.len(), 2);
        // insertions before a block do not make it move
        assert!(moved_blocks(&[pair(0, 3), pair(1, 5)]).is_empty());
    }

    #[test]
    fn test_list_key_ignores_item_order() {
        let list = BlockKind::List { ordered: false };
        assert_eq!(item_key(&list, "- alpha"), item_key(&list, "* alpha"));
        assert_ne!(
            item_key(&list, "- alpha"),
            item_key(&BlockKind::List { ordered: true }, "1. alpha")
        );

        let (a, b) = (hash_str("alpha"), hash_str("beta"));
        let bullet = list_key(false, [&a, &b].into_iter());
        assert_eq!(bullet, list_key(false, [&b, &a].into_iter()));
        assert_ne!(bullet, list_key(true, [&a, &b].into_iter()));
        assert_ne!(bullet, list_key(false, [&a].into_iter()));
    }

    #[test]
    fn test_clamp_overlays_respects_graphemes() {
        let overlay = |start, end| RunOverlay {
            start,
            end,
            underline: true,
            color: None,
        };
        let mut style = StyleRecord {
            style_name: "Normal".into(),
            font_name: None,
            font_size: None,
            alignment: Default::default(),
            overlays: vec![overlay(1, 4), overlay(0, 2), overlay(4, 40), overlay(50, 60)],
            image: None,
        };
        // "e" plus a combining acute accent is one three-byte grapheme
        clamp_overlays(&mut style, "e\u{301}xyz");
        let ranges: Vec<_> = style.overlays.iter().map(|o| (o.start, o.end)).collect();
        assert_eq!(ranges, vec![(0, 4), (4, 6)]);
    }
}
