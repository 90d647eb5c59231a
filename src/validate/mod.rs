//! Integrity validator.
//!
//! Runs every check against a container and returns all findings in a fixed
//! order (by check, then by block order). Never stops at the first problem
//! and never modifies its input.

use crate::error::Location;
use crate::hash::hash_str;
use crate::markdown;
use crate::model::{Block, BlockKind, Container};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    UnsupportedVersion,
    SpanOutOfBounds,
    InvalidBoundary,
    SpanOverlap,
    SpanGap,
    DuplicateId,
    MissingStyle,
    OrphanStyle,
    HashMismatch,
    UnparsableText,
    InlineSpanOutOfBounds,
    MissingAsset,
    ContentFingerprintMismatch,
    ExternalIndexOrder,
    ChildIdHierarchy,
    IdCounter,
}

impl ViolationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ViolationCode::SpanOutOfBounds => "SPAN_OUT_OF_BOUNDS",
            ViolationCode::InvalidBoundary => "INVALID_BOUNDARY",
            ViolationCode::SpanOverlap => "SPAN_OVERLAP",
            ViolationCode::SpanGap => "SPAN_GAP",
            ViolationCode::DuplicateId => "DUPLICATE_ID",
            ViolationCode::MissingStyle => "MISSING_STYLE",
            ViolationCode::OrphanStyle => "ORPHAN_STYLE",
            ViolationCode::HashMismatch => "HASH_MISMATCH",
            ViolationCode::UnparsableText => "UNPARSABLE_TEXT",
            ViolationCode::InlineSpanOutOfBounds => "INLINE_SPAN_OUT_OF_BOUNDS",
            ViolationCode::MissingAsset => "MISSING_ASSET",
            ViolationCode::ContentFingerprintMismatch => "CONTENT_FINGERPRINT_MISMATCH",
            ViolationCode::ExternalIndexOrder => "EXTERNAL_INDEX_ORDER",
            ViolationCode::ChildIdHierarchy => "CHILD_ID_HIERARCHY",
            ViolationCode::IdCounter => "ID_COUNTER",
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub code: ViolationCode,
    pub detail: String,
    pub location: Location,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.code, self.location, self.detail)
    }
}

struct Checker<'a> {
    container: &'a Container,
    /// Per block: span lies in the text on char boundaries.
    readable: Vec<bool>,
    violations: Vec<Violation>,
}

impl<'a> Checker<'a> {
    fn report(&mut self, code: ViolationCode, location: Location, detail: impl Into<String>) {
        self.violations.push(Violation {
            code,
            detail: detail.into(),
            location,
        });
    }

    fn block_location(block: &Block) -> Location {
        Location::Block(block.id.clone())
    }

    fn text(&self, index: usize) -> Option<&'a str> {
        let container: &'a Container = self.container;
        if self.readable[index] {
            container.blocks[index].text(&container.text)
        } else {
            None
        }
    }
}

pub fn validate(container: &Container) -> Vec<Violation> {
    let mut checker = Checker {
        container,
        readable: vec![false; container.blocks.len()],
        violations: Vec::new(),
    };
    check_version(&mut checker);
    check_span_bounds(&mut checker);
    check_partition(&mut checker);
    check_unique_ids(&mut checker);
    check_styles(&mut checker);
    check_hashes(&mut checker);
    check_inline_spans(&mut checker);
    check_assets(&mut checker);
    check_content_fingerprint(&mut checker);
    check_external_index(&mut checker);
    check_hierarchy(&mut checker);
    check_id_counter(&mut checker);
    checker.violations
}

fn check_version(checker: &mut Checker<'_>) {
    if let Err(err) = checker.container.manifest.check_version() {
        checker.report(ViolationCode::UnsupportedVersion, Location::Manifest, err.to_string());
    }
}

fn check_span_bounds(checker: &mut Checker<'_>) {
    let container = checker.container;
    let text = &container.text;
    for (index, block) in container.blocks.iter().enumerate() {
        let span = block.span;
        if span.start > span.end || span.end > text.len() {
            checker.report(
                ViolationCode::SpanOutOfBounds,
                Checker::block_location(block),
                format!(
                    "span {}..{} does not fit a {}-byte text",
                    span.start,
                    span.end,
                    text.len()
                ),
            );
        } else if !text.is_char_boundary(span.start) || !text.is_char_boundary(span.end) {
            checker.report(
                ViolationCode::InvalidBoundary,
                Checker::block_location(block),
                format!("span {}..{} splits a character", span.start, span.end),
            );
        } else {
            checker.readable[index] = true;
        }
    }
}

/// Top-level spans must be ordered, disjoint and leave only whitespace
/// uncovered; list items do the same within their list.
fn check_partition(checker: &mut Checker<'_>) {
    let container = checker.container;
    let top_level: Vec<usize> = (0..container.blocks.len())
        .filter(|&i| !container.blocks[i].is_child())
        .collect();
    check_sequence(checker, &top_level, 0, container.text.len());

    for (index, block) in container.blocks.iter().enumerate() {
        if !block.kind.is_list() || !checker.readable[index] {
            continue;
        }
        let items: Vec<usize> = (index + 1..container.blocks.len())
            .take_while(|&i| container.blocks[i].is_child())
            .collect();
        for &item in &items {
            let inner = &container.blocks[item];
            if checker.readable[item] && !block.span.contains(&inner.span) {
                checker.report(
                    ViolationCode::SpanOutOfBounds,
                    Checker::block_location(inner),
                    format!("item lies outside its list {}", block.id),
                );
            }
        }
        let inside: Vec<usize> = items
            .into_iter()
            .filter(|&i| block.span.contains(&container.blocks[i].span))
            .collect();
        check_sequence(checker, &inside, block.span.start, block.span.end);
    }
}

fn check_sequence(checker: &mut Checker<'_>, indices: &[usize], start: usize, end: usize) {
    let container = checker.container;
    let text = &container.text;
    let mut cursor = start;
    let mut previous: Option<&Block> = None;
    for &index in indices {
        if !checker.readable[index] {
            continue;
        }
        let block = &container.blocks[index];
        if block.span.start < cursor {
            let detail = match previous {
                Some(prev) => format!("overlaps {}", prev.id),
                None => "starts before its container".to_string(),
            };
            checker.report(ViolationCode::SpanOverlap, Checker::block_location(block), detail);
        } else if !text[cursor..block.span.start].trim().is_empty() {
            checker.report(
                ViolationCode::SpanGap,
                Location::Offset(cursor),
                format!("text before {} is not covered by any block", block.id),
            );
        }
        cursor = cursor.max(block.span.end);
        previous = Some(block);
    }
    if cursor < end && text.is_char_boundary(cursor) && !text[cursor..end].trim().is_empty() {
        checker.report(
            ViolationCode::SpanGap,
            Location::Offset(cursor),
            "trailing text is not covered by any block",
        );
    }
}

fn check_unique_ids(checker: &mut Checker<'_>) {
    let container = checker.container;
    let mut seen = HashSet::new();
    for block in &container.blocks {
        if !seen.insert(&block.id) {
            checker.report(
                ViolationCode::DuplicateId,
                Checker::block_location(block),
                "id used by more than one block",
            );
        }
    }
}

fn check_styles(checker: &mut Checker<'_>) {
    let container = checker.container;
    for block in &container.blocks {
        if container.style(&block.id).is_none() {
            checker.report(
                ViolationCode::MissingStyle,
                Checker::block_location(block),
                "no style record",
            );
        }
    }
    let ids: HashSet<_> = container.blocks.iter().map(|b| &b.id).collect();
    for id in container.styles.block_styles.keys() {
        if !ids.contains(id) {
            checker.report(
                ViolationCode::OrphanStyle,
                Location::Block(id.clone()),
                "style record for a block that does not exist",
            );
        }
    }
}

fn check_hashes(checker: &mut Checker<'_>) {
    let container = checker.container;
    for (index, block) in container.blocks.iter().enumerate() {
        let Some(text) = checker.text(index) else {
            continue;
        };
        let actual = hash_str(text);
        if actual != block.content_hash {
            checker.report(
                ViolationCode::HashMismatch,
                Checker::block_location(block),
                format!(
                    "stored {} but text hashes to {}",
                    block.content_hash.short(12),
                    actual.short(12)
                ),
            );
        }
    }
}

/// Inline spans index the block's plain text. When the text parses, the
/// plain length is known exactly; otherwise the raw span length bounds it.
fn check_inline_spans(checker: &mut Checker<'_>) {
    let container = checker.container;
    let mut plain_lengths: HashMap<(usize, usize, &'static str), usize> = HashMap::new();
    match markdown::parse(&container.text) {
        Ok(parsed) => {
            for block in parsed {
                plain_lengths.insert(
                    (block.span.start, block.span.end, block.content.kind.type_name()),
                    block.content.plain.len(),
                );
            }
        }
        Err(err) => checker.report(
            ViolationCode::UnparsableText,
            Location::Document,
            err.to_string(),
        ),
    }

    for block in &container.blocks {
        let key = (block.span.start, block.span.end, block.kind.type_name());
        let limit = plain_lengths.get(&key).copied().unwrap_or(block.span.len());
        for span in &block.inline {
            if span.start > span.end || span.end > limit {
                checker.report(
                    ViolationCode::InlineSpanOutOfBounds,
                    Checker::block_location(block),
                    format!("inline span {}..{} exceeds {limit} bytes", span.start, span.end),
                );
            }
        }
    }
}

fn check_assets(checker: &mut Checker<'_>) {
    let container = checker.container;
    for block in &container.blocks {
        if let BlockKind::Image { image_path } = &block.kind {
            if !container.assets.contains(image_path) {
                checker.report(
                    ViolationCode::MissingAsset,
                    Checker::block_location(block),
                    format!("{image_path} is not in the asset store"),
                );
            }
        }
    }
}

fn check_content_fingerprint(checker: &mut Checker<'_>) {
    let container = checker.container;
    let actual = hash_str(&container.text);
    let stored = &container.manifest.content_fingerprint;
    if &actual != stored {
        checker.report(
            ViolationCode::ContentFingerprintMismatch,
            Location::Manifest,
            format!(
                "manifest records {} but text hashes to {}",
                stored.short(12),
                actual.short(12)
            ),
        );
    }
}

fn check_external_index(checker: &mut Checker<'_>) {
    let container = checker.container;
    let blocks = &container.blocks;
    let mut last: Option<usize> = None;
    for (index, block) in blocks.iter().enumerate() {
        if block.kind.is_list() {
            let first_item = blocks.get(index + 1).filter(|b| b.is_child());
            if let Some(item) = first_item {
                if item.external_index != block.external_index {
                    checker.report(
                        ViolationCode::ExternalIndexOrder,
                        Checker::block_location(block),
                        format!(
                            "list index {} differs from its first item's {}",
                            block.external_index, item.external_index
                        ),
                    );
                }
            }
            continue;
        }
        if let Some(last) = last {
            if block.external_index <= last {
                checker.report(
                    ViolationCode::ExternalIndexOrder,
                    Checker::block_location(block),
                    format!(
                        "index {} does not follow {last}",
                        block.external_index
                    ),
                );
            }
        }
        last = Some(block.external_index);
    }
}

fn check_hierarchy(checker: &mut Checker<'_>) {
    let container = checker.container;
    let blocks = &container.blocks;
    let mut current_list: Option<&Block> = None;
    for (index, block) in blocks.iter().enumerate() {
        if !block.is_child() {
            current_list = block.kind.is_list().then_some(block);
            if block.kind.is_list() {
                let items: Vec<_> = blocks[index + 1..]
                    .iter()
                    .take_while(|b| b.is_child())
                    .map(|b| &b.id)
                    .collect();
                let listed: Vec<_> = block.children.iter().collect();
                if items != listed {
                    checker.report(
                        ViolationCode::ChildIdHierarchy,
                        Checker::block_location(block),
                        "children do not match the items that follow the list",
                    );
                }
            } else if !block.children.is_empty() {
                checker.report(
                    ViolationCode::ChildIdHierarchy,
                    Checker::block_location(block),
                    format!("{} block has children", block.kind.type_name()),
                );
            }
            continue;
        }
        match current_list {
            Some(list) if block.id.parent().as_ref() == Some(&list.id) => {}
            Some(list) => checker.report(
                ViolationCode::ChildIdHierarchy,
                Checker::block_location(block),
                format!("item id is not under its list {}", list.id),
            ),
            None => checker.report(
                ViolationCode::ChildIdHierarchy,
                Checker::block_location(block),
                "list item outside any list",
            ),
        }
    }
}

fn check_id_counter(checker: &mut Checker<'_>) {
    let container = checker.container;
    let next = container.manifest.next_block_id;
    for block in &container.blocks {
        if let Some(number) = block.id.top_level_number() {
            if number >= next {
                checker.report(
                    ViolationCode::IdCounter,
                    Checker::block_location(block),
                    format!("id number {number} is not below the counter {next}"),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FormattedDocument, Paragraph};
    use crate::extract::{ExtractConfig, extract};
    use crate::model::BlockId;

    fn sample() -> Container {
        let doc = FormattedDocument::new(vec![
            Paragraph::new("Heading 1").with_text("Title"),
            Paragraph::new("Normal").with_text("Body"),
            Paragraph::new("List Bullet").with_text("one"),
            Paragraph::new("List Bullet").with_text("two"),
        ]);
        extract(&doc, &ExtractConfig::default()).unwrap()
    }

    fn codes(container: &Container) -> Vec<ViolationCode> {
        validate(container).into_iter().map(|v| v.code).collect()
    }

    #[test]
    fn test_extracted_container_is_valid() {
        assert!(validate(&sample()).is_empty());
    }

    #[test]
    fn test_reports_every_problem_not_just_the_first() {
        let mut container = sample();
        container.blocks[1].id = BlockId::top_level(0);
        container.blocks[1].content_hash = hash_str("something else");
        container.manifest.next_block_id = 1;
        let found = codes(&container);
        assert!(found.contains(&ViolationCode::DuplicateId));
        assert!(found.contains(&ViolationCode::HashMismatch));
        assert!(found.contains(&ViolationCode::OrphanStyle));
        assert!(found.contains(&ViolationCode::IdCounter));
    }

    #[test]
    fn test_gap_and_overlap() {
        let mut container = sample();
        container.blocks[1].span.start += 2;
        container.blocks[1].content_hash = hash_str(container.block_text(&container.blocks[1]).unwrap());
        let found = codes(&container);
        assert_eq!(found, vec![ViolationCode::SpanGap]);

        let mut overlapping = sample();
        overlapping.blocks[1].span.start = 0;
        let found = codes(&overlapping);
        assert!(found.contains(&ViolationCode::SpanOverlap));
    }

    #[test]
    fn test_out_of_bounds_span_is_reported_not_panicking() {
        let mut container = sample();
        container.blocks[0].span.end = 10_000;
        let found = codes(&container);
        assert!(found.contains(&ViolationCode::SpanOutOfBounds));
    }

    #[test]
    fn test_validate_does_not_mutate() {
        let container = sample();
        let before = container.clone();
        let _ = validate(&container);
        assert_eq!(container, before);
    }

    #[test]
    fn test_violation_codes_serialize_stably() {
        let value = serde_json::to_value(ViolationCode::ContentFingerprintMismatch).unwrap();
        assert_eq!(value, "CONTENT_FINGERPRINT_MISMATCH");
        assert_eq!(
            ViolationCode::ContentFingerprintMismatch.as_str(),
            "CONTENT_FINGERPRINT_MISMATCH"
        );
    }
}
