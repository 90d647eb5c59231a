//! Error taxonomy shared by every pipeline.
//!
//! Each leaf error names what went wrong and where: a text position for
//! [`FormatError`], a block id or asset path for the others. Operation-level
//! errors (`SyncError`, `ExtractError`, ...) wrap these with `#[from]`.

use crate::model::BlockId;
use serde::Serialize;
use std::fmt;

/// Where in a container a problem was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "at", rename_all = "snake_case")]
pub enum Location {
    Block(BlockId),
    Offset(usize),
    Asset(String),
    Manifest,
    Document,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Block(id) => write!(f, "block {id}"),
            Location::Offset(offset) => write!(f, "offset {offset}"),
            Location::Asset(path) => write!(f, "asset {path}"),
            Location::Manifest => f.write_str("manifest"),
            Location::Document => f.write_str("document"),
        }
    }
}

/// The text buffer could not be parsed. Never auto-corrected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("format error at line {line}, column {column}: {message}")]
pub struct FormatError {
    /// 1-based line.
    pub line: usize,
    /// 1-based column, counted in characters.
    pub column: usize,
    pub message: String,
}

impl FormatError {
    pub fn at_offset(text: &str, offset: usize, message: impl Into<String>) -> Self {
        let (line, column) = line_column(text, offset);
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// A referenced binary is missing or unusable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("asset error for {path}{}: {reason}", block_suffix(.block_id))]
pub struct AssetError {
    pub path: String,
    pub block_id: Option<BlockId>,
    pub reason: String,
}

fn block_suffix(block_id: &Option<BlockId>) -> String {
    match block_id {
        Some(id) => format!(" (block {id})"),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityKind {
    SpanOverlap,
    SpanGap,
    DuplicateId,
    HashMismatch,
    DanglingStyle,
    InlineOutOfBounds,
    StructureMismatch,
}

impl fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntegrityKind::SpanOverlap => "span overlap",
            IntegrityKind::SpanGap => "span gap",
            IntegrityKind::DuplicateId => "duplicate id",
            IntegrityKind::HashMismatch => "hash mismatch",
            IntegrityKind::DanglingStyle => "dangling style reference",
            IntegrityKind::InlineOutOfBounds => "inline span out of bounds",
            IntegrityKind::StructureMismatch => "structure mismatch",
        };
        f.write_str(name)
    }
}

/// A structural invariant the operation depends on does not hold.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("integrity error ({kind}) at {location}: {detail}")]
pub struct IntegrityError {
    pub kind: IntegrityKind,
    pub detail: String,
    pub location: Location,
}

impl IntegrityError {
    pub fn new(kind: IntegrityKind, location: Location, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            location,
        }
    }
}

/// The container was written by an incompatible format version.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported container format version {found} (supported: {supported})")]
pub struct VersionError {
    pub found: String,
    pub supported: String,
}

/// Converts a byte offset into a 1-based (line, column) pair.
pub fn line_column(text: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(text.len());
    let mut line = 1;
    let mut column = 1;
    for (index, ch) in text.char_indices() {
        if index >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}
