//! sidedoc: a round-trip container that keeps a formatted document's text
//! apart from its presentation.
//!
//! A container holds an editable markdown buffer, the block structure that
//! maps each block to a byte range of that buffer, per-block style records,
//! a manifest, and binary assets. It includes:
//!
//! - **Block model** - block ids, kinds, spans, inline formatting, styles
//! - **Extraction** - formatted document to container
//! - **Reconstruction** - container back to a formatted document
//! - **Sync** - reconcile an edited buffer with the stored structure
//! - **Validation** - integrity checks over a container
//! - **Package** - on-disk layout with atomic writes (optional)
//!
//! # Quick Start
//!
//! ```rust
//! use sidedoc::{ExtractConfig, FormattedDocument, Paragraph, SyncConfig, extract, sync, validate};
//!
//! let doc = FormattedDocument::new(vec![
//!     Paragraph::new("Heading 1").with_text("Title"),
//!     Paragraph::new("Normal").with_text("Body text."),
//! ]);
//! let container = extract(&doc, &ExtractConfig::default()).unwrap();
//! assert_eq!(container.text, "# Title\n\nBody text.");
//!
//! let outcome = sync(&container, "# Title\n\nBody text, edited.", &SyncConfig::default()).unwrap();
//! assert_eq!(outcome.report.modified, 1);
//! assert!(validate(&outcome.container).is_empty());
//! ```
//!
//! # Features
//!
//! - `package` - Enables reading and writing the directory layout (default)

/// Value written to `Manifest::generator`.
pub const GENERATOR: &str = concat!("sidedoc/", env!("CARGO_PKG_VERSION"));

pub mod error;
pub mod hash;

// Block model and style records
pub mod model;

// Text format and formatted-document backends
pub mod backend;
pub mod markdown;

// Pipelines
pub mod extract;
pub mod reconstruct;
pub mod sync;
pub mod validate;

// Optional: on-disk package
#[cfg(feature = "package")]
pub mod package;

pub use error::{
    AssetError, FormatError, IntegrityError, IntegrityKind, Location, VersionError,
};
pub use hash::{ContentHash, hash, hash_str};

pub use model::{
    Alignment, AssetStore, Block, BlockId, BlockKind, Container, DocumentDefaults,
    FORMAT_VERSION, ImageDimensions, InlineKind, InlineSpan, Manifest, RunOverlay, Span,
    StyleRecord, StyleSheet,
};

pub use backend::{EmbeddedImage, FormattedDocument, Paragraph, Run};

pub use extract::{ExtractConfig, ExtractError, extract};
pub use reconstruct::{ReconstructError, reconstruct};
pub use sync::{
    BlockChange, ChangeKind, Score, SyncConfig, SyncError, SyncOutcome, SyncReport, SyncWarning,
    WarningKind, sync,
};
pub use validate::{Violation, ViolationCode, validate};

#[cfg(feature = "package")]
pub use package::{Package, PackageError, PackageLimits};
