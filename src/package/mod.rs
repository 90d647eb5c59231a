//! Persisted container: a directory holding the four members and the asset
//! subdirectory.
//!
//! ```text
//! content.md  structure.json  styles.json  manifest.json  assets/image1.png ...
//! ```
//!
//! Every member is written to a `.tmp` sibling and renamed into place. The
//! manifest goes last, so a reader never sees a new manifest over old
//! content.

use crate::error::{AssetError, VersionError};
use crate::model::{ASSETS_DIR, AssetStore, Block, BlockKind, Container, Manifest, StyleSheet};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const CONTENT_FILE: &str = "content.md";
pub const STRUCTURE_FILE: &str = "structure.json";
pub const STYLES_FILE: &str = "styles.json";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Largest asset accepted when reading a package, in bytes.
pub const MAX_ASSET_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageLimits {
    pub max_asset_bytes: u64,
}

impl Default for PackageLimits {
    fn default() -> Self {
        Self {
            max_asset_bytes: MAX_ASSET_BYTES,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid {member}: {source}")]
    Json {
        member: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error("package is missing {0}")]
    Missing(&'static str),
    #[error("package path does not exist: {0}")]
    PathDoesNotExist(PathBuf),
}

#[derive(Debug, Serialize, Deserialize)]
struct StructureFile {
    blocks: Vec<Block>,
}

#[derive(Debug, Clone)]
pub struct Package {
    root: PathBuf,
    limits: PackageLimits,
}

impl Package {
    /// Opens an existing package directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, PackageError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(PackageError::PathDoesNotExist(root));
        }
        Ok(Self {
            root,
            limits: PackageLimits::default(),
        })
    }

    /// Opens a package directory, creating it if needed.
    pub fn create(root: impl AsRef<Path>) -> Result<Self, PackageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(ASSETS_DIR))?;
        Ok(Self {
            root,
            limits: PackageLimits::default(),
        })
    }

    pub fn with_limits(mut self, limits: PackageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn read(&self) -> Result<Container, PackageError> {
        let manifest: Manifest = self.read_json(MANIFEST_FILE)?;
        manifest.check_version()?;
        let text = self.read_member(CONTENT_FILE)?;
        let structure: StructureFile = self.read_json(STRUCTURE_FILE)?;
        let styles: StyleSheet = self.read_json(STYLES_FILE)?;

        for block in &structure.blocks {
            if let BlockKind::Image { image_path } = &block.kind {
                if !is_safe_path(image_path) {
                    return Err(AssetError {
                        path: image_path.clone(),
                        block_id: Some(block.id.clone()),
                        reason: "path escapes the package".to_string(),
                    }
                    .into());
                }
            }
        }
        let assets = self.read_assets()?;

        debug!(
            root = %self.root.display(),
            blocks = structure.blocks.len(),
            assets = assets.len(),
            "read package"
        );
        Ok(Container {
            text,
            blocks: structure.blocks,
            styles,
            manifest,
            assets,
        })
    }

    pub fn write(&self, container: &Container) -> Result<(), PackageError> {
        fs::create_dir_all(self.root.join(ASSETS_DIR))?;
        for (path, bytes) in container.assets.iter() {
            if !is_safe_path(path) {
                return Err(AssetError {
                    path: path.to_string(),
                    block_id: None,
                    reason: "path escapes the package".to_string(),
                }
                .into());
            }
            let target = self.root.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            write_atomic(&target, bytes)?;
        }

        let structure = StructureFile {
            blocks: container.blocks.clone(),
        };
        write_atomic(&self.root.join(CONTENT_FILE), container.text.as_bytes())?;
        write_atomic(&self.root.join(STRUCTURE_FILE), &to_json(STRUCTURE_FILE, &structure)?)?;
        write_atomic(&self.root.join(STYLES_FILE), &to_json(STYLES_FILE, &container.styles)?)?;
        write_atomic(
            &self.root.join(MANIFEST_FILE),
            &to_json(MANIFEST_FILE, &container.manifest)?,
        )?;

        info!(
            root = %self.root.display(),
            blocks = container.blocks.len(),
            "wrote package"
        );
        Ok(())
    }

    fn read_member(&self, member: &'static str) -> Result<String, PackageError> {
        match fs::read_to_string(self.root.join(member)) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(PackageError::Missing(member)),
            Err(err) => Err(PackageError::Io(err)),
        }
    }

    fn read_json<T: DeserializeOwned>(&self, member: &'static str) -> Result<T, PackageError> {
        let text = self.read_member(member)?;
        serde_json::from_str(&text).map_err(|source| PackageError::Json { member, source })
    }

    fn read_assets(&self) -> Result<AssetStore, PackageError> {
        let mut assets = AssetStore::new();
        let dir = self.root.join(ASSETS_DIR);
        if !dir.is_dir() {
            return Ok(assets);
        }
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(|err| {
                PackageError::Io(err.into_io_error().unwrap_or_else(|| {
                    io::Error::other("filesystem loop in assets directory")
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.ends_with(".tmp") {
                continue;
            }
            let size = entry.metadata().map_err(io::Error::from)?.len();
            if size > self.limits.max_asset_bytes {
                return Err(AssetError {
                    path: key,
                    block_id: None,
                    reason: format!(
                        "asset is {size} bytes, limit is {}",
                        self.limits.max_asset_bytes
                    ),
                }
                .into());
            }
            assets.insert(key, fs::read(entry.path())?);
        }
        Ok(assets)
    }
}

/// Whether a package-relative path stays inside the package.
pub fn is_safe_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with(['/', '\\']) || path.contains(':') {
        return false;
    }
    Path::new(path)
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
        && !path.split(['/', '\\']).any(|part| part == "..")
}

fn to_json<T: Serialize>(member: &'static str, value: &T) -> Result<Vec<u8>, PackageError> {
    serde_json::to_vec_pretty(value).map_err(|source| PackageError::Json { member, source })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    fs::write(&temp, bytes)?;
    fs::rename(&temp, path)
}
