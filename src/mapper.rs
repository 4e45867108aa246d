//! Path mapping from the source library into the mirror

use std::path::{Component, Path, PathBuf};

use crate::models::POINTER_EXTENSION;

/// Maps source paths to mirror destinations and pointer contents.
///
/// Implementations must be pure functions of the source path: an existing
/// destination is trusted to hold exactly what the mapper would produce.
pub trait PathMapper: Send + Sync {
    /// Destination of the pointer file for a media path
    fn to_mirror_path(&self, source: &Path) -> PathBuf;

    /// Text written into the pointer file
    fn to_pointer_content(&self, source: &Path) -> String;

    /// Destination of a copied metadata or image file
    fn to_copy_path(&self, source: &Path) -> PathBuf;
}

/// Default mapper: mirrors the directory layout under the output root and
/// points at the same relative path under the mount prefix.
#[derive(Debug, Clone)]
pub struct StrmMapper {
    source_root: PathBuf,
    output_root: PathBuf,
    mount_prefix: String,
}

impl StrmMapper {
    pub fn new(source_root: PathBuf, output_root: PathBuf, mount_prefix: impl Into<String>) -> Self {
        Self {
            source_root,
            output_root,
            mount_prefix: mount_prefix.into(),
        }
    }

    /// Path relative to the source root; foreign paths fall back to their file name.
    fn relative<'a>(&self, source: &'a Path) -> &'a Path {
        match source.strip_prefix(&self.source_root) {
            Ok(rel) => rel,
            Err(_) => source
                .file_name()
                .map(Path::new)
                .unwrap_or(source),
        }
    }
}

impl PathMapper for StrmMapper {
    fn to_mirror_path(&self, source: &Path) -> PathBuf {
        self.output_root
            .join(self.relative(source))
            .with_extension(POINTER_EXTENSION)
    }

    fn to_pointer_content(&self, source: &Path) -> String {
        let rel = self
            .relative(source)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        let prefix = self.mount_prefix.trim_end_matches('/');
        format!("{prefix}/{rel}")
    }

    fn to_copy_path(&self, source: &Path) -> PathBuf {
        self.output_root.join(self.relative(source))
    }
}
