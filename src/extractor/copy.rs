//! Plain copy backend.
//!
//! Used when the policy action is Copy (or ExtractCopy without a matching
//! extractor). The file is placed in the cache untouched, reflinked where the
//! filesystem supports it.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use super::Extractor;

pub const NAME: &str = "Copy";

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyExtractor;

impl Extractor for CopyExtractor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn supported_type(&self, _archive_path: &str) -> bool {
        true
    }

    fn extractor_path(&self) -> Option<PathBuf> {
        None
    }

    fn size(&self, archive_path: &Path, _inner_file: Option<&str>) -> u64 {
        match std::fs::metadata(archive_path) {
            Ok(m) => m.len(),
            Err(e) => {
                error!("Failed to read size of {}: {}", archive_path.display(), e);
                0
            }
        }
    }

    fn extract(&self, archive_path: &Path, dest: &Path, _include: &[String], _exclude: &[String]) -> bool {
        let Some(file_name) = archive_path.file_name() else {
            error!("Cannot copy {}: no file name", archive_path.display());
            return false;
        };

        let target = dest.join(file_name);
        let result = std::fs::create_dir_all(dest)
            .and_then(|_| reflink_copy::reflink_or_copy(archive_path, &target).map(|_| ()));

        match result {
            Ok(()) => {
                info!("Copied {} to {}", archive_path.display(), target.display());
                true
            }
            Err(e) => {
                error!("Failed to copy {} to {}: {}", archive_path.display(), target.display(), e);
                false
            }
        }
    }

    fn list(&self, archive_path: &Path) -> Vec<String> {
        archive_path
            .file_name()
            .map(|n| vec![n.to_string_lossy().into_owned()])
            .unwrap_or_default()
    }
}
