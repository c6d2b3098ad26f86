//! extract-xiso backend for Xbox disc images.
//!
//! Listing output looks like:
//!
//! ```text
//! extract-xiso v2.7.1 (01.11.14) for linux - written by in <in@fishtank.com>
//!
//! listing Halo.iso:
//!
//! \default.xbe (1499136 bytes)
//! \media\intro.bik (24117248 bytes)
//!
//! 2 files in Halo.iso total 25616384 bytes
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{error, info};

use super::{run_tool, Extractor, ToolLocator};
use crate::paths;

pub const NAME: &str = "extract-xiso";

const BINARIES: &[&str] = &["extract-xiso", "extract-xiso.exe"];

pub fn supported_type(archive_path: &str) -> bool {
    paths::has_extension(archive_path, &[".iso"])
}

/// One file from an xiso listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XisoEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ExtractXiso {
    path: PathBuf,
}

impl ExtractXiso {
    pub fn new(tools: &ToolLocator) -> Self {
        Self {
            path: tools.locate(BINARIES),
        }
    }

    fn list_output(&self, archive_path: &Path) -> Option<String> {
        let args: Vec<OsString> = vec!["-l".into(), archive_path.into()];
        let output = run_tool(NAME, &self.path, &args);
        output.success().then_some(output.stdout)
    }
}

impl Extractor for ExtractXiso {
    fn name(&self) -> &'static str {
        NAME
    }

    fn supported_type(&self, archive_path: &str) -> bool {
        supported_type(archive_path)
    }

    fn extractor_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn size(&self, archive_path: &Path, inner_file: Option<&str>) -> u64 {
        let Some(stdout) = self.list_output(archive_path) else {
            return 0;
        };

        match inner_file {
            Some(inner) => {
                let wanted = paths::normalize_for_lookup(inner);
                parse_entries(&stdout)
                    .into_iter()
                    .filter(|e| paths::normalize_for_lookup(&e.path) == wanted)
                    .map(|e| e.size)
                    .sum()
            }
            None => parse_total_size(&stdout).unwrap_or_else(|| {
                error!("Failed to parse xiso size for {}", archive_path.display());
                0
            }),
        }
    }

    /// Extracts the whole image; xiso has no wildcard filtering.
    fn extract(&self, archive_path: &Path, dest: &Path, _include: &[String], _exclude: &[String]) -> bool {
        if let Err(e) = std::fs::create_dir_all(dest) {
            error!("Failed to create {}: {}", dest.display(), e);
            return false;
        }

        let args: Vec<OsString> = vec!["-x".into(), archive_path.into(), "-d".into(), dest.into()];
        let output = run_tool(NAME, &self.path, &args);
        if output.success() {
            info!("Extracted {} to {}", archive_path.display(), dest.display());
        }
        output.success()
    }

    fn list(&self, archive_path: &Path) -> Vec<String> {
        self.list_output(archive_path)
            .map(|stdout| parse_entries(&stdout).into_iter().map(|e| e.path).collect())
            .unwrap_or_default()
    }
}

/// Parse `\path\name (N bytes)` rows. Paths come back with forward slashes and no leading separator.
pub fn parse_entries(stdout: &str) -> Vec<XisoEntry> {
    static ENTRY: OnceLock<Regex> = OnceLock::new();
    let re = ENTRY.get_or_init(|| Regex::new(r"^[\\/](.+) \((\d+) bytes\)\s*$").unwrap());

    stdout
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line)?;
            let size = caps[2].parse::<u64>().ok()?;
            Some(XisoEntry {
                path: paths::to_forward_slashes(&caps[1]),
                size,
            })
        })
        .collect()
}

/// Parse the `N files in X total N bytes` summary.
pub fn parse_total_size(stdout: &str) -> Option<u64> {
    static TOTAL: OnceLock<Regex> = OnceLock::new();
    let re = TOTAL.get_or_init(|| Regex::new(r"(?m)^\d+ files in .* total (\d+) bytes").unwrap());

    re.captures(stdout)?[1].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALO_LISTING: &str = "\
extract-xiso v2.7.1 (01.11.14) for linux - written by in <in@fishtank.com>

listing Halo.iso:

\\default.xbe (1499136 bytes)
\\media\\intro.bik (24117248 bytes)

2 files in Halo.iso total 25616384 bytes
";

    #[test]
    fn test_parse_entries() {
        assert_eq!(
            parse_entries(HALO_LISTING),
            vec![
                XisoEntry {
                    path: "default.xbe".to_string(),
                    size: 1_499_136,
                },
                XisoEntry {
                    path: "media/intro.bik".to_string(),
                    size: 24_117_248,
                },
            ]
        );
    }

    #[test]
    fn test_parse_total_size() {
        assert_eq!(parse_total_size(HALO_LISTING), Some(25_616_384));
        assert_eq!(parse_total_size("listing failed"), None);
    }

    #[test]
    fn test_supported_type() {
        assert!(supported_type("Halo.ISO"));
        assert!(!supported_type("Halo.chd"));
    }
}
