//! chdman backend for MAME compressed hunks of data (`.chd`) disc images.
//!
//! A CHD holds exactly one disc. CD images are restored as `.cue` + `.bin`,
//! DVD images as a single `.iso`; which one is decided from the metadata
//! tags printed by `chdman info`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{error, info};

use super::{archive_stem, run_tool, Extractor, ToolLocator};
use crate::paths;

pub const NAME: &str = "chdman";

const BINARIES: &[&str] = &["chdman", "chdman.exe"];

pub fn supported_type(archive_path: &str) -> bool {
    paths::has_extension(archive_path, &[".chd"])
}

/// Kind of disc stored in a CHD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscKind {
    Cd,
    Dvd,
}

/// Facts parsed from `chdman info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChdInfo {
    pub logical_size: u64,
    pub kind: DiscKind,
}

#[derive(Debug, Clone)]
pub struct Chdman {
    path: PathBuf,
}

impl Chdman {
    pub fn new(tools: &ToolLocator) -> Self {
        Self {
            path: tools.locate(BINARIES),
        }
    }

    fn info(&self, archive_path: &Path) -> Option<ChdInfo> {
        let args: Vec<OsString> = vec!["info".into(), "-i".into(), archive_path.into()];
        let output = run_tool(NAME, &self.path, &args);
        if !output.success() {
            return None;
        }

        let info = parse_info(&output.stdout);
        if info.is_none() {
            error!("Failed to parse chdman info for {}", archive_path.display());
        }
        info
    }

    fn output_files(archive_path: &Path, kind: DiscKind) -> Vec<String> {
        let stem = archive_stem(archive_path);
        match kind {
            DiscKind::Cd => vec![format!("{}.cue", stem), format!("{}.bin", stem)],
            DiscKind::Dvd => vec![format!("{}.iso", stem)],
        }
    }
}

impl Extractor for Chdman {
    fn name(&self) -> &'static str {
        NAME
    }

    fn supported_type(&self, archive_path: &str) -> bool {
        supported_type(archive_path)
    }

    fn extractor_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn size(&self, archive_path: &Path, _inner_file: Option<&str>) -> u64 {
        self.info(archive_path).map(|i| i.logical_size).unwrap_or(0)
    }

    /// Restores the whole disc; include/exclude filters don't apply to a single image.
    fn extract(&self, archive_path: &Path, dest: &Path, _include: &[String], _exclude: &[String]) -> bool {
        let Some(info) = self.info(archive_path) else {
            return false;
        };

        if let Err(e) = std::fs::create_dir_all(dest) {
            error!("Failed to create {}: {}", dest.display(), e);
            return false;
        }

        let files = Self::output_files(archive_path, info.kind);
        let mut args: Vec<OsString> = match info.kind {
            DiscKind::Cd => vec![
                "extractcd".into(),
                "-i".into(),
                archive_path.into(),
                "-o".into(),
                dest.join(&files[0]).into(),
                "-ob".into(),
                dest.join(&files[1]).into(),
            ],
            DiscKind::Dvd => vec![
                "extractdvd".into(),
                "-i".into(),
                archive_path.into(),
                "-o".into(),
                dest.join(&files[0]).into(),
            ],
        };
        // Overwrite leftovers from an interrupted run
        args.push("-f".into());

        let output = run_tool(NAME, &self.path, &args);
        if output.success() {
            info!("Extracted {} to {}", archive_path.display(), dest.display());
        }
        output.success()
    }

    fn list(&self, archive_path: &Path) -> Vec<String> {
        self.info(archive_path)
            .map(|i| Self::output_files(archive_path, i.kind))
            .unwrap_or_default()
    }
}

/// Parse `chdman info` output.
///
/// ```text
/// Logical size: 681,574,400 bytes
/// Metadata:     Tag='CHT2'  Index=0  Length=91 bytes
/// ```
pub fn parse_info(stdout: &str) -> Option<ChdInfo> {
    static LOGICAL_SIZE: OnceLock<Regex> = OnceLock::new();
    let re = LOGICAL_SIZE.get_or_init(|| {
        Regex::new(r"(?m)^\s*Logical size:\s*([\d,]+)\s*bytes").unwrap()
    });

    let size = re
        .captures(stdout)?
        .get(1)?
        .as_str()
        .replace(',', "")
        .parse::<u64>()
        .ok()?;

    let kind = if stdout.contains("Tag='DVD '") {
        DiscKind::Dvd
    } else {
        DiscKind::Cd
    };

    Some(ChdInfo {
        logical_size: size,
        kind,
    })
}
