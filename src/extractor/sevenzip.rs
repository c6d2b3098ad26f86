//! 7-Zip backend.
//!
//! Drives the 7z binary for listing, sizing and extracting zip/7z/rar/gz
//! archives. Output is parsed from the human-readable listing, which has a
//! fixed column layout:
//!
//! ```text
//!    Date      Time    Attr         Size   Compressed  Name
//! ------------------- ----- ------------ ------------  ------------------------
//! 1996-12-24 23:32:00 .....     84175728     69019477  Doom (USA) (Track 1).bin
//! 1996-12-24 23:32:00 .....          814          147  Doom (USA).cue
//! ------------------- ----- ------------ ------------  ------------------------
//! 1996-12-24 23:32:00           84176542     69019624  2 files
//! ```
//!
//! The file name starts at column 53 and the summary size at column 25. If a
//! 7-Zip release changes that layout, only the `parse_*` functions below need
//! to follow.
//!
//! # 7z Commands Reference
//!
//! - List files: `7z l archive.zip [-i!wildcard] [-x!wildcard] [-r]`
//! - Extract: `7z x archive.zip -o/output/dir -y -aoa -bsp1 [filters]`
//!   - `-y`: Yes to all prompts
//!   - `-aoa`: Overwrite all existing files
//!   - `-bsp1`: Progress to stdout
//!   - `-r`: Apply wildcards recursively

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use super::{run_tool, Extractor, ToolLocator, ToolOutput};
use crate::paths;

pub const NAME: &str = "7-Zip";

const BINARIES: &[&str] = &["7zz", "7z", "7z.exe"];

/// Divider between the header, file and summary sections of a listing.
const LIST_DIVIDER: &str = "------------------- ----- ------------ ------------  ------------------------";

/// Column where the file name starts in a listing row.
const NAME_COLUMN: usize = 53;

/// Column after the date/time/attribute fields and before the sizes.
const SIZE_COLUMN: usize = 25;

pub fn supported_type(archive_path: &str) -> bool {
    paths::is_compressed_archive(archive_path)
}

#[derive(Debug, Clone)]
pub struct SevenZip {
    path: PathBuf,
}

impl SevenZip {
    pub fn new(tools: &ToolLocator) -> Self {
        Self {
            path: tools.locate(BINARIES),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn list_details(
        &self,
        archive_path: &Path,
        include: &[String],
        exclude: &[String],
        prefix_wildcard: bool,
    ) -> ToolOutput {
        let mut args: Vec<OsString> = vec!["l".into(), archive_path.into()];
        args.extend(filter_args(include, exclude, prefix_wildcard));
        run_tool(NAME, &self.path, &args)
    }
}

impl Extractor for SevenZip {
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
        let include: Vec<String> = inner_file.map(str::to_string).into_iter().collect();
        let output = self.list_details(archive_path, &include, &[], false);

        if output.success() {
            parse_archive_size(&output.stdout)
        } else {
            0
        }
    }

    fn extract(&self, archive_path: &Path, dest: &Path, include: &[String], exclude: &[String]) -> bool {
        let mut args: Vec<OsString> = vec![
            "x".into(),
            archive_path.into(),
            format!("-o{}", dest.display()).into(),
            "-y".into(),
            "-aoa".into(),
            "-bsp1".into(),
        ];
        args.extend(filter_args(include, exclude, false));

        let output = run_tool(NAME, &self.path, &args);
        if output.success() {
            info!("Extracted {} to {}", archive_path.display(), dest.display());
        }
        output.success()
    }

    fn list(&self, archive_path: &Path) -> Vec<String> {
        self.list_filtered(archive_path, &[], &[], false)
    }

    fn list_filtered(
        &self,
        archive_path: &Path,
        include: &[String],
        exclude: &[String],
        prefix_wildcard: bool,
    ) -> Vec<String> {
        let output = self.list_details(archive_path, include, exclude, prefix_wildcard);

        if output.success() {
            parse_file_list(&output.stdout)
        } else {
            error!("Error listing archive {}.", archive_path.display());
            Vec::new()
        }
    }
}

/// Build `-i!` / `-x!` wildcard arguments, with `-r` when any filter is present.
pub fn filter_args(include: &[String], exclude: &[String], prefix_wildcard: bool) -> Vec<OsString> {
    let prefix = if prefix_wildcard { "*" } else { "" };

    let mut args: Vec<OsString> = include
        .iter()
        .map(|i| format!("-i!{}{}", prefix, i).into())
        .chain(exclude.iter().map(|x| format!("-x!{}{}", prefix, x).into()))
        .collect();

    if !args.is_empty() {
        args.push("-r".into());
    }

    args
}

/// Extract file names from the middle section of a listing.
pub fn parse_file_list(stdout: &str) -> Vec<String> {
    let sections: Vec<&str> = stdout.split(LIST_DIVIDER).collect();

    // Header, files, summary. Anything else means no files or an unexpected layout.
    if sections.len() < 3 {
        return Vec::new();
    }

    sections[1]
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match column(line, NAME_COLUMN) {
            Some(name) if !name.trim().is_empty() => Some(name.trim().to_string()),
            _ => {
                error!("Failed to parse file name from 7-Zip listing line {:?}", line);
                None
            }
        })
        .collect()
}

/// Extract the total uncompressed size from a listing's summary line.
pub fn parse_archive_size(stdout: &str) -> u64 {
    let Some(summary) = stdout.rsplit(LIST_DIVIDER).next() else {
        return 0;
    };

    let Some(line) = summary
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .find(|l| !l.trim().is_empty())
    else {
        error!("Failed to parse archive size: listing has no summary line");
        return 0;
    };

    parse_size(line)
}

fn parse_size(line: &str) -> u64 {
    let parsed = column(line, SIZE_COLUMN)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.parse::<u64>().ok());

    match parsed {
        Some(size) => size,
        None => {
            error!("Failed to parse archive size from 7-Zip summary line {:?}", line);
            0
        }
    }
}

/// Slice from a character column, or `None` when the line is shorter.
fn column(line: &str, col: usize) -> Option<&str> {
    if col == 0 {
        return Some(line);
    }
    line.char_indices().nth(col).map(|(idx, _)| &line[idx..])
}
