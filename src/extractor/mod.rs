//! Extraction backends.
//!
//! Every backend exposes the same capability set through [`Extractor`]:
//! name, type support, tool location, decompressed size, extraction and
//! listing. Exactly one backend handles a given archive; which one is decided
//! by [`select_extractor`] from the file type and the emulator/platform policy.
//!
//! | Backend       | Tool           | Types                         |
//! |---------------|----------------|-------------------------------|
//! | 7-Zip         | `7z` / `7zz`   | zip, 7z, rar, gz              |
//! | chdman        | `chdman`       | chd                           |
//! | DolphinTool   | `dolphin-tool` | rvz, gcz, wia                 |
//! | extract-xiso  | `extract-xiso` | iso (Xbox)                    |
//! | Copy          | none           | anything                      |
//!
//! Backends never return errors. A missing tool, a non-zero exit code or
//! unparseable output is logged and surfaces as `false`, `0` or an empty
//! listing, so the worst outcome is a launch without cache benefit.

pub mod chdman;
pub mod copy;
pub mod dolphin;
pub mod sevenzip;
pub mod xiso;

pub use chdman::Chdman;
pub use copy::CopyExtractor;
pub use dolphin::DolphinTool;
pub use sevenzip::SevenZip;
pub use xiso::ExtractXiso;

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, error, warn};

use crate::config::PolicyStore;
use crate::paths;

/// Capability set shared by all extraction backends.
pub trait Extractor {
    /// Display name used in logs and user messages.
    fn name(&self) -> &'static str;

    /// Whether this backend handles the file type of `archive_path`.
    fn supported_type(&self, archive_path: &str) -> bool;

    /// Location of the external tool, or `None` when the backend needs none.
    ///
    /// When the tool can't be found this is the location we expected it at,
    /// so the user can be told where to put it.
    fn extractor_path(&self) -> Option<PathBuf>;

    /// Decompressed size in bytes of the whole archive, or of `inner_file` only.
    fn size(&self, archive_path: &Path, inner_file: Option<&str>) -> u64;

    /// Extract into `dest`, optionally filtered by wildcard include/exclude lists.
    fn extract(&self, archive_path: &Path, dest: &Path, include: &[String], exclude: &[String]) -> bool;

    /// File names inside the archive, in archive order.
    fn list(&self, archive_path: &Path) -> Vec<String>;

    /// Listing filtered by wildcard patterns, matched recursively against file names.
    ///
    /// When `prefix_wildcard` is set every pattern gets a leading `*`, so
    /// `.bin` matches `Track 1.bin`.
    fn list_filtered(
        &self,
        archive_path: &Path,
        include: &[String],
        exclude: &[String],
        prefix_wildcard: bool,
    ) -> Vec<String> {
        let patterns = |list: &[String]| -> Vec<String> {
            list.iter()
                .map(|p| if prefix_wildcard { format!("*{}", p) } else { p.clone() })
                .collect()
        };
        let include = patterns(include);
        let exclude = patterns(exclude);

        self.list(archive_path)
            .into_iter()
            .filter(|f| {
                let name = paths::file_name(f);
                (include.is_empty() || include.iter().any(|p| wildcard_match(p, name)))
                    && !exclude.iter().any(|p| wildcard_match(p, name))
            })
            .collect()
    }

    /// True when the tool is present (or not needed).
    fn tool_exists(&self) -> bool {
        self.extractor_path().map(|p| p.exists()).unwrap_or(true)
    }
}

/// Backend identifiers, in selection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    Chdman,
    DolphinTool,
    ExtractXiso,
    SevenZip,
    Copy,
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtractorKind::Chdman => chdman::NAME,
            ExtractorKind::DolphinTool => dolphin::NAME,
            ExtractorKind::ExtractXiso => xiso::NAME,
            ExtractorKind::SevenZip => sevenzip::NAME,
            ExtractorKind::Copy => copy::NAME,
        })
    }
}

/// Inputs to backend selection for one archive.
struct Selection<'a> {
    archive_path: &'a str,
    key: &'a str,
    policy: &'a PolicyStore,
}

type Rule = (ExtractorKind, fn(&Selection) -> bool);

/// First matching rule wins; 7-Zip is the fallback when nothing matches.
const SELECTION_RULES: &[Rule] = &[
    (ExtractorKind::Chdman, |s| {
        s.policy.get_action(s.key).extracts()
            && s.policy.get_chdman(s.key)
            && chdman::supported_type(s.archive_path)
    }),
    (ExtractorKind::DolphinTool, |s| {
        s.policy.get_action(s.key).extracts()
            && s.policy.get_dolphin_tool(s.key)
            && dolphin::supported_type(s.archive_path)
    }),
    (ExtractorKind::ExtractXiso, |s| {
        s.policy.get_action(s.key).extracts()
            && s.policy.get_extract_xiso(s.key)
            && xiso::supported_type(s.archive_path)
    }),
    (ExtractorKind::SevenZip, |s| {
        s.policy.get_action(s.key).extracts() && sevenzip::supported_type(s.archive_path)
    }),
    (ExtractorKind::Copy, |s| s.policy.get_action(s.key).copies()),
];

/// Pick the backend for an archive under the policy for `key`.
pub fn select_extractor(archive_path: &str, key: &str, policy: &PolicyStore) -> ExtractorKind {
    let selection = Selection {
        archive_path,
        key,
        policy,
    };

    SELECTION_RULES
        .iter()
        .find(|(_, matches)| matches(&selection))
        .map(|(kind, _)| *kind)
        .unwrap_or(ExtractorKind::SevenZip)
}

/// Whether an enabled extracting backend (not the copy fallback) handles this archive.
pub fn has_enabled_extractor(archive_path: &str, key: &str, policy: &PolicyStore) -> bool {
    let selection = Selection {
        archive_path,
        key,
        policy,
    };

    SELECTION_RULES
        .iter()
        .filter(|(kind, _)| *kind != ExtractorKind::Copy)
        .any(|(_, matches)| matches(&selection))
}

impl ExtractorKind {
    /// Construct the backend, resolving its tool through `tools`.
    pub fn build(self, tools: &ToolLocator) -> Box<dyn Extractor> {
        match self {
            ExtractorKind::Chdman => Box::new(Chdman::new(tools)),
            ExtractorKind::DolphinTool => Box::new(DolphinTool::new(tools)),
            ExtractorKind::ExtractXiso => Box::new(ExtractXiso::new(tools)),
            ExtractorKind::SevenZip => Box::new(SevenZip::new(tools)),
            ExtractorKind::Copy => Box::new(CopyExtractor),
        }
    }
}

/// Finds external tool binaries.
///
/// Looks in the following locations, in order:
/// 1. An explicitly configured tools directory
/// 2. `bin/` relative to the executable
/// 3. The executable's own directory
/// 4. System PATH
#[derive(Debug, Clone, Default)]
pub struct ToolLocator {
    tools_dir: Option<PathBuf>,
}

impl ToolLocator {
    pub fn new(tools_dir: Option<PathBuf>) -> Self {
        Self { tools_dir }
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(dir) = &self.tools_dir {
            dirs.push(dir.clone());
        }
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
        {
            dirs.push(exe_dir.join("bin"));
            dirs.push(exe_dir);
        }
        dirs
    }

    /// Resolve the first of `binaries` that exists, or the expected location of the first.
    pub fn locate(&self, binaries: &[&str]) -> PathBuf {
        for dir in self.search_dirs() {
            for binary in binaries {
                let candidate = dir.join(binary);
                if candidate.is_file() {
                    return candidate;
                }
            }
        }

        for binary in binaries {
            if let Ok(path) = which::which(binary) {
                return path;
            }
        }

        let expected_dir = self
            .search_dirs()
            .into_iter()
            .next()
            .unwrap_or_else(|| PathBuf::from("bin"));
        expected_dir.join(binaries.first().copied().unwrap_or_default())
    }
}

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code; -1 when the process could not be started or was killed.
    pub exit_code: i32,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a tool to completion with stdout and stderr captured.
///
/// Blocks until the process exits. Failures are logged, never returned.
pub(crate) fn run_tool(name: &str, program: &Path, args: &[OsString]) -> ToolOutput {
    debug!("{} launched with args {:?}", name, args);

    let output = match Command::new(program).args(args).output() {
        Ok(output) => output,
        Err(e) => {
            error!("Failed to run {} ({}): {}", name, program.display(), e);
            return ToolOutput {
                stderr: e.to_string(),
                exit_code: -1,
                ..ToolOutput::default()
            };
        }
    };

    let result = ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    };

    if !result.success() {
        warn!(
            "{} returned exit code {} with error output:\n{}",
            name,
            result.exit_code,
            result.stderr.trim_end()
        );
    }

    result
}

/// Case-insensitive `*` / `?` wildcard match.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// File stem of an archive path, used to name single-image outputs.
pub(crate) fn archive_stem(archive_path: &Path) -> String {
    archive_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable backend for state and launch tests.

    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    pub struct MockExtractor {
        /// Archive file name → inner file names.
        pub contents: HashMap<String, Vec<String>>,
        /// Archive file name → decompressed size.
        pub sizes: HashMap<String, u64>,
        pub fail_extract: bool,
        pub size_calls: RefCell<Vec<String>>,
        pub list_calls: RefCell<usize>,
        pub extract_calls: RefCell<Vec<(PathBuf, Vec<String>)>>,
    }

    impl MockExtractor {
        pub fn with_archive(mut self, archive: &str, files: &[&str], size: u64) -> Self {
            self.contents
                .insert(archive.to_string(), files.iter().map(|s| s.to_string()).collect());
            self.sizes.insert(archive.to_string(), size);
            self
        }

        fn key(archive_path: &Path) -> String {
            archive_path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        }
    }

    impl Extractor for MockExtractor {
        fn name(&self) -> &'static str {
            "Mock"
        }

        fn supported_type(&self, _archive_path: &str) -> bool {
            true
        }

        fn extractor_path(&self) -> Option<PathBuf> {
            None
        }

        fn size(&self, archive_path: &Path, _inner_file: Option<&str>) -> u64 {
            let key = Self::key(archive_path);
            self.size_calls.borrow_mut().push(key.clone());
            self.sizes.get(&key).copied().unwrap_or(0)
        }

        fn extract(&self, archive_path: &Path, dest: &Path, include: &[String], _exclude: &[String]) -> bool {
            self.extract_calls
                .borrow_mut()
                .push((archive_path.to_path_buf(), include.to_vec()));
            if self.fail_extract {
                // Leave a partial payload behind, like an interrupted tool would
                let _ = std::fs::create_dir_all(dest);
                let _ = std::fs::write(dest.join("partial.tmp"), b"x");
                return false;
            }

            let files = self.contents.get(&Self::key(archive_path)).cloned().unwrap_or_default();
            for file in files {
                if !include.is_empty() && !include.contains(&file) {
                    continue;
                }
                let target = dest.join(&file);
                if let Some(parent) = target.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let _ = std::fs::write(target, b"payload");
            }
            true
        }

        fn list(&self, archive_path: &Path) -> Vec<String> {
            *self.list_calls.borrow_mut() += 1;
            self.contents.get(&Self::key(archive_path)).cloned().unwrap_or_default()
        }
    }
}
