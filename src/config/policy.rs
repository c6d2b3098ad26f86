//! Per emulator/platform extraction policy.

use std::fmt;
use std::str::FromStr;

use crate::paths;

/// What to do with the launched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Extract supported archives into the cache.
    #[default]
    Extract,
    /// Copy the file into the cache as-is.
    Copy,
    /// Extract when a backend supports the type, otherwise copy.
    ExtractCopy,
}

impl Action {
    pub fn extracts(self) -> bool {
        matches!(self, Action::Extract | Action::ExtractCopy)
    }

    pub fn copies(self) -> bool {
        matches!(self, Action::Copy | Action::ExtractCopy)
    }
}

/// Where the emulator is pointed after the cache is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchPath {
    /// The cache entry directory itself.
    #[default]
    Default,
    /// A subdirectory of the entry named after the game title.
    Title,
    /// A subdirectory of the entry named after the platform.
    Platform,
    /// A subdirectory of the entry named after the emulator.
    Emulator,
}

/// How the generated m3u playlist of a multi-disc game is named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum M3uName {
    #[default]
    GameId,
    TitleVersion,
    DiscOneFilename,
}

/// Case-insensitive parse error for the policy enums.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{value:?} is not a valid {kind}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => stringify!($variant),)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                $ty::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| ParseEnumError {
                        kind: stringify!($ty),
                        value: s.to_string(),
                    })
            }
        }
    };
}

text_enum!(Action { Extract, Copy, ExtractCopy });
text_enum!(LaunchPath { Default, Title, Platform, Emulator });
text_enum!(M3uName { GameId, TitleVersion, DiscOneFilename });

/// Priority hints used when an archive holds several launchable files.
///
/// Disc metadata / table-of-contents types come before disc data types.
pub const DEFAULT_FILENAME_PRIORITY: &str = "mds, gdi, cue, eboot.bin";

/// Policy for one `"<emulator> \ <platform>"` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    /// Ordered name or extension hints, highest priority first.
    pub filename_priority: Vec<String>,
    pub action: Action,
    pub launch_path: LaunchPath,
    pub multi_disc: bool,
    pub m3u_name: M3uName,
    pub smart_extract: bool,
    /// Enable the chdman backend for `.chd` images.
    pub chdman: bool,
    /// Enable the DolphinTool backend for GameCube/Wii images.
    pub dolphin_tool: bool,
    /// Enable the extract-xiso backend for Xbox images.
    pub extract_xiso: bool,
}

impl Default for PolicyEntry {
    fn default() -> Self {
        Self {
            filename_priority: parse_priority_list(DEFAULT_FILENAME_PRIORITY),
            action: Action::default(),
            launch_path: LaunchPath::default(),
            multi_disc: true,
            m3u_name: M3uName::default(),
            smart_extract: true,
            chdman: false,
            dolphin_tool: false,
            extract_xiso: false,
        }
    }
}

/// Split `"mds, gdi, cue"` into ordered hints. Hints keep their casing but lose whitespace.
pub fn parse_priority_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn format_priority_list(list: &[String]) -> String {
    list.join(", ")
}

/// Pick the file to launch from an archive listing.
///
/// Hints are tried in order; a hint matches a file whose name equals it
/// (`eboot.bin`) or whose extension equals it (`cue`). Falls back to the
/// first listed file.
pub fn choose_by_priority<'a>(files: &'a [String], priority: &[String]) -> Option<&'a str> {
    for hint in priority {
        let hint_lower = hint.to_lowercase();
        let hint_ext = paths::normalize_extension(&hint_lower);

        let found = files.iter().find(|f| {
            let name = paths::file_name(f).to_lowercase();
            name == hint_lower || paths::extension(&name) == hint_ext
        });

        if let Some(file) = found {
            return Some(file.as_str());
        }
    }

    files.first().map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_text_roundtrip() {
        for action in Action::ALL {
            assert_eq!(action.to_string().parse::<Action>().unwrap(), *action);
        }
        for mode in LaunchPath::ALL {
            assert_eq!(mode.to_string().parse::<LaunchPath>().unwrap(), *mode);
        }
        for mode in M3uName::ALL {
            assert_eq!(mode.to_string().parse::<M3uName>().unwrap(), *mode);
        }
    }

    #[test]
    fn test_enum_parse_is_case_insensitive() {
        assert_eq!("extractcopy".parse::<Action>().unwrap(), Action::ExtractCopy);
        assert_eq!(" Title ".parse::<LaunchPath>().unwrap(), LaunchPath::Title);
        assert!("Shred".parse::<Action>().is_err());
    }

    #[test]
    fn test_action_flags() {
        assert!(Action::Extract.extracts() && !Action::Extract.copies());
        assert!(!Action::Copy.extracts() && Action::Copy.copies());
        assert!(Action::ExtractCopy.extracts() && Action::ExtractCopy.copies());
    }

    #[test]
    fn test_choose_by_priority() {
        let files: Vec<String> = ["Doom (Track 1).bin", "Doom (Track 2).bin", "Doom.cue"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let default = parse_priority_list(DEFAULT_FILENAME_PRIORITY);
        assert_eq!(choose_by_priority(&files, &default), Some("Doom.cue"));

        let bin_first = parse_priority_list("bin, iso");
        assert_eq!(choose_by_priority(&files, &bin_first), Some("Doom (Track 1).bin"));

        let none = parse_priority_list("gdi");
        assert_eq!(choose_by_priority(&files, &none), Some("Doom (Track 1).bin"));
        assert_eq!(choose_by_priority(&[], &none), None);
    }

    #[test]
    fn test_choose_by_exact_name() {
        let files = vec!["PSP_GAME/SYSDIR/EBOOT.BIN".to_string(), "PSP_GAME/ICON0.PNG".to_string()];
        let priority = parse_priority_list("eboot.bin");
        assert_eq!(choose_by_priority(&files, &priority), Some("PSP_GAME/SYSDIR/EBOOT.BIN"));
    }
}
