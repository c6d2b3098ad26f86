//! Game descriptor persisted in every cache entry.
//!
//! A fresh [`GameRecord`] is built from frontend data at the start of each
//! launch. If the target cache entry already has a descriptor, that copy is
//! loaded and merged in before the record is written back. The descriptor's
//! existence is what marks an entry as a cache hit, so it is only ever written
//! after the payload is complete.
//!
//! ```text
//! [Game]
//! GameId = 5f1c...
//! ArchivePath = "/roms/psx/Final Fantasy VII (Disc 1).chd"
//! ...
//!
//! [Disc 1]
//! ArchivePath = "/roms/psx/Final Fantasy VII (Disc 1).chd"
//! ```

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{format_bool, parse_bool, quote, IniStore, StoreError};

const GAME_SECTION: &str = "Game";
const DISC_SECTION_PREFIX: &str = "Disc ";

/// Errors reading a descriptor file.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Descriptor value {key} = {value:?} is not valid")]
    InvalidValue { key: String, value: String },
}

/// One disc of a multi-disc game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscInfo {
    pub disc: u32,
    pub archive_path: String,
}

/// Everything known about one launched game.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: String,
    pub archive_path: String,
    pub emulator: String,
    pub platform: String,
    pub title: String,
    pub version: String,
    /// File inside the archive the user picked, if any.
    pub selected_file: Option<String>,
    /// The frontend itself would build an m3u for this emulator/platform.
    pub emulator_platform_m3u: bool,
    pub multi_disc: bool,
    pub total_discs: u32,
    pub selected_disc: Option<u32>,
    pub discs: Vec<DiscInfo>,
    pub decompressed_size: Option<u64>,
    pub last_used: Option<DateTime<Utc>>,
}

impl GameRecord {
    pub fn new(id: impl Into<String>, archive_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            archive_path: archive_path.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, DescriptorError> {
        let ini = IniStore::load(path)?;
        Self::from_ini(&ini)
    }

    pub fn from_ini(ini: &IniStore) -> Result<Self, DescriptorError> {
        let get = |key: &str| ini.get_value(GAME_SECTION, key).unwrap_or_default().to_string();
        let non_empty = |key: &str| Some(get(key)).filter(|v| !v.is_empty());

        let mut record = Self {
            id: ini.require(GAME_SECTION, "GameId")?.to_string(),
            archive_path: ini.require(GAME_SECTION, "ArchivePath")?.to_string(),
            emulator: get("Emulator"),
            platform: get("Platform"),
            title: get("Title"),
            version: get("Version"),
            selected_file: non_empty("SelectedFile"),
            emulator_platform_m3u: parse_flag(ini, "EmulatorPlatformM3u")?,
            multi_disc: parse_flag(ini, "MultiDisc")?,
            total_discs: parse_number(ini, "TotalDiscs")?.unwrap_or(0),
            selected_disc: parse_number(ini, "SelectedDisc")?,
            discs: Vec::new(),
            decompressed_size: parse_number(ini, "DecompressedSize")?,
            last_used: None,
        };

        if let Some(value) = non_empty("LastUsed") {
            let parsed = DateTime::parse_from_rfc3339(&value).map_err(|_| DescriptorError::InvalidValue {
                key: "LastUsed".to_string(),
                value: value.clone(),
            })?;
            record.last_used = Some(parsed.with_timezone(&Utc));
        }

        for section in ini.sections() {
            let Some(number) = section.strip_prefix(DISC_SECTION_PREFIX) else {
                continue;
            };
            let disc = number.trim().parse().map_err(|_| DescriptorError::InvalidValue {
                key: "Disc".to_string(),
                value: section.to_string(),
            })?;
            record.discs.push(DiscInfo {
                disc,
                archive_path: ini.require(section, "ArchivePath")?.to_string(),
            });
        }
        record.discs.sort_by_key(|d| d.disc);

        Ok(record)
    }

    pub fn to_ini(&self) -> IniStore {
        let mut ini = IniStore::new();
        let mut set = |key: &str, value: String| ini.set_value(GAME_SECTION, key, value);

        set("GameId", self.id.clone());
        set("ArchivePath", quote(&self.archive_path));
        set("Emulator", quote(&self.emulator));
        set("Platform", quote(&self.platform));
        set("Title", quote(&self.title));
        set("Version", quote(&self.version));
        set("SelectedFile", quote(self.selected_file.as_deref().unwrap_or_default()));
        set("EmulatorPlatformM3u", format_bool(self.emulator_platform_m3u).to_string());
        set("MultiDisc", format_bool(self.multi_disc).to_string());
        set("TotalDiscs", self.total_discs.to_string());
        if let Some(disc) = self.selected_disc {
            set("SelectedDisc", disc.to_string());
        }
        if let Some(size) = self.decompressed_size {
            set("DecompressedSize", size.to_string());
        }
        if let Some(last_used) = self.last_used {
            set("LastUsed", last_used.to_rfc3339());
        }

        for disc in &self.discs {
            ini.set_value(
                &format!("{}{}", DISC_SECTION_PREFIX, disc.disc),
                "ArchivePath",
                quote(&disc.archive_path),
            );
        }

        ini
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        self.to_ini().save(path)
    }

    /// Adopt what an existing cache entry already knows about this game.
    ///
    /// Identity fields stay as freshly observed. Size and last use come from
    /// the cached copy; the selection only when none was made this launch.
    pub fn merge_cache_info(&mut self, cached: &GameRecord) {
        if cached.decompressed_size.is_some() {
            self.decompressed_size = cached.decompressed_size;
        }
        if self.selected_file.is_none() {
            self.selected_file = cached.selected_file.clone();
        }
        if self.last_used.is_none() {
            self.last_used = cached.last_used;
        }
    }

    pub fn disc(&self, disc: u32) -> Option<&DiscInfo> {
        self.discs.iter().find(|d| d.disc == disc)
    }
}

fn parse_flag(ini: &IniStore, key: &str) -> Result<bool, DescriptorError> {
    match ini.get_value(GAME_SECTION, key) {
        None | Some("") => Ok(false),
        Some(value) => parse_bool(value).map_err(|_| DescriptorError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(ini: &IniStore, key: &str) -> Result<Option<T>, DescriptorError> {
    match ini.get_value(GAME_SECTION, key) {
        None | Some("") => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DescriptorError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    fn ff7() -> GameRecord {
        GameRecord {
            id: "5f1c2a".to_string(),
            archive_path: "/roms/psx/Final Fantasy VII (Disc 1).chd".to_string(),
            emulator: "RetroArch".to_string(),
            platform: "Sony Playstation".to_string(),
            title: "Final Fantasy VII".to_string(),
            version: "(USA)".to_string(),
            selected_file: None,
            emulator_platform_m3u: true,
            multi_disc: true,
            total_discs: 2,
            selected_disc: Some(1),
            discs: vec![
                DiscInfo {
                    disc: 1,
                    archive_path: "/roms/psx/Final Fantasy VII (Disc 1).chd".to_string(),
                },
                DiscInfo {
                    disc: 2,
                    archive_path: "/roms/psx/Final Fantasy VII (Disc 2).chd".to_string(),
                },
            ],
            decompressed_size: Some(681_574_400),
            last_used: Some(DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc)),
        }
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("game.ini");
        let record = ff7();

        record.save(&path)?;
        assert_eq!(GameRecord::load(&path)?, record);
        Ok(())
    }

    #[test]
    fn test_minimal_descriptor() -> Result<()> {
        let ini = IniStore::parse("[Game]\nGameId = abc\nArchivePath = \"/roms/doom.zip\"\n", Path::new("game.ini"))?;
        let record = GameRecord::from_ini(&ini)?;

        assert_eq!(record.archive_path, "/roms/doom.zip");
        assert_eq!(record.selected_file, None);
        assert_eq!(record.decompressed_size, None);
        assert!(!record.multi_disc);
        Ok(())
    }

    #[test]
    fn test_corrupt_descriptor() -> Result<()> {
        let missing_path = IniStore::parse("[Game]\nGameId = abc\n", Path::new("game.ini"))?;
        assert!(GameRecord::from_ini(&missing_path).is_err());

        let bad_size = IniStore::parse(
            "[Game]\nGameId = abc\nArchivePath = x.zip\nDecompressedSize = lots\n",
            Path::new("game.ini"),
        )?;
        assert!(matches!(
            GameRecord::from_ini(&bad_size),
            Err(DescriptorError::InvalidValue { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_merge_keeps_identity_and_adopts_cache_fields() {
        let mut fresh = GameRecord::new("5f1c2a", "/roms/moved/Final Fantasy VII (Disc 1).chd");
        fresh.title = "Final Fantasy VII (Renamed)".to_string();

        let mut cached = ff7();
        cached.selected_file = Some("Final Fantasy VII (Disc 1).cue".to_string());
        fresh.merge_cache_info(&cached);

        assert_eq!(fresh.archive_path, "/roms/moved/Final Fantasy VII (Disc 1).chd");
        assert_eq!(fresh.title, "Final Fantasy VII (Renamed)");
        assert_eq!(fresh.decompressed_size, Some(681_574_400));
        assert_eq!(fresh.selected_file.as_deref(), Some("Final Fantasy VII (Disc 1).cue"));
        assert_eq!(fresh.last_used, cached.last_used);
    }

    #[test]
    fn test_merge_prefers_fresh_selection() {
        let mut fresh = GameRecord::new("id", "a.zip");
        fresh.selected_file = Some("b.bin".to_string());
        let mut cached = GameRecord::new("id", "a.zip");
        cached.selected_file = Some("a.bin".to_string());

        fresh.merge_cache_info(&cached);
        assert_eq!(fresh.selected_file.as_deref(), Some("b.bin"));
    }
}
