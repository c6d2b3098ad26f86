//! DolphinTool backend for compressed GameCube/Wii images (rvz, gcz, wia).
//!
//! Images are converted back to a plain `.iso`. DolphinTool doesn't report
//! the uncompressed size, so it's derived from the platform: GameCube and
//! Wii discs have fixed sizes per format.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use super::{archive_stem, run_tool, Extractor, ToolLocator};
use crate::paths;

pub const NAME: &str = "DolphinTool";

const BINARIES: &[&str] = &["dolphin-tool", "DolphinTool", "DolphinTool.exe"];

const SUPPORTED_EXTENSIONS: &[&str] = &[".rvz", ".gcz", ".wia"];

/// Full-size GameCube disc image.
pub const GAMECUBE_DISC_SIZE: u64 = 1_459_978_240;

/// Single-layer Wii disc image.
pub const WII_SINGLE_LAYER_SIZE: u64 = 4_699_979_776;

/// Dual-layer Wii disc image.
pub const WII_DUAL_LAYER_SIZE: u64 = 8_511_160_320;

pub fn supported_type(archive_path: &str) -> bool {
    paths::has_extension(archive_path, SUPPORTED_EXTENSIONS)
}

#[derive(Debug, Clone)]
pub struct DolphinTool {
    path: PathBuf,
}

impl DolphinTool {
    pub fn new(tools: &ToolLocator) -> Self {
        Self {
            path: tools.locate(BINARIES),
        }
    }

    fn iso_name(archive_path: &Path) -> String {
        format!("{}.iso", archive_stem(archive_path))
    }
}

impl Extractor for DolphinTool {
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
        let args: Vec<OsString> = vec!["header".into(), "-i".into(), archive_path.into()];
        let output = run_tool(NAME, &self.path, &args);
        if !output.success() {
            return 0;
        }

        let size = estimate_disc_size(&output.stdout);
        if size == 0 {
            error!("Failed to determine disc size of {}", archive_path.display());
        }
        size
    }

    fn extract(&self, archive_path: &Path, dest: &Path, _include: &[String], _exclude: &[String]) -> bool {
        if let Err(e) = std::fs::create_dir_all(dest) {
            error!("Failed to create {}: {}", dest.display(), e);
            return false;
        }

        let args: Vec<OsString> = vec![
            "convert".into(),
            "-i".into(),
            archive_path.into(),
            "-o".into(),
            dest.join(Self::iso_name(archive_path)).into(),
            "-f".into(),
            "iso".into(),
        ];

        let output = run_tool(NAME, &self.path, &args);
        if output.success() {
            info!("Converted {} to {}", archive_path.display(), dest.display());
        }
        output.success()
    }

    fn list(&self, archive_path: &Path) -> Vec<String> {
        vec![Self::iso_name(archive_path)]
    }
}

/// Estimate the plain image size from `DolphinTool header` output.
///
/// The first letter of the game ID identifies the console: `G`, `D`, `P`
/// and `U` are GameCube, everything else is Wii. Wii titles known to ship
/// on dual-layer discs report a block count above the single-layer limit.
pub fn estimate_disc_size(header: &str) -> u64 {
    let field = |name: &str| {
        header.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
    };

    let Some(game_id) = field("Game ID").filter(|id| !id.is_empty()) else {
        return 0;
    };

    match game_id.chars().next() {
        Some('G' | 'D' | 'P' | 'U') => GAMECUBE_DISC_SIZE,
        _ => {
            let blocks = field("Block Count").and_then(|b| b.parse::<u64>().ok());
            match blocks {
                Some(b) if b.saturating_mul(0x8000) > WII_SINGLE_LAYER_SIZE => WII_DUAL_LAYER_SIZE,
                _ => WII_SINGLE_LAYER_SIZE,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gamecube_size() {
        let header = "Internal Name: THE LEGEND OF ZELDA The Wind Waker\nGame ID: GZLE01\nRevision: 0\n";
        assert_eq!(estimate_disc_size(header), GAMECUBE_DISC_SIZE);
    }

    #[test]
    fn test_wii_size() {
        let header = "Internal Name: SUPER MARIO GALAXY\nGame ID: RMGE01\n";
        assert_eq!(estimate_disc_size(header), WII_SINGLE_LAYER_SIZE);

        let dual = "Game ID: RSBE01\nBlock Count: 250000\n";
        assert_eq!(estimate_disc_size(dual), WII_DUAL_LAYER_SIZE);
    }

    #[test]
    fn test_unparseable_header() {
        assert_eq!(estimate_disc_size(""), 0);
        assert_eq!(estimate_disc_size("Game ID:\n"), 0);
    }

    #[test]
    fn test_list_is_single_iso() {
        let tool = DolphinTool::new(&ToolLocator::default());
        assert_eq!(tool.list(Path::new("/roms/Metroid Prime.rvz")), vec!["Metroid Prime.iso"]);
        assert!(supported_type("x.WIA"));
        assert!(!supported_type("x.iso"));
    }
}
