//! Path helpers for archive classification and cache layout.
//!
//! Frontends hand us Windows-style paths as often as native ones, so the
//! string helpers here accept both `\` and `/` separators.

use std::path::{Component, Path, PathBuf};

use crate::hash;

/// Descriptor file written into every cache entry once its payload is complete.
pub const DESCRIPTOR_FILE: &str = "game.ini";

/// Archive types 7-Zip can list and extract selectively.
pub const COMPRESSED_ARCHIVE_EXTENSIONS: &[&str] = &[".zip", ".7z", ".rar", ".gz", ".gzip"];

/// Archive types the host frontend extracts itself and must never be redirected.
pub const FRONTEND_ARCHIVE_EXTENSIONS: &[&str] = &[".zip", ".7z", ".rar"];

/// Convert Windows path separators to forward slashes
pub fn to_forward_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Normalize a path for lookups and comparisons (lowercase, forward slashes, trimmed)
pub fn normalize_for_lookup(path: &str) -> String {
    path.to_lowercase()
        .replace('\\', "/")
        .trim_matches('/')
        .to_string()
}

/// Get the filename from a path (handles both / and \)
pub fn file_name(path: &str) -> &str {
    path.rfind(['\\', '/'])
        .map(|idx| &path[idx + 1..])
        .unwrap_or(path)
}

/// Lowercase extension including the leading dot, e.g. `.bin`.
///
/// Returns an empty string for names without an extension.
pub fn extension(path: &str) -> String {
    let name = file_name(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_lowercase(),
        _ => String::new(),
    }
}

/// Case-insensitive extension match. Entries may be given with or without a dot.
pub fn has_extension<S: AsRef<str>>(path: &str, extensions: &[S]) -> bool {
    let ext = extension(path);
    !ext.is_empty()
        && extensions
            .iter()
            .any(|e| normalize_extension(e.as_ref()) == ext)
}

/// `"BIN"`, `"bin"` and `".bin"` all become `".bin"`.
pub fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.is_empty() || ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

/// Parse a comma-separated extension list (`"nfo, txt"`) into `[".nfo", ".txt"]`.
pub fn parse_extension_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(normalize_extension)
        .filter(|e| !e.is_empty())
        .collect()
}

/// Whether 7-Zip can partially extract this file type.
pub fn is_compressed_archive(path: &str) -> bool {
    has_extension(path, COMPRESSED_ARCHIVE_EXTENSIONS)
}

/// Check a configured cache path before we start deleting things under it.
///
/// Rejects empty paths, filesystem roots, and anything that climbs out with `..`.
pub fn is_path_safe(path: &str) -> bool {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed.contains('\0') {
        return false;
    }

    let native = PathBuf::from(to_forward_slashes(trimmed));
    let mut normal_parts = 0;
    for component in native.components() {
        match component {
            Component::ParentDir => return false,
            Component::Normal(_) => normal_parts += 1,
            _ => {}
        }
    }

    // "C:" or "C:/" arrive as a single normal component on unix
    let drive_root = trimmed.len() <= 3 && trimmed.as_bytes().get(1) == Some(&b':');

    normal_parts > 0 && !drive_root
}

/// Resolve a configured (possibly relative) cache path against a base directory.
pub fn resolve_against(base: &Path, configured: &str) -> PathBuf {
    let configured = PathBuf::from(to_forward_slashes(configured.trim()));
    if configured.is_absolute() {
        configured
    } else {
        base.join(configured)
    }
}

/// Deterministic cache directory for an archive.
///
/// Readable stem plus a hash of the normalized source path, so two archives
/// with the same file name in different folders never share an entry.
pub fn archive_cache_dir(cache_root: &Path, archive_path: &str) -> PathBuf {
    cache_root.join(archive_cache_dir_name(archive_path))
}

pub fn archive_cache_dir_name(archive_path: &str) -> String {
    let name = file_name(archive_path);
    let stem = match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    };
    let stem: String = sanitize_file_name(stem).chars().take(64).collect();

    format!("{}-{}", stem.trim(), hash::path_key(&normalize_for_lookup(archive_path)))
}

/// Replace characters that aren't safe in a file name on every platform with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || " ()[]-_.,'&!".contains(c) { c } else { '_' })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Path of the descriptor file inside a cache entry.
pub fn descriptor_path(entry_dir: &Path) -> PathBuf {
    entry_dir.join(DESCRIPTOR_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_for_lookup("Roms\\PSX\\Doom.ZIP"), "roms/psx/doom.zip");
        assert_eq!(normalize_for_lookup("/foo/bar/"), "foo/bar");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("C:\\Roms\\game.bin"), "game.bin");
        assert_eq!(file_name("game.bin"), "game.bin");
        assert_eq!(file_name("roms/psx/game.bin"), "game.bin");
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("Doom (USA).CUE"), ".cue");
        assert_eq!(extension("dir\\eboot.bin"), ".bin");
        assert_eq!(extension("noext"), "");
        assert_eq!(extension(".hidden"), "");
    }

    #[test]
    fn test_has_extension() {
        assert!(has_extension("game.ZIP", &[".zip", ".7z"]));
        assert!(has_extension("game.chd", &["chd"]));
        assert!(!has_extension("game.iso", &[".zip"]));
        assert!(!has_extension("noext", &[".zip"]));
    }

    #[test]
    fn test_parse_extension_list() {
        assert_eq!(parse_extension_list("nfo, TXT,.dat,"), vec![".nfo", ".txt", ".dat"]);
    }

    #[test]
    fn test_is_path_safe() {
        assert!(is_path_safe("ArchiveCache"));
        assert!(is_path_safe("/home/user/.cache/archive-cache"));
        assert!(is_path_safe("D:\\Cache"));
        assert!(!is_path_safe(""));
        assert!(!is_path_safe("   "));
        assert!(!is_path_safe("/"));
        assert!(!is_path_safe("C:\\"));
        assert!(!is_path_safe("../outside"));
        assert!(!is_path_safe("cache/../../etc"));
    }

    #[test]
    fn test_archive_cache_dir_is_deterministic() {
        let a = archive_cache_dir_name("C:\\Roms\\Doom (USA).zip");
        let b = archive_cache_dir_name("c:/roms/doom (usa).zip");
        let c = archive_cache_dir_name("C:\\Other\\Doom (USA).zip");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("Doom (USA)-"));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("Final Fantasy VII: Disc 1/3"), "Final Fantasy VII_ Disc 1_3");
        assert_eq!(sanitize_file_name(" Doom? "), "Doom_");
    }
}
