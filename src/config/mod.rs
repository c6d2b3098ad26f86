//! Policy store: global settings plus per emulator/platform policy.
//!
//! The store file has one reserved section for global settings and one
//! section per `"<emulator> \ <platform>"` key:
//!
//! ```text
//! [Archive Cache Manager]
//! CachePath = ArchiveCache
//! CacheSize = 20000
//! MinArchiveSize = 100
//!
//! [All \ All]
//! FilenamePriority = mds, gdi, cue, eboot.bin
//! Action = Extract
//! ...
//! ```
//!
//! Every lookup resolves exact key → `All \ All` → compiled-in default, so
//! callers never handle a missing policy. Loading never fails either: bad
//! values are corrected (or the whole file replaced by defaults) and the
//! effective configuration is written straight back to disk.

mod policy;

pub use policy::{
    choose_by_priority, format_priority_list, parse_priority_list, Action, LaunchPath, M3uName,
    ParseEnumError, PolicyEntry, DEFAULT_FILENAME_PRIORITY,
};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{error, info, warn};

use crate::paths;
use crate::store::{format_bool, parse_bool, IniStore, StoreError};

/// Name of the policy store file inside the config directory.
pub const CONFIG_FILE: &str = "archive-cache.ini";

/// Reserved section holding global settings.
pub const GLOBAL_SECTION: &str = "Archive Cache Manager";

/// Wildcard policy key consulted when an exact key is missing.
pub const DEFAULT_POLICY_KEY: &str = r"All \ All";

pub const DEFAULT_CACHE_PATH: &str = "ArchiveCache";
pub const DEFAULT_CACHE_SIZE_MB: i64 = 20000;
pub const DEFAULT_MIN_ARCHIVE_SIZE_MB: i64 = 100;

/// File types playable without sibling files from the same archive.
pub const DEFAULT_STANDALONE_EXTENSIONS: &str =
    "gb, gbc, gba, agb, nes, fds, smc, sfc, n64, z64, v64, ndd, md, smd, gen, iso, chd, rvn, gg, gcm, 32x, bin";

/// File types an emulator never needs to run a game.
pub const DEFAULT_METADATA_EXTENSIONS: &str = "nfo, txt, dat, xml, json";

/// Build the policy key for an emulator/platform pair.
pub fn policy_key(emulator: &str, platform: &str) -> String {
    format!(r"{} \ {}", emulator, platform)
}

/// Settings from the reserved global section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSettings {
    /// Cache root, absolute or relative to the config directory.
    pub cache_path: String,
    /// Cache size ceiling in megabytes.
    pub cache_size_mb: i64,
    /// Archives smaller than this (in megabytes) are never cached.
    pub min_archive_size_mb: i64,
    pub standalone_extensions: Vec<String>,
    pub metadata_extensions: Vec<String>,
    /// Redirect the frontend's application path even for types it extracts itself.
    pub bypass_path_check: bool,
    /// Unset until the user answers the update prompt.
    pub update_check: Option<bool>,
    pub skip_update: Option<String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            cache_path: DEFAULT_CACHE_PATH.to_string(),
            cache_size_mb: DEFAULT_CACHE_SIZE_MB,
            min_archive_size_mb: DEFAULT_MIN_ARCHIVE_SIZE_MB,
            standalone_extensions: paths::parse_extension_list(DEFAULT_STANDALONE_EXTENSIONS),
            metadata_extensions: paths::parse_extension_list(DEFAULT_METADATA_EXTENSIONS),
            bypass_path_check: false,
            update_check: None,
            skip_update: None,
        }
    }
}

impl GlobalSettings {
    pub fn cache_size_bytes(&self) -> u64 {
        mb_to_bytes(self.cache_size_mb)
    }

    pub fn min_archive_size_bytes(&self) -> u64 {
        mb_to_bytes(self.min_archive_size_mb)
    }
}

fn mb_to_bytes(mb: i64) -> u64 {
    (mb.max(0) as u64).saturating_mul(1024 * 1024)
}

/// Errors that make a loaded policy file unusable.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("[{section}] {key} = {value:?} is not valid: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

/// Loaded global settings and policies, bound to the file they came from.
#[derive(Debug, Clone)]
pub struct PolicyStore {
    path: PathBuf,
    global: GlobalSettings,
    policies: BTreeMap<String, PolicyEntry>,
}

impl PolicyStore {
    /// Compiled-in defaults, bound to `path` but not written.
    pub fn with_defaults(path: impl Into<PathBuf>) -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(DEFAULT_POLICY_KEY.to_string(), PolicyEntry::default());
        policies.insert(
            policy_key("PCSX2", "Sony Playstation 2"),
            PolicyEntry {
                filename_priority: parse_priority_list("bin, iso"),
                ..PolicyEntry::default()
            },
        );

        Self {
            path: path.into(),
            global: GlobalSettings::default(),
            policies,
        }
    }

    /// Load the store from `path`, correcting and re-saving as needed.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut needs_save = false;

        let mut store = if path.exists() {
            match Self::parse_file(&path) {
                Ok((store, complete)) => {
                    needs_save |= !complete;
                    store
                }
                Err(e) => {
                    error!("Error parsing config file {}: {}. Using default config.", path.display(), e);
                    needs_save = true;
                    Self::with_defaults(&path)
                }
            }
        } else {
            info!("Config file {} does not exist, using default config.", path.display());
            needs_save = true;
            Self::with_defaults(&path)
        };

        needs_save |= store.validate();

        if needs_save {
            if let Err(e) = store.save() {
                error!("Error saving config file to {}: {}", store.path.display(), e);
            }
        }

        store
    }

    /// Parse a store file. The flag is false when fields were missing and
    /// defaults were filled in, meaning the file should be rewritten.
    fn parse_file(path: &Path) -> Result<(Self, bool), PolicyError> {
        let ini = IniStore::load(path)?;
        let mut store = Self {
            path: path.to_path_buf(),
            global: GlobalSettings::default(),
            policies: BTreeMap::new(),
        };
        let mut complete = ini.has_section(GLOBAL_SECTION);

        for section in ini.sections() {
            let mut reader = SectionReader {
                ini: &ini,
                section,
                complete: &mut complete,
            };

            if section == GLOBAL_SECTION {
                let defaults = GlobalSettings::default();
                store.global = GlobalSettings {
                    cache_path: reader.text("CachePath", defaults.cache_path),
                    cache_size_mb: reader.parsed("CacheSize", defaults.cache_size_mb)?,
                    min_archive_size_mb: reader.parsed("MinArchiveSize", defaults.min_archive_size_mb)?,
                    standalone_extensions: reader
                        .optional("StandaloneExtensions")
                        .map(paths::parse_extension_list)
                        .unwrap_or(defaults.standalone_extensions),
                    metadata_extensions: reader
                        .optional("MetadataExtensions")
                        .map(paths::parse_extension_list)
                        .unwrap_or(defaults.metadata_extensions),
                    bypass_path_check: reader.flag("BypassPathCheck", defaults.bypass_path_check)?,
                    update_check: reader.optional("UpdateCheck").map(parse_bool).transpose().map_err(
                        |reason| reader.invalid("UpdateCheck", reason),
                    )?,
                    skip_update: reader
                        .optional("SkipUpdate")
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                };
            } else {
                let defaults = PolicyEntry::default();
                let entry = PolicyEntry {
                    filename_priority: reader
                        .optional_or_flag("FilenamePriority")
                        .map(parse_priority_list)
                        .unwrap_or(defaults.filename_priority),
                    action: reader.parsed("Action", defaults.action)?,
                    launch_path: reader.parsed("LaunchPath", defaults.launch_path)?,
                    multi_disc: reader.flag("MultiDisc", defaults.multi_disc)?,
                    m3u_name: reader.parsed("M3uName", defaults.m3u_name)?,
                    smart_extract: reader.flag("SmartExtract", defaults.smart_extract)?,
                    chdman: reader.flag("Chdman", defaults.chdman)?,
                    dolphin_tool: reader.flag("DolphinTool", defaults.dolphin_tool)?,
                    extract_xiso: reader.flag("ExtractXiso", defaults.extract_xiso)?,
                };
                store.policies.insert(section.to_string(), entry);
            }
        }

        if !store.policies.contains_key(DEFAULT_POLICY_KEY) {
            info!("Config has no [{}] section, adding default policy.", DEFAULT_POLICY_KEY);
            store
                .policies
                .insert(DEFAULT_POLICY_KEY.to_string(), PolicyEntry::default());
            complete = false;
        }

        Ok((store, complete))
    }

    /// Replace out-of-range global values with defaults. Returns true if anything changed.
    fn validate(&mut self) -> bool {
        let mut corrected = false;

        if !paths::is_path_safe(&self.global.cache_path) {
            warn!(
                "Config CachePath can not be set to \"{}\", using default ({}).",
                self.global.cache_path, DEFAULT_CACHE_PATH
            );
            self.global.cache_path = DEFAULT_CACHE_PATH.to_string();
            corrected = true;
        }

        if self.global.cache_size_mb <= 0 {
            warn!(
                "Config CacheSize can not be less than or equal 0, using default ({}).",
                DEFAULT_CACHE_SIZE_MB
            );
            self.global.cache_size_mb = DEFAULT_CACHE_SIZE_MB;
            corrected = true;
        }

        if self.global.min_archive_size_mb < 0 {
            warn!(
                "Config MinArchiveSize can not be less than 0, using default ({}).",
                DEFAULT_MIN_ARCHIVE_SIZE_MB
            );
            self.global.min_archive_size_mb = DEFAULT_MIN_ARCHIVE_SIZE_MB;
            corrected = true;
        }

        corrected
    }

    /// Write every field of every policy plus the global section.
    pub fn save(&self) -> Result<(), StoreError> {
        let mut ini = IniStore::new();
        let g = &self.global;

        ini.set_value(GLOBAL_SECTION, "CachePath", g.cache_path.as_str());
        ini.set_value(GLOBAL_SECTION, "CacheSize", g.cache_size_mb.to_string());
        ini.set_value(GLOBAL_SECTION, "MinArchiveSize", g.min_archive_size_mb.to_string());
        if let Some(update_check) = g.update_check {
            ini.set_value(GLOBAL_SECTION, "UpdateCheck", format_bool(update_check));
        }
        if let Some(skip) = g.skip_update.as_deref() {
            ini.set_value(GLOBAL_SECTION, "SkipUpdate", skip);
        }
        ini.set_value(GLOBAL_SECTION, "StandaloneExtensions", format_extension_list(&g.standalone_extensions));
        ini.set_value(GLOBAL_SECTION, "MetadataExtensions", format_extension_list(&g.metadata_extensions));
        ini.set_value(GLOBAL_SECTION, "BypassPathCheck", format_bool(g.bypass_path_check));

        for (key, p) in &self.policies {
            ini.set_value(key, "FilenamePriority", format_priority_list(&p.filename_priority));
            ini.set_value(key, "Action", p.action.as_str());
            ini.set_value(key, "LaunchPath", p.launch_path.as_str());
            ini.set_value(key, "MultiDisc", format_bool(p.multi_disc));
            ini.set_value(key, "M3uName", p.m3u_name.as_str());
            ini.set_value(key, "SmartExtract", format_bool(p.smart_extract));
            ini.set_value(key, "Chdman", format_bool(p.chdman));
            ini.set_value(key, "DolphinTool", format_bool(p.dolphin_tool));
            ini.set_value(key, "ExtractXiso", format_bool(p.extract_xiso));
        }

        ini.save(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn global(&self) -> &GlobalSettings {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut GlobalSettings {
        &mut self.global
    }

    /// Directory the store file lives in; relative cache paths resolve against it.
    pub fn config_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Absolute cache root.
    pub fn cache_root(&self) -> PathBuf {
        paths::resolve_against(&self.config_dir(), &self.global.cache_path)
    }

    pub fn policy_keys(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn set_policy(&mut self, key: impl Into<String>, entry: PolicyEntry) {
        self.policies.insert(key.into(), entry);
    }

    pub fn remove_policy(&mut self, key: &str) -> Option<PolicyEntry> {
        self.policies.remove(key)
    }

    /// Resolve a field: exact key, then `All \ All`, then the compiled-in default.
    fn resolve<T>(&self, key: &str, field: impl Fn(&PolicyEntry) -> T) -> T {
        self.policies
            .get(key)
            .or_else(|| self.policies.get(DEFAULT_POLICY_KEY))
            .map(&field)
            .unwrap_or_else(|| field(&PolicyEntry::default()))
    }

    pub fn get_policy(&self, key: &str) -> PolicyEntry {
        self.resolve(key, PolicyEntry::clone)
    }

    pub fn get_filename_priority(&self, key: &str) -> Vec<String> {
        self.resolve(key, |p| p.filename_priority.clone())
    }

    pub fn get_action(&self, key: &str) -> Action {
        self.resolve(key, |p| p.action)
    }

    pub fn get_launch_path(&self, key: &str) -> LaunchPath {
        self.resolve(key, |p| p.launch_path)
    }

    pub fn get_multi_disc(&self, key: &str) -> bool {
        self.resolve(key, |p| p.multi_disc)
    }

    pub fn get_m3u_name(&self, key: &str) -> M3uName {
        self.resolve(key, |p| p.m3u_name)
    }

    pub fn get_smart_extract(&self, key: &str) -> bool {
        self.resolve(key, |p| p.smart_extract)
    }

    pub fn get_chdman(&self, key: &str) -> bool {
        self.resolve(key, |p| p.chdman)
    }

    pub fn get_dolphin_tool(&self, key: &str) -> bool {
        self.resolve(key, |p| p.dolphin_tool)
    }

    pub fn get_extract_xiso(&self, key: &str) -> bool {
        self.resolve(key, |p| p.extract_xiso)
    }
}

/// Reads one section, filling defaults for missing keys and remembering that it did.
struct SectionReader<'a> {
    ini: &'a IniStore,
    section: &'a str,
    complete: &'a mut bool,
}

impl<'a> SectionReader<'a> {
    fn optional(&self, key: &str) -> Option<&'a str> {
        self.ini.get_value(self.section, key)
    }

    fn optional_or_flag(&mut self, key: &str) -> Option<&'a str> {
        let value = self.optional(key);
        if value.is_none() {
            *self.complete = false;
        }
        value
    }

    fn text(&mut self, key: &str, default: String) -> String {
        self.optional_or_flag(key)
            .map(str::to_string)
            .unwrap_or(default)
    }

    fn parsed<T>(&mut self, key: &str, default: T) -> Result<T, PolicyError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional_or_flag(key) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e: T::Err| self.invalid(key, e.to_string())),
            None => Ok(default),
        }
    }

    fn flag(&mut self, key: &str, default: bool) -> Result<bool, PolicyError> {
        match self.optional_or_flag(key) {
            Some(value) => parse_bool(value).map_err(|reason| self.invalid(key, reason)),
            None => Ok(default),
        }
    }

    fn invalid(&self, key: &str, reason: String) -> PolicyError {
        PolicyError::InvalidValue {
            section: self.section.to_string(),
            key: key.to_string(),
            value: self.optional(key).unwrap_or_default().to_string(),
            reason,
        }
    }
}

fn format_extension_list(list: &[String]) -> String {
    list.iter()
        .map(|e| e.trim_start_matches('.'))
        .collect::<Vec<_>>()
        .join(", ")
}
