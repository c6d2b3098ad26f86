//! Launch preparation.
//!
//! [`Launcher::prepare`] takes one frontend launch request through the whole
//! pipeline: decide whether caching applies, make sure the backend tool is
//! there, fill (or reuse) the cache entries, and hand back the path the
//! emulator should be started with. Nothing in here aborts a launch; when
//! caching can't happen the outcome simply points at the source archive.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{choose_by_priority, policy_key, M3uName, PolicyStore};
use crate::extractor::{has_enabled_extractor, select_extractor, Extractor, ToolLocator};
use crate::game::{DiscInfo, GameRecord};
use crate::index::CacheIndex;
use crate::manager::{CacheManager, Destination};
use crate::paths;
use crate::state::{LaunchSettings, LaunchState};

/// How long overridden host settings may stay overridden before they're put back.
pub const DEFAULT_RESTORE_DELAY: Duration = Duration::from_millis(5000);

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(
        "Attempting to extract using {name}, but couldn't find {binary} in {folder}.\n\n\
         Please place a copy of {binary} in this folder and try again, or disable the {name} option.\n\n\
         Game launch will continue without extraction or caching."
    )]
    MissingExtractor {
        name: String,
        binary: String,
        folder: String,
    },
}

/// One launch as reported by the frontend.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub game_id: String,
    pub archive_path: String,
    pub emulator: String,
    pub platform: String,
    pub title: String,
    pub version: String,
    /// Every disc of a multi-disc game; empty for single-disc games.
    pub discs: Vec<DiscInfo>,
    pub selected_disc: Option<u32>,
    /// The frontend would load multi-disc games through an m3u playlist.
    pub m3u_enabled: bool,
}

impl LaunchRequest {
    pub fn key(&self) -> String {
        policy_key(&self.emulator, &self.platform)
    }

    pub fn is_multi_disc(&self) -> bool {
        self.discs.len() > 1
    }
}

/// What the emulator should be started with.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchOutcome {
    pub launch_path: PathBuf,
    /// Every archive was already cached.
    pub cache_hit: bool,
    /// Where the selected disc's payload went; `None` when the source is launched directly.
    pub destination: Option<Destination>,
    /// The frontend's application path should be pointed at `launch_path`.
    pub redirect: bool,
    pub m3u: Option<PathBuf>,
    /// Message for the user when caching was skipped for a reason they can fix.
    pub notice: Option<String>,
}

impl LaunchOutcome {
    fn passthrough(archive_path: &str, notice: Option<String>) -> Self {
        Self {
            launch_path: PathBuf::from(archive_path),
            cache_hit: false,
            destination: None,
            redirect: false,
            m3u: None,
            notice,
        }
    }
}

/// Whether caching applies to this launch at all.
///
/// Multi-disc games are left alone when the policy disables multi-disc
/// support but the frontend builds its own m3u, since the two would conflict.
pub fn should_use_cache(
    policy: &PolicyStore,
    key: &str,
    archive_path: &str,
    multi_disc: bool,
    m3u_enabled: bool,
) -> bool {
    if multi_disc && m3u_enabled && !policy.get_multi_disc(key) {
        return false;
    }

    has_enabled_extractor(archive_path, key, policy) || policy.get_action(key).copies()
}

/// Whether the frontend's application path should be redirected to the cache.
pub fn should_redirect_path(policy: &PolicyStore, key: &str, archive_path: &str) -> bool {
    if policy.global().bypass_path_check {
        return true;
    }

    // The frontend runs its own extraction for these
    if paths::has_extension(archive_path, paths::FRONTEND_ARCHIVE_EXTENSIONS) {
        return false;
    }

    policy.get_action(key).copies() || has_enabled_extractor(archive_path, key, policy)
}

/// Check that the backend selected for an archive has its tool available.
pub fn check_extractor(
    policy: &PolicyStore,
    key: &str,
    archive_path: &str,
    tools: &ToolLocator,
) -> Result<(), LaunchError> {
    let extractor = select_extractor(archive_path, key, policy).build(tools);
    missing_extractor(extractor.as_ref()).map_or(Ok(()), Err)
}

fn missing_extractor(extractor: &dyn Extractor) -> Option<LaunchError> {
    if extractor.tool_exists() {
        return None;
    }

    let path = extractor.extractor_path().unwrap_or_default();
    Some(LaunchError::MissingExtractor {
        name: extractor.name().to_string(),
        binary: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        folder: path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    })
}

/// Extension of the playlists written for multi-disc games.
pub const PLAYLIST_EXTENSION: &str = ".m3u";

/// Picks the launchable file inside an extracted payload.
///
/// The user's selection wins when it was extracted; otherwise the filename
/// priority list decides, falling back to the first file in name order.
/// Metadata files and playlists (including the one written for multi-disc
/// launches) are only considered when nothing else is there.
pub fn choose_launch_file(
    payload_dir: &Path,
    selected: Option<&str>,
    priority: &[String],
    metadata_extensions: &[String],
) -> Option<PathBuf> {
    if let Some(selected) = selected.filter(|s| !s.is_empty()) {
        let candidate = payload_dir.join(selected);
        if candidate.is_file() {
            return Some(candidate);
        }
        warn!("Selected file {} not found in {}.", selected, payload_dir.display());
    }

    let mut files: Vec<String> = WalkDir::new(payload_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(payload_dir).ok()?;
            Some(paths::to_forward_slashes(&rel.to_string_lossy()))
        })
        .filter(|rel| rel != paths::DESCRIPTOR_FILE)
        .collect();
    files.sort();

    let (playable, other): (Vec<String>, Vec<String>) = files.into_iter().partition(|f| {
        !paths::has_extension(f, metadata_extensions) && !paths::has_extension(f, &[PLAYLIST_EXTENSION])
    });
    let candidates = if playable.is_empty() { other } else { playable };

    choose_by_priority(&candidates, priority).map(|f| payload_dir.join(f))
}

/// File name of the m3u playlist for a multi-disc game.
pub fn m3u_file_name(mode: M3uName, game: &GameRecord, disc_one: &Path) -> String {
    let stem = match mode {
        M3uName::GameId => game.id.clone(),
        M3uName::TitleVersion if game.version.trim().is_empty() => game.title.clone(),
        M3uName::TitleVersion => format!("{} {}", game.title, game.version),
        M3uName::DiscOneFilename => disc_one
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| game.id.clone()),
    };
    format!("{}{}", paths::sanitize_file_name(&stem), PLAYLIST_EXTENSION)
}

type ExtractorFactory<'a> = Box<dyn Fn(&str, &str) -> Rc<dyn Extractor> + 'a>;

/// Prepares launches against one policy store, selection index and cache.
pub struct Launcher<'a> {
    policy: &'a PolicyStore,
    index: &'a CacheIndex,
    manager: &'a CacheManager,
    extractors: ExtractorFactory<'a>,
}

impl<'a> Launcher<'a> {
    pub fn new(policy: &'a PolicyStore, index: &'a CacheIndex, manager: &'a CacheManager, tools: ToolLocator) -> Self {
        Self::with_extractors(policy, index, manager, move |archive, key| {
            let extractor: Rc<dyn Extractor> = Rc::from(select_extractor(archive, key, policy).build(&tools));
            extractor
        })
    }

    /// Launcher with a custom backend factory, called with `(archive_path, policy_key)`.
    pub fn with_extractors(
        policy: &'a PolicyStore,
        index: &'a CacheIndex,
        manager: &'a CacheManager,
        extractors: impl Fn(&str, &str) -> Rc<dyn Extractor> + 'a,
    ) -> Self {
        Self {
            policy,
            index,
            manager,
            extractors: Box::new(extractors),
        }
    }

    pub fn prepare(&self, request: &LaunchRequest) -> Result<LaunchOutcome> {
        let key = request.key();
        let archive = request.archive_path.as_str();

        if !should_use_cache(self.policy, &key, archive, request.is_multi_disc(), request.m3u_enabled) {
            info!("Caching doesn't apply to {} under [{}], launching it directly.", archive, key);
            return Ok(LaunchOutcome::passthrough(archive, None));
        }

        info!("-------- {} --------", request.title.to_uppercase());
        info!(
            "Preparing cache for {} ({}) running with {}.",
            request.title, request.platform, request.emulator
        );

        if let Some(err) = missing_extractor((self.extractors)(archive, key.as_str()).as_ref()) {
            warn!("{}", err);
            return Ok(LaunchOutcome::passthrough(archive, Some(err.to_string())));
        }

        let mut state = LaunchState::new(
            self.game_record(request),
            LaunchSettings::resolve(self.policy, &key),
            self.manager.cache_root(),
            |path| (self.extractors)(path, key.as_str()),
        );

        let units: Vec<Option<u32>> = if state.is_multi_disc() {
            state.disc_numbers().into_iter().map(Some).collect()
        } else {
            vec![None]
        };
        let active: Vec<PathBuf> = units.iter().map(|&d| state.cache_dir(d).to_path_buf()).collect();

        if state.in_cache(None) {
            info!("{} of {} archives already cached.", state.disc_count_in_cache(), units.len());
        }

        let mut prepared = BTreeMap::new();
        let mut cache_hit = true;
        for &disc in &units {
            match self.prepare_unit(&mut state, disc, &active) {
                Ok((payload, destination, hit)) => {
                    cache_hit &= hit;
                    prepared.insert(disc, (payload, destination));
                }
                Err(e) => {
                    warn!("Cache preparation failed, launching without cache: {:#}", e);
                    return Ok(LaunchOutcome::passthrough(archive, Some(format!("{:#}", e))));
                }
            }
        }

        let priority = self.policy.get_filename_priority(&key);
        let mut launch_files = BTreeMap::new();
        for (&disc, (payload, _)) in &prepared {
            let selected = if disc.is_none() { state.game().selected_file.as_deref() } else { None };
            let file = choose_launch_file(payload, selected, &priority, &state.settings().metadata_extensions)
                .with_context(|| format!("No launchable file in {}", payload.display()))?;
            launch_files.insert(disc, file);
        }

        let target = request
            .selected_disc
            .filter(|d| state.is_multi_disc() && launch_files.contains_key(&Some(*d)))
            .or_else(|| units.first().copied().flatten());

        let (launch_path, m3u) = if state.is_multi_disc() && request.m3u_enabled {
            let m3u = self.write_m3u(&state, &key, &launch_files, &prepared)?;
            (m3u.clone(), Some(m3u))
        } else {
            let file = launch_files
                .get(&target)
                .or_else(|| launch_files.values().next())
                .cloned()
                .with_context(|| format!("Nothing to launch for {}", archive))?;
            (file, None)
        };

        info!("Launching {}.", launch_path.display());
        Ok(LaunchOutcome {
            launch_path,
            cache_hit,
            destination: prepared.get(&target).map(|(_, d)| d.clone()),
            redirect: should_redirect_path(self.policy, &key, archive),
            m3u,
            notice: None,
        })
    }

    fn game_record(&self, request: &LaunchRequest) -> GameRecord {
        let selected = self.index.get_selected_file(&request.game_id);
        let mut discs = request.discs.clone();
        discs.sort_by_key(|d| d.disc);

        let multi_disc = request.is_multi_disc();
        if multi_disc {
            info!("Multi-disc game detected.");
        }

        GameRecord {
            id: request.game_id.clone(),
            archive_path: request.archive_path.clone(),
            emulator: request.emulator.clone(),
            platform: request.platform.clone(),
            title: request.title.clone(),
            version: request.version.clone(),
            selected_file: Some(selected).filter(|s| !s.is_empty()),
            emulator_platform_m3u: request.m3u_enabled,
            multi_disc,
            total_discs: discs.len() as u32,
            selected_disc: request.selected_disc.filter(|_| multi_disc),
            discs,
            decompressed_size: None,
            last_used: None,
        }
    }

    /// Reuse or fill the entry for one disc (or the whole game).
    fn prepare_unit(
        &self,
        state: &mut LaunchState,
        disc: Option<u32>,
        active: &[PathBuf],
    ) -> Result<(PathBuf, Destination, bool)> {
        let entry = state.cache_dir(disc).to_path_buf();

        if state.in_cache(disc) {
            info!("Cache hit for {}.", state.archive_path(disc));
            state.save_to_cache(disc)?;
            return Ok((state.payload_dir(disc), Destination::Cache(entry), true));
        }

        let archive = PathBuf::from(state.archive_path(disc));
        let source_size = fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);
        let needed = state.decompressed_size(disc);
        let destination = self.manager.plan_destination(&entry, source_size, needed, active)?;

        let payload = match state.payload_subdir() {
            Some(sub) => destination.dir().join(sub),
            None => destination.dir().to_path_buf(),
        };

        let include = match (disc, state.game().selected_file.clone()) {
            (None, Some(selected)) if state.extract_single_file() => vec![selected],
            _ => Vec::new(),
        };

        let extractor = state.extractor(disc);
        self.manager
            .create_entry(extractor.as_ref(), &archive, destination.dir(), &payload, &include)?;

        if destination.is_cache() {
            state.save_to_cache(disc)?;
        }
        Ok((payload, destination, false))
    }

    fn write_m3u(
        &self,
        state: &LaunchState,
        key: &str,
        launch_files: &BTreeMap<Option<u32>, PathBuf>,
        prepared: &BTreeMap<Option<u32>, (PathBuf, Destination)>,
    ) -> Result<PathBuf> {
        let (first, disc_one) = launch_files
            .iter()
            .next()
            .context("Multi-disc game has no discs to list")?;
        let name = m3u_file_name(self.policy.get_m3u_name(key), state.game(), disc_one);
        let dir = prepared
            .get(first)
            .map(|(payload, _)| payload.clone())
            .context("Missing payload for first disc")?;

        let contents: String = launch_files
            .values()
            .map(|f| format!("{}\n", f.display()))
            .collect();
        let path = dir.join(name);
        fs::write(&path, contents).with_context(|| format!("Failed to write {}", path.display()))?;

        info!("Wrote multi-disc playlist {}.", path.display());
        Ok(path)
    }
}

/// Puts temporarily overridden host settings back.
pub trait SettingsRestore: Send + Sync {
    fn restore_all(&self);
}

/// Runs a [`SettingsRestore`] exactly once, on [`complete`](Self::complete)
/// or when the delay runs out, whichever happens first.
pub struct DelayedRestore {
    done: Arc<AtomicBool>,
    restore: Arc<dyn SettingsRestore>,
}

impl DelayedRestore {
    pub fn schedule(restore: Arc<dyn SettingsRestore>, delay: Duration) -> Self {
        let done = Arc::new(AtomicBool::new(false));

        let timer_done = Arc::clone(&done);
        let timer_restore = Arc::clone(&restore);
        thread::spawn(move || {
            thread::sleep(delay);
            if run_once(&timer_done, timer_restore.as_ref()) {
                info!("Restored settings after {} ms.", delay.as_millis());
            }
        });

        Self { done, restore }
    }

    /// Restore now, on the normal completion path.
    pub fn complete(&self) {
        run_once(&self.done, self.restore.as_ref());
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

fn run_once(done: &AtomicBool, restore: &dyn SettingsRestore) -> bool {
    if done.swap(true, Ordering::SeqCst) {
        return false;
    }
    restore.restore_all();
    true
}
