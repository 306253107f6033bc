//! Game session tracking and clip file placement
//!
//! Clips land in `<output root>/<game>` where the game name is derived from
//! the detected executable. Anything unnamed goes to `<output root>/General`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

/// Folder used when no game is known
pub const GENERAL_FOLDER: &str = "General";

/// Game name that maps to the general folder
const UNKNOWN_GAME: &str = "Unknown";

/// Characters that cannot appear in a path segment on any supported platform
const INVALID_PATH_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Media extensions considered when the engine does not report a path
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "mkv"];

/// Map a raw game name to its output folder under `root`
pub fn path_for_game_name(root: &Path, game_name: &str) -> PathBuf {
    if game_name.is_empty() || game_name == UNKNOWN_GAME {
        return root.join(GENERAL_FOLDER);
    }

    let cleaned: String = game_name
        .chars()
        .map(|c| if INVALID_PATH_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        root.join(GENERAL_FOLDER)
    } else {
        root.join(cleaned)
    }
}

/// File stem of an executable path, accepting both separator styles
pub fn game_name_from_executable(executable: &str) -> String {
    let file_name = executable
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(executable);
    match file_name.rfind('.') {
        Some(0) | None => file_name.to_string(),
        Some(dot) => file_name[..dot].to_string(),
    }
}

/// Output folder under `root` for the game behind `executable`
pub fn game_folder_for_executable(root: &Path, executable: &str) -> PathBuf {
    path_for_game_name(root, &game_name_from_executable(executable))
}

/// `Clip_<YYYY-MM-DD>_<HH-MM-SS>_<duration>s.mp4`
pub fn generate_clip_filename(duration_secs: u32, now: &DateTime<Local>) -> String {
    format!(
        "Clip_{}_{}s.mp4",
        now.format("%Y-%m-%d_%H-%M-%S"),
        duration_secs
    )
}

/// Current game and the cached folder derived from it
#[derive(Debug)]
pub struct GameSession {
    output_root: PathBuf,
    game_name: String,
    cached_folder: Option<PathBuf>,
}

impl GameSession {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            game_name: String::new(),
            cached_folder: None,
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn game_name(&self) -> &str {
        &self.game_name
    }

    /// Returns true if the game changed
    pub fn set_game(&mut self, game_name: String) -> bool {
        if game_name == self.game_name {
            return false;
        }
        debug!("Game changed from '{}' to '{}'", self.game_name, game_name);
        self.game_name = game_name;
        self.cached_folder = None;
        true
    }

    /// Folder for the current game, computed on first use after a change
    pub fn current_folder(&mut self) -> PathBuf {
        if let Some(folder) = &self.cached_folder {
            return folder.clone();
        }
        let folder = path_for_game_name(&self.output_root, &self.game_name);
        self.cached_folder = Some(folder.clone());
        folder
    }

    /// Change the output root and make sure its general folder exists
    pub fn set_output_root(&mut self, root: impl Into<PathBuf>) -> Result<()> {
        self.output_root = root.into();
        self.cached_folder = None;
        ensure_dir(&self.output_root.join(GENERAL_FOLDER))
    }

    /// Create the current game's folder if needed and return it
    pub fn ensure_current_folder(&mut self) -> Result<PathBuf> {
        let folder = self.current_folder();
        ensure_dir(&folder)?;
        Ok(folder)
    }
}

/// Create a directory (and parents) if it does not exist
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))
}

/// Locate the file a finished save produced.
///
/// A reported path outside `expected_dir` is moved there under its original
/// file name. Without a reported path the newest media file in `expected_dir`
/// is taken. Returns `None` unless the resulting file exists.
pub fn resolve_saved_file(reported: Option<&Path>, expected_dir: &Path) -> Option<PathBuf> {
    let resolved = match reported.filter(|p| !p.as_os_str().is_empty()) {
        Some(path) => Some(relocate(path, expected_dir)),
        None => {
            debug!(
                "No path reported, scanning {} for the newest clip",
                expected_dir.display()
            );
            newest_media_file(expected_dir)
        }
    };

    resolved.filter(|path| path.is_file())
}

fn relocate(path: &Path, expected_dir: &Path) -> PathBuf {
    if path.parent() == Some(expected_dir) {
        return path.to_path_buf();
    }
    let Some(file_name) = path.file_name() else {
        return path.to_path_buf();
    };

    let target = expected_dir.join(file_name);
    info!(
        "Clip saved to unexpected location {}, moving to {}",
        path.display(),
        target.display()
    );

    if let Err(e) = ensure_dir(expected_dir) {
        warn!("{:#}", e);
        return path.to_path_buf();
    }

    match move_file(path, &target) {
        Ok(()) => target,
        Err(e) => {
            warn!("Failed to move clip: {:#}", e);
            path.to_path_buf()
        }
    }
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Cross-device moves need a copy
    fs::copy(from, to).with_context(|| format!("Failed to copy {}", from.display()))?;
    fs::remove_file(from).with_context(|| format!("Failed to remove {}", from.display()))?;
    Ok(())
}

fn newest_media_file(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;

    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| MEDIA_EXTENSIONS.iter().any(|m| ext.eq_ignore_ascii_case(m)))
                .unwrap_or(false)
        })
        .map(|path| {
            let modified = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn sanitizes_illegal_characters() {
        let root = Path::new("root");
        assert_eq!(path_for_game_name(root, "My/Game:2"), root.join("My_Game_2"));
        assert_eq!(path_for_game_name(root, "a<b>c|d?e*f\"g\\h"), root.join("a_b_c_d_e_f_g_h"));
    }

    #[test]
    fn empty_and_unknown_go_to_general() {
        let root = Path::new("root");
        assert_eq!(path_for_game_name(root, ""), root.join("General"));
        assert_eq!(path_for_game_name(root, "Unknown"), root.join("General"));
        assert_eq!(path_for_game_name(root, "   "), root.join("General"));
        assert_eq!(path_for_game_name(root, "  Halo  "), root.join("Halo"));
    }

    #[test]
    fn game_name_is_executable_stem() {
        assert_eq!(game_name_from_executable("C:\\Games\\eldenring.exe"), "eldenring");
        assert_eq!(game_name_from_executable("/usr/bin/factorio"), "factorio");
        assert_eq!(game_name_from_executable("Cyberpunk2077.exe"), "Cyberpunk2077");
        assert_eq!(game_name_from_executable(".hidden"), ".hidden");
        assert_eq!(
            game_folder_for_executable(Path::new("Clips"), "D:\\Games\\Hades.exe"),
            Path::new("Clips").join("Hades")
        );
    }

    #[test]
    fn clip_filename_format() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
        assert_eq!(generate_clip_filename(30, &now), "Clip_2024-03-09_07-05-02_30s.mp4");
    }

    #[test]
    fn folder_cache_is_invalidated_on_game_change() {
        let mut session = GameSession::new("Clips");
        assert_eq!(session.current_folder(), Path::new("Clips").join("General"));

        assert!(session.set_game(game_name_from_executable("C:\\Games\\Valorant.exe")));
        assert_eq!(session.current_folder(), Path::new("Clips").join("Valorant"));

        assert!(!session.set_game(game_name_from_executable("D:\\Other\\Valorant.exe")));
        assert!(session.set_game(String::new()));
        assert_eq!(session.current_folder(), Path::new("Clips").join("General"));
    }

    #[test]
    fn set_output_root_creates_general() {
        let dir = TempDir::new().unwrap();
        let mut session = GameSession::new("unused");
        session.set_output_root(dir.path().join("clips")).unwrap();

        assert!(dir.path().join("clips").join("General").is_dir());
        assert_eq!(session.current_folder(), dir.path().join("clips").join("General"));
    }

    #[test]
    fn reported_path_in_expected_folder_is_kept() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("Replay_20240101_120000.mp4");
        fs::write(&file, b"clip").unwrap();

        assert_eq!(resolve_saved_file(Some(&file), dir.path()), Some(file));
    }

    #[test]
    fn reported_path_elsewhere_is_moved() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("General");
        let expected = dir.path().join("Halo");
        fs::create_dir_all(&old).unwrap();
        let file = old.join("Replay_1.mp4");
        fs::write(&file, b"clip").unwrap();

        let resolved = resolve_saved_file(Some(&file), &expected).unwrap();
        assert_eq!(resolved, expected.join("Replay_1.mp4"));
        assert!(resolved.is_file());
        assert!(!file.exists());
    }

    #[test]
    fn missing_path_scans_for_newest_clip() {
        let dir = TempDir::new().unwrap();
        let older = dir.path().join("a.mp4");
        let newer = dir.path().join("b.mkv");
        fs::write(&older, b"old").unwrap();
        fs::write(&newer, b"new").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        fs::File::options()
            .write(true)
            .open(&older)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(60))
            .unwrap();

        assert_eq!(resolve_saved_file(None, dir.path()), Some(newer));
    }

    #[test]
    fn nothing_to_resolve_is_a_failure() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_saved_file(None, dir.path()), None);

        let ghost = dir.path().join("ghost.mp4");
        assert_eq!(resolve_saved_file(Some(&ghost), dir.path()), None);
    }
}
