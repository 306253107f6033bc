//! libobs runtime installation
//!
//! The runtime (libobs, its data files and plugins) is fetched by the
//! bootstrapper the first time it is missing and never auto-updated.

use std::convert::Infallible;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use libobs_bootstrapper::{
    status_handler::ObsBootstrapStatusHandler, ObsBootstrapper, ObsBootstrapperOptions,
    ObsBootstrapperResult,
};
use libobs_wrapper::utils::{ObsPath, StartupPaths};
use tracing::{debug, info};

/// Overrides where the libobs runtime is installed and loaded from
pub const RUNTIME_DIR_ENV: &str = "REPLAY_COMPANION_OBS_DIR";

fn runtime_root() -> Option<PathBuf> {
    std::env::var_os(RUNTIME_DIR_ENV).map(PathBuf::from)
}

fn bootstrap_options() -> ObsBootstrapperOptions {
    let options = ObsBootstrapperOptions::default().set_update(false);
    #[cfg(target_os = "macos")]
    if let Some(root) = runtime_root() {
        info!("Using external libobs install dir {}", root.display());
        return options.set_install_dir(root);
    }
    options
}

/// Install the libobs runtime if it is not present yet
pub async fn ensure_runtime() -> Result<()> {
    let options = bootstrap_options();
    let present = ObsBootstrapper::is_valid_installation_with_options(&options)
        .context("Failed to check libobs installation")?;
    if present {
        debug!("libobs runtime already installed");
        return Ok(());
    }

    info!("libobs runtime missing, downloading");
    let result = ObsBootstrapper::bootstrap_with_handler(&options, Box::new(ProgressLog::default()))
        .await
        .context("Failed to bootstrap libobs runtime")?;

    match result {
        ObsBootstrapperResult::None => {
            info!("libobs runtime installed");
            Ok(())
        }
        ObsBootstrapperResult::Restart => {
            anyhow::bail!("libobs runtime installed, restart replay-companion to load it")
        }
    }
}

/// Whether a usable runtime is installed, and where it was looked for
pub fn installation() -> (bool, String) {
    let searched = runtime_root()
        .map(|root| root.display().to_string())
        .unwrap_or_else(|| "application directory".to_string());
    let present = ObsBootstrapper::is_valid_installation_with_options(&bootstrap_options())
        .unwrap_or(false);
    (present, searched)
}

/// Startup paths for a runtime installed outside the application directory
pub fn startup_paths() -> Option<StartupPaths> {
    let root = runtime_root().filter(|root| root.exists())?;
    let layout = RuntimeLayout::under(&root);
    info!("Using external libobs runtime at {}", root.display());
    Some(StartupPaths::new(
        ObsPath::new(layout.data.to_string_lossy().as_ref()),
        ObsPath::new(layout.plugin_bin.to_string_lossy().as_ref()),
        ObsPath::new(layout.plugin_data.to_string_lossy().as_ref()),
    ))
}

#[derive(Debug, PartialEq, Eq)]
struct RuntimeLayout {
    data: PathBuf,
    plugin_bin: PathBuf,
    plugin_data: PathBuf,
}

impl RuntimeLayout {
    fn under(root: &Path) -> Self {
        let plugin_bin = if cfg!(target_os = "macos") {
            root.join("obs-plugins/%module%.plugin/Contents/MacOS")
        } else if cfg!(target_os = "windows") {
            root.join("obs-plugins/64bit")
        } else {
            root.join("obs-plugins")
        };
        Self {
            data: root.join("data/libobs"),
            plugin_bin,
            plugin_data: root.join("data/obs-plugins/%module%"),
        }
    }
}

/// Logs each bootstrap phase once instead of every progress tick
#[derive(Debug, Default)]
struct ProgressLog {
    last_message: Option<String>,
}

impl ProgressLog {
    fn record(&mut self, phase: &str, progress: f32, message: String) {
        debug!("libobs {} progress {:.2}", phase, progress);
        if self.last_message.as_deref() != Some(message.as_str()) {
            info!("libobs {}: {}", phase, message);
            self.last_message = Some(message);
        }
    }
}

impl ObsBootstrapStatusHandler for ProgressLog {
    type Error = Infallible;

    fn handle_downloading(&mut self, progress: f32, message: String) -> Result<(), Self::Error> {
        self.record("download", progress, message);
        Ok(())
    }

    fn handle_extraction(&mut self, progress: f32, message: String) -> Result<(), Self::Error> {
        self.record("extraction", progress, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_stays_under_the_runtime_root() {
        let root = Path::new("/opt/replay-companion/obs");
        let layout = RuntimeLayout::under(root);
        assert_eq!(layout.data, root.join("data/libobs"));
        assert_eq!(layout.plugin_data, root.join("data/obs-plugins/%module%"));
        assert!(layout.plugin_bin.starts_with(root.join("obs-plugins")));
    }

    #[test]
    fn progress_log_tracks_phase_messages() {
        let mut log = ProgressLog::default();
        log.handle_downloading(0.1, "Downloading OBS".to_string()).unwrap();
        log.handle_downloading(0.5, "Downloading OBS".to_string()).unwrap();
        assert_eq!(log.last_message.as_deref(), Some("Downloading OBS"));

        log.handle_extraction(0.0, "Extracting".to_string()).unwrap();
        assert_eq!(log.last_message.as_deref(), Some("Extracting"));
    }
}
