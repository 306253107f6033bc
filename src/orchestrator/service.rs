//! Orchestrator event loop
//!
//! Owns the buffer manager and is the only task that touches it. Commands,
//! process events, engine signals, buffer events and the manager's timer
//! deadline are all multiplexed through one `select!`.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::capture::{
    AudioProfile, BufferEvent, BufferManager, BufferPhase, EncodingProfile, MicrophoneProfile,
};
use crate::config::Config;
use crate::engine::{CaptureEngine, SignalReceiver};
use crate::error::{BufferError, EngineError};
use crate::monitor::{ProcessEvent, ProcessMonitor};

use super::{ClippingState, Command, Status};

pub struct Orchestrator {
    config: Config,
    manager: BufferManager,
    state: ClippingState,
    /// Executable the buffer is capturing
    current_game: Option<String>,
    /// Monitored executables currently running, in detection order
    running_games: Vec<String>,
    /// Start was refused while a stop was pending; retry once inactive
    start_pending: bool,
    cmd_rx: mpsc::Receiver<Command>,
    status_tx: broadcast::Sender<Status>,
    signal_rx: SignalReceiver,
    buffer_rx: mpsc::UnboundedReceiver<BufferEvent>,
    process_tx: mpsc::Sender<ProcessEvent>,
    process_rx: mpsc::Receiver<ProcessEvent>,
    games_tx: watch::Sender<Vec<String>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        engine: Arc<dyn CaptureEngine>,
        signal_rx: SignalReceiver,
        cmd_rx: mpsc::Receiver<Command>,
        status_tx: broadcast::Sender<Status>,
    ) -> Self {
        let (buffer_tx, buffer_rx) = mpsc::unbounded_channel();
        let (process_tx, process_rx) = mpsc::channel(32);
        let (games_tx, _) = watch::channel(config.clipping.games.clone());

        let mut manager = BufferManager::new(
            engine,
            config.capture.clone(),
            config.clipping.output_folder.clone(),
            buffer_tx,
        );
        manager.set_encoding(config.encoding.clone());
        manager.set_audio(config.audio.clone());
        manager.set_microphone(config.microphone.clone());
        manager.set_buffer_duration(config.clipping.buffer_duration_secs);

        Self {
            config,
            manager,
            state: ClippingState::Disabled,
            current_game: None,
            running_games: Vec::new(),
            start_pending: false,
            cmd_rx,
            status_tx,
            signal_rx,
            buffer_rx,
            process_tx,
            process_rx,
            games_tx,
        }
    }

    /// Bring up the capture engine. Enables clipping when autostart is set.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if let Err(e) = self.manager.set_output_folder(&self.config.clipping.output_folder) {
            warn!("{:#}", e);
        }
        self.manager.initialize()?;

        if self.config.clipping.autostart {
            info!("Autostart enabled, clipping mode on");
            self.enable();
        } else {
            self.publish(Status::StateChanged(self.state));
        }
        Ok(())
    }

    /// Run the main loop until a shutdown command arrives
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Orchestrator running, monitoring {} games",
            self.config.clipping.games.len()
        );
        let monitor = ProcessMonitor::new(
            Duration::from_millis(self.config.clipping.poll_interval_ms.max(100)),
            self.games_tx.subscribe(),
            self.process_tx.clone(),
        )
        .spawn();

        loop {
            let deadline = self.manager.next_deadline();

            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => {
                    if !self.handle_command(cmd) {
                        break;
                    }
                }

                Some(event) = self.process_rx.recv() => {
                    self.handle_process_event(event);
                }

                Some(signal) = self.signal_rx.recv() => {
                    self.manager.handle_signal(signal);
                }

                Some(event) = self.buffer_rx.recv() => {
                    self.handle_buffer_event(event);
                }

                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.manager.poll_timers(Instant::now());
                }
            }

            self.retry_pending_start();
        }

        monitor.abort();
        self.manager.shutdown();
        info!("Orchestrator stopped");
        Ok(())
    }

    pub fn state(&self) -> ClippingState {
        self.state
    }

    pub fn current_game(&self) -> Option<&str> {
        self.current_game.as_deref()
    }

    /// Returns false when the loop should exit
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::ToggleClipping => {
                if self.state == ClippingState::Disabled {
                    self.enable();
                } else {
                    self.disable();
                }
            }
            Command::SaveClip => {
                let duration = self.config.clipping.clip_length_secs;
                if let Err(e) = self.manager.save(duration, None) {
                    info!("Save rejected: {}", e);
                    self.publish(Status::SaveFailed(e.to_string()));
                }
            }
            Command::SetEncoding(profile) => self.set_encoding(profile),
            Command::SetAudio(profile) => self.set_audio(profile),
            Command::SetMicrophone(profile) => self.set_microphone(profile),
            Command::SetBufferDuration(secs) => {
                self.manager.set_buffer_duration(secs);
                self.config.clipping.buffer_duration_secs = self.manager.buffer_duration();
                self.save_config();
            }
            Command::SetOutputFolder(folder) => {
                match self.manager.set_output_folder(&folder) {
                    Ok(()) => {
                        info!("Clips now saved under {}", folder.display());
                        self.config.clipping.output_folder = folder;
                        self.save_config();
                    }
                    Err(e) => {
                        warn!("{:#}", e);
                        self.publish(Status::Error(format!("{:#}", e)));
                    }
                }
            }
            Command::AddGame(executable) => match self.config.add_game(&executable) {
                Ok(true) => {
                    info!("Now monitoring {}", executable);
                    self.games_changed();
                }
                Ok(false) => debug!("{} is already monitored", executable),
                Err(e) => warn!("Failed to add {}: {:#}", executable, e),
            },
            Command::RemoveGame(executable) => {
                if self.config.remove_game(&executable) {
                    info!("No longer monitoring {}", executable);
                    self.running_games
                        .retain(|game| !game.eq_ignore_ascii_case(&executable));
                    self.games_changed();
                    if self.is_current_game(&executable) {
                        self.deactivate();
                        self.activate_next_running();
                    }
                }
            }
            Command::ReportStatus => info!("{}", self.status_line()),
            Command::Shutdown => {
                info!("Shutdown command received");
                return false;
            }
        }
        true
    }

    fn handle_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Started(executable) => {
                if !self.config.is_monitored(&executable) {
                    return;
                }
                info!("Detected game {}", executable);
                if !self
                    .running_games
                    .iter()
                    .any(|game| game.eq_ignore_ascii_case(&executable))
                {
                    self.running_games.push(executable.clone());
                }
                if self.state == ClippingState::AwaitingGame {
                    self.activate(&executable);
                }
            }
            ProcessEvent::Stopped(executable) => {
                self.running_games
                    .retain(|game| !game.eq_ignore_ascii_case(&executable));
                if self.state == ClippingState::Active && self.is_current_game(&executable) {
                    info!("Game {} exited", executable);
                    self.deactivate();
                    self.activate_next_running();
                }
            }
        }
    }

    fn handle_buffer_event(&mut self, event: BufferEvent) {
        match event {
            BufferEvent::ClippingModeChanged(running) => {
                debug!("Replay buffer running: {}", running);
                self.publish(Status::BufferRunning(running));
            }
            BufferEvent::SaveStarted { label } => self.publish(Status::SaveStarted(label)),
            BufferEvent::SaveFinished {
                success: true,
                path: Some(path),
            } => {
                info!("Clip saved: {}", path.display());
                self.publish(Status::ClipSaved(path));
            }
            BufferEvent::SaveFinished { .. } => {
                warn!("Clip save failed");
                self.publish(Status::SaveFailed("clip was not written".to_string()));
            }
        }
    }

    fn enable(&mut self) {
        self.set_state(ClippingState::AwaitingGame);
        self.activate_next_running();
    }

    fn disable(&mut self) {
        self.start_pending = false;
        self.manager.stop();
        self.manager.clear_game_capture();
        self.current_game = None;
        self.set_state(ClippingState::Disabled);
    }

    fn activate_next_running(&mut self) {
        if self.state != ClippingState::AwaitingGame {
            return;
        }
        let next = self
            .running_games
            .iter()
            .find(|game| self.config.is_monitored(game))
            .cloned();
        if let Some(game) = next {
            self.activate(&game);
        }
    }

    /// Point game capture at `executable` and start buffering
    fn activate(&mut self, executable: &str) {
        self.publish(Status::GameDetected(executable.to_string()));
        if let Err(e) = self.manager.set_game_capture(executable) {
            error!("{}", e);
            self.publish(Status::Error(e.to_string()));
            return;
        }

        match self.manager.start() {
            Ok(()) => {}
            Err(BufferError::OperationPending) => {
                debug!("Buffer busy, start deferred for {}", executable);
                self.start_pending = true;
            }
            Err(e) => {
                error!("Failed to start replay buffer for {}: {}", executable, e);
                self.manager.clear_game_capture();
                self.publish(Status::Error(e.to_string()));
                return;
            }
        }
        self.current_game = Some(executable.to_string());
        self.set_state(ClippingState::Active);
    }

    /// Stop buffering the current game and go back to waiting
    fn deactivate(&mut self) {
        self.start_pending = false;
        self.manager.stop();
        self.manager.clear_game_capture();
        self.current_game = None;
        if self.state == ClippingState::Active {
            self.set_state(ClippingState::AwaitingGame);
        }
    }

    fn retry_pending_start(&mut self) {
        if !self.start_pending || self.manager.phase() != BufferPhase::Inactive {
            return;
        }
        self.start_pending = false;
        if let Err(e) = self.manager.start() {
            error!("Deferred buffer start failed: {}", e);
            self.publish(Status::Error(e.to_string()));
            self.deactivate();
        }
    }

    fn set_encoding(&mut self, profile: EncodingProfile) {
        if profile == self.config.encoding {
            return;
        }
        self.config.encoding = profile.clone();
        self.manager.set_encoding(profile);
        self.save_config();
        self.restart_if_active();
    }

    fn set_audio(&mut self, profile: AudioProfile) {
        let needs_restart = profile != self.config.audio;
        self.config.audio = profile.clone();
        self.manager.set_audio(profile);
        self.save_config();
        if needs_restart {
            self.restart_if_active();
        }
    }

    fn set_microphone(&mut self, profile: MicrophoneProfile) {
        let needs_restart = profile != self.config.microphone;
        self.config.microphone = profile.clone();
        self.manager.set_microphone(profile);
        self.save_config();
        if needs_restart {
            self.restart_if_active();
        }
    }

    /// Heavier profile changes only take effect on a full start
    fn restart_if_active(&mut self) {
        if self.manager.is_active() {
            info!("Restarting replay buffer to apply new settings");
            self.manager.restart();
        }
    }

    fn games_changed(&mut self) {
        self.save_config();
        self.games_tx.send_replace(self.config.clipping.games.clone());
    }

    fn is_current_game(&self, executable: &str) -> bool {
        self.current_game
            .as_deref()
            .map(|game| game.eq_ignore_ascii_case(executable))
            .unwrap_or(false)
    }

    fn status_line(&mut self) -> String {
        format!(
            "state={:?} game={} buffer={:?} saving={} duration={}s folder={}",
            self.state,
            self.current_game.as_deref().unwrap_or("-"),
            self.manager.phase(),
            self.manager.is_saving(),
            self.manager.buffer_duration(),
            self.manager.current_folder().display()
        )
    }

    fn set_state(&mut self, state: ClippingState) {
        if self.state == state {
            return;
        }
        info!("Clipping state: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.publish(Status::StateChanged(state));
    }

    fn save_config(&self) {
        if let Err(e) = self.config.save() {
            warn!("Failed to save config: {:#}", e);
        }
    }

    fn publish(&self, status: Status) {
        let _ = self.status_tx.send(status);
    }
}

/// Create command and status channels for the orchestrator
pub fn create_orchestrator_channels() -> (
    mpsc::Sender<Command>,
    mpsc::Receiver<Command>,
    broadcast::Sender<Status>,
    broadcast::Receiver<Status>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = broadcast::channel(64);
    (cmd_tx, cmd_rx, status_tx, status_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DEFAULT_BUFFER_DURATION_SECS;
    use crate::engine::fake::FakeEngine;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const GAME: &str = "Hades.exe";

    struct Harness {
        fake: Arc<FakeEngine>,
        orchestrator: Orchestrator,
        status_rx: broadcast::Receiver<Status>,
        cmd_tx: mpsc::Sender<Command>,
        dir: TempDir,
    }

    impl Harness {
        fn new(autostart: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = Config::load_from(dir.path().join("config.toml")).unwrap();
            config.clipping.output_folder = dir.path().join("Clips");
            config.clipping.games = vec![GAME.to_string()];
            config.clipping.autostart = autostart;

            let (fake, signals) = FakeEngine::new();
            let (cmd_tx, cmd_rx, status_tx, status_rx) = create_orchestrator_channels();
            let mut orchestrator = Orchestrator::new(config, fake.clone(), signals, cmd_rx, status_tx);
            orchestrator.initialize().unwrap();

            Self {
                fake,
                orchestrator,
                status_rx,
                cmd_tx,
                dir,
            }
        }

        /// Deliver queued engine signals and buffer events the way the loop does
        fn pump(&mut self) {
            loop {
                if let Ok(signal) = self.orchestrator.signal_rx.try_recv() {
                    self.orchestrator.manager.handle_signal(signal);
                } else if let Ok(event) = self.orchestrator.buffer_rx.try_recv() {
                    self.orchestrator.handle_buffer_event(event);
                } else {
                    break;
                }
                self.orchestrator.retry_pending_start();
            }
        }

        async fn advance(&mut self, by: Duration) {
            tokio::time::advance(by).await;
            self.orchestrator.manager.poll_timers(Instant::now());
            self.orchestrator.retry_pending_start();
            self.pump();
        }

        fn statuses(&mut self) -> Vec<Status> {
            let mut statuses = Vec::new();
            while let Ok(status) = self.status_rx.try_recv() {
                statuses.push(status);
            }
            statuses
        }

        fn game_started(&mut self, exe: &str) {
            self.orchestrator
                .handle_process_event(ProcessEvent::Started(exe.to_string()));
            self.pump();
        }

        fn game_stopped(&mut self, exe: &str) {
            self.orchestrator
                .handle_process_event(ProcessEvent::Stopped(exe.to_string()));
            self.pump();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn game_start_activates_buffer() {
        let mut h = Harness::new(true);
        assert_eq!(h.orchestrator.state(), ClippingState::AwaitingGame);

        h.game_started("hades.EXE");
        assert_eq!(h.orchestrator.state(), ClippingState::Active);
        assert_eq!(h.orchestrator.current_game(), Some("hades.EXE"));
        assert_eq!(h.orchestrator.manager.phase(), BufferPhase::Active);
        assert_eq!(h.fake.state().source_creations("game_capture"), 1);
        assert!(h.dir.path().join("Clips").join("hades").is_dir());

        let statuses = h.statuses();
        assert!(statuses.contains(&Status::GameDetected("hades.EXE".to_string())));
        assert!(statuses.contains(&Status::StateChanged(ClippingState::Active)));
        assert!(statuses.contains(&Status::BufferRunning(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn unmonitored_processes_are_ignored() {
        let mut h = Harness::new(true);
        h.game_started("explorer.exe");
        assert_eq!(h.orchestrator.state(), ClippingState::AwaitingGame);
        assert_eq!(h.fake.output_creations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn enabling_picks_up_running_game() {
        let mut h = Harness::new(false);
        h.game_started(GAME);
        assert_eq!(h.orchestrator.state(), ClippingState::Disabled);
        assert_eq!(h.fake.output_creations(), 0);

        h.orchestrator.handle_command(Command::ToggleClipping);
        h.pump();
        assert_eq!(h.orchestrator.state(), ClippingState::Active);
        assert_eq!(h.orchestrator.current_game(), Some(GAME));
    }

    #[tokio::test(start_paused = true)]
    async fn game_exit_returns_to_awaiting() {
        let mut h = Harness::new(true);
        h.game_started(GAME);
        h.game_stopped("HADES.exe");

        assert_eq!(h.orchestrator.state(), ClippingState::AwaitingGame);
        assert_eq!(h.orchestrator.manager.phase(), BufferPhase::Inactive);
        assert!(h.orchestrator.current_game().is_none());
        // scene, desktop audio and both encoders survive
        assert_eq!(h.fake.live_objects(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_games_defers_start_until_stopped() {
        let mut h = Harness::new(true);
        h.orchestrator.handle_command(Command::AddGame("Celeste.exe".to_string()));
        h.fake.state().auto_stop_signal = false;
        h.game_started(GAME);
        h.game_started("Celeste.exe");
        assert_eq!(h.orchestrator.current_game(), Some(GAME));

        h.game_stopped(GAME);
        assert_eq!(h.orchestrator.current_game(), Some("Celeste.exe"));
        assert_eq!(h.orchestrator.manager.phase(), BufferPhase::Stopping);
        assert!(h.orchestrator.start_pending);

        let output = h.orchestrator.manager.output_handle().unwrap();
        h.fake.emit_stopped(output);
        h.pump();
        assert_eq!(h.orchestrator.manager.phase(), BufferPhase::Active);
        assert_eq!(h.fake.output_creations(), 2);
        assert!(!h.orchestrator.start_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_off_stops_everything() {
        let mut h = Harness::new(true);
        h.game_started(GAME);
        h.orchestrator.handle_command(Command::ToggleClipping);
        h.pump();

        assert_eq!(h.orchestrator.state(), ClippingState::Disabled);
        assert_eq!(h.orchestrator.manager.phase(), BufferPhase::Inactive);
        assert_eq!(h.fake.state().source_creations("game_capture"), 1);
        assert_eq!(h.fake.live_objects(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_stays_awaiting() {
        let mut h = Harness::new(true);
        h.fake.state().fail_output_start = true;
        h.game_started(GAME);

        assert_eq!(h.orchestrator.state(), ClippingState::AwaitingGame);
        assert!(h.orchestrator.current_game().is_none());
        // only the scene and desktop audio remain
        assert_eq!(h.fake.live_objects(), 2);
        assert!(h
            .statuses()
            .iter()
            .any(|s| matches!(s, Status::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn save_command_reports_clip() {
        let mut h = Harness::new(true);
        h.game_started(GAME);
        h.statuses();

        h.orchestrator.handle_command(Command::SaveClip);
        let output = h.orchestrator.manager.output_handle().unwrap();
        let clip = h.dir.path().join("Clips").join("Hades").join("Replay_1.mp4");
        std::fs::write(&clip, b"clip").unwrap();
        h.fake.emit_saved(output, Some(clip.clone()));
        h.pump();

        let statuses = h.statuses();
        assert!(matches!(&statuses[0], Status::SaveStarted(label) if label.ends_with("_30s.mp4")));
        assert_eq!(statuses[1], Status::ClipSaved(clip));
    }

    #[tokio::test(start_paused = true)]
    async fn save_while_awaiting_is_rejected() {
        let mut h = Harness::new(true);
        h.statuses();
        h.orchestrator.handle_command(Command::SaveClip);

        assert_eq!(
            h.statuses(),
            vec![Status::SaveFailed("clipping mode is not active".to_string())]
        );
        assert_eq!(h.fake.state().save_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn encoding_change_restarts_active_buffer() {
        let mut h = Harness::new(true);
        h.game_started(GAME);

        h.orchestrator.handle_command(Command::SetEncoding(EncodingProfile {
            bitrate: 20000,
            ..EncodingProfile::default()
        }));
        h.pump();
        assert_eq!(h.orchestrator.manager.phase(), BufferPhase::Inactive);

        h.advance(Duration::from_millis(500)).await;
        assert_eq!(h.orchestrator.manager.phase(), BufferPhase::Active);
        assert_eq!(h.fake.video_encoder_creations(), 2);
        assert_eq!(h.fake.audio_encoder_creations(), 1);

        let saved = Config::load_from(h.dir.path().join("config.toml")).unwrap();
        assert_eq!(saved.encoding.bitrate, 20000);
    }

    #[tokio::test(start_paused = true)]
    async fn volume_change_does_not_restart() {
        let mut h = Harness::new(true);
        h.game_started(GAME);

        h.orchestrator.handle_command(Command::SetAudio(AudioProfile {
            volume: 0.4,
            ..AudioProfile::default()
        }));
        h.pump();
        assert_eq!(h.orchestrator.manager.phase(), BufferPhase::Active);
        assert_eq!(h.fake.state().stop_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_duration_is_persisted() {
        let mut h = Harness::new(false);
        assert_eq!(
            h.orchestrator.manager.buffer_duration(),
            DEFAULT_BUFFER_DURATION_SECS
        );
        h.orchestrator.handle_command(Command::SetBufferDuration(120));

        let saved = Config::load_from(h.dir.path().join("config.toml")).unwrap();
        assert_eq!(saved.clipping.buffer_duration_secs, 120);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_current_game_deactivates() {
        let mut h = Harness::new(true);
        h.game_started(GAME);
        h.orchestrator.handle_command(Command::RemoveGame("hades.exe".to_string()));
        h.pump();

        assert_eq!(h.orchestrator.state(), ClippingState::AwaitingGame);
        assert!(h.orchestrator.config.clipping.games.is_empty());
        assert!(h.orchestrator.games_tx.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn output_folder_change_is_applied() {
        let mut h = Harness::new(false);
        let folder: PathBuf = h.dir.path().join("Elsewhere");
        h.orchestrator
            .handle_command(Command::SetOutputFolder(folder.clone()));

        assert!(folder.join("General").is_dir());
        assert_eq!(h.orchestrator.config.clipping.output_folder, folder);
    }

    #[tokio::test(start_paused = true)]
    async fn run_exits_on_shutdown_and_tears_down() {
        let mut h = Harness::new(false);
        h.cmd_tx.send(Command::ToggleClipping).await.unwrap();
        h.cmd_tx.send(Command::Shutdown).await.unwrap();

        h.orchestrator.run().await.unwrap();
        assert_eq!(h.orchestrator.state(), ClippingState::AwaitingGame);
        assert!(!h.fake.state().started);
        assert_eq!(h.fake.live_objects(), 0);
    }
}
