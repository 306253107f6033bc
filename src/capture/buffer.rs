//! Replay buffer lifecycle manager
//!
//! Owns every engine object used for clipping and drives the replay buffer
//! output through start, stop, fast reset and save. Encoders and audio
//! sources persist across buffer cycles and are only rebuilt when the
//! profile governing them changed since the last successful start.
//!
//! Nothing here blocks. Asynchronous engine work (output stop, clip save) is
//! tracked as a pending continuation plus a deadline in [`Timers`]; the owner
//! feeds engine signals in through [`BufferManager::handle_signal`] and wakes
//! the manager at [`BufferManager::next_deadline`] via
//! [`BufferManager::poll_timers`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::encoders::{self, EncoderInfo};
use super::profile::{
    AudioProfile, CaptureProfile, EncoderFamily, EncoderKind, EncodingProfile, MicrophoneProfile,
};
use super::session::{
    game_name_from_executable, generate_clip_filename, resolve_saved_file, GameSession,
};
use super::timers::{
    TimerKind, Timers, BUFFER_STOP_TIMEOUT, DELAYED_START_DELAY, ENCODER_SETTLE_DELAY,
    POST_SAVE_RESET_DELAY, RESET_VERIFY_DELAY, SAVE_COOLDOWN, SAVE_TIMEOUT,
};
use crate::engine::{
    CaptureEngine, EncoderHandle, EngineSignal, OutputHandle, Owned, SceneHandle, Settings,
    SignalKind, SignalPayload, SourceHandle, Subscription,
};
use crate::error::{BufferError, EngineError, SaveRejected};

pub const SCENE_NAME: &str = "capture_scene";
pub const GAME_CAPTURE_KIND: &str = "game_capture";
pub const GAME_CAPTURE_NAME: &str = "Game Capture";
pub const REPLAY_OUTPUT_KIND: &str = "replay_buffer";
pub const REPLAY_OUTPUT_NAME: &str = "buffer_output";
/// Engine-side file name pattern for replay files
pub const REPLAY_FILE_FORMAT: &str = "Replay_%CCYY%MM%DD_%hh%mm%ss";
pub const REPLAY_FILE_EXTENSION: &str = "mp4";
pub const DEFAULT_BUFFER_DURATION_SECS: u32 = 60;

const SCENE_CHANNEL: u32 = 0;
const DESKTOP_AUDIO_CHANNEL: u32 = 1;
const MICROPHONE_CHANNEL: u32 = 2;

/// Sample rates tried, in order, when resetting the audio pipeline
const AUDIO_SAMPLE_RATES: [u32; 2] = [48000, 44100];

/// Notifications emitted to whoever drives the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferEvent {
    ClippingModeChanged(bool),
    SaveStarted { label: String },
    SaveFinished { success: bool, path: Option<PathBuf> },
}

/// Lifecycle of the replay buffer output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPhase {
    /// No output exists
    Inactive,
    /// Output exists and is buffering
    Active,
    /// Async stop in flight; the output is released once it completes
    Stopping,
    /// Async stop in flight; the same output restarts once it completes
    Resetting,
}

impl BufferPhase {
    pub fn can_transition_to(self, next: BufferPhase) -> bool {
        use BufferPhase::*;
        matches!(
            (self, next),
            (Inactive, Active)
                | (Active, Stopping)
                | (Active, Inactive)
                | (Active, Resetting)
                | (Stopping, Inactive)
                | (Resetting, Active)
                | (Resetting, Stopping)
                | (Resetting, Inactive)
        )
    }
}

#[derive(Debug)]
enum SaveState {
    Idle,
    Saving {
        label: String,
        subscription: Subscription,
    },
}

/// What runs when the pending output stop completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingStop {
    Cleanup,
    Reset,
}

/// Profiles the persistent components were last built from.
///
/// Only written after a successful start. Defaults until then, so the first
/// start builds everything that does not exist yet.
#[derive(Debug, Clone, Default)]
struct BufferState {
    encoding: EncodingProfile,
    audio: AudioProfile,
    microphone: MicrophoneProfile,
    buffer_duration_secs: u32,
}

/// Objects created by the current start attempt, released if it fails
#[derive(Debug, Default)]
struct FreshObjects {
    video_encoder: bool,
    audio_encoder: bool,
}

pub struct BufferManager {
    engine: Arc<dyn CaptureEngine>,
    events: mpsc::UnboundedSender<BufferEvent>,
    initialized: bool,

    capture: CaptureProfile,
    encoding: EncodingProfile,
    audio: AudioProfile,
    microphone: MicrophoneProfile,
    buffer_duration_secs: u32,

    state: BufferState,
    phase: BufferPhase,
    save: SaveState,
    pending: Option<PendingStop>,
    stop_subscription: Option<Subscription>,
    /// Arm a delayed start once the buffer reaches `Inactive`
    restart_pending: bool,
    last_save: Option<Instant>,
    timers: Timers,

    session: GameSession,
    available_encoders: Vec<EncoderInfo>,

    scene: Owned<SceneHandle>,
    game_source: Owned<SourceHandle>,
    desktop_source: Owned<SourceHandle>,
    microphone_source: Owned<SourceHandle>,
    video_encoder: Owned<EncoderHandle>,
    audio_encoder: Owned<EncoderHandle>,
    output: Owned<OutputHandle>,
}

impl BufferManager {
    pub fn new(
        engine: Arc<dyn CaptureEngine>,
        capture: CaptureProfile,
        output_root: impl Into<PathBuf>,
        events: mpsc::UnboundedSender<BufferEvent>,
    ) -> Self {
        Self {
            scene: Owned::empty(engine.clone()),
            game_source: Owned::empty(engine.clone()),
            desktop_source: Owned::empty(engine.clone()),
            microphone_source: Owned::empty(engine.clone()),
            video_encoder: Owned::empty(engine.clone()),
            audio_encoder: Owned::empty(engine.clone()),
            output: Owned::empty(engine.clone()),
            engine,
            events,
            initialized: false,
            capture,
            encoding: EncodingProfile::default(),
            audio: AudioProfile::default(),
            microphone: MicrophoneProfile::default(),
            buffer_duration_secs: DEFAULT_BUFFER_DURATION_SECS,
            state: BufferState::default(),
            phase: BufferPhase::Inactive,
            save: SaveState::Idle,
            pending: None,
            stop_subscription: None,
            restart_pending: false,
            last_save: None,
            timers: Timers::new(),
            session: GameSession::new(output_root),
            available_encoders: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Engine lifecycle
    // ------------------------------------------------------------------

    /// Bring the engine up and create the objects that live for the whole
    /// session: the capture scene and the desktop audio source.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.initialized {
            return Err(EngineError::AlreadyRunning);
        }

        info!(
            "Initializing capture engine at {}x{} @ {} fps",
            self.capture.width, self.capture.height, self.capture.fps
        );
        if let Err(e) = self.engine.startup(&self.capture) {
            error!("Engine startup failed: {}", e);
            return Err(e);
        }

        let audio_ready = AUDIO_SAMPLE_RATES.iter().any(|rate| {
            let accepted = self.engine.reset_audio(*rate, self.audio.channels);
            if !accepted {
                warn!("Audio pipeline rejected {} Hz", rate);
            }
            accepted
        });
        if !audio_ready {
            error!("No usable audio format");
            self.engine.shutdown();
            return Err(EngineError::AudioFormatRejected);
        }

        let Some(scene) = self.engine.create_scene(SCENE_NAME) else {
            error!("Failed to create scene {}", SCENE_NAME);
            self.engine.shutdown();
            return Err(EngineError::SceneCreation(SCENE_NAME.to_string()));
        };
        self.engine.set_channel_scene(SCENE_CHANNEL, scene);
        self.scene.replace(Some(scene));

        self.available_encoders = encoders::detect_available(self.engine.as_ref());
        self.desktop_source
            .replace(encoders::create_desktop_source(self.engine.as_ref(), &self.audio));
        if self.desktop_source.is_none() {
            warn!("Desktop audio source could not be created");
        }

        if let Err(e) = self.session.ensure_current_folder() {
            warn!("{:#}", e);
        }

        self.initialized = true;
        info!("Capture engine initialized");
        Ok(())
    }

    /// Tear down everything, including the persistent encoders and sources,
    /// and shut the engine down. Runs on drop as well.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        info!("Shutting down capture engine");

        self.restart_pending = false;
        self.abort_save();
        if let Some(subscription) = self.stop_subscription.take() {
            self.engine.unsubscribe(subscription);
        }
        self.pending = None;
        if let Some(output) = self.output.get() {
            if self.engine.output_active(output) {
                self.engine.force_stop_output(output);
            }
        }
        self.output.release();
        if self.phase != BufferPhase::Inactive {
            self.transition(BufferPhase::Inactive);
            self.emit(BufferEvent::ClippingModeChanged(false));
        }
        self.timers.clear();

        self.clear_game_capture();
        self.engine.set_channel_source(DESKTOP_AUDIO_CHANNEL, None);
        self.engine.set_channel_source(MICROPHONE_CHANNEL, None);
        self.engine.set_channel_source(SCENE_CHANNEL, None);
        self.video_encoder.release();
        self.audio_encoder.release();
        self.desktop_source.release();
        self.microphone_source.release();
        self.scene.release();

        self.engine.shutdown();
        self.initialized = false;
        self.state = BufferState::default();
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    /// Start buffering. When already active only the buffer duration is
    /// re-applied.
    pub fn start(&mut self) -> Result<(), BufferError> {
        if !self.initialized {
            return Err(BufferError::NotInitialized);
        }
        match self.phase {
            BufferPhase::Active => {
                debug!("Buffer already active, applying settings updates");
                self.apply_buffer_settings();
                return Ok(());
            }
            BufferPhase::Stopping | BufferPhase::Resetting => {
                debug!("Cannot start buffer while {:?}", self.phase);
                return Err(BufferError::OperationPending);
            }
            BufferPhase::Inactive => {}
        }

        self.validate_engine()?;
        self.restart_pending = false;
        self.timers.cancel(TimerKind::DelayedStart);

        info!("Setting up replay buffer");
        let mut fresh = FreshObjects::default();
        if let Err(e) = self.build_pipeline(&mut fresh) {
            warn!("Replay buffer setup failed: {}", e);
            self.output.release();
            if fresh.video_encoder {
                self.video_encoder.release();
            }
            if fresh.audio_encoder {
                self.audio_encoder.release();
            }
            return Err(e);
        }

        self.state = BufferState {
            encoding: self.encoding.clone(),
            audio: self.audio.clone(),
            microphone: self.microphone.clone(),
            buffer_duration_secs: self.buffer_duration_secs,
        };
        self.transition(BufferPhase::Active);
        self.emit(BufferEvent::ClippingModeChanged(true));
        info!(
            "Replay buffer active ({}s) writing to {}",
            self.buffer_duration_secs,
            self.session.current_folder().display()
        );
        Ok(())
    }

    fn validate_engine(&self) -> Result<(), BufferError> {
        let video_ok = self
            .engine
            .video_info()
            .map(|v| v.width > 0 && v.height > 0)
            .unwrap_or(false);
        if !video_ok || self.engine.audio_info().is_none() {
            warn!("Engine pipeline not ready (video ok: {})", video_ok);
            return Err(BufferError::EngineNotReady);
        }
        Ok(())
    }

    fn build_pipeline(&mut self, fresh: &mut FreshObjects) -> Result<(), BufferError> {
        fresh.video_encoder = self.update_video_encoder()?;
        self.update_audio_sources();
        fresh.audio_encoder = self.update_audio_encoder()?;
        let output = self.ensure_output()?;

        if !self.engine.output_active(output) {
            if !self.engine.start_output(output) {
                let reason = self
                    .engine
                    .output_last_error(output)
                    .unwrap_or_else(|| "unknown error".to_string());
                return Err(BufferError::OutputStart(reason));
            }
            self.timers.arm(TimerKind::EncoderSettle, ENCODER_SETTLE_DELAY);
        }
        Ok(())
    }

    /// Returns true if a new encoder was created
    fn update_video_encoder(&mut self) -> Result<bool, BufferError> {
        let needs_recreation = match self.active_video_family() {
            Some(active) => self.encoding.requires_recreation(&self.state.encoding, active),
            None => true,
        };
        if !needs_recreation {
            debug!("Video encoder is up to date");
            return Ok(false);
        }

        debug!("Recreating video encoder");
        self.video_encoder.release();
        let encoder = encoders::create_video_encoder(
            self.engine.as_ref(),
            &self.encoding,
            &self.available_encoders,
        )
        .ok_or(BufferError::VideoEncoder)?;
        self.video_encoder.replace(Some(encoder));
        Ok(true)
    }

    /// Family of the video encoder currently held, if any
    fn active_video_family(&self) -> Option<EncoderFamily> {
        let encoder = self.video_encoder.get()?;
        let family = self
            .engine
            .encoder_id(encoder)
            .and_then(|id| EncoderKind::from_engine_id(&id))
            .map(|kind| kind.family())
            .unwrap_or(EncoderFamily::Software);
        Some(family)
    }

    fn update_audio_sources(&mut self) {
        let engine = self.engine.clone();
        let engine = engine.as_ref();

        let desktop_changed = self.audio.device_id != self.state.audio.device_id;
        if self.desktop_source.is_none() || desktop_changed {
            debug!("Recreating desktop audio source");
            self.desktop_source
                .replace(encoders::create_desktop_source(engine, &self.audio));
        }
        match self.desktop_source.get() {
            Some(source) => {
                encoders::apply_desktop_live(engine, source, &self.audio);
                engine.set_channel_source(
                    DESKTOP_AUDIO_CHANNEL,
                    self.audio.enabled.then_some(source),
                );
            }
            None => engine.set_channel_source(DESKTOP_AUDIO_CHANNEL, None),
        }

        let recreate_microphone = if self.microphone_source.is_some() {
            let device_changed = self.microphone.device_id != self.state.microphone.device_id;
            let switched_on = self.microphone.enabled && !self.state.microphone.enabled;
            device_changed || switched_on
        } else {
            self.microphone.enabled
        };
        if recreate_microphone {
            debug!("Recreating microphone source");
            let source = if self.microphone.enabled {
                encoders::create_microphone_source(engine, &self.microphone)
            } else {
                None
            };
            self.microphone_source.replace(source);
        }
        match self.microphone_source.get() {
            Some(source) => {
                encoders::apply_microphone_live(engine, source, &self.microphone);
                engine.set_channel_source(
                    MICROPHONE_CHANNEL,
                    self.microphone.enabled.then_some(source),
                );
            }
            None => engine.set_channel_source(MICROPHONE_CHANNEL, None),
        }
    }

    /// Returns true if a new encoder was created
    fn update_audio_encoder(&mut self) -> Result<bool, BufferError> {
        if self.audio_encoder.is_some() && self.audio.bitrate == self.state.audio.bitrate {
            debug!("Audio encoder is up to date");
            return Ok(false);
        }

        debug!("Recreating audio encoder");
        self.audio_encoder.release();
        let encoder = encoders::create_audio_encoder(self.engine.as_ref(), &self.audio)
            .ok_or(BufferError::AudioEncoder)?;
        self.audio_encoder.replace(Some(encoder));
        Ok(true)
    }

    /// Create the replay output if needed and (re)apply its settings
    fn ensure_output(&mut self) -> Result<OutputHandle, BufferError> {
        let (Some(video), Some(audio)) = (self.video_encoder.get(), self.audio_encoder.get()) else {
            warn!("Cannot create replay output without both encoders");
            return Err(BufferError::OutputCreation);
        };
        let directory = self.ensure_output_directory();

        let output = match self.output.get() {
            Some(output) => output,
            None => {
                let mut settings = Settings::new();
                settings
                    .set_int("max_time_sec", i64::from(self.buffer_duration_secs))
                    .set_string("directory", directory.to_string_lossy())
                    .set_string("format", REPLAY_FILE_FORMAT)
                    .set_string("extension", REPLAY_FILE_EXTENSION);
                let output = self
                    .engine
                    .create_output(REPLAY_OUTPUT_KIND, REPLAY_OUTPUT_NAME, &settings)
                    .ok_or(BufferError::OutputCreation)?;
                self.output.replace(Some(output));
                output
            }
        };

        let mut settings = Settings::new();
        settings
            .set_int("max_time_sec", i64::from(self.buffer_duration_secs))
            .set_string("directory", directory.to_string_lossy());
        self.engine.update_output(output, &settings);
        self.engine.set_output_encoders(output, video, audio);
        Ok(output)
    }

    fn ensure_output_directory(&mut self) -> PathBuf {
        match self.session.ensure_current_folder() {
            Ok(folder) => folder,
            Err(e) => {
                warn!("{:#}", e);
                self.session.current_folder()
            }
        }
    }

    fn apply_buffer_settings(&mut self) {
        let Some(output) = self.output.get() else {
            return;
        };
        if self.buffer_duration_secs == self.state.buffer_duration_secs {
            return;
        }
        let mut settings = Settings::new();
        settings.set_int("max_time_sec", i64::from(self.buffer_duration_secs));
        self.engine.update_output(output, &settings);
        self.state.buffer_duration_secs = self.buffer_duration_secs;
        info!("Buffer duration updated to {}s", self.buffer_duration_secs);
    }

    fn update_output_directory(&mut self) {
        let Some(output) = self.output.get() else {
            return;
        };
        let directory = self.ensure_output_directory();
        let mut settings = Settings::new();
        settings.set_string("directory", directory.to_string_lossy());
        self.engine.update_output(output, &settings);
        info!("Replay output now writing to {}", directory.display());
    }

    // ------------------------------------------------------------------
    // Stop and reset
    // ------------------------------------------------------------------

    /// Stop buffering and release the output. Encoders and sources are kept.
    ///
    /// A no-op while inactive. A delayed restart scheduled by a failed reset
    /// is cancelled.
    pub fn stop(&mut self) {
        self.restart_pending = false;
        self.timers.cancel(TimerKind::DelayedStart);
        self.begin_stop();
    }

    /// Full stop followed by a delayed start, so that profile changes that
    /// need new encoders or sources take effect.
    pub fn restart(&mut self) {
        match self.phase {
            BufferPhase::Inactive => {}
            _ => {
                info!("Restarting replay buffer");
                self.restart_pending = true;
                self.begin_stop();
            }
        }
    }

    fn begin_stop(&mut self) {
        match self.phase {
            BufferPhase::Inactive | BufferPhase::Stopping => return,
            BufferPhase::Resetting => {
                info!("Stop requested during reset, output will be released");
                self.pending = Some(PendingStop::Cleanup);
                self.transition(BufferPhase::Stopping);
                self.emit(BufferEvent::ClippingModeChanged(false));
                return;
            }
            BufferPhase::Active => {}
        }

        info!("Stopping replay buffer");
        self.abort_save();
        self.timers.cancel(TimerKind::PostSaveReset);
        self.timers.cancel(TimerKind::ResetVerify);
        self.timers.cancel(TimerKind::EncoderSettle);
        self.emit(BufferEvent::ClippingModeChanged(false));

        match self.output.get() {
            Some(output) if self.engine.output_active(output) => {
                self.request_output_stop(output, PendingStop::Cleanup);
                self.transition(BufferPhase::Stopping);
            }
            _ => self.complete_cleanup(),
        }
    }

    /// Stop and restart the same output in place. Refused while another
    /// stop or reset is pending.
    pub fn fast_reset(&mut self) -> Result<(), BufferError> {
        match self.phase {
            BufferPhase::Active => {}
            BufferPhase::Stopping | BufferPhase::Resetting => {
                debug!("Fast reset refused, {:?} in progress", self.phase);
                return Err(BufferError::OperationPending);
            }
            BufferPhase::Inactive => return Err(BufferError::OutputNotRunning),
        }
        if self.pending.is_some() {
            return Err(BufferError::OperationPending);
        }
        let Some(output) = self.output.get().filter(|o| self.engine.output_active(*o)) else {
            return Err(BufferError::OutputNotRunning);
        };

        debug!("Fast buffer reset");
        self.request_output_stop(output, PendingStop::Reset);
        self.transition(BufferPhase::Resetting);
        Ok(())
    }

    fn request_output_stop(&mut self, output: OutputHandle, continuation: PendingStop) {
        if let Some(stale) = self.stop_subscription.take() {
            self.engine.unsubscribe(stale);
        }
        self.stop_subscription = self.engine.subscribe(output, SignalKind::Stopped);
        if self.stop_subscription.is_none() {
            warn!("Could not subscribe to output stop, relying on timeout");
        }
        self.pending = Some(continuation);
        self.timers.arm(TimerKind::BufferStop, BUFFER_STOP_TIMEOUT);
        self.engine.stop_output(output);
    }

    fn on_output_stopped(&mut self, timed_out: bool) {
        self.timers.cancel(TimerKind::BufferStop);
        if let Some(subscription) = self.stop_subscription.take() {
            self.engine.unsubscribe(subscription);
        }
        if timed_out {
            warn!("Replay output did not stop in time, forcing");
            if let Some(output) = self.output.get() {
                if self.engine.output_active(output) {
                    self.engine.force_stop_output(output);
                }
            }
        } else {
            debug!("Replay output stopped");
        }

        match self.pending.take() {
            Some(PendingStop::Cleanup) => self.complete_cleanup(),
            Some(PendingStop::Reset) => self.restart_in_place(),
            None => debug!("Output stop with nothing pending"),
        }
    }

    fn complete_cleanup(&mut self) {
        self.output.release();
        if self.phase != BufferPhase::Inactive {
            self.transition(BufferPhase::Inactive);
        }
        info!("Replay buffer stopped");

        if self.restart_pending {
            self.restart_pending = false;
            self.timers.arm(TimerKind::DelayedStart, DELAYED_START_DELAY);
        }
    }

    fn restart_in_place(&mut self) {
        let restarted = self.video_encoder.is_some()
            && self.audio_encoder.is_some()
            && self
                .output
                .get()
                .map(|output| self.engine.start_output(output))
                .unwrap_or(false);

        if !restarted {
            warn!("In-place restart failed, falling back to a full restart");
            self.restart_pending = true;
            self.emit(BufferEvent::ClippingModeChanged(false));
            self.complete_cleanup();
            return;
        }

        self.transition(BufferPhase::Active);
        self.timers.arm(TimerKind::ResetVerify, RESET_VERIFY_DELAY);
        debug!("Replay output restarted in place");
    }

    fn fallback_restart(&mut self) {
        warn!("Falling back to full buffer restart");
        self.restart_pending = true;
        self.begin_stop();
    }

    // ------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------

    /// Flush the buffer to a file. Returns the label of the accepted save;
    /// the outcome arrives later as [`BufferEvent::SaveFinished`].
    pub fn save(&mut self, duration_secs: u32, filename: Option<&str>) -> Result<String, SaveRejected> {
        let now = Instant::now();
        if let Some(last) = self.last_save {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < SAVE_COOLDOWN {
                debug!("Save rejected, on cooldown");
                return Err(SaveRejected::Cooldown {
                    remaining: SAVE_COOLDOWN - elapsed,
                });
            }
        }
        if !self.is_active() {
            return Err(SaveRejected::NotActive);
        }
        if self.is_saving() {
            return Err(SaveRejected::AlreadySaving);
        }
        let Some(output) = self.output.get().filter(|o| self.engine.output_active(*o)) else {
            return Err(SaveRejected::OutputNotRunning);
        };

        self.last_save = Some(now);
        let label = filename
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| generate_clip_filename(duration_secs, &Local::now()));

        let Some(subscription) = self.engine.subscribe(output, SignalKind::Saved) else {
            warn!("Could not subscribe to the saved signal");
            return Err(SaveRejected::Subscription);
        };
        if !self.engine.call_procedure(output, "save") {
            warn!("Save procedure call failed");
            self.engine.unsubscribe(subscription);
            return Err(SaveRejected::TriggerFailed);
        }

        self.save = SaveState::Saving {
            label: label.clone(),
            subscription,
        };
        self.timers.arm(TimerKind::SaveTimeout, SAVE_TIMEOUT);
        self.emit(BufferEvent::SaveStarted {
            label: label.clone(),
        });
        info!("Saving replay ({})", label);
        Ok(label)
    }

    fn on_saved(&mut self, reported: Option<PathBuf>) {
        let SaveState::Saving { label, subscription } =
            std::mem::replace(&mut self.save, SaveState::Idle)
        else {
            return;
        };
        self.timers.cancel(TimerKind::SaveTimeout);
        self.engine.unsubscribe(subscription);

        let expected = self.session.current_folder();
        let resolved = resolve_saved_file(reported.as_deref(), &expected);
        match &resolved {
            Some(path) => info!("Replay {} saved to {}", label, path.display()),
            None => warn!(
                "Replay {} reported saved but no file was found (reported: {:?})",
                label, reported
            ),
        }
        self.emit(BufferEvent::SaveFinished {
            success: resolved.is_some(),
            path: resolved,
        });

        self.timers.arm(TimerKind::PostSaveReset, POST_SAVE_RESET_DELAY);
    }

    fn on_save_timeout(&mut self) {
        let SaveState::Saving { label, subscription } =
            std::mem::replace(&mut self.save, SaveState::Idle)
        else {
            return;
        };
        warn!("Save of {} timed out", label);
        self.engine.unsubscribe(subscription);
        self.emit(BufferEvent::SaveFinished {
            success: false,
            path: None,
        });
    }

    /// Drop an in-flight save, reporting it as failed
    fn abort_save(&mut self) {
        let SaveState::Saving { label, subscription } =
            std::mem::replace(&mut self.save, SaveState::Idle)
        else {
            return;
        };
        warn!("Abandoning save of {}", label);
        self.timers.cancel(TimerKind::SaveTimeout);
        self.engine.unsubscribe(subscription);
        self.emit(BufferEvent::SaveFinished {
            success: false,
            path: None,
        });
    }

    // ------------------------------------------------------------------
    // Signals and timers
    // ------------------------------------------------------------------

    /// Feed an engine signal back in. Signals for subscriptions that are no
    /// longer current are ignored.
    pub fn handle_signal(&mut self, signal: EngineSignal) {
        if self.stop_subscription == Some(signal.subscription) {
            self.on_output_stopped(false);
            return;
        }

        let is_save = matches!(
            &self.save,
            SaveState::Saving { subscription, .. } if *subscription == signal.subscription
        );
        if is_save {
            let path = match signal.payload {
                SignalPayload::Saved { path } => path,
                SignalPayload::Stopped { .. } => None,
            };
            self.on_saved(path);
            return;
        }

        debug!("Ignoring stale {:?} signal", signal.subscription.kind);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Run every timer due at `now`
    pub fn poll_timers(&mut self, now: Instant) {
        for kind in self.timers.take_due(now) {
            self.on_timer(kind);
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::BufferStop => {
                if self.pending.is_some() {
                    self.on_output_stopped(true);
                }
            }
            TimerKind::SaveTimeout => self.on_save_timeout(),
            TimerKind::PostSaveReset => {
                if self.phase == BufferPhase::Active {
                    if let Err(e) = self.fast_reset() {
                        warn!("Fast reset after save failed: {}", e);
                        self.fallback_restart();
                    }
                }
            }
            TimerKind::ResetVerify => {
                let running = self
                    .output
                    .get()
                    .map(|output| self.engine.output_active(output))
                    .unwrap_or(false);
                if self.phase == BufferPhase::Active && !running {
                    warn!("Replay output not running after reset");
                    self.fallback_restart();
                }
            }
            TimerKind::DelayedStart => {
                if let Err(e) = self.start() {
                    warn!("Delayed buffer start failed: {}", e);
                }
            }
            TimerKind::EncoderSettle => self.reapply_encoder_settings(),
        }
    }

    fn reapply_encoder_settings(&mut self) {
        let (Some(output), Some(encoder)) = (self.output.get(), self.video_encoder.get()) else {
            return;
        };
        if self.phase != BufferPhase::Active || !self.engine.output_active(output) {
            return;
        }
        let Some(encoder_id) = self.engine.encoder_id(encoder) else {
            return;
        };
        let settings = encoders::video_encoder_settings(&self.state.encoding, &encoder_id);
        self.engine.update_encoder(encoder, &settings);
        debug!("Re-applied {} settings after start", encoder_id);
    }

    // ------------------------------------------------------------------
    // Game capture
    // ------------------------------------------------------------------

    /// Capture the game behind `executable`, replacing any previous capture
    pub fn set_game_capture(&mut self, executable: &str) -> Result<(), BufferError> {
        if !self.initialized {
            return Err(BufferError::NotInitialized);
        }
        let game_name = game_name_from_executable(executable);
        if self.game_source.is_some() && game_name == self.session.game_name() {
            debug!("Game capture already set for {}", game_name);
            return Ok(());
        }

        self.clear_game_capture();

        let mut settings = Settings::new();
        settings
            .set_string("executable", executable)
            .set_bool("capture_cursor", self.capture.capture_cursor)
            .set_bool("capture_overlays", true)
            .set_bool("anti_cheat_hook", true)
            .set_string("hook_rate", "normal")
            .set_string("mode", "any_fullscreen");
        let scene = self.scene.get().ok_or(BufferError::NotInitialized)?;
        let bounds = (self.capture.width, self.capture.height);
        let source = self
            .engine
            .create_scene_source(scene, GAME_CAPTURE_KIND, GAME_CAPTURE_NAME, &settings, bounds)
            .ok_or_else(|| BufferError::CaptureSource(executable.to_string()))?;
        self.game_source.replace(Some(source));
        info!("Game capture set for {}", game_name);

        if self.session.set_game(game_name) && self.is_active() {
            self.update_output_directory();
        }
        Ok(())
    }

    pub fn clear_game_capture(&mut self) {
        let Some(source) = self.game_source.get() else {
            return;
        };
        if let Some(scene) = self.scene.get() {
            self.engine.scene_remove(scene, source);
        }
        self.game_source.release();
        debug!("Game capture cleared");
    }

    // ------------------------------------------------------------------
    // Settings surface
    // ------------------------------------------------------------------

    /// Store a new encoding profile. Applied on the next buffer start.
    pub fn set_encoding(&mut self, profile: EncodingProfile) {
        if profile == self.encoding {
            return;
        }
        self.encoding = profile;
    }

    /// Store a new desktop audio profile, pushing volume and enabled state
    /// into the live source
    pub fn set_audio(&mut self, profile: AudioProfile) {
        if let Some(source) = self.desktop_source.get() {
            encoders::apply_desktop_live(self.engine.as_ref(), source, &profile);
        }
        self.audio = profile;
    }

    /// Store a new microphone profile, pushing volume, enabled state and the
    /// noise filter toggle into the live source
    pub fn set_microphone(&mut self, profile: MicrophoneProfile) {
        if let Some(source) = self.microphone_source.get() {
            encoders::apply_microphone_live(self.engine.as_ref(), source, &profile);
        }
        self.microphone = profile;
    }

    pub fn set_buffer_duration(&mut self, secs: u32) {
        self.buffer_duration_secs = secs.max(1);
        if self.phase == BufferPhase::Active {
            self.apply_buffer_settings();
        }
    }

    /// Point clips at a new root folder; its `General` folder is created
    pub fn set_output_folder(&mut self, folder: impl Into<PathBuf>) -> Result<()> {
        self.session.set_output_root(folder)?;
        if self.is_active() {
            self.update_output_directory();
        }
        Ok(())
    }

    pub fn capture(&self) -> &CaptureProfile {
        &self.capture
    }

    pub fn encoding(&self) -> &EncodingProfile {
        &self.encoding
    }

    pub fn audio(&self) -> &AudioProfile {
        &self.audio
    }

    pub fn microphone(&self) -> &MicrophoneProfile {
        &self.microphone
    }

    pub fn buffer_duration(&self) -> u32 {
        self.buffer_duration_secs
    }

    pub fn output_root(&self) -> &Path {
        self.session.output_root()
    }

    pub fn current_game(&self) -> &str {
        self.session.game_name()
    }

    pub fn current_folder(&mut self) -> PathBuf {
        self.session.current_folder()
    }

    pub fn available_encoders(&self) -> &[EncoderInfo] {
        &self.available_encoders
    }

    #[cfg(test)]
    pub fn output_handle(&self) -> Option<OutputHandle> {
        self.output.get()
    }

    /// Non-owning view of the desktop audio source, for metering
    pub fn desktop_source(&self) -> Option<SourceHandle> {
        self.desktop_source.get()
    }

    /// Non-owning view of the microphone source, for metering
    pub fn microphone_source(&self) -> Option<SourceHandle> {
        self.microphone_source.get()
    }

    #[cfg(test)]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Clipping mode is on (buffering, or restarting in place)
    pub fn is_active(&self) -> bool {
        matches!(self.phase, BufferPhase::Active | BufferPhase::Resetting)
    }

    pub fn is_saving(&self) -> bool {
        matches!(self.save, SaveState::Saving { .. })
    }

    pub fn phase(&self) -> BufferPhase {
        self.phase
    }

    // ------------------------------------------------------------------

    fn transition(&mut self, next: BufferPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal buffer transition {:?} -> {:?}",
            self.phase,
            next
        );
        if !self.phase.can_transition_to(next) {
            warn!("Illegal buffer transition {:?} -> {:?}", self.phase, next);
        }
        debug!("Buffer {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    fn emit(&self, event: BufferEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::encoders::{DESKTOP_AUDIO_KIND, MICROPHONE_KIND, NOISE_FILTER_NAME};
    use crate::capture::profile::EncoderKind;
    use crate::engine::fake::FakeEngine;
    use crate::engine::SignalReceiver;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        fake: Arc<FakeEngine>,
        signals: SignalReceiver,
        events: mpsc::UnboundedReceiver<BufferEvent>,
        manager: BufferManager,
        dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let (fake, signals) = FakeEngine::new();
            let (tx, events) = mpsc::unbounded_channel();
            let dir = TempDir::new().unwrap();
            let mut manager = BufferManager::new(
                fake.clone(),
                CaptureProfile::default(),
                dir.path().join("Clips"),
                tx,
            );
            manager.initialize().unwrap();
            Self {
                fake,
                signals,
                events,
                manager,
                dir,
            }
        }

        fn started() -> Self {
            let mut h = Self::new();
            h.manager.start().unwrap();
            h.drain_events();
            h
        }

        fn pump(&mut self) {
            while let Ok(signal) = self.signals.try_recv() {
                self.manager.handle_signal(signal);
            }
        }

        async fn advance(&mut self, by: Duration) {
            tokio::time::advance(by).await;
            self.manager.poll_timers(Instant::now());
            self.pump();
        }

        fn drain_events(&mut self) -> Vec<BufferEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn output(&self) -> OutputHandle {
            self.manager.output.get().unwrap()
        }

        fn general(&self) -> PathBuf {
            self.dir.path().join("Clips").join("General")
        }
    }

    #[test]
    fn transition_table() {
        use BufferPhase::*;
        assert!(Inactive.can_transition_to(Active));
        assert!(Active.can_transition_to(Stopping));
        assert!(Active.can_transition_to(Resetting));
        assert!(Stopping.can_transition_to(Inactive));
        assert!(Resetting.can_transition_to(Active));
        assert!(Resetting.can_transition_to(Stopping));

        assert!(!Inactive.can_transition_to(Stopping));
        assert!(!Inactive.can_transition_to(Resetting));
        assert!(!Stopping.can_transition_to(Active));
        assert!(!Stopping.can_transition_to(Resetting));
        assert!(!Active.can_transition_to(Active));
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_builds_scene_and_desktop_audio() {
        let h = Harness::new();
        let state = h.fake.state();
        assert!(state.started);
        assert!(state.channels[&0].is_some());
        assert_eq!(state.source_creations(DESKTOP_AUDIO_KIND), 1);
        drop(state);

        let ids: Vec<&str> = h.manager.available_encoders().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["ffmpeg_nvenc", "obs_x264", "obs_x265"]);
        assert!(h.general().is_dir());
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_falls_back_to_44100() {
        let (fake, _signals) = FakeEngine::new();
        fake.state().rejected_sample_rates.insert(48000);
        let (tx, _events) = mpsc::unbounded_channel();
        let dir = TempDir::new().unwrap();
        let mut manager = BufferManager::new(fake.clone(), CaptureProfile::default(), dir.path(), tx);

        manager.initialize().unwrap();
        assert_eq!(fake.state().audio.unwrap().sample_rate, 44100);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_reports_rejected_audio() {
        let (fake, _signals) = FakeEngine::new();
        fake.state().rejected_sample_rates.extend([48000, 44100]);
        let (tx, _events) = mpsc::unbounded_channel();
        let dir = TempDir::new().unwrap();
        let mut manager = BufferManager::new(fake.clone(), CaptureProfile::default(), dir.path(), tx);

        assert_eq!(manager.initialize(), Err(EngineError::AudioFormatRejected));
        assert!(!manager.is_initialized());
        assert!(!fake.state().started);
        assert_eq!(manager.start(), Err(BufferError::NotInitialized));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_engine_startup_creates_nothing() {
        let (fake, _signals) = FakeEngine::new();
        fake.state().fail_startup = Some(EngineError::VideoBackendUnavailable {
            tried: "opengl".to_string(),
        });
        let (tx, _events) = mpsc::unbounded_channel();
        let dir = TempDir::new().unwrap();
        let mut manager = BufferManager::new(fake.clone(), CaptureProfile::default(), dir.path(), tx);

        assert_eq!(
            manager.initialize(),
            Err(EngineError::VideoBackendUnavailable {
                tried: "opengl".to_string()
            })
        );
        assert!(!manager.is_initialized());
        assert_eq!(fake.live_objects(), 0);
        assert!(fake.state().sources.is_empty());
        assert!(fake.state().channels.is_empty());
        assert_eq!(manager.start(), Err(BufferError::NotInitialized));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_output_creation_releases_fresh_encoders() {
        let mut h = Harness::new();
        let before = h.fake.live_objects();
        h.fake.state().fail_output_create = true;

        assert_eq!(h.manager.start(), Err(BufferError::OutputCreation));
        assert_eq!(h.manager.phase(), BufferPhase::Inactive);
        assert_eq!(h.fake.video_encoder_creations(), 1);
        assert_eq!(h.fake.audio_encoder_creations(), 1);
        assert!(h.manager.video_encoder.is_none());
        assert!(h.manager.audio_encoder.is_none());
        assert!(h.manager.output.is_none());
        assert_eq!(h.fake.live_objects(), before);
        assert!(h.drain_events().is_empty());

        h.fake.state().fail_output_create = false;
        h.manager.start().unwrap();
        assert_eq!(h.manager.phase(), BufferPhase::Active);
        assert_eq!(h.fake.video_encoder_creations(), 2);
    }
        let mut h = Harness::new();
        h.manager.start().unwrap();

        assert_eq!(h.manager.phase(), BufferPhase::Active);
        assert_eq!(h.fake.video_encoder_creations(), 1);
        assert_eq!(h.fake.audio_encoder_creations(), 1);
        assert_eq!(h.fake.output_creations(), 1);

        let output = h.output();
        let state = h.fake.state();
        let settings = &state.output_settings[&output];
        assert_eq!(settings.get_int("max_time_sec"), Some(60));
        assert_eq!(settings.get_str("format"), Some(REPLAY_FILE_FORMAT));
        assert_eq!(settings.get_str("extension"), Some("mp4"));
        assert_eq!(settings.get_str("directory").map(PathBuf::from), Some(h.general()));
        assert!(state.active_outputs.contains(&output));
        assert!(state.output_encoders.contains_key(&output));
        drop(state);

        assert_eq!(
            h.drain_events(),
            vec![BufferEvent::ClippingModeChanged(true)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_requires_ready_pipeline() {
        let mut h = Harness::new();
        h.fake.state().video = None;
        assert_eq!(h.manager.start(), Err(BufferError::EngineNotReady));
        assert_eq!(h.fake.output_creations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_start_recreates_nothing() {
        let mut h = Harness::started();
        h.manager.start().unwrap();

        assert_eq!(h.fake.video_encoder_creations(), 1);
        assert_eq!(h.fake.audio_encoder_creations(), 1);
        assert_eq!(h.fake.output_creations(), 1);
        assert_eq!(h.fake.state().source_creations(DESKTOP_AUDIO_KIND), 1);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_active_applies_new_duration() {
        let mut h = Harness::started();
        h.manager.set_buffer_duration(120);
        h.manager.start().unwrap();

        let output = h.output();
        assert_eq!(
            h.fake.state().output_settings[&output].get_int("max_time_sec"),
            Some(120)
        );
        assert_eq!(h.fake.output_creations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn volume_change_is_live_and_recreates_nothing() {
        let mut h = Harness::started();
        let desktop = h.manager.desktop_source().unwrap();

        h.manager.set_audio(AudioProfile {
            volume: 0.3,
            ..AudioProfile::default()
        });
        assert_eq!(h.fake.state().volumes[&desktop], 0.3);

        h.manager.stop();
        h.pump();
        h.manager.start().unwrap();

        assert_eq!(h.manager.desktop_source(), Some(desktop));
        assert_eq!(h.fake.state().source_creations(DESKTOP_AUDIO_KIND), 1);
        assert_eq!(h.fake.audio_encoder_creations(), 1);
        assert_eq!(h.fake.video_encoder_creations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn irrelevant_vendor_change_keeps_video_encoder() {
        let mut h = Harness::started();
        let mut profile = EncodingProfile::default();
        profile.nvenc.preset = "p7".to_string();
        profile.amf.usage = "speed".to_string();
        h.manager.set_encoding(profile);

        h.manager.stop();
        h.pump();
        h.manager.start().unwrap();
        assert_eq!(h.fake.video_encoder_creations(), 1);

        h.manager.set_encoding(EncodingProfile {
            encoder: EncoderKind::NvencH264,
            ..EncodingProfile::default()
        });
        h.manager.stop();
        h.pump();
        h.manager.start().unwrap();
        assert_eq!(h.fake.video_encoder_creations(), 2);
        assert_eq!(h.fake.state().video_encoders[1].id, "ffmpeg_nvenc");
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_encoder_rebuilds_on_x264_changes() {
        let mut h = Harness::new();
        let requested = EncodingProfile {
            encoder: EncoderKind::NvencHevc,
            ..EncodingProfile::default()
        };
        h.manager.set_encoding(requested.clone());
        h.manager.start().unwrap();
        assert_eq!(h.fake.state().video_encoders[0].id, "obs_x264");

        let mut nvenc_tweaked = requested.clone();
        nvenc_tweaked.nvenc.preset = "p7".to_string();
        h.manager.set_encoding(nvenc_tweaked.clone());
        h.manager.stop();
        h.pump();
        h.manager.start().unwrap();
        assert_eq!(h.fake.video_encoder_creations(), 1);

        let mut x264_tweaked = nvenc_tweaked;
        x264_tweaked.x264.preset = "slow".to_string();
        h.manager.set_encoding(x264_tweaked);
        h.manager.stop();
        h.pump();
        h.manager.start().unwrap();
        assert_eq!(h.fake.video_encoder_creations(), 2);
        assert_eq!(
            h.fake.state().video_encoders[1].settings.get_str("preset"),
            Some("slow")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bitrate_change_recreates_only_video_encoder() {
        let mut h = Harness::started();
        let desktop = h.manager.desktop_source();

        h.manager.set_encoding(EncodingProfile {
            bitrate: 12000,
            ..EncodingProfile::default()
        });
        h.manager.stop();
        h.pump();
        assert_eq!(h.manager.phase(), BufferPhase::Inactive);
        h.manager.start().unwrap();

        assert_eq!(h.fake.video_encoder_creations(), 2);
        assert_eq!(h.fake.audio_encoder_creations(), 1);
        assert_eq!(h.fake.state().source_creations(DESKTOP_AUDIO_KIND), 1);
        assert_eq!(h.manager.desktop_source(), desktop);
        assert_eq!(
            h.fake.state().video_encoders[1].settings.get_int("bitrate"),
            Some(12000)
        );
        // scene, desktop audio, both encoders and the output; the old encoder is gone
        assert_eq!(h.fake.live_objects(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn audio_bitrate_and_device_changes() {
        let mut h = Harness::started();
        h.manager.set_audio(AudioProfile {
            bitrate: 320,
            device_id: "{speakers-2}".to_string(),
            ..AudioProfile::default()
        });
        h.manager.stop();
        h.pump();
        h.manager.start().unwrap();

        assert_eq!(h.fake.audio_encoder_creations(), 2);
        assert_eq!(h.fake.state().source_creations(DESKTOP_AUDIO_KIND), 2);
        assert_eq!(h.fake.video_encoder_creations(), 1);
        let desktop = h.manager.desktop_source().unwrap();
        assert_eq!(h.fake.state().channels[&1], Some(desktop.0));
    }

    #[tokio::test(start_paused = true)]
    async fn microphone_lifecycle() {
        let mut h = Harness::started();
        assert!(h.manager.microphone_source().is_none());
        assert_eq!(h.fake.state().channels[&2], None);

        h.manager.set_microphone(MicrophoneProfile {
            enabled: true,
            ..MicrophoneProfile::default()
        });
        h.manager.stop();
        h.pump();
        h.manager.start().unwrap();
        let mic = h.manager.microphone_source().unwrap();
        assert_eq!(h.fake.state().source_creations(MICROPHONE_KIND), 1);
        assert_eq!(h.fake.state().channels[&2], Some(mic.0));

        // Live: volume and noise suppression off
        h.manager.set_microphone(MicrophoneProfile {
            enabled: true,
            volume: 0.5,
            noise_suppression: false,
            ..MicrophoneProfile::default()
        });
        {
            let state = h.fake.state();
            assert_eq!(state.volumes[&mic], 0.5);
            assert_eq!(state.filters[&mic], vec![(NOISE_FILTER_NAME.to_string(), false)]);
        }

        // Disabled keeps the source but unroutes it
        h.manager.set_microphone(MicrophoneProfile {
            enabled: false,
            ..MicrophoneProfile::default()
        });
        h.manager.stop();
        h.pump();
        h.manager.start().unwrap();
        assert_eq!(h.manager.microphone_source(), Some(mic));
        assert_eq!(h.fake.state().channels[&2], None);

        // Switching back on rebuilds it
        h.manager.set_microphone(MicrophoneProfile {
            enabled: true,
            ..MicrophoneProfile::default()
        });
        h.manager.stop();
        h.pump();
        h.manager.start().unwrap();
        assert_ne!(h.manager.microphone_source(), Some(mic));
        assert_eq!(h.fake.state().source_creations(MICROPHONE_KIND), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_releases_partial_objects() {
        let mut h = Harness::new();
        let baseline = h.fake.live_objects();
        h.fake.state().fail_output_start = true;

        assert_eq!(
            h.manager.start(),
            Err(BufferError::OutputStart("scripted failure".to_string()))
        );
        assert_eq!(h.manager.phase(), BufferPhase::Inactive);
        assert!(h.manager.output.is_none());
        assert!(h.manager.video_encoder.is_none());
        assert!(h.manager.audio_encoder.is_none());
        assert_eq!(h.fake.live_objects(), baseline);
        assert!(h.drain_events().is_empty());

        h.fake.state().fail_output_start = false;
        h.manager.start().unwrap();
        assert_eq!(h.manager.phase(), BufferPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_audio_encoder_releases_new_video_encoder() {
        let mut h = Harness::new();
        h.fake.state().fail_audio_encoder = true;

        assert_eq!(h.manager.start(), Err(BufferError::AudioEncoder));
        assert_eq!(h.fake.video_encoder_creations(), 1);
        assert!(h.manager.video_encoder.is_none());
        assert_eq!(h.fake.output_creations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_inactive_is_a_noop() {
        let mut h = Harness::new();
        h.manager.stop();

        let state = h.fake.state();
        assert_eq!(state.subscribe_calls, 0);
        assert_eq!(state.stop_calls, 0);
        drop(state);
        assert_eq!(h.manager.phase(), BufferPhase::Inactive);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_signal_and_keeps_encoders() {
        let mut h = Harness::started();
        let output = h.output();
        h.manager.stop();

        assert_eq!(h.manager.phase(), BufferPhase::Stopping);
        assert!(h.manager.output.is_some());
        assert_eq!(h.fake.state().subscriptions_for(output, SignalKind::Stopped), 1);

        h.pump();
        assert_eq!(h.manager.phase(), BufferPhase::Inactive);
        assert!(h.manager.output.is_none());
        assert!(h.manager.video_encoder.is_some());
        assert!(h.manager.audio_encoder.is_some());
        assert_eq!(h.fake.state().force_stop_calls, 0);
        assert!(h.manager.next_deadline().is_none());
        assert_eq!(
            h.drain_events(),
            vec![BufferEvent::ClippingModeChanged(false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_timeout_forces_the_output() {
        let mut h = Harness::started();
        h.fake.state().auto_stop_signal = false;
        let output = h.output();
        // Keep the output "running" so the timeout path has to force it
        h.manager.stop();
        h.fake.set_output_active(output, true);

        h.advance(Duration::from_millis(2900)).await;
        assert_eq!(h.manager.phase(), BufferPhase::Stopping);

        h.advance(Duration::from_millis(200)).await;
        assert_eq!(h.manager.phase(), BufferPhase::Inactive);
        assert_eq!(h.fake.state().force_stop_calls, 1);
        assert!(h.manager.output.is_none());
        assert_eq!(h.fake.state().subscriptions.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_subscription_still_forces_after_timeout() {
        let mut h = Harness::started();
        let output = h.output();
        {
            let mut state = h.fake.state();
            state.fail_subscribe = true;
            state.auto_stop_signal = false;
        }
        h.manager.stop();
        h.fake.set_output_active(output, true);

        assert_eq!(h.manager.phase(), BufferPhase::Stopping);
        assert!(h.manager.stop_subscription.is_none());
        assert!(h.manager.timers.is_armed(TimerKind::BufferStop));

        h.advance(BUFFER_STOP_TIMEOUT).await;
        assert_eq!(h.manager.phase(), BufferPhase::Inactive);
        assert_eq!(h.fake.state().force_stop_calls, 1);
        assert!(h.manager.output.is_none());
        assert!(h.manager.video_encoder.is_some());
        assert!(h.manager.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_stopping_is_rejected() {
        let mut h = Harness::started();
        h.fake.state().auto_stop_signal = false;
        h.manager.stop();

        assert_eq!(h.manager.start(), Err(BufferError::OperationPending));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_reset_restarts_same_output() {
        let mut h = Harness::started();
        let output = h.output();

        h.manager.fast_reset().unwrap();
        assert_eq!(h.manager.phase(), BufferPhase::Resetting);
        assert!(h.manager.is_active());

        h.pump();
        assert_eq!(h.manager.phase(), BufferPhase::Active);
        assert_eq!(h.output(), output);
        assert_eq!(h.fake.output_creations(), 1);
        assert_eq!(h.fake.state().start_calls, 2);

        h.advance(RESET_VERIFY_DELAY).await;
        assert_eq!(h.manager.phase(), BufferPhase::Active);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_fast_reset_is_refused() {
        let mut h = Harness::started();
        h.fake.state().auto_stop_signal = false;
        let output = h.output();

        h.manager.fast_reset().unwrap();
        assert_eq!(h.manager.fast_reset(), Err(BufferError::OperationPending));
        assert_eq!(h.fake.state().subscriptions_for(output, SignalKind::Stopped), 1);
        assert_eq!(h.fake.state().stop_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_in_place_restart_falls_back_to_full_restart() {
        let mut h = Harness::started();
        h.manager.fast_reset().unwrap();
        h.fake.state().fail_output_start = true;
        h.pump();

        assert_eq!(h.manager.phase(), BufferPhase::Inactive);
        assert!(h.manager.output.is_none());
        assert_eq!(
            h.drain_events(),
            vec![BufferEvent::ClippingModeChanged(false)]
        );

        h.fake.state().fail_output_start = false;
        h.advance(DELAYED_START_DELAY).await;
        assert_eq!(h.manager.phase(), BufferPhase::Active);
        assert_eq!(h.fake.output_creations(), 2);
        assert_eq!(h.fake.video_encoder_creations(), 1);
        assert_eq!(
            h.drain_events(),
            vec![BufferEvent::ClippingModeChanged(true)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dead_output_after_reset_triggers_full_restart() {
        let mut h = Harness::started();
        let output = h.output();
        h.manager.fast_reset().unwrap();
        h.pump();
        h.fake.set_output_active(output, false);

        h.advance(RESET_VERIFY_DELAY).await;
        assert_eq!(h.manager.phase(), BufferPhase::Inactive);

        h.advance(DELAYED_START_DELAY).await;
        assert_eq!(h.manager.phase(), BufferPhase::Active);
        assert_eq!(h.fake.output_creations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn user_stop_cancels_pending_restart() {
        let mut h = Harness::started();
        h.manager.fast_reset().unwrap();
        h.fake.state().fail_output_start = true;
        h.pump();
        h.fake.state().fail_output_start = false;

        h.manager.stop();
        h.advance(DELAYED_START_DELAY).await;
        assert_eq!(h.manager.phase(), BufferPhase::Inactive);
        assert_eq!(h.fake.output_creations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_reset_releases_output() {
        let mut h = Harness::started();
        h.fake.state().auto_stop_signal = false;
        let output = h.output();
        h.manager.fast_reset().unwrap();
        h.drain_events();

        h.manager.stop();
        assert_eq!(h.manager.phase(), BufferPhase::Stopping);
        assert_eq!(h.fake.state().subscriptions_for(output, SignalKind::Stopped), 1);

        h.fake.emit_stopped(output);
        h.pump();
        assert_eq!(h.manager.phase(), BufferPhase::Inactive);
        assert!(h.manager.output.is_none());
        assert_eq!(h.fake.state().start_calls, 1);
        assert_eq!(
            h.drain_events(),
            vec![BufferEvent::ClippingModeChanged(false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn restart_applies_profile_after_stop() {
        let mut h = Harness::started();
        h.manager.set_encoding(EncodingProfile {
            bitrate: 4000,
            ..EncodingProfile::default()
        });
        h.manager.restart();
        h.pump();
        assert_eq!(h.manager.phase(), BufferPhase::Inactive);

        h.advance(DELAYED_START_DELAY).await;
        assert_eq!(h.manager.phase(), BufferPhase::Active);
        assert_eq!(h.fake.video_encoder_creations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn encoder_settings_reapplied_after_start() {
        let mut h = Harness::started();
        assert!(h.fake.state().encoder_updates.is_empty());

        h.advance(ENCODER_SETTLE_DELAY).await;
        let state = h.fake.state();
        assert_eq!(state.encoder_updates.len(), 1);
        assert_eq!(state.encoder_updates[0].1.get_str("preset"), Some("veryfast"));
    }

    #[tokio::test(start_paused = true)]
    async fn save_round_trip_then_fast_reset() {
        let mut h = Harness::started();
        let output = h.output();
        let clip = h.general().join("Replay_20240101_120000.mp4");
        fs::write(&clip, b"clip").unwrap();

        let label = h.manager.save(30, Some("clip1")).unwrap();
        assert_eq!(label, "clip1");
        assert!(h.manager.is_saving());
        assert_eq!(h.fake.state().save_calls, 1);

        h.fake.emit_saved(output, Some(clip.clone()));
        h.pump();
        assert!(!h.manager.is_saving());
        assert_eq!(
            h.drain_events(),
            vec![
                BufferEvent::SaveStarted {
                    label: "clip1".to_string()
                },
                BufferEvent::SaveFinished {
                    success: true,
                    path: Some(clip.clone())
                },
            ]
        );
        assert_eq!(h.fake.state().subscriptions_for(output, SignalKind::Saved), 0);

        h.advance(POST_SAVE_RESET_DELAY).await;
        assert_eq!(h.manager.phase(), BufferPhase::Active);
        assert_eq!(h.fake.state().stop_calls, 1);
        assert_eq!(h.fake.state().start_calls, 2);

        h.advance(RESET_VERIFY_DELAY).await;
        assert_eq!(h.manager.phase(), BufferPhase::Active);
        assert_eq!(h.output(), output);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unnamed_save_gets_generated_label() {
        let mut h = Harness::started();
        let label = h.manager.save(45, None).unwrap();
        assert!(label.starts_with("Clip_"));
        assert!(label.ends_with("_45s.mp4"));
    }

    #[tokio::test(start_paused = true)]
    async fn save_cooldown() {
        let mut h = Harness::started();
        h.manager.save(30, None).unwrap();
        h.fake.emit_saved(h.output(), None);
        h.pump();

        tokio::time::advance(Duration::from_millis(1500)).await;
        match h.manager.save(30, None) {
            Err(SaveRejected::Cooldown { remaining }) => {
                assert_eq!(remaining, Duration::from_millis(500));
            }
            other => panic!("expected cooldown, got {:?}", other),
        }
        assert_eq!(h.fake.state().save_calls, 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        h.manager.poll_timers(Instant::now());
        h.pump();
        h.manager.save(30, None).unwrap();
        assert_eq!(h.fake.state().save_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn save_timeout_reports_failure() {
        let mut h = Harness::started();
        let output = h.output();
        h.manager.save(30, None).unwrap();
        h.drain_events();

        h.advance(Duration::from_secs(29)).await;
        assert!(h.manager.is_saving());

        h.advance(Duration::from_secs(1)).await;
        assert!(!h.manager.is_saving());
        assert_eq!(
            h.drain_events(),
            vec![BufferEvent::SaveFinished {
                success: false,
                path: None
            }]
        );
        assert_eq!(h.fake.state().subscriptions_for(output, SignalKind::Saved), 0);
        // a timed-out save does not reset the buffer
        assert_eq!(h.fake.state().stop_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn save_preconditions() {
        let mut h = Harness::new();
        assert_eq!(h.manager.save(30, None), Err(SaveRejected::NotActive));

        h.manager.start().unwrap();
        h.manager.save(30, None).unwrap();
        tokio::time::advance(SAVE_COOLDOWN).await;
        assert_eq!(h.manager.save(30, None), Err(SaveRejected::AlreadySaving));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_trigger_starts_no_timer() {
        let mut h = Harness::started();
        h.fake.state().fail_save_call = true;
        let output = h.output();

        assert_eq!(h.manager.save(30, None), Err(SaveRejected::TriggerFailed));
        assert!(!h.manager.is_saving());
        assert_eq!(h.fake.state().subscriptions_for(output, SignalKind::Saved), 0);
        assert!(!h.manager.timers.is_armed(TimerKind::SaveTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn save_without_subscription_is_rejected() {
        let mut h = Harness::started();
        h.fake.state().fail_subscribe = true;

        assert_eq!(h.manager.save(30, None), Err(SaveRejected::Subscription));
        assert!(!h.manager.is_saving());
        assert!(!h.manager.timers.is_armed(TimerKind::SaveTimeout));
        assert_eq!(h.fake.state().save_calls, 0);
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn saved_signal_without_file_is_a_failure() {
        let mut h = Harness::started();
        h.manager.save(30, None).unwrap();
        h.drain_events();

        h.fake.emit_saved(h.output(), None);
        h.pump();
        assert_eq!(
            h.drain_events(),
            vec![BufferEvent::SaveFinished {
                success: false,
                path: None
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn save_after_game_change_moves_the_file() {
        let mut h = Harness::started();
        h.manager.set_game_capture("C:\\Games\\Halo.exe").unwrap();
        let clip = h.general().join("Replay_1.mp4");
        fs::write(&clip, b"clip").unwrap();

        h.manager.save(30, None).unwrap();
        h.drain_events();
        h.fake.emit_saved(h.output(), Some(clip.clone()));
        h.pump();

        let expected = h.dir.path().join("Clips").join("Halo").join("Replay_1.mp4");
        assert_eq!(
            h.drain_events(),
            vec![BufferEvent::SaveFinished {
                success: true,
                path: Some(expected.clone())
            }]
        );
        assert!(expected.is_file());
        assert!(!clip.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_save_abandons_it() {
        let mut h = Harness::started();
        let output = h.output();
        h.manager.save(30, None).unwrap();
        h.drain_events();

        h.manager.stop();
        h.pump();
        assert!(!h.manager.is_saving());
        assert_eq!(
            h.drain_events(),
            vec![
                BufferEvent::SaveFinished {
                    success: false,
                    path: None
                },
                BufferEvent::ClippingModeChanged(false),
            ]
        );

        // a late saved signal for the dropped subscription is ignored
        h.advance(SAVE_TIMEOUT).await;
        assert!(h.drain_events().is_empty());
        assert_eq!(h.fake.state().subscriptions_for(output, SignalKind::Saved), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn game_capture_points_output_at_game_folder() {
        let mut h = Harness::started();
        h.manager.set_game_capture("/games/My:Game.exe").unwrap();

        let output = h.output();
        let expected = h.dir.path().join("Clips").join("My_Game");
        assert_eq!(
            h.fake.state().output_settings[&output]
                .get_str("directory")
                .map(PathBuf::from),
            Some(expected.clone())
        );
        assert!(expected.is_dir());

        let state = h.fake.state();
        let created = state
            .sources
            .iter()
            .find(|s| s.kind == GAME_CAPTURE_KIND)
            .unwrap();
        assert_eq!(created.settings.get_str("mode"), Some("any_fullscreen"));
        assert_eq!(created.settings.get_bool("anti_cheat_hook"), Some(true));
        let scene = h.manager.scene.get().unwrap();
        assert_eq!(state.scene_items[&scene], vec![created.handle]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_game_is_not_recaptured_until_cleared() {
        let mut h = Harness::new();
        h.manager.set_game_capture("halo.exe").unwrap();
        h.manager.set_game_capture("halo.exe").unwrap();
        assert_eq!(h.fake.state().source_creations(GAME_CAPTURE_KIND), 1);

        h.manager.clear_game_capture();
        h.manager.set_game_capture("halo.exe").unwrap();
        assert_eq!(h.fake.state().source_creations(GAME_CAPTURE_KIND), 2);
        let scene = h.manager.scene.get().unwrap();
        assert_eq!(h.fake.state().scene_items[&scene].len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_output_folder_creates_general() {
        let mut h = Harness::new();
        let root = h.dir.path().join("Elsewhere");
        h.manager.set_output_folder(&root).unwrap();
        assert!(root.join("General").is_dir());
        assert_eq!(h.manager.current_folder(), root.join("General"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_everything() {
        let mut h = Harness::started();
        h.manager.set_microphone(MicrophoneProfile {
            enabled: true,
            ..MicrophoneProfile::default()
        });
        h.manager.set_game_capture("halo.exe").unwrap();
        h.manager.save(30, None).unwrap();
        h.drain_events();

        h.manager.shutdown();
        assert_eq!(h.fake.live_objects(), 0);
        assert!(!h.fake.state().started);
        assert!(h.fake.state().subscriptions.is_empty());
        assert!(h.manager.next_deadline().is_none());
        assert_eq!(
            h.drain_events(),
            vec![
                BufferEvent::SaveFinished {
                    success: false,
                    path: None
                },
                BufferEvent::ClippingModeChanged(false),
            ]
        );

        h.manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn drop_releases_everything() {
        let (fake, _signals) = FakeEngine::new();
        let (tx, _events) = mpsc::unbounded_channel();
        let dir = TempDir::new().unwrap();
        {
            let mut manager =
                BufferManager::new(fake.clone(), CaptureProfile::default(), dir.path(), tx);
            manager.initialize().unwrap();
            manager.start().unwrap();
        }
        assert_eq!(fake.live_objects(), 0);
        assert!(!fake.state().started);
    }
}
