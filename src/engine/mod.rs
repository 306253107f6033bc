//! Capture engine boundary
//!
//! The capture/encoding library is an external collaborator. This module
//! describes what the core needs from it: object creation for scenes,
//! sources, encoders and outputs, keyed settings dictionaries, a named
//! procedure call, and typed signal subscriptions.
//!
//! Signals never re-enter the core on the engine's own thread. An engine
//! posts [`EngineSignal`]s into the unbounded channel it was built with, and
//! the orchestrator loop feeds them back into the buffer manager.

mod handle;
mod settings;

#[cfg(test)]
pub mod fake;

pub mod obs;

use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::capture::CaptureProfile;
use crate::error::EngineError;

pub use handle::{EngineObject, Owned};
pub use settings::{SettingValue, Settings};

/// Scene container handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SceneHandle(pub u64);

/// Input source or filter handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle(pub u64);

/// Video or audio encoder handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncoderHandle(pub u64);

/// Output handle (the replay buffer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputHandle(pub u64);

/// Negotiated video pipeline format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Negotiated audio pipeline format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u32,
}

/// How a source is routed to the local audio monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringType {
    None,
    MonitorAndOutput,
}

/// Output signals the core subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Replay buffer finished writing a file
    Saved,
    /// Output fully stopped
    Stopped,
}

impl SignalKind {
    /// Engine-side signal name
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::Saved => "saved",
            SignalKind::Stopped => "stop",
        }
    }
}

/// Token for one active signal subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub id: u64,
    pub kind: SignalKind,
    pub output: OutputHandle,
}

/// Data carried by a signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Stopped { code: i64 },
    Saved { path: Option<PathBuf> },
}

/// A signal delivered by the engine for a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSignal {
    pub subscription: Subscription,
    pub payload: SignalPayload,
}

pub type SignalSender = mpsc::UnboundedSender<EngineSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<EngineSignal>;

/// Create the channel an engine delivers its signals through
pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    mpsc::unbounded_channel()
}

/// Operations the core needs from the capture engine.
///
/// Handles passed in are always ones this engine returned. Creation methods
/// return `None` on failure; the engine logs its own diagnostics.
pub trait CaptureEngine: Send + Sync {
    /// Start the engine with the given capture geometry. Implementations try
    /// their primary graphics backend and then a secondary one.
    fn startup(&self, capture: &CaptureProfile) -> Result<(), EngineError>;
    /// Reset the audio pipeline. Returns false if the format was rejected.
    fn reset_audio(&self, sample_rate: u32, channels: u32) -> bool;
    fn shutdown(&self);
    fn video_info(&self) -> Option<VideoInfo>;
    fn audio_info(&self) -> Option<AudioInfo>;
    /// Identifiers of every registered video encoder type
    fn encoder_types(&self) -> Vec<String>;

    fn create_scene(&self, name: &str) -> Option<SceneHandle>;
    fn release_scene(&self, scene: SceneHandle);
    /// Route a scene to an output channel
    fn set_channel_scene(&self, channel: u32, scene: SceneHandle);
    /// Route a source (or nothing) to an output channel
    fn set_channel_source(&self, channel: u32, source: Option<SourceHandle>);
    /// Create a source directly inside a scene, stretched to `bounds`
    fn create_scene_source(
        &self,
        scene: SceneHandle,
        kind: &str,
        name: &str,
        settings: &Settings,
        bounds: (u32, u32),
    ) -> Option<SourceHandle>;
    fn scene_remove(&self, scene: SceneHandle, source: SourceHandle);

    fn create_source(&self, kind: &str, name: &str, settings: &Settings) -> Option<SourceHandle>;
    fn release_source(&self, source: SourceHandle);
    fn set_source_volume(&self, source: SourceHandle, volume: f32);
    fn set_source_enabled(&self, source: SourceHandle, enabled: bool);
    fn set_source_monitoring(&self, source: SourceHandle, monitoring: MonitoringType);
    fn add_filter(&self, source: SourceHandle, kind: &str, name: &str) -> bool;
    /// Toggle a named filter. Returns false if the source has no such filter.
    fn set_filter_enabled(&self, source: SourceHandle, name: &str, enabled: bool) -> bool;

    /// Create a video encoder bound to the main video pipeline
    fn create_video_encoder(&self, id: &str, name: &str, settings: &Settings) -> Option<EncoderHandle>;
    /// Create an audio encoder bound to the main audio pipeline
    fn create_audio_encoder(
        &self,
        id: &str,
        name: &str,
        settings: &Settings,
        mixer: usize,
    ) -> Option<EncoderHandle>;
    fn update_encoder(&self, encoder: EncoderHandle, settings: &Settings);
    fn encoder_id(&self, encoder: EncoderHandle) -> Option<String>;
    fn release_encoder(&self, encoder: EncoderHandle);

    fn create_output(&self, kind: &str, name: &str, settings: &Settings) -> Option<OutputHandle>;
    fn set_output_encoders(&self, output: OutputHandle, video: EncoderHandle, audio: EncoderHandle);
    fn update_output(&self, output: OutputHandle, settings: &Settings);
    fn start_output(&self, output: OutputHandle) -> bool;
    /// Request an asynchronous stop; completion is signalled with [`SignalKind::Stopped`]
    fn stop_output(&self, output: OutputHandle);
    fn force_stop_output(&self, output: OutputHandle);
    fn output_active(&self, output: OutputHandle) -> bool;
    fn output_last_error(&self, output: OutputHandle) -> Option<String>;
    fn release_output(&self, output: OutputHandle);

    fn subscribe(&self, output: OutputHandle, kind: SignalKind) -> Option<Subscription>;
    fn unsubscribe(&self, subscription: Subscription);
    /// Invoke a named procedure on an output (e.g. `"save"`)
    fn call_procedure(&self, output: OutputHandle, name: &str) -> bool;
}
