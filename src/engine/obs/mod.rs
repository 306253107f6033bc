//! libobs backend
//!
//! Built on libobs-wrapper: the context, scenes, sources, outputs and their
//! encoders are wrapper objects held in a registry keyed by the handles the
//! core sees. Dropping a registry entry releases the wrapper object.
//!
//! The wrapper creates encoders through the output that uses them, so an
//! encoder handle first records its id and settings and is instantiated
//! when it is attached to an output. [`native`] covers the replay buffer
//! signals and procedures plus the few calls the wrapper does not expose.

mod bootstrap;
mod native;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use libobs_wrapper::context::ObsContext;
use libobs_wrapper::data::output::ObsOutputRef;
use libobs_wrapper::data::video::ObsVideoInfoBuilder;
use libobs_wrapper::data::ObsData;
use libobs_wrapper::encoders::audio::ObsAudioEncoder;
use libobs_wrapper::encoders::video::ObsVideoEncoder;
use libobs_wrapper::encoders::ObsVideoEncoderType;
use libobs_wrapper::enums::ObsGraphicsModule;
use libobs_wrapper::scenes::ObsSceneRef;
use libobs_wrapper::sources::ObsSourceRef;
use libobs_wrapper::utils::traits::ObsUpdatable;
use libobs_wrapper::utils::{
    AudioEncoderInfo, ObsError, OutputInfo, SourceInfo, StartupInfo, VideoEncoderInfo,
};
use tracing::{debug, error, info, warn};

use super::{
    signal_channel, AudioInfo, CaptureEngine, EncoderHandle, MonitoringType, OutputHandle,
    SceneHandle, SettingValue, Settings, SignalKind, SignalReceiver, SignalSender, SourceHandle,
    Subscription, VideoInfo,
};
use crate::capture::CaptureProfile;
use crate::error::EngineError;

pub use bootstrap::ensure_runtime;

#[cfg(target_os = "windows")]
const GRAPHICS_BACKENDS: &[&str] = &["d3d11", "opengl"];
#[cfg(not(target_os = "windows"))]
const GRAPHICS_BACKENDS: &[&str] = &["opengl"];

fn graphics_module(backend: &str) -> ObsGraphicsModule {
    match backend {
        "d3d11" => ObsGraphicsModule::DirectX11,
        _ => ObsGraphicsModule::OpenGL,
    }
}

/// An encoder instantiated on an output
pub(crate) enum LiveEncoder {
    Video(Arc<ObsVideoEncoder>),
    Audio(Arc<ObsAudioEncoder>),
}

enum EncoderRole {
    Video,
    Audio { mixer: usize },
}

struct EncoderEntry {
    role: EncoderRole,
    id: String,
    name: String,
    settings: Settings,
    /// Output the encoder is instantiated on
    attached: Option<(u64, LiveEncoder)>,
}

struct OutputEntry {
    output: ObsOutputRef,
    last_error: Option<String>,
}

#[derive(Default)]
struct Registry {
    context: Option<ObsContext>,
    video: Option<VideoInfo>,
    audio: Option<AudioInfo>,
    encoder_types: Vec<String>,
    scenes: HashMap<u64, ObsSceneRef>,
    sources: HashMap<u64, ObsSourceRef>,
    encoders: HashMap<u64, EncoderEntry>,
    outputs: HashMap<u64, OutputEntry>,
    connections: HashMap<u64, native::SignalConnection>,
}

impl Registry {
    fn context(&mut self) -> Option<&mut ObsContext> {
        let context = self.context.as_mut();
        if context.is_none() {
            warn!("libobs context is not running");
        }
        context
    }

    /// Convert settings for one wrapper call
    fn data(&mut self, settings: &Settings) -> Option<ObsData> {
        let context = self.context()?;
        match to_obs_data(context, settings) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Failed to build settings: {}", e);
                None
            }
        }
    }
}

fn to_obs_data(context: &ObsContext, settings: &Settings) -> Result<ObsData, ObsError> {
    let mut data = context.data()?;
    for (key, value) in settings.iter() {
        match value {
            SettingValue::Str(s) => {
                data.set_string(key, s.as_str())?;
            }
            SettingValue::Int(i) => {
                data.set_int(key, *i)?;
            }
            SettingValue::Bool(b) => {
                data.set_bool(key, *b)?;
            }
        }
    }
    Ok(data)
}

pub struct ObsEngine {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    signals: SignalSender,
}

impl ObsEngine {
    /// Create the engine and the receiver its signals are delivered through
    pub fn new() -> (Arc<Self>, SignalReceiver) {
        let (signals, receiver) = signal_channel();
        let engine = Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            signals,
        });
        (engine, receiver)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn create_context(capture: &CaptureProfile, backend: &str) -> Result<ObsContext, ObsError> {
        let video_info = ObsVideoInfoBuilder::new()
            .graphics_module(graphics_module(backend))
            .base_width(capture.width)
            .base_height(capture.height)
            .fps_num(capture.fps)
            .fps_den(1)
            .output_width(capture.width)
            .output_height(capture.height)
            .build();

        let mut startup_info = StartupInfo::default().set_video_info(video_info);
        if let Some(paths) = bootstrap::startup_paths() {
            startup_info = startup_info.set_startup_paths(paths);
        }
        ObsContext::new(startup_info)
    }

    /// Instantiate an encoder on `output` unless it already lives there
    fn attach_encoder(
        registry: &mut Registry,
        output_id: u64,
        encoder_id: u64,
    ) -> Result<(), String> {
        let Some(entry) = registry.encoders.get(&encoder_id) else {
            return Err(format!("unknown encoder {}", encoder_id));
        };
        if matches!(entry.attached, Some((attached_to, _)) if attached_to == output_id) {
            return Ok(());
        }
        let (role_mixer, id, name, settings) = (
            match entry.role {
                EncoderRole::Video => None,
                EncoderRole::Audio { mixer } => Some(mixer),
            },
            entry.id.clone(),
            entry.name.clone(),
            entry.settings.clone(),
        );

        let data = registry
            .data(&settings)
            .ok_or_else(|| "settings conversion failed".to_string())?;
        let context = registry
            .context
            .as_ref()
            .ok_or_else(|| "context not running".to_string())?;
        let output = &mut registry
            .outputs
            .get_mut(&output_id)
            .ok_or_else(|| format!("unknown output {}", output_id))?
            .output;

        let live = match role_mixer {
            None => {
                let info = VideoEncoderInfo::new(ObsVideoEncoderType::Other(id), name, Some(data), None);
                let video = context.get_video_ptr().map_err(|e| e.to_string())?;
                LiveEncoder::Video(output.video_encoder(info, video).map_err(|e| e.to_string())?)
            }
            Some(mixer) => {
                let info = AudioEncoderInfo::new(id, name, Some(data), None);
                let audio = context.get_audio_ptr().map_err(|e| e.to_string())?;
                LiveEncoder::Audio(
                    output
                        .audio_encoder(info, mixer, audio)
                        .map_err(|e| e.to_string())?,
                )
            }
        };

        if let Some(entry) = registry.encoders.get_mut(&encoder_id) {
            entry.attached = Some((output_id, live));
        }
        Ok(())
    }

    fn release_all(&self) {
        let mut registry = self.registry();
        if !(registry.outputs.is_empty() && registry.encoders.is_empty()) {
            warn!(
                "Releasing {} outputs and {} encoders still held at shutdown",
                registry.outputs.len(),
                registry.encoders.len()
            );
        }
        // Handlers hold output refs, so they go before the outputs
        registry.connections.clear();
        registry.encoders.clear();
        registry.outputs.clear();
        registry.sources.clear();
        registry.scenes.clear();
    }
}

impl CaptureEngine for ObsEngine {
    fn startup(&self, capture: &CaptureProfile) -> Result<(), EngineError> {
        if self.registry().context.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let (installed, searched) = bootstrap::installation();
        if !installed {
            error!("libobs runtime not installed ({})", searched);
            return Err(EngineError::DataFilesMissing { searched });
        }

        for backend in GRAPHICS_BACKENDS {
            match Self::create_context(capture, backend) {
                Ok(context) => {
                    info!(
                        "libobs context up with {} at {}x{}@{}",
                        backend, capture.width, capture.height, capture.fps
                    );
                    let mut registry = self.registry();
                    registry.context = Some(context);
                    registry.video = Some(VideoInfo {
                        width: capture.width,
                        height: capture.height,
                        fps: capture.fps,
                    });
                    registry.encoder_types = native::encoder_types();
                    return Ok(());
                }
                Err(e) => warn!("libobs context with {} failed: {}", backend, e),
            }
        }

        Err(EngineError::VideoBackendUnavailable {
            tried: GRAPHICS_BACKENDS.join(", "),
        })
    }

    fn reset_audio(&self, sample_rate: u32, channels: u32) -> bool {
        let mut registry = self.registry();
        if registry.context.is_none() {
            return false;
        }
        let accepted = native::reset_audio(sample_rate, channels);
        if accepted {
            registry.audio = Some(AudioInfo {
                sample_rate,
                channels,
            });
        } else {
            warn!("Audio reset rejected {} Hz / {} channels", sample_rate, channels);
        }
        accepted
    }

    fn shutdown(&self) {
        self.release_all();
        let mut registry = self.registry();
        registry.video = None;
        registry.audio = None;
        registry.encoder_types.clear();
        if registry.context.take().is_some() {
            info!("libobs context dropped");
        }
    }

    fn video_info(&self) -> Option<VideoInfo> {
        self.registry().video
    }

    fn audio_info(&self) -> Option<AudioInfo> {
        self.registry().audio
    }

    fn encoder_types(&self) -> Vec<String> {
        self.registry().encoder_types.clone()
    }

    fn create_scene(&self, name: &str) -> Option<SceneHandle> {
        let mut registry = self.registry();
        let scene = match registry.context()?.scene(name) {
            Ok(scene) => scene,
            Err(e) => {
                error!("Failed to create scene {}: {}", name, e);
                return None;
            }
        };
        let id = self.next_id();
        registry.scenes.insert(id, scene);
        Some(SceneHandle(id))
    }

    fn release_scene(&self, scene: SceneHandle) {
        self.registry().scenes.remove(&scene.0);
    }

    fn set_channel_scene(&self, channel: u32, scene: SceneHandle) {
        let registry = self.registry();
        if let Some(scene) = registry.scenes.get(&scene.0) {
            if let Err(e) = scene.set_to_channel(channel) {
                warn!("Failed to route scene to channel {}: {}", channel, e);
            }
        }
    }

    fn set_channel_source(&self, channel: u32, source: Option<SourceHandle>) {
        let registry = self.registry();
        native::set_channel_source(channel, source.and_then(|s| registry.sources.get(&s.0)));
    }

    fn create_scene_source(
        &self,
        scene: SceneHandle,
        kind: &str,
        name: &str,
        settings: &Settings,
        bounds: (u32, u32),
    ) -> Option<SourceHandle> {
        let mut registry = self.registry();
        let data = registry.data(settings)?;
        let scene_ref = registry.scenes.get_mut(&scene.0)?;
        let source = match scene_ref.add_source(SourceInfo::new(kind, name, Some(data), None)) {
            Ok(source) => source,
            Err(e) => {
                warn!("Failed to add source {} ({}) to scene: {}", name, kind, e);
                return None;
            }
        };
        if !native::stretch_scene_item(scene_ref, &source, bounds) {
            warn!("Scene item for {} not found, bounds not applied", name);
        }
        let id = self.next_id();
        registry.sources.insert(id, source);
        debug!("Created scene source {} ({})", name, kind);
        Some(SourceHandle(id))
    }

    fn scene_remove(&self, scene: SceneHandle, source: SourceHandle) {
        let registry = self.registry();
        if let (Some(scene), Some(source)) =
            (registry.scenes.get(&scene.0), registry.sources.get(&source.0))
        {
            native::remove_scene_item(scene, source);
        }
    }

    fn create_source(&self, kind: &str, name: &str, settings: &Settings) -> Option<SourceHandle> {
        let mut registry = self.registry();
        let data = registry.data(settings)?;
        let runtime = registry.context()?.runtime().clone();
        let source = match ObsSourceRef::new(kind, name, Some(data), None, runtime) {
            Ok(source) => source,
            Err(e) => {
                warn!("Failed to create source {} ({}): {}", name, kind, e);
                return None;
            }
        };
        let id = self.next_id();
        registry.sources.insert(id, source);
        debug!("Created source {} ({})", name, kind);
        Some(SourceHandle(id))
    }

    fn release_source(&self, source: SourceHandle) {
        self.registry().sources.remove(&source.0);
    }

    fn set_source_volume(&self, source: SourceHandle, volume: f32) {
        if let Some(source) = self.registry().sources.get(&source.0) {
            native::set_volume(source, volume);
        }
    }

    fn set_source_enabled(&self, source: SourceHandle, enabled: bool) {
        if let Some(source) = self.registry().sources.get(&source.0) {
            native::set_enabled(source, enabled);
        }
    }

    fn set_source_monitoring(&self, source: SourceHandle, monitoring: MonitoringType) {
        if let Some(source) = self.registry().sources.get(&source.0) {
            native::set_monitoring(source, monitoring);
        }
    }

    fn add_filter(&self, source: SourceHandle, kind: &str, name: &str) -> bool {
        self.registry()
            .sources
            .get(&source.0)
            .map(|source| native::add_filter(source, kind, name))
            .unwrap_or(false)
    }

    fn set_filter_enabled(&self, source: SourceHandle, name: &str, enabled: bool) -> bool {
        self.registry()
            .sources
            .get(&source.0)
            .map(|source| native::set_filter_enabled(source, name, enabled))
            .unwrap_or(false)
    }

    fn create_video_encoder(&self, id: &str, name: &str, settings: &Settings) -> Option<EncoderHandle> {
        let mut registry = self.registry();
        if !registry.encoder_types.iter().any(|known| known == id) {
            warn!("Video encoder type {} is not registered", id);
            return None;
        }
        let handle = self.next_id();
        registry.encoders.insert(
            handle,
            EncoderEntry {
                role: EncoderRole::Video,
                id: id.to_string(),
                name: name.to_string(),
                settings: settings.clone(),
                attached: None,
            },
        );
        Some(EncoderHandle(handle))
    }

    fn create_audio_encoder(
        &self,
        id: &str,
        name: &str,
        settings: &Settings,
        mixer: usize,
    ) -> Option<EncoderHandle> {
        let mut registry = self.registry();
        if !registry.encoder_types.iter().any(|known| known == id) {
            warn!("Audio encoder type {} is not registered", id);
            return None;
        }
        let handle = self.next_id();
        registry.encoders.insert(
            handle,
            EncoderEntry {
                role: EncoderRole::Audio { mixer },
                id: id.to_string(),
                name: name.to_string(),
                settings: settings.clone(),
                attached: None,
            },
        );
        Some(EncoderHandle(handle))
    }

    fn update_encoder(&self, encoder: EncoderHandle, settings: &Settings) {
        let mut registry = self.registry();
        let Some(data) = registry.data(settings) else {
            return;
        };
        if let Some(entry) = registry.encoders.get_mut(&encoder.0) {
            entry.settings.merge(settings);
            if let Some((_, live)) = &entry.attached {
                native::update_encoder(live, &data);
            }
        }
    }

    fn encoder_id(&self, encoder: EncoderHandle) -> Option<String> {
        self.registry()
            .encoders
            .get(&encoder.0)
            .map(|entry| entry.id.clone())
    }

    fn release_encoder(&self, encoder: EncoderHandle) {
        self.registry().encoders.remove(&encoder.0);
    }

    fn create_output(&self, kind: &str, name: &str, settings: &Settings) -> Option<OutputHandle> {
        let mut registry = self.registry();
        let data = registry.data(settings)?;
        let id = self.next_id();
        // Released outputs linger in the context until shutdown, so names stay unique
        let unique_name = format!("{}_{}", name, id);
        let output = match registry
            .context()?
            .output(OutputInfo::new(kind, unique_name.as_str(), Some(data), None))
        {
            Ok(output) => output,
            Err(e) => {
                error!("Failed to create output {} ({}): {}", name, kind, e);
                return None;
            }
        };
        registry.outputs.insert(
            id,
            OutputEntry {
                output,
                last_error: None,
            },
        );
        Some(OutputHandle(id))
    }

    fn set_output_encoders(&self, output: OutputHandle, video: EncoderHandle, audio: EncoderHandle) {
        let mut registry = self.registry();
        for encoder in [video.0, audio.0] {
            if let Err(e) = Self::attach_encoder(&mut registry, output.0, encoder) {
                warn!("Failed to attach encoder to output: {}", e);
                if let Some(entry) = registry.outputs.get_mut(&output.0) {
                    entry.last_error = Some(e);
                }
            }
        }
    }

    fn update_output(&self, output: OutputHandle, settings: &Settings) {
        let mut registry = self.registry();
        let Some(data) = registry.data(settings) else {
            return;
        };
        if let Some(entry) = registry.outputs.get_mut(&output.0) {
            if let Err(e) = entry.output.update_raw(data) {
                warn!("Failed to update output settings: {}", e);
            }
        }
    }

    fn start_output(&self, output: OutputHandle) -> bool {
        let mut registry = self.registry();
        let Some(entry) = registry.outputs.get_mut(&output.0) else {
            return false;
        };
        match entry.output.start() {
            Ok(()) => {
                entry.last_error = None;
                true
            }
            Err(e) => {
                warn!("Failed to start output: {}", e);
                entry.last_error = Some(e.to_string());
                false
            }
        }
    }

    fn stop_output(&self, output: OutputHandle) {
        let mut registry = self.registry();
        if let Some(entry) = registry.outputs.get_mut(&output.0) {
            if let Err(e) = entry.output.stop() {
                warn!("Failed to stop output: {}", e);
            }
        }
    }

    fn force_stop_output(&self, output: OutputHandle) {
        if let Some(entry) = self.registry().outputs.get(&output.0) {
            native::force_stop(&entry.output);
        }
    }

    fn output_active(&self, output: OutputHandle) -> bool {
        self.registry()
            .outputs
            .get(&output.0)
            .and_then(|entry| entry.output.is_active().ok())
            .unwrap_or(false)
    }

    fn output_last_error(&self, output: OutputHandle) -> Option<String> {
        self.registry()
            .outputs
            .get(&output.0)
            .and_then(|entry| entry.last_error.clone())
    }

    fn release_output(&self, output: OutputHandle) {
        let mut registry = self.registry();
        registry
            .connections
            .retain(|_, connection| connection.subscription().output != output);
        for entry in registry.encoders.values_mut() {
            if matches!(entry.attached, Some((attached_to, _)) if attached_to == output.0) {
                entry.attached = None;
            }
        }
        registry.outputs.remove(&output.0);
    }

    fn subscribe(&self, output: OutputHandle, kind: SignalKind) -> Option<Subscription> {
        let mut registry = self.registry();
        let entry = registry.outputs.get(&output.0)?;
        let subscription = Subscription {
            id: self.next_id(),
            kind,
            output,
        };
        let connection =
            native::SignalConnection::connect(&entry.output, subscription, self.signals.clone());
        registry.connections.insert(subscription.id, connection);
        Some(subscription)
    }

    fn unsubscribe(&self, subscription: Subscription) {
        self.registry().connections.remove(&subscription.id);
    }

    fn call_procedure(&self, output: OutputHandle, name: &str) -> bool {
        self.registry()
            .outputs
            .get(&output.0)
            .map(|entry| native::call_procedure(&entry.output, name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_platform_has_a_graphics_backend() {
        assert!(!GRAPHICS_BACKENDS.is_empty());
        assert_eq!(GRAPHICS_BACKENDS.last(), Some(&"opengl"));
    }

    #[test]
    fn unknown_handles_are_ignored() {
        let (engine, _signals) = ObsEngine::new();
        assert!(engine.video_info().is_none());
        assert!(engine.encoder_types().is_empty());
        assert!(!engine.start_output(OutputHandle(7)));
        assert!(!engine.output_active(OutputHandle(7)));
        assert!(engine.subscribe(OutputHandle(7), SignalKind::Saved).is_none());
        assert!(engine.create_video_encoder("obs_x264", "video", &Settings::new()).is_none());
        assert!(!engine.reset_audio(48000, 2));
    }
}
