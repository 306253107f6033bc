//! Scripted in-memory engine for unit tests
//!
//! Counts every object creation, records the settings each object was given,
//! and delivers signals through the same channel type a real engine uses.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    signal_channel, AudioInfo, CaptureEngine, EncoderHandle, EngineSignal, MonitoringType,
    OutputHandle, SceneHandle, Settings, SignalKind, SignalPayload, SignalReceiver, SignalSender,
    SourceHandle, Subscription, VideoInfo,
};
use crate::capture::CaptureProfile;
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct CreatedSource {
    pub handle: SourceHandle,
    pub kind: String,
    pub name: String,
    pub settings: Settings,
}

#[derive(Debug, Clone)]
pub struct CreatedEncoder {
    pub handle: EncoderHandle,
    pub id: String,
    pub settings: Settings,
}

#[derive(Debug)]
pub struct FakeState {
    next_id: u64,
    pub started: bool,
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
    pub encoder_types: Vec<String>,

    // Failure injection
    pub fail_startup: Option<EngineError>,
    pub rejected_sample_rates: HashSet<u32>,
    pub failing_video_encoders: HashSet<String>,
    pub fail_audio_encoder: bool,
    pub fail_output_create: bool,
    pub fail_output_start: bool,
    pub fail_subscribe: bool,
    pub fail_save_call: bool,
    /// Post a Stopped signal to subscribers whenever `stop_output` runs
    pub auto_stop_signal: bool,

    // Records
    pub video_encoders: Vec<CreatedEncoder>,
    pub audio_encoders: Vec<CreatedEncoder>,
    pub sources: Vec<CreatedSource>,
    pub outputs: Vec<OutputHandle>,
    pub output_settings: HashMap<OutputHandle, Settings>,
    pub output_encoders: HashMap<OutputHandle, (EncoderHandle, EncoderHandle)>,
    pub encoder_updates: Vec<(EncoderHandle, Settings)>,
    pub live: HashSet<u64>,
    pub releases: usize,
    pub volumes: HashMap<SourceHandle, f32>,
    pub enabled: HashMap<SourceHandle, bool>,
    pub monitoring: HashMap<SourceHandle, MonitoringType>,
    pub filters: HashMap<SourceHandle, Vec<(String, bool)>>,
    pub channels: HashMap<u32, Option<u64>>,
    pub scene_items: HashMap<SceneHandle, Vec<SourceHandle>>,
    pub active_outputs: HashSet<OutputHandle>,
    pub subscriptions: HashMap<u64, Subscription>,
    pub start_calls: usize,
    pub stop_calls: usize,
    pub force_stop_calls: usize,
    pub save_calls: usize,
    pub subscribe_calls: usize,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            next_id: 0,
            started: false,
            video: Some(VideoInfo {
                width: 1920,
                height: 1080,
                fps: 60,
            }),
            audio: Some(AudioInfo {
                sample_rate: 48000,
                channels: 2,
            }),
            encoder_types: vec![
                "obs_x264".to_string(),
                "obs_x265".to_string(),
                "ffmpeg_nvenc".to_string(),
                "jim_av1_nvenc".to_string(),
            ],
            fail_startup: None,
            rejected_sample_rates: HashSet::new(),
            failing_video_encoders: HashSet::new(),
            fail_audio_encoder: false,
            fail_output_create: false,
            fail_output_start: false,
            fail_subscribe: false,
            fail_save_call: false,
            auto_stop_signal: true,
            video_encoders: Vec::new(),
            audio_encoders: Vec::new(),
            sources: Vec::new(),
            outputs: Vec::new(),
            output_settings: HashMap::new(),
            output_encoders: HashMap::new(),
            encoder_updates: Vec::new(),
            live: HashSet::new(),
            releases: 0,
            volumes: HashMap::new(),
            enabled: HashMap::new(),
            monitoring: HashMap::new(),
            filters: HashMap::new(),
            channels: HashMap::new(),
            scene_items: HashMap::new(),
            active_outputs: HashSet::new(),
            subscriptions: HashMap::new(),
            start_calls: 0,
            stop_calls: 0,
            force_stop_calls: 0,
            save_calls: 0,
            subscribe_calls: 0,
        }
    }
}

impl FakeState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.live.insert(self.next_id);
        self.next_id
    }

    fn release(&mut self, id: u64) {
        assert!(self.live.remove(&id), "released object {} twice or never created", id);
        self.releases += 1;
    }

    pub fn source_creations(&self, kind: &str) -> usize {
        self.sources.iter().filter(|s| s.kind == kind).count()
    }

    pub fn subscriptions_for(&self, output: OutputHandle, kind: SignalKind) -> usize {
        self.subscriptions
            .values()
            .filter(|s| s.output == output && s.kind == kind)
            .count()
    }
}

pub struct FakeEngine {
    state: Mutex<FakeState>,
    signals: SignalSender,
}

impl FakeEngine {
    pub fn new() -> (Arc<Self>, SignalReceiver) {
        let (signals, rx) = signal_channel();
        let engine = Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            signals,
        });
        (engine, rx)
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn live_objects(&self) -> usize {
        self.state().live.len()
    }

    pub fn video_encoder_creations(&self) -> usize {
        self.state().video_encoders.len()
    }

    pub fn audio_encoder_creations(&self) -> usize {
        self.state().audio_encoders.len()
    }

    pub fn output_creations(&self) -> usize {
        self.state().outputs.len()
    }

    /// Deliver a signal to every subscriber of `kind` on `output`
    pub fn emit(&self, output: OutputHandle, kind: SignalKind, payload: SignalPayload) {
        let subscriptions: Vec<Subscription> = self
            .state()
            .subscriptions
            .values()
            .filter(|s| s.output == output && s.kind == kind)
            .copied()
            .collect();
        for subscription in subscriptions {
            let _ = self.signals.send(EngineSignal {
                subscription,
                payload: payload.clone(),
            });
        }
    }

    pub fn emit_saved(&self, output: OutputHandle, path: Option<PathBuf>) {
        self.emit(output, SignalKind::Saved, SignalPayload::Saved { path });
    }

    pub fn emit_stopped(&self, output: OutputHandle) {
        self.emit(output, SignalKind::Stopped, SignalPayload::Stopped { code: 0 });
    }

    /// Simulate the engine dropping an output on its own
    pub fn set_output_active(&self, output: OutputHandle, active: bool) {
        let mut state = self.state();
        if active {
            state.active_outputs.insert(output);
        } else {
            state.active_outputs.remove(&output);
        }
    }
}

impl CaptureEngine for FakeEngine {
    fn startup(&self, capture: &CaptureProfile) -> Result<(), EngineError> {
        let mut state = self.state();
        if let Some(err) = state.fail_startup.clone() {
            return Err(err);
        }
        if state.started {
            return Err(EngineError::AlreadyRunning);
        }
        state.started = true;
        state.video = Some(VideoInfo {
            width: capture.width,
            height: capture.height,
            fps: capture.fps,
        });
        Ok(())
    }

    fn reset_audio(&self, sample_rate: u32, channels: u32) -> bool {
        let mut state = self.state();
        if state.rejected_sample_rates.contains(&sample_rate) {
            return false;
        }
        state.audio = Some(AudioInfo {
            sample_rate,
            channels,
        });
        true
    }

    fn shutdown(&self) {
        self.state().started = false;
    }

    fn video_info(&self) -> Option<VideoInfo> {
        self.state().video
    }

    fn audio_info(&self) -> Option<AudioInfo> {
        self.state().audio
    }

    fn encoder_types(&self) -> Vec<String> {
        self.state().encoder_types.clone()
    }

    fn create_scene(&self, _name: &str) -> Option<SceneHandle> {
        Some(SceneHandle(self.state().allocate()))
    }

    fn release_scene(&self, scene: SceneHandle) {
        let mut state = self.state();
        state.scene_items.remove(&scene);
        state.release(scene.0);
    }

    fn set_channel_scene(&self, channel: u32, scene: SceneHandle) {
        self.state().channels.insert(channel, Some(scene.0));
    }

    fn set_channel_source(&self, channel: u32, source: Option<SourceHandle>) {
        self.state().channels.insert(channel, source.map(|s| s.0));
    }

    fn create_scene_source(
        &self,
        scene: SceneHandle,
        kind: &str,
        name: &str,
        settings: &Settings,
        _bounds: (u32, u32),
    ) -> Option<SourceHandle> {
        let source = self.create_source(kind, name, settings)?;
        self.state().scene_items.entry(scene).or_default().push(source);
        Some(source)
    }

    fn scene_remove(&self, scene: SceneHandle, source: SourceHandle) {
        if let Some(items) = self.state().scene_items.get_mut(&scene) {
            items.retain(|s| *s != source);
        }
    }

    fn create_source(&self, kind: &str, name: &str, settings: &Settings) -> Option<SourceHandle> {
        let mut state = self.state();
        let handle = SourceHandle(state.allocate());
        state.sources.push(CreatedSource {
            handle,
            kind: kind.to_string(),
            name: name.to_string(),
            settings: settings.clone(),
        });
        Some(handle)
    }

    fn release_source(&self, source: SourceHandle) {
        let mut state = self.state();
        state.filters.remove(&source);
        state.release(source.0);
    }

    fn set_source_volume(&self, source: SourceHandle, volume: f32) {
        self.state().volumes.insert(source, volume);
    }

    fn set_source_enabled(&self, source: SourceHandle, enabled: bool) {
        self.state().enabled.insert(source, enabled);
    }

    fn set_source_monitoring(&self, source: SourceHandle, monitoring: MonitoringType) {
        self.state().monitoring.insert(source, monitoring);
    }

    fn add_filter(&self, source: SourceHandle, _kind: &str, name: &str) -> bool {
        self.state()
            .filters
            .entry(source)
            .or_default()
            .push((name.to_string(), true));
        true
    }

    fn set_filter_enabled(&self, source: SourceHandle, name: &str, enabled: bool) -> bool {
        let mut state = self.state();
        let Some(filters) = state.filters.get_mut(&source) else {
            return false;
        };
        match filters.iter_mut().find(|(n, _)| n == name) {
            Some(filter) => {
                filter.1 = enabled;
                true
            }
            None => false,
        }
    }

    fn create_video_encoder(&self, id: &str, _name: &str, settings: &Settings) -> Option<EncoderHandle> {
        let mut state = self.state();
        if state.failing_video_encoders.contains(id) {
            return None;
        }
        let handle = EncoderHandle(state.allocate());
        state.video_encoders.push(CreatedEncoder {
            handle,
            id: id.to_string(),
            settings: settings.clone(),
        });
        Some(handle)
    }

    fn create_audio_encoder(
        &self,
        id: &str,
        _name: &str,
        settings: &Settings,
        _mixer: usize,
    ) -> Option<EncoderHandle> {
        let mut state = self.state();
        if state.fail_audio_encoder {
            return None;
        }
        let handle = EncoderHandle(state.allocate());
        state.audio_encoders.push(CreatedEncoder {
            handle,
            id: id.to_string(),
            settings: settings.clone(),
        });
        Some(handle)
    }

    fn update_encoder(&self, encoder: EncoderHandle, settings: &Settings) {
        self.state().encoder_updates.push((encoder, settings.clone()));
    }

    fn encoder_id(&self, encoder: EncoderHandle) -> Option<String> {
        let state = self.state();
        state
            .video_encoders
            .iter()
            .chain(state.audio_encoders.iter())
            .find(|e| e.handle == encoder)
            .map(|e| e.id.clone())
    }

    fn release_encoder(&self, encoder: EncoderHandle) {
        self.state().release(encoder.0);
    }

    fn create_output(&self, _kind: &str, _name: &str, settings: &Settings) -> Option<OutputHandle> {
        let mut state = self.state();
        if state.fail_output_create {
            return None;
        }
        let handle = OutputHandle(state.allocate());
        state.outputs.push(handle);
        state.output_settings.insert(handle, settings.clone());
        Some(handle)
    }

    fn set_output_encoders(&self, output: OutputHandle, video: EncoderHandle, audio: EncoderHandle) {
        self.state().output_encoders.insert(output, (video, audio));
    }

    fn update_output(&self, output: OutputHandle, settings: &Settings) {
        self.state()
            .output_settings
            .entry(output)
            .or_default()
            .merge(settings);
    }

    fn start_output(&self, output: OutputHandle) -> bool {
        let mut state = self.state();
        state.start_calls += 1;
        if state.fail_output_start {
            return false;
        }
        state.active_outputs.insert(output);
        true
    }

    fn stop_output(&self, output: OutputHandle) {
        let auto_signal = {
            let mut state = self.state();
            state.stop_calls += 1;
            state.active_outputs.remove(&output);
            state.auto_stop_signal
        };
        if auto_signal {
            self.emit_stopped(output);
        }
    }

    fn force_stop_output(&self, output: OutputHandle) {
        let mut state = self.state();
        state.force_stop_calls += 1;
        state.active_outputs.remove(&output);
    }

    fn output_active(&self, output: OutputHandle) -> bool {
        self.state().active_outputs.contains(&output)
    }

    fn output_last_error(&self, _output: OutputHandle) -> Option<String> {
        Some("scripted failure".to_string())
    }

    fn release_output(&self, output: OutputHandle) {
        let mut state = self.state();
        state.active_outputs.remove(&output);
        state.subscriptions.retain(|_, s| s.output != output);
        state.release(output.0);
    }

    fn subscribe(&self, output: OutputHandle, kind: SignalKind) -> Option<Subscription> {
        let mut state = self.state();
        state.subscribe_calls += 1;
        if state.fail_subscribe {
            return None;
        }
        state.next_id += 1;
        let subscription = Subscription {
            id: state.next_id,
            kind,
            output,
        };
        state.subscriptions.insert(subscription.id, subscription);
        Some(subscription)
    }

    fn unsubscribe(&self, subscription: Subscription) {
        self.state().subscriptions.remove(&subscription.id);
    }

    fn call_procedure(&self, _output: OutputHandle, name: &str) -> bool {
        let mut state = self.state();
        if name == "save" {
            state.save_calls += 1;
            return !state.fail_save_call;
        }
        false
    }
}
