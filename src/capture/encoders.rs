//! Encoder and audio source factory
//!
//! Translates profiles into engine objects. Nothing here holds state; the
//! buffer manager owns every handle these functions return.

use tracing::{debug, info, warn};

use super::profile::{
    device_or_default, AudioProfile, EncoderFamily, EncoderKind, EncodingProfile,
    MicrophoneProfile, RateControl,
};
use crate::engine::{CaptureEngine, EncoderHandle, MonitoringType, Settings, SourceHandle};

/// Encoder used when the requested one is missing or fails to build
pub const FALLBACK_ENCODER_ID: &str = "obs_x264";

pub const AUDIO_ENCODER_ID: &str = "ffmpeg_aac";
pub const AUDIO_ENCODER_SAMPLE_RATE: i64 = 48000;

#[cfg(target_os = "windows")]
pub const DESKTOP_AUDIO_KIND: &str = "wasapi_output_capture";
#[cfg(target_os = "windows")]
pub const MICROPHONE_KIND: &str = "wasapi_input_capture";

#[cfg(target_os = "macos")]
pub const DESKTOP_AUDIO_KIND: &str = "coreaudio_output_capture";
#[cfg(target_os = "macos")]
pub const MICROPHONE_KIND: &str = "coreaudio_input_capture";

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const DESKTOP_AUDIO_KIND: &str = "pulse_output_capture";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const MICROPHONE_KIND: &str = "pulse_input_capture";

pub const DESKTOP_AUDIO_NAME: &str = "Desktop Audio";
pub const MICROPHONE_NAME: &str = "Microphone";

pub const NOISE_FILTER_KIND: &str = "noise_suppress_filter";
pub const NOISE_FILTER_NAME: &str = "Noise Suppression";

/// An encoder registered with the engine that the application knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    pub kind: EncoderKind,
    pub id: &'static str,
    pub name: &'static str,
}

impl From<EncoderKind> for EncoderInfo {
    fn from(kind: EncoderKind) -> Self {
        Self {
            kind,
            id: kind.engine_id(),
            name: kind.display_name(),
        }
    }
}

/// Intersect the engine's registered encoder types with the known table
pub fn detect_available(engine: &dyn CaptureEngine) -> Vec<EncoderInfo> {
    let registered = engine.encoder_types();
    let available: Vec<EncoderInfo> = EncoderKind::ALL
        .into_iter()
        .filter(|kind| registered.iter().any(|id| id == kind.engine_id()))
        .map(EncoderInfo::from)
        .collect();

    for encoder in &available {
        debug!("Detected available encoder: {} ({})", encoder.name, encoder.id);
    }
    info!(
        "Encoder detection finished, found {} of {} registered types",
        available.len(),
        registered.len()
    );
    available
}

/// Engine id for the requested kind, or the software fallback if unavailable
pub fn select_encoder_id(kind: EncoderKind, available: &[EncoderInfo]) -> &'static str {
    available
        .iter()
        .find(|encoder| encoder.kind == kind)
        .map(|encoder| encoder.id)
        .unwrap_or(FALLBACK_ENCODER_ID)
}

/// Build the settings dictionary for a video encoder.
///
/// The vendor bag is chosen from the engine id actually used, so a fallback
/// to x264 gets x264 parameters even when an NVENC profile was requested.
pub fn video_encoder_settings(profile: &EncodingProfile, encoder_id: &str) -> Settings {
    let family = EncoderKind::from_engine_id(encoder_id)
        .map(|kind| kind.family())
        .unwrap_or(EncoderFamily::Software);

    let mut settings = Settings::new();
    settings.set_int("keyint_sec", profile.keyframe_interval_secs);

    match family {
        EncoderFamily::Nvidia => {
            let nvenc = &profile.nvenc;
            settings
                .set_string("preset2", nvenc.preset.as_str())
                .set_string("tune", nvenc.tuning.as_str())
                .set_string("multipass", nvenc.multipass.as_str())
                .set_string("profile", nvenc.profile.as_str())
                .set_bool("lookahead", nvenc.lookahead)
                .set_bool("psycho_aq", nvenc.psycho_visual_tuning)
                .set_int("gpu", nvenc.gpu)
                .set_int("bf", nvenc.max_b_frames);
        }
        EncoderFamily::Intel => {
            let qsv = &profile.qsv;
            settings
                .set_string("preset", qsv.preset.as_str())
                .set_string("profile", qsv.profile.as_str())
                .set_bool("low_power", qsv.low_power);
        }
        EncoderFamily::Amd => {
            let amf = &profile.amf;
            settings
                .set_string("usage", amf.usage.as_str())
                .set_string("profile", amf.profile.as_str())
                .set_int("bf", amf.b_frames);
            if !amf.options.is_empty() {
                settings.set_string("amf_opts", amf.options.as_str());
            }
        }
        EncoderFamily::Software => {
            let x264 = &profile.x264;
            settings.set_string("preset", x264.preset.as_str());
            if x264.tune != "none" {
                settings.set_string("tune", x264.tune.as_str());
            }
            settings.set_string("profile", x264.profile.as_str());
            if !x264.options.is_empty() {
                settings.set_string("x264opts", x264.options.as_str());
            }
        }
    }

    match profile.rate_control {
        RateControl::Cbr => {
            settings
                .set_string("rate_control", "CBR")
                .set_int("bitrate", profile.bitrate);
        }
        RateControl::ConstantQuality if family == EncoderFamily::Software => {
            settings
                .set_string("rate_control", "CRF")
                .set_int("crf", profile.quality);
        }
        RateControl::ConstantQuality => {
            settings
                .set_string("rate_control", "CQP")
                .set_int("cqp", profile.quality);
        }
    }

    settings
}

/// Create the buffer's video encoder, falling back once to x264
pub fn create_video_encoder(
    engine: &dyn CaptureEngine,
    profile: &EncodingProfile,
    available: &[EncoderInfo],
) -> Option<EncoderHandle> {
    let encoder_id = select_encoder_id(profile.encoder, available);
    if encoder_id != profile.encoder.engine_id() {
        warn!(
            "Encoder {} is not available, using {}",
            profile.encoder.engine_id(),
            encoder_id
        );
    }

    let settings = video_encoder_settings(profile, encoder_id);
    if let Some(encoder) = engine.create_video_encoder(encoder_id, "video_encoder", &settings) {
        info!("Created video encoder {}", encoder_id);
        return Some(encoder);
    }

    if encoder_id == FALLBACK_ENCODER_ID {
        warn!("Failed to create video encoder {}", encoder_id);
        return None;
    }

    warn!(
        "Failed to create video encoder {}, falling back to {}",
        encoder_id, FALLBACK_ENCODER_ID
    );
    let settings = video_encoder_settings(profile, FALLBACK_ENCODER_ID);
    let encoder = engine.create_video_encoder(FALLBACK_ENCODER_ID, "video_encoder", &settings);
    if encoder.is_none() {
        warn!("Fallback video encoder {} failed as well", FALLBACK_ENCODER_ID);
    }
    encoder
}

pub fn audio_encoder_settings(audio: &AudioProfile) -> Settings {
    let mut settings = Settings::new();
    settings
        .set_int("bitrate", audio.bitrate)
        .set_string("rate_control", "CBR")
        .set_int("samplerate", AUDIO_ENCODER_SAMPLE_RATE);
    settings
}

/// AAC encoder on mixer track 0
pub fn create_audio_encoder(engine: &dyn CaptureEngine, audio: &AudioProfile) -> Option<EncoderHandle> {
    let encoder = engine.create_audio_encoder(
        AUDIO_ENCODER_ID,
        "audio_encoder",
        &audio_encoder_settings(audio),
        0,
    );
    match encoder {
        Some(_) => info!("Created audio encoder at {} kbps", audio.bitrate),
        None => warn!("Failed to create audio encoder {}", AUDIO_ENCODER_ID),
    }
    encoder
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        return 1.0;
    }
    volume.clamp(0.0, 1.0)
}

pub fn create_desktop_source(engine: &dyn CaptureEngine, audio: &AudioProfile) -> Option<SourceHandle> {
    let mut settings = Settings::new();
    settings.set_string("device_id", device_or_default(&audio.device_id));

    let source = engine.create_source(DESKTOP_AUDIO_KIND, DESKTOP_AUDIO_NAME, &settings)?;
    apply_desktop_live(engine, source, audio);
    engine.set_source_monitoring(source, MonitoringType::MonitorAndOutput);
    debug!(
        "Desktop audio source created for device {}",
        device_or_default(&audio.device_id)
    );
    Some(source)
}

/// Push volume and enabled state into an existing desktop source
pub fn apply_desktop_live(engine: &dyn CaptureEngine, source: SourceHandle, audio: &AudioProfile) {
    engine.set_source_volume(source, clamp_volume(audio.volume));
    engine.set_source_enabled(source, audio.enabled);
}

pub fn create_microphone_source(
    engine: &dyn CaptureEngine,
    microphone: &MicrophoneProfile,
) -> Option<SourceHandle> {
    let mut settings = Settings::new();
    settings
        .set_string("device_id", device_or_default(&microphone.device_id))
        .set_bool("use_device_timing", true);

    let source = engine.create_source(MICROPHONE_KIND, MICROPHONE_NAME, &settings)?;
    engine.set_source_volume(source, clamp_volume(microphone.volume));
    engine.set_source_enabled(source, microphone.enabled);
    engine.set_source_monitoring(source, MonitoringType::None);

    if microphone.noise_suppression && !engine.add_filter(source, NOISE_FILTER_KIND, NOISE_FILTER_NAME) {
        warn!("Failed to attach noise suppression to the microphone");
    }
    debug!(
        "Microphone source created for device {}",
        device_or_default(&microphone.device_id)
    );
    Some(source)
}

/// Push volume, enabled state and the noise filter toggle into an existing
/// microphone source. The filter is only ever disabled, never removed.
pub fn apply_microphone_live(
    engine: &dyn CaptureEngine,
    source: SourceHandle,
    microphone: &MicrophoneProfile,
) {
    engine.set_source_volume(source, clamp_volume(microphone.volume));
    engine.set_source_enabled(source, microphone.enabled);

    if engine.set_filter_enabled(source, NOISE_FILTER_NAME, microphone.noise_suppression) {
        return;
    }
    if microphone.noise_suppression && !engine.add_filter(source, NOISE_FILTER_KIND, NOISE_FILTER_NAME) {
        warn!("Failed to attach noise suppression to the microphone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::profile::{AmfParams, X264Params};
    use crate::engine::fake::FakeEngine;

    fn detected(fake: &FakeEngine) -> Vec<EncoderInfo> {
        detect_available(fake)
    }

    #[test]
    fn detection_intersects_with_known_table() {
        let (fake, _signals) = FakeEngine::new();
        let available = detected(&fake);

        let ids: Vec<&str> = available.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["ffmpeg_nvenc", "obs_x264", "obs_x265"]);
    }

    #[test]
    fn unavailable_kind_falls_back_to_software() {
        let (fake, _signals) = FakeEngine::new();
        let available = detected(&fake);

        assert_eq!(select_encoder_id(EncoderKind::NvencH264, &available), "ffmpeg_nvenc");
        assert_eq!(select_encoder_id(EncoderKind::AmfHevc, &available), "obs_x264");
    }

    #[test]
    fn nvenc_constant_quality_uses_cqp() {
        let profile = EncodingProfile {
            encoder: EncoderKind::NvencH264,
            rate_control: RateControl::ConstantQuality,
            quality: 19,
            ..EncodingProfile::default()
        };
        let settings = video_encoder_settings(&profile, "ffmpeg_nvenc");

        assert_eq!(settings.get_str("preset2"), Some("p5"));
        assert_eq!(settings.get_bool("psycho_aq"), Some(true));
        assert_eq!(settings.get_int("bf"), Some(2));
        assert_eq!(settings.get_str("rate_control"), Some("CQP"));
        assert_eq!(settings.get_int("cqp"), Some(19));
        assert!(!settings.contains_key("bitrate"));
        assert!(!settings.contains_key("crf"));
    }

    #[test]
    fn x264_skips_none_tune_and_empty_options() {
        let profile = EncodingProfile {
            rate_control: RateControl::ConstantQuality,
            ..EncodingProfile::default()
        };
        let settings = video_encoder_settings(&profile, "obs_x264");
        assert_eq!(settings.get_str("preset"), Some("veryfast"));
        assert!(!settings.contains_key("tune"));
        assert!(!settings.contains_key("x264opts"));
        assert_eq!(settings.get_str("rate_control"), Some("CRF"));
        assert_eq!(settings.get_int("crf"), Some(22));
        assert_eq!(settings.get_int("keyint_sec"), Some(0));

        let tuned = EncodingProfile {
            x264: X264Params {
                tune: "film".to_string(),
                options: "bframes=3".to_string(),
                ..X264Params::default()
            },
            ..EncodingProfile::default()
        };
        let settings = video_encoder_settings(&tuned, "obs_x265");
        assert_eq!(settings.get_str("tune"), Some("film"));
        assert_eq!(settings.get_str("x264opts"), Some("bframes=3"));
        assert_eq!(settings.get_str("rate_control"), Some("CBR"));
        assert_eq!(settings.get_int("bitrate"), Some(8000));
    }

    #[test]
    fn amf_options_only_when_set() {
        let mut profile = EncodingProfile {
            encoder: EncoderKind::AmfH264,
            ..EncodingProfile::default()
        };
        let settings = video_encoder_settings(&profile, "h264_texture_amf");
        assert_eq!(settings.get_str("usage"), Some("quality"));
        assert!(!settings.contains_key("amf_opts"));

        profile.amf = AmfParams {
            options: "QualityPreset=0".to_string(),
            ..AmfParams::default()
        };
        let settings = video_encoder_settings(&profile, "h264_texture_amf");
        assert_eq!(settings.get_str("amf_opts"), Some("QualityPreset=0"));
    }

    #[test]
    fn failed_hardware_encoder_falls_back_once() {
        let (fake, _signals) = FakeEngine::new();
        fake.state()
            .failing_video_encoders
            .insert("ffmpeg_nvenc".to_string());
        let available = detected(&fake);

        let profile = EncodingProfile {
            encoder: EncoderKind::NvencH264,
            ..EncodingProfile::default()
        };
        let encoder = create_video_encoder(&*fake, &profile, &available);

        assert!(encoder.is_some());
        let state = fake.state();
        assert_eq!(state.video_encoders.len(), 1);
        assert_eq!(state.video_encoders[0].id, "obs_x264");
        assert_eq!(state.video_encoders[0].settings.get_str("preset"), Some("veryfast"));
    }

    #[test]
    fn fallback_failure_is_reported() {
        let (fake, _signals) = FakeEngine::new();
        {
            let mut state = fake.state();
            state.failing_video_encoders.insert("ffmpeg_nvenc".to_string());
            state.failing_video_encoders.insert("obs_x264".to_string());
        }
        let available = detected(&fake);
        let profile = EncodingProfile {
            encoder: EncoderKind::NvencH264,
            ..EncodingProfile::default()
        };

        assert!(create_video_encoder(&*fake, &profile, &available).is_none());
        assert_eq!(fake.live_objects(), 0);
    }

    #[test]
    fn audio_encoder_is_fixed_format_cbr() {
        let (fake, _signals) = FakeEngine::new();
        let audio = AudioProfile {
            bitrate: 320,
            ..AudioProfile::default()
        };
        assert!(create_audio_encoder(&*fake, &audio).is_some());

        let state = fake.state();
        let created = &state.audio_encoders[0];
        assert_eq!(created.id, "ffmpeg_aac");
        assert_eq!(created.settings.get_int("bitrate"), Some(320));
        assert_eq!(created.settings.get_str("rate_control"), Some("CBR"));
        assert_eq!(created.settings.get_int("samplerate"), Some(48000));
    }

    #[test]
    fn desktop_source_defaults_device_and_clamps_volume() {
        let (fake, _signals) = FakeEngine::new();
        let audio = AudioProfile {
            device_id: String::new(),
            volume: 1.7,
            ..AudioProfile::default()
        };
        let source = create_desktop_source(&*fake, &audio).unwrap();

        let state = fake.state();
        assert_eq!(state.sources[0].settings.get_str("device_id"), Some("default"));
        assert_eq!(state.volumes[&source], 1.0);
        assert!(state.enabled[&source]);
        assert_eq!(state.monitoring[&source], MonitoringType::MonitorAndOutput);
    }

    #[test]
    fn microphone_filter_is_toggled_not_removed() {
        let (fake, _signals) = FakeEngine::new();
        let mut microphone = MicrophoneProfile {
            enabled: true,
            ..MicrophoneProfile::default()
        };
        let source = create_microphone_source(&*fake, &microphone).unwrap();
        assert_eq!(
            fake.state().filters[&source],
            vec![(NOISE_FILTER_NAME.to_string(), true)]
        );
        assert_eq!(fake.state().monitoring[&source], MonitoringType::None);

        microphone.noise_suppression = false;
        apply_microphone_live(&*fake, source, &microphone);
        assert_eq!(
            fake.state().filters[&source],
            vec![(NOISE_FILTER_NAME.to_string(), false)]
        );

        microphone.noise_suppression = true;
        apply_microphone_live(&*fake, source, &microphone);
        assert_eq!(
            fake.state().filters[&source],
            vec![(NOISE_FILTER_NAME.to_string(), true)]
        );
    }

    #[test]
    fn late_noise_suppression_adds_the_filter() {
        let (fake, _signals) = FakeEngine::new();
        let mut microphone = MicrophoneProfile {
            enabled: true,
            noise_suppression: false,
            ..MicrophoneProfile::default()
        };
        let source = create_microphone_source(&*fake, &microphone).unwrap();
        assert!(fake.state().filters.get(&source).is_none());

        microphone.noise_suppression = true;
        apply_microphone_live(&*fake, source, &microphone);
        assert_eq!(fake.state().filters[&source].len(), 1);
    }
}
