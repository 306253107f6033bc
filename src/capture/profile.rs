//! Capture, encoding and audio profiles
//!
//! Profiles are plain values. The buffer manager keeps a snapshot of the
//! ones it last applied and compares against it to decide which engine
//! objects have to be rebuilt.

use serde::{Deserialize, Serialize};

/// Capture geometry. Changing it requires an engine restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub capture_cursor: bool,
}

impl Default for CaptureProfile {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 60,
            capture_cursor: true,
        }
    }
}

/// Hardware vendor family of an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderFamily {
    Nvidia,
    Intel,
    Amd,
    Software,
}

/// Closed set of video encoders the application knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    NvencH264,
    NvencHevc,
    QsvH264,
    QsvHevc,
    AmfH264,
    AmfHevc,
    #[default]
    X264,
    X265,
}

impl EncoderKind {
    pub const ALL: [EncoderKind; 8] = [
        EncoderKind::NvencH264,
        EncoderKind::NvencHevc,
        EncoderKind::QsvH264,
        EncoderKind::QsvHevc,
        EncoderKind::AmfH264,
        EncoderKind::AmfHevc,
        EncoderKind::X264,
        EncoderKind::X265,
    ];

    /// Engine encoder type identifier
    pub fn engine_id(&self) -> &'static str {
        match self {
            EncoderKind::NvencH264 => "ffmpeg_nvenc",
            EncoderKind::NvencHevc => "ffmpeg_hevc_nvenc",
            EncoderKind::QsvH264 => "obs_qsv11",
            EncoderKind::QsvHevc => "obs_qsv11_hevc",
            EncoderKind::AmfH264 => "h264_texture_amf",
            EncoderKind::AmfHevc => "h265_texture_amf",
            EncoderKind::X264 => "obs_x264",
            EncoderKind::X265 => "obs_x265",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            EncoderKind::NvencH264 => "NVIDIA NVENC H.264",
            EncoderKind::NvencHevc => "NVIDIA NVENC HEVC",
            EncoderKind::QsvH264 => "Intel Quick Sync (QSV) H.264",
            EncoderKind::QsvHevc => "Intel Quick Sync (QSV) HEVC",
            EncoderKind::AmfH264 => "AMD AMF H.264 (AVC)",
            EncoderKind::AmfHevc => "AMD AMF HEVC",
            EncoderKind::X264 => "Software (x264)",
            EncoderKind::X265 => "Software (x265)",
        }
    }

    pub fn family(&self) -> EncoderFamily {
        match self {
            EncoderKind::NvencH264 | EncoderKind::NvencHevc => EncoderFamily::Nvidia,
            EncoderKind::QsvH264 | EncoderKind::QsvHevc => EncoderFamily::Intel,
            EncoderKind::AmfH264 | EncoderKind::AmfHevc => EncoderFamily::Amd,
            EncoderKind::X264 | EncoderKind::X265 => EncoderFamily::Software,
        }
    }

    pub fn from_engine_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.engine_id() == id)
    }
}

/// Rate control applied uniformly across vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControl {
    /// Constant bitrate at `bitrate` kbps
    #[default]
    Cbr,
    /// CQP (hardware) or CRF (software) at `quality`; lower is better
    ConstantQuality,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NvencParams {
    pub preset: String,
    pub tuning: String,
    pub multipass: String,
    pub profile: String,
    pub lookahead: bool,
    pub psycho_visual_tuning: bool,
    pub gpu: i64,
    pub max_b_frames: i64,
}

impl Default for NvencParams {
    fn default() -> Self {
        Self {
            preset: "p5".to_string(),
            tuning: "hq".to_string(),
            multipass: "qres".to_string(),
            profile: "high".to_string(),
            lookahead: false,
            psycho_visual_tuning: true,
            gpu: 0,
            max_b_frames: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QsvParams {
    pub preset: String,
    pub profile: String,
    pub low_power: bool,
}

impl Default for QsvParams {
    fn default() -> Self {
        Self {
            preset: "balanced".to_string(),
            profile: "high".to_string(),
            low_power: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmfParams {
    /// Usage preset ("quality", "balanced", "speed")
    pub usage: String,
    pub profile: String,
    pub b_frames: i64,
    pub options: String,
}

impl Default for AmfParams {
    fn default() -> Self {
        Self {
            usage: "quality".to_string(),
            profile: "high".to_string(),
            b_frames: 2,
            options: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct X264Params {
    pub preset: String,
    pub profile: String,
    /// "none" leaves the tune unset
    pub tune: String,
    pub options: String,
}

impl Default for X264Params {
    fn default() -> Self {
        Self {
            preset: "veryfast".to_string(),
            profile: "high".to_string(),
            tune: "none".to_string(),
            options: String::new(),
        }
    }
}

/// Video encoder selection and tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingProfile {
    pub encoder: EncoderKind,
    pub rate_control: RateControl,
    /// kbps
    pub bitrate: i64,
    pub quality: i64,
    /// Seconds between keyframes, 0 lets the encoder decide
    pub keyframe_interval_secs: i64,
    pub nvenc: NvencParams,
    pub qsv: QsvParams,
    pub amf: AmfParams,
    pub x264: X264Params,
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self {
            encoder: EncoderKind::X264,
            rate_control: RateControl::Cbr,
            bitrate: 8000,
            quality: 22,
            keyframe_interval_secs: 0,
            nvenc: NvencParams::default(),
            qsv: QsvParams::default(),
            amf: AmfParams::default(),
            x264: X264Params::default(),
        }
    }
}

impl EncodingProfile {
    /// Whether an encoder built from `previous` can serve this profile.
    ///
    /// Common fields always count. Vendor parameter bags only count for
    /// `active`, the family of the encoder actually running, which differs
    /// from the requested one after a fallback to software.
    pub fn requires_recreation(&self, previous: &EncodingProfile, active: EncoderFamily) -> bool {
        if self.encoder != previous.encoder
            || self.rate_control != previous.rate_control
            || self.bitrate != previous.bitrate
            || self.quality != previous.quality
            || self.keyframe_interval_secs != previous.keyframe_interval_secs
        {
            return true;
        }

        match active {
            EncoderFamily::Nvidia => self.nvenc != previous.nvenc,
            EncoderFamily::Intel => self.qsv != previous.qsv,
            EncoderFamily::Amd => self.amf != previous.amf,
            EncoderFamily::Software => self.x264 != previous.x264,
        }
    }
}

/// Desktop audio capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioProfile {
    pub enabled: bool,
    pub sample_rate: u32,
    /// kbps
    pub bitrate: i64,
    pub channels: u32,
    /// 0.0 - 1.0
    pub volume: f32,
    pub device_id: String,
    pub device_name: String,
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 48000,
            bitrate: 192,
            channels: 2,
            volume: 1.0,
            device_id: DEFAULT_DEVICE_ID.to_string(),
            device_name: "Default".to_string(),
        }
    }
}

// Volume is live-updatable and deliberately left out.
impl PartialEq for AudioProfile {
    fn eq(&self, other: &Self) -> bool {
        self.enabled == other.enabled
            && self.bitrate == other.bitrate
            && self.device_id == other.device_id
    }
}

/// Microphone capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MicrophoneProfile {
    pub enabled: bool,
    pub sample_rate: u32,
    pub channels: u32,
    pub volume: f32,
    pub device_id: String,
    pub device_name: String,
    pub noise_suppression: bool,
}

impl Default for MicrophoneProfile {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 48000,
            channels: 1,
            volume: 1.0,
            device_id: DEFAULT_DEVICE_ID.to_string(),
            device_name: "Default Microphone".to_string(),
            noise_suppression: true,
        }
    }
}

impl PartialEq for MicrophoneProfile {
    fn eq(&self, other: &Self) -> bool {
        self.enabled == other.enabled && self.device_id == other.device_id
    }
}

/// Device id used when a profile does not name one
pub const DEFAULT_DEVICE_ID: &str = "default";

/// Resolve an empty device id to the default device
pub fn device_or_default(device_id: &str) -> &str {
    if device_id.is_empty() {
        DEFAULT_DEVICE_ID
    } else {
        device_id
    }
}
