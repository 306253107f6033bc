//! Replay buffer capture core
//!
//! Drives a capture engine through the [`CaptureEngine`](crate::engine::CaptureEngine)
//! boundary. The buffer manager keeps encoders and audio sources alive across
//! buffer cycles and saves clips into per-game folders.

mod buffer;
mod encoders;
mod profile;
mod session;
mod timers;

pub use buffer::{BufferEvent, BufferManager, BufferPhase, DEFAULT_BUFFER_DURATION_SECS};
pub use encoders::EncoderInfo;
pub use profile::{
    AmfParams, AudioProfile, CaptureProfile, EncoderFamily, EncoderKind, EncodingProfile,
    MicrophoneProfile, NvencParams, QsvParams, RateControl, X264Params,
};
pub use session::{ensure_dir, game_folder_for_executable, GENERAL_FOLDER};
