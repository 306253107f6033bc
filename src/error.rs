//! Error types for the capture core
//!
//! Core operations report typed outcomes; the detailed diagnostics are
//! logged at the point of failure rather than carried upward.

use std::time::Duration;
use thiserror::Error;

/// Engine initialization failures. Fatal to the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine data files not found (searched: {searched})")]
    DataFilesMissing { searched: String },

    #[error("no usable video backend (tried {tried})")]
    VideoBackendUnavailable { tried: String },

    #[error("audio format rejected at 48000 Hz and 44100 Hz")]
    AudioFormatRejected,

    #[error("failed to create scene '{0}'")]
    SceneCreation(String),

    #[error("engine is already running")]
    AlreadyRunning,
}

/// Failures and refusals of buffer Start / Fast Reset.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("capture engine is not initialized")]
    NotInitialized,

    #[error("engine video/audio pipeline is not ready")]
    EngineNotReady,

    #[error("an asynchronous stop or reset is already pending")]
    OperationPending,

    #[error("failed to create video encoder")]
    VideoEncoder,

    #[error("failed to create audio encoder")]
    AudioEncoder,

    #[error("failed to create replay buffer output")]
    OutputCreation,

    #[error("failed to start replay buffer output: {0}")]
    OutputStart(String),

    #[error("replay buffer output is not running")]
    OutputNotRunning,

    #[error("failed to create game capture source for {0}")]
    CaptureSource(String),
}

/// Save requests rejected synchronously. No state changes accompany these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SaveRejected {
    #[error("save is on cooldown for another {remaining:?}")]
    Cooldown { remaining: Duration },

    #[error("clipping mode is not active")]
    NotActive,

    #[error("a save is already in progress")]
    AlreadySaving,

    #[error("replay buffer output is not running")]
    OutputNotRunning,

    #[error("could not subscribe to the saved signal")]
    Subscription,

    #[error("save procedure call failed")]
    TriggerFailed,
}
