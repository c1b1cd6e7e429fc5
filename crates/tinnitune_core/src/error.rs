//! Engine Error Types

use thiserror::Error;

/// Errors that can occur in the therapy engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Audio output unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Failed to decode audio: {0}")]
    DecodeFailure(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unknown unit: {0}")]
    UnknownUnit(u64),

    #[error("Unit {0} has been stopped")]
    UnitStopped(u64),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to play audio stream: {0}")]
    StreamPlayError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel send error - receiver dropped")]
    ChannelSendError,

    #[error("DSP error: {0}")]
    Dsp(#[from] tinnitune_dsp::DspError),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
