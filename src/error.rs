use thiserror::Error;

/// Errors surfaced at the application boundary. The render path never
/// returns these; it degrades instead (stopping voices, dropping events).
#[derive(Debug, Error)]
pub enum MixerError {
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid enum value: {0}")]
    InvalidEnum(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("unsupported format: {0}")]
    Format(String),

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    #[error("resampler error: {0}")]
    Resample(String),

    #[error("device disconnected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, MixerError>;

impl From<rubato::ResamplerConstructionError> for MixerError {
    fn from(err: rubato::ResamplerConstructionError) -> Self {
        MixerError::Resample(err.to_string())
    }
}

impl From<rubato::ResampleError> for MixerError {
    fn from(err: rubato::ResampleError) -> Self {
        MixerError::Resample(err.to_string())
    }
}
