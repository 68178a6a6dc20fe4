/// Result alias that carries the custom [`VocalScopeError`] type.
pub type Result<T> = std::result::Result<T, VocalScopeError>;

/// Common error type for the core crate.
///
/// Only configuration-time problems surface as errors. Steady-state polling
/// ("no new frames yet", "buffer too small") is reported through return
/// values instead.
#[derive(Debug, thiserror::Error)]
pub enum VocalScopeError {
    /// A configuration was rejected before any state was touched.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Input handed to an analysis routine cannot be processed.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// The FFT backend refused a buffer.
    #[error("fft error: {0}")]
    Fft(String),
    /// Config (de)serialisation failed.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl VocalScopeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<&str> for VocalScopeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for VocalScopeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<realfft::FftError> for VocalScopeError {
    fn from(value: realfft::FftError) -> Self {
        Self::Fft(value.to_string())
    }
}
