pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// framing errors, recoverable inside the decode loop
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("decode buffer overflow: {0} bytes")]
    BufferOverflow(usize),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// cache errors
    #[error("l2 cache: {0}")]
    CacheL2(String),

    #[error("origin load: {0}")]
    Origin(String),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),
}

impl From<std::sync::Arc<AppError>> for AppError {
    /// Unwraps a shared error when this caller is the last holder, otherwise
    /// degrades to an `Origin` error carrying the display form.
    fn from(shared: std::sync::Arc<AppError>) -> Self {
        match std::sync::Arc::try_unwrap(shared) {
            Ok(e) => e,
            Err(arc) => AppError::Origin(arc.to_string()),
        }
    }
}
