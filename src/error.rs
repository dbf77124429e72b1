use crate::config::ConfigError;
use crate::queue::QueueError;

/// Errors that stop a command. Only startup problems end up here; the
/// collector and dispatcher loops log and retry everything else.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Local queue error: {0}")]
    Queue(#[from] QueueError),
}

pub type AppResult<T> = Result<T, AppError>;
