use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Invalid retry configuration: {0}")]
    InvalidConfig(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}
