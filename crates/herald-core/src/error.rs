use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeraldError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown status: {0}")]
    InvalidStatus(String),
}

pub type Result<T> = std::result::Result<T, HeraldError>;
