use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SentinelaError {
    #[error("Unknown feed source: {0}")]
    UnknownSource(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
