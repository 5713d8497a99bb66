use thiserror::Error;

#[derive(Debug, Error)]
pub enum DmresError {
    #[error("Partition error: {0}")]
    Partition(String),

    #[error("Dimension error: {0}")]
    Dimension(String),

    #[error("Degenerate step: {0}")]
    Degenerate(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DmresError>;
