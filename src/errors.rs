use thiserror::Error;

#[derive(Error, Debug)]
pub enum PintError {
    #[error("config error: {0}")]
    Config(String),
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dimension mismatch: expected {expected}, found {found}")]
    Dimension { expected: String, found: String },
    #[error("wire format error: {0}")]
    Wire(String),
    #[error("communication error: {0}")]
    Comm(String),
    #[error("numerical failure: {0}")]
    Numeric(String),
}

pub type PintResult<T> = Result<T, PintError>;
