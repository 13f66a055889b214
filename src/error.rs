use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading data, configuring or running an epistasis search.
///
/// Every variant aborts the run: there is no partial-result recovery.
#[derive(Error, Debug)]
pub enum EpistasisError {
    /// The dataset file could not be opened
    #[error("Dataset file not found: {path}")]
    FileNotFound { path: PathBuf },

    /// Header unreadable or byte length inconsistent with the header
    #[error("Malformed dataset {path}: {message}")]
    Format { path: PathBuf, message: String },

    /// A genotype call outside {0,1,2}
    #[error("Invalid genotype {value} in {path} at variant {variant}, sample {sample} (expected 0, 1 or 2)")]
    InvalidGenotype {
        path: PathBuf,
        variant: usize,
        sample: usize,
        value: u8,
    },

    /// The report directory could not be created
    #[error("Can't create output directory {path}: {source}")]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    /// A ranking message could not be exchanged between nodes
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EpistasisError>;

impl EpistasisError {
    pub fn format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

impl From<bincode::Error> for EpistasisError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for EpistasisError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<csv::Error> for EpistasisError {
    fn from(e: csv::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
