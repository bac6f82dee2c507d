use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum TaxoError {
    #[error("invalid taxonomic rank: {0}")]
    InvalidRank(String),

    #[error("invalid authority specifier: {0}")]
    InvalidAuthority(String),

    #[error("empty authority precedence list")]
    EmptyAuthorityList,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("no input files found under {0}")]
    NoInputFiles(String),

    #[error("failed to parse entry at {path}:{line}: {message}")]
    InputParse {
        path: String,
        line: usize,
        message: String,
    },

    #[error("verifier request failed: {0}")]
    VerifierHttp(String),

    #[error("verifier returned status {status}: {message}")]
    VerifierStatus { status: u16, message: String },

    #[error("worker pool setup failed: {0}")]
    WorkerPool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
