//! Error taxonomy for the trace analysis core.
//!
//! Per the error handling design: malformed input is fatal, everything else
//! (unresolvable addresses, allocation anomalies, stack-frame misses) is
//! recovered from locally by the caller and only ever surfaces as a
//! `log::warn!` plus an entry in [`crate::DroppedRecordCounts`].

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceWalkError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "malformed raw trace file {path}: length {len} is not a multiple of the record size ({record_size})"
    )]
    MalformedRecord {
        path: PathBuf,
        len: u64,
        record_size: u64,
    },

    #[error("malformed prefix data file {path} at line {line}: {reason}")]
    MalformedPrefixData {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("granularity must be a power of two, got {0}")]
    InvalidGranularity(u32),

    #[error("malformed preprocessed trace stream: {0}")]
    Decoding(String),

    #[error("no trace prefix is available yet")]
    PrefixNotReady,

    #[error("pipeline is no longer accepting submissions")]
    PipelineClosed,
}

pub type Result<T> = std::result::Result<T, TraceWalkError>;

impl TraceWalkError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
