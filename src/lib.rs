//! Trace-analysis core for detecting microarchitectural side-channel
//! leakage in compiled cryptographic libraries: the preprocessor that
//! turns raw fixed-width trace records into an address-normalized
//! stream, the comparator that finds where two preprocessed traces
//! diverge, and the mutual-information analyzers that quantify how much
//! a trace (or a single instruction) leaks about testcase identity.
//!
//! The tracing frontend that produces raw traces, and the CLI that wires
//! this crate's [`Pipeline`] up to real files and a real tracer, are out
//! of scope here.

pub mod alloc_tracker;
pub mod comparator;
pub mod config;
pub mod encoder;
pub mod entry;
pub mod error;
pub mod image_map;
pub mod mi;
pub mod pipeline;
pub mod preprocessor;
pub mod record;
pub mod result_writer;
pub mod stack_tracker;

pub use config::{AnalysisMode, PipelineConfig};
pub use error::{Result, TraceWalkError};
pub use pipeline::{AnalysisResults, Pipeline, Tracer};
pub use preprocessor::{DroppedRecordCounts, Preprocessor};
