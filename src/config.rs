//! Pipeline configuration, modeled the way `samply`'s
//! `ProfileCreationProps`/`RecordingProps` bundle its CLI-adjacent knobs
//! into one `serde`-derived struct, so a caller can load it from a config
//! file as easily as construct it in code.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, TraceWalkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    None,
    Compare,
    MutualInformationWholeTrace,
    MutualInformationTracePrefix,
    MutualInformationSingleInstruction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    pub analysis_mode: AnalysisMode,

    /// Byte granularity addresses are masked to before comparison/hashing.
    /// Must be a power of two; 1 disables masking.
    pub granularity: u32,

    pub keep_raw_traces: bool,
    pub keep_preprocessed_traces: bool,

    /// Number of internally-randomized repetitions each testcase is
    /// expected to already fold in, used only for the under-sampling
    /// warning on mutual-information results.
    pub randomization_multiplier: u32,

    pub output_directory: PathBuf,
    pub preprocessed_trace_directory: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis_mode: AnalysisMode::None,
            granularity: 1,
            keep_raw_traces: false,
            keep_preprocessed_traces: false,
            randomization_multiplier: 1,
            output_directory: PathBuf::from("./tracewalk-out"),
            preprocessed_trace_directory: PathBuf::from("./tracewalk-out/preprocessed"),
        }
    }
}

impl PipelineConfig {
    /// Validates invariants `serde` alone can't express: `granularity`
    /// must be a nonzero power of two.
    pub fn validate(self) -> Result<Self> {
        if self.granularity == 0 || !self.granularity.is_power_of_two() {
            return Err(TraceWalkError::InvalidGranularity(self.granularity));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_granularity_is_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.granularity = 0;
        assert!(matches!(
            cfg.validate(),
            Err(TraceWalkError::InvalidGranularity(0))
        ));
    }

    #[test]
    fn non_power_of_two_granularity_is_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.granularity = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrips_through_json() {
        let cfg = PipelineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.granularity, cfg.granularity);
        assert_eq!(back.analysis_mode, cfg.analysis_mode);
    }
}
