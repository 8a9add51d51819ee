//! # hs-types
//!
//! Core types and data structures for HyperSweep: jobs, parameter spaces,
//! experiment configuration, lifecycle enums, the error taxonomy, and the
//! job-script result protocol.

pub mod config;
pub mod errors;
pub mod job;
pub mod marker;
pub mod param;
pub mod status;

pub use config::{
    EarlyStopConfig, EarlyStopPolicy, ExperimentConfig, JobFailureConfig, ResourceArgs,
    ResourceKind, RuntimeArgs,
};
pub use errors::{HsError, HsResult, JobError, ProposerError, ResourceError, StoreError, StoreResult};
pub use job::{Job, JobConfig, TID_KEY};
pub use marker::{
    format_result, parse_final_line, parse_interm_line, parse_result, INTERM_MARKER, RESULT_MARKER,
};
pub use param::{ParameterDef, ParameterKind, ParameterValue, SearchSpace};
pub use status::{BestResult, ExperimentStatus, IntermediateResult, JobStatus, Target};
