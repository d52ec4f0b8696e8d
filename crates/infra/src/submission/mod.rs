//! Compensating job-submission workflow.

mod error;
mod pipeline;

pub use error::SubmissionError;
pub use pipeline::{Accepted, JobSubmissionPipeline, PipelineConfig, Step, StepOutcome, SubmissionRequest};
