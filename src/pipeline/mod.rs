//! Declarative search pipelines: a small step graph parsed from YAML or
//! JSON, resolved from templates, validated as a DAG, and executed with
//! level parallelism.

pub mod config;
pub mod engine;
pub mod graph;
pub mod template;

pub use config::{OutputFormat, OutputSpec, PipelineConfig, ScheduleSpec, Step, StepAction};
pub use engine::{ExecOptions, PipelineEngine, PipelineResult, RunStatus};
