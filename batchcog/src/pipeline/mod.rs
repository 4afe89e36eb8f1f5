//! Pipeline orchestration.
//!
//! A [`CogPipeline`] is built once per process and shared by every run.
//! Each call to [`CogPipeline::run`] acquires its own workspace, drives the
//! [`StateMachine`] through the stages, and releases the workspace whatever
//! the outcome.

mod orchestrator;
mod request;
mod state;

pub use orchestrator::{CogPipeline, PipelineBuilder};
pub use request::{PipelineRequest, RunReport};
pub use state::{PipelineState, StateMachine};
