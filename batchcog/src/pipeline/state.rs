//! Run state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::InvalidTransitionError;

/// Where a run is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Workspace acquired, nothing processed yet.
    #[default]
    Start,
    /// Multi-band inputs were stacked into one raster.
    Composited,
    /// The raster was written in the target CRS.
    Reprojected,
    /// The COG was produced.
    Encoded,
    /// The COG reached the blob store.
    Uploaded,
    /// The run finished successfully.
    Done,
    /// The run stopped with an error.
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Composited => write!(f, "composited"),
            Self::Reprojected => write!(f, "reprojected"),
            Self::Encoded => write!(f, "encoded"),
            Self::Uploaded => write!(f, "uploaded"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl PipelineState {
    /// Returns true for `Done` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns true if `next` may follow `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use PipelineState::{Composited, Done, Encoded, Failed, Reprojected, Start, Uploaded};

        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Start, Composited | Reprojected)
            | (Composited, Reprojected)
            | (Reprojected, Encoded)
            | (Encoded, Uploaded)
            | (Uploaded, Done) => true,
            _ => false,
        }
    }
}

/// Tracks one run's state and every state it has visited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: PipelineState::Start,
            history: vec![PipelineState::Start],
        }
    }
}

impl StateMachine {
    /// Starts in `Start`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state visited, starting with `Start`.
    #[must_use]
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    /// Moves to `next`, returning the previous state.
    pub fn advance(&mut self, next: PipelineState) -> Result<PipelineState, InvalidTransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransitionError::new(self.state.to_string(), next.to_string()));
        }
        let previous = self.state;
        self.state = next;
        self.history.push(next);
        Ok(previous)
    }

    /// Moves to `Failed` unless the run is already terminal. Returns the
    /// previous state when a transition happened.
    pub fn fail(&mut self) -> Option<PipelineState> {
        self.advance(PipelineState::Failed).ok()
    }
}
