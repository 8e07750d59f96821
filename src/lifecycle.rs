//! Per-execution lifecycle state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Phase of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Request received, nothing done yet.
    #[default]
    Idle,
    /// Classifying the request into a plan.
    Resolving,
    /// Building the workspace.
    Materializing,
    /// Toolchain process running.
    Executing,
    /// Turning the raw outcome into a result.
    Normalizing,
    /// Releasing the workspace.
    CleaningUp,
    /// Finished, successfully or not.
    Done,
}

impl Phase {
    /// Returns true if `next` may directly follow `self`.
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;

        matches!(
            (self, next),
            (Idle, Resolving)
                | (Resolving, Materializing)
                | (Resolving, CleaningUp)
                | (Materializing, Executing)
                | (Materializing, CleaningUp)
                | (Executing, Normalizing)
                | (Executing, CleaningUp)
                | (Normalizing, CleaningUp)
                | (CleaningUp, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Done
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Resolving => "resolving",
            Phase::Materializing => "materializing",
            Phase::Executing => "executing",
            Phase::Normalizing => "normalizing",
            Phase::CleaningUp => "cleaning_up",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Tracks the phase of one execution and rejects illegal transitions.
///
/// `Executing` only goes straight to `CleaningUp` when the process could not
/// be spawned; every outcome of a started process passes through
/// `Normalizing`.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    phase: Phase,
    history: Vec<Phase>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns every phase entered so far, starting with `Idle`.
    pub fn history(&self) -> impl Iterator<Item = Phase> + '_ {
        std::iter::once(Phase::Idle).chain(self.history.iter().copied())
    }

    /// Moves to `next`.
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_advance_to(next) {
            return Err(Error::Internal(format!(
                "illegal lifecycle transition {} -> {}",
                self.phase, next
            )));
        }

        tracing::debug!(from = %self.phase, to = %next, "lifecycle transition");
        self.phase = next;
        self.history.push(next);
        Ok(())
    }

    /// Moves to `CleaningUp` from wherever the execution stopped.
    ///
    /// A no-op if cleanup has already started.
    pub fn begin_cleanup(&mut self) -> Result<()> {
        match self.phase {
            Phase::CleaningUp | Phase::Done => Ok(()),
            _ => self.advance(Phase::CleaningUp),
        }
    }

    /// Finishes the execution.
    pub fn finish(&mut self) -> Result<()> {
        self.begin_cleanup()?;
        self.advance(Phase::Done)
    }
}
