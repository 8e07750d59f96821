//! Result normalization.
//!
//! Turns the raw [`ExecutionOutcome`] of a toolchain invocation into the
//! [`ExecutionResult`] callers see.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::runner::{EnforcedLimits, ExecutionOutcome};
use crate::sandbox::Workspace;
use crate::strategy::{ExecutionPlan, Strategy, WorkspaceOrigin};
use crate::toolchain::Operation;

/// Why an execution did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The toolchain ran to completion and reported failure.
    ToolchainFailure,
    /// The wall-clock deadline fired.
    ExecutionTimeout,
    /// A CPU or memory ceiling was hit.
    ResourceLimitExceeded,
}

/// Structured result of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code zero, no timeout and no limit violation.
    pub success: bool,
    /// Exit code, absent when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Terminating signal, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    pub operation: Operation,
    pub strategy: Strategy,
    pub workspace_origin: WorkspaceOrigin,
    pub timed_out: bool,
    pub resource_limit_exceeded: bool,
    /// Set whenever `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub limits: EnforcedLimits,
    /// Path of the ephemeral workspace kept for inspection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained_workspace: Option<PathBuf>,
}

/// Builds the result for an outcome. Pure.
///
/// The workspace origin and retained path come from the workspace the
/// toolchain actually ran in, not from the plan.
pub fn normalize(
    outcome: ExecutionOutcome,
    plan: &ExecutionPlan,
    workspace: &Workspace,
) -> ExecutionResult {
    let success =
        outcome.exit_code == Some(0) && !outcome.timed_out && !outcome.resource_limit_exceeded;

    let failure = if success {
        None
    } else if outcome.timed_out {
        Some(FailureKind::ExecutionTimeout)
    } else if outcome.resource_limit_exceeded {
        Some(FailureKind::ResourceLimitExceeded)
    } else {
        Some(FailureKind::ToolchainFailure)
    };

    ExecutionResult {
        success,
        exit_code: outcome.exit_code,
        signal: outcome.signal,
        stdout: into_text(outcome.stdout),
        stderr: into_text(outcome.stderr),
        stdout_truncated: outcome.stdout_truncated,
        stderr_truncated: outcome.stderr_truncated,
        duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
        operation: plan.operation(),
        strategy: plan.strategy(),
        workspace_origin: workspace.origin(),
        timed_out: outcome.timed_out,
        resource_limit_exceeded: outcome.resource_limit_exceeded,
        failure,
        limits: outcome.enforced,
        retained_workspace: workspace.retained_path().map(Path::to_path_buf),
    }
}

/// Decodes captured bytes, replacing only invalid sequences.
fn into_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}
