//! Sandbox executor for Go toolchain invocations.
//!
//! Runs the command of an [`ExecutionPlan`] inside a materialized workspace with
//! a scrubbed environment, resource ceilings and a hard wall-clock deadline.

mod capture;
mod env;
mod process;

pub use capture::CaptureBuffer;
pub use env::SandboxEnv;
pub use process::ProcessRunner;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::strategy::ExecutionPlan;

/// Ceilings that were actually in force for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnforcedLimits {
    /// Wall-clock deadline in milliseconds.
    pub timeout_ms: u64,
    /// CPU seconds per process, if the ceiling was applied.
    pub cpu_secs: Option<u64>,
    /// Address-space ceiling in bytes, if it was applied.
    pub memory_bytes: Option<u64>,
    /// Per-stream capture limit.
    pub max_output_bytes: usize,
}

/// Raw outcome of one toolchain invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    /// Exit code, or `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
    /// Captured stdout, at most the capture limit.
    pub stdout: Vec<u8>,
    /// Captured stderr, at most the capture limit.
    pub stderr: Vec<u8>,
    /// Whether stdout exceeded the capture limit.
    pub stdout_truncated: bool,
    /// Whether stderr exceeded the capture limit.
    pub stderr_truncated: bool,
    /// Wall-clock time from spawn to reap.
    pub duration: Duration,
    /// Whether the deadline fired.
    pub timed_out: bool,
    /// Whether a CPU or memory ceiling was hit.
    pub resource_limit_exceeded: bool,
    /// Ceilings in force.
    pub enforced: EnforcedLimits,
}

/// Trait for toolchain runners.
#[async_trait]
pub trait ToolchainRunner: Send + Sync {
    /// Runs the plan's command with `workspace` as working directory.
    ///
    /// A non-zero exit, a timeout or a resource-limit violation is a normal
    /// outcome. Only failing to start the process is an error.
    async fn run(&self, plan: &ExecutionPlan, workspace: &Path) -> Result<ExecutionOutcome>;

    /// Returns the name of this runner.
    fn name(&self) -> &str;
}
