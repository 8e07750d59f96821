//! go-sandbox - sandboxed execution of Go toolchain operations
//!
//! This library runs `go` and `gofmt` against code snippets, existing projects,
//! or copies of existing projects with snippets overlaid, inside isolated
//! workspaces with hard time, CPU, memory and output ceilings.

pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod limiter;
pub mod normalize;
pub mod request;
pub mod runner;
pub mod sandbox;
pub mod strategy;
pub mod toolchain;

pub use config::{ResourceLimits, SandboxConfig, Validate, ValidationResult};
pub use engine::ExecutionEngine;
pub use error::{Error, Result};
pub use lifecycle::{Lifecycle, Phase};
pub use limiter::{ExecutionLimiter, ExecutionSlot};
pub use normalize::{normalize, ExecutionResult, FailureKind};
pub use request::{ExecutionRequest, OperationFlags};
pub use runner::{EnforcedLimits, ExecutionOutcome, ProcessRunner, SandboxEnv, ToolchainRunner};
pub use sandbox::{FsMaterializer, Ownership, Workspace, WorkspaceProvider};
pub use strategy::{resolve, ExecutionPlan, Materialization, Strategy, WorkspaceOrigin};
pub use toolchain::{MutationPolicy, Operation, ToolchainCommand};
