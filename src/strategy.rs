//! Strategy resolution: classify a request and plan its workspace.
//!
//! [`resolve`] performs no I/O. It only decides which of the three strategies
//! applies and what the materializer and executor will have to do.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{ResourceLimits, SandboxConfig};
use crate::error::{Error, Result};
use crate::request::ExecutionRequest;
use crate::toolchain::{build_command, CommandContext, MutationPolicy, Operation, ToolchainCommand};

/// File name of the Go module descriptor.
pub const MODULE_FILE: &str = "go.mod";

/// How the workspace for a request is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// A snippet in a fresh synthesized workspace.
    CodeOnly,
    /// An existing project on its own.
    ProjectPathOnly,
    /// A copy of an existing project with the snippet overlaid.
    Hybrid,
}

/// Where the workspace comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceOrigin {
    /// A system-owned root created for this execution.
    Ephemeral,
    /// The caller's own directory.
    Existing,
}

/// A file to write into a workspace, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    /// Path relative to the workspace root.
    pub path: PathBuf,
    /// Full file content.
    pub contents: String,
}

impl PlannedFile {
    /// Creates a planned file.
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// A `go.mod` to write when the workspace has none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Module path.
    pub module: String,
    /// `go` directive version.
    pub go_version: String,
}

impl ModuleDescriptor {
    /// Renders the descriptor as `go.mod` content.
    pub fn render(&self) -> String {
        format!("module {}\n\ngo {}\n", self.module, self.go_version)
    }
}

/// What the materializer has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialization {
    /// Write the files into a fresh ephemeral root.
    Synthesize { files: Vec<PlannedFile> },
    /// Use the caller's directory as is.
    InPlace { root: PathBuf },
    /// Copy the project into a fresh root, then overlay the files.
    CopyThenOverlay {
        source: PathBuf,
        files: Vec<PlannedFile>,
    },
}

/// A resolved, immutable execution plan.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    strategy: Strategy,
    operation: Operation,
    materialization: Materialization,
    module: Option<ModuleDescriptor>,
    limits: ResourceLimits,
    command: ToolchainCommand,
    retain_workspace: bool,
}

impl ExecutionPlan {
    /// Returns the resolved strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Returns the operation to run.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Returns the workspace origin implied by the materialization.
    ///
    /// The materialized [`Workspace`](crate::sandbox::Workspace) has the final
    /// say: an in-place plan may still end up on a copy.
    pub fn origin(&self) -> WorkspaceOrigin {
        match self.materialization {
            Materialization::InPlace { .. } => WorkspaceOrigin::Existing,
            _ => WorkspaceOrigin::Ephemeral,
        }
    }

    /// Returns the materialization steps.
    pub fn materialization(&self) -> &Materialization {
        &self.materialization
    }

    /// Returns the files written or overlaid, in order.
    pub fn files(&self) -> &[PlannedFile] {
        match &self.materialization {
            Materialization::Synthesize { files }
            | Materialization::CopyThenOverlay { files, .. } => files.as_slice(),
            Materialization::InPlace { .. } => &[],
        }
    }

    /// Returns the project copied or used in place, if any.
    pub fn source_project(&self) -> Option<&Path> {
        match &self.materialization {
            Materialization::InPlace { root } => Some(root.as_path()),
            Materialization::CopyThenOverlay { source, .. } => Some(source.as_path()),
            Materialization::Synthesize { .. } => None,
        }
    }

    /// Returns the module descriptor to ensure after copying, if any.
    ///
    /// On an in-place plan a descriptor means the operation needs a module:
    /// a project without `go.mod` is then copied rather than written to.
    pub fn module(&self) -> Option<&ModuleDescriptor> {
        self.module.as_ref()
    }

    /// Returns the resource limits.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Returns the toolchain command.
    pub fn command(&self) -> &ToolchainCommand {
        &self.command
    }

    /// Returns true if an ephemeral workspace should be kept afterwards.
    pub fn retain_workspace(&self) -> bool {
        self.retain_workspace
    }
}

/// Resolves a request into an execution plan.
pub fn resolve(request: &ExecutionRequest, config: &SandboxConfig) -> Result<ExecutionPlan> {
    let has_overlay = request.code.is_some() || request.test_code.is_some();

    let strategy = match (&request.project_path, &request.code, has_overlay) {
        (None, Some(_), _) => Strategy::CodeOnly,
        (Some(_), _, false) => Strategy::ProjectPathOnly,
        (Some(_), _, true) => Strategy::Hybrid,
        (None, None, _) => {
            return Err(Error::InvalidRequest(
                "either code or project_path must be provided".to_string(),
            ))
        }
    };

    let operation = request.operation;
    let module = operation.requires_module().then(|| ModuleDescriptor {
        module: config.module_name.clone(),
        go_version: config.go_version.clone(),
    });

    let overlay_files = overlay_files(request);

    let (materialization, module) = match strategy {
        Strategy::CodeOnly => {
            let mut files = overlay_files;
            if let Some(module) = &module {
                files.push(PlannedFile::new(MODULE_FILE, module.render()));
            }
            (Materialization::Synthesize { files }, None)
        }
        Strategy::ProjectPathOnly => {
            let root = project_root(request)?;
            match operation.mutation_policy() {
                MutationPolicy::ReadOnly | MutationPolicy::RewritesSource => {
                    (Materialization::InPlace { root }, module)
                }
                MutationPolicy::WritesArtifacts => (
                    Materialization::CopyThenOverlay {
                        source: root,
                        files: Vec::new(),
                    },
                    module,
                ),
            }
        }
        Strategy::Hybrid => (
            Materialization::CopyThenOverlay {
                source: project_root(request)?,
                files: overlay_files,
            },
            module,
        ),
    };

    let in_place = matches!(materialization, Materialization::InPlace { .. });
    let format_targets = format_targets(request);
    let command = build_command(
        operation,
        &request.flags,
        &CommandContext {
            go_binary: &config.go_binary,
            gofmt_binary: &config.gofmt_binary,
            in_place,
            format_targets: &format_targets,
        },
    );

    Ok(ExecutionPlan {
        strategy,
        operation,
        materialization,
        module,
        limits: config.limits_for(request.timeout_secs),
        command,
        retain_workspace: request.retain_workspace && !in_place,
    })
}

fn project_root(request: &ExecutionRequest) -> Result<PathBuf> {
    request
        .project_path
        .clone()
        .ok_or_else(|| Error::InvalidRequest("project_path is required".to_string()))
}

fn overlay_files(request: &ExecutionRequest) -> Vec<PlannedFile> {
    let mut files = Vec::new();
    if let Some(code) = &request.code {
        files.push(PlannedFile::new(&request.target_file, code.as_str()));
    }
    if let Some(test_code) = &request.test_code {
        files.push(PlannedFile::new(request.test_target_file(), test_code.as_str()));
    }
    files
}

fn format_targets(request: &ExecutionRequest) -> Vec<String> {
    let mut targets = Vec::new();
    if request.code.is_some() {
        targets.push(request.target_file.clone());
    }
    if request.test_code.is_some() {
        targets.push(request.test_target_file());
    }
    targets
}
