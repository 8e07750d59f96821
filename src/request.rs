//! Execution requests as handed over by the protocol layer.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::toolchain::Operation;

/// File name used for overlays and snippets when the request names none.
pub const DEFAULT_TARGET_FILE: &str = "main.go";

/// Per-operation flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFlags {
    /// Build tags passed via `-tags`.
    #[serde(default)]
    pub build_tags: Vec<String>,

    /// Output path for `go build -o`, relative to the workspace.
    #[serde(default)]
    pub output_path: Option<String>,

    /// Verbose toolchain output.
    #[serde(default)]
    pub verbose: bool,

    /// Report test coverage.
    #[serde(default)]
    pub coverage: bool,

    /// Run `go vet` as part of `go test`.
    #[serde(default = "default_vet")]
    pub vet: bool,

    /// Test name pattern for `go test -run`.
    #[serde(default)]
    pub test_pattern: Option<String>,

    /// Arguments passed to the program by `go run`.
    #[serde(default)]
    pub run_args: Vec<String>,
}

fn default_vet() -> bool {
    true
}

impl Default for OperationFlags {
    fn default() -> Self {
        Self {
            build_tags: Vec::new(),
            output_path: None,
            verbose: false,
            coverage: false,
            vet: default_vet(),
            test_pattern: None,
            run_args: Vec::new(),
        }
    }
}

/// A request to run one toolchain operation against Go source material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Source code snippet, or overlay content in hybrid mode.
    #[serde(default)]
    pub code: Option<String>,

    /// Test code placed next to the target file.
    #[serde(default)]
    pub test_code: Option<String>,

    /// Existing project directory.
    #[serde(default)]
    pub project_path: Option<PathBuf>,

    /// File the code is written to, relative to the workspace root.
    #[serde(default = "default_target_file")]
    pub target_file: String,

    /// Toolchain operation to run.
    #[serde(default)]
    pub operation: Operation,

    /// Operation flags.
    #[serde(flatten)]
    pub flags: OperationFlags,

    /// Wall-clock timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Keep the ephemeral workspace on disk for inspection.
    #[serde(default)]
    pub retain_workspace: bool,
}

fn default_target_file() -> String {
    DEFAULT_TARGET_FILE.to_string()
}

impl Default for ExecutionRequest {
    fn default() -> Self {
        Self {
            code: None,
            test_code: None,
            project_path: None,
            target_file: default_target_file(),
            operation: Operation::default(),
            flags: OperationFlags::default(),
            timeout_secs: None,
            retain_workspace: false,
        }
    }
}

impl ExecutionRequest {
    /// Creates a request for a bare code snippet.
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Default::default()
        }
    }

    /// Creates a request against an existing project directory.
    pub fn project(path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Sets the operation.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    /// Sets the code snippet or overlay content.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Sets the test code.
    pub fn with_test_code(mut self, test_code: impl Into<String>) -> Self {
        self.test_code = Some(test_code.into());
        self
    }

    /// Sets the project directory.
    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    /// Sets the overlay target file.
    pub fn with_target_file(mut self, target: impl Into<String>) -> Self {
        self.target_file = target.into();
        self
    }

    /// Sets the timeout in seconds.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Sets the operation flags.
    pub fn with_flags(mut self, flags: OperationFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Keeps the ephemeral workspace after the execution.
    pub fn retained(mut self) -> Self {
        self.retain_workspace = true;
        self
    }

    /// Returns the test file paired with the target file
    /// (`main.go` becomes `main_test.go`).
    pub fn test_target_file(&self) -> String {
        let stem = self
            .target_file
            .strip_suffix(".go")
            .unwrap_or(&self.target_file);
        format!("{}_test.go", stem)
    }

    /// Checks that the project path, if any, exists and is a readable directory.
    ///
    /// This is the only I/O performed before a plan is resolved.
    pub fn check_project_path(&self) -> Result<()> {
        let Some(path) = &self.project_path else {
            return Ok(());
        };

        let metadata = std::fs::metadata(path).map_err(|e| {
            Error::InvalidRequest(format!(
                "project path '{}' is not accessible: {}",
                path.display(),
                e
            ))
        })?;

        if !metadata.is_dir() {
            return Err(Error::InvalidRequest(format!(
                "project path '{}' is not a directory",
                path.display()
            )));
        }

        std::fs::read_dir(path).map_err(|e| {
            Error::InvalidRequest(format!(
                "project path '{}' is not readable: {}",
                path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

/// Checks that `relative` names a file and stays inside whatever root it is
/// joined to.
pub(crate) fn validate_relative_path(relative: &Path) -> std::result::Result<(), String> {
    if relative.as_os_str().is_empty() {
        return Err("empty file path".to_string());
    }

    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(format!("'{}' escapes the workspace", relative.display()))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("'{}' is not a relative path", relative.display()))
            }
        }
    }

    if relative.file_name().is_none() {
        return Err(format!("'{}' does not name a file", relative.display()));
    }

    Ok(())
}
