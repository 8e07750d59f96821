//! Sandbox configuration and validation.
//!
//! The configuration is loaded by the surrounding service (usually from a TOML
//! file) and handed to each execution explicitly. Nothing here is global.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::{validate_relative_path, ExecutionRequest};
use crate::toolchain::Operation;

/// Host variables forwarded to the toolchain when present.
pub const DEFAULT_ENV_PASSTHROUGH: &[&str] = &[
    "PATH",
    "HOME",
    "GOROOT",
    "GOPATH",
    "GOCACHE",
    "GOMODCACHE",
    "XDG_CACHE_HOME",
    "TMPDIR",
];

/// Resource ceilings applied to one toolchain invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock deadline for the whole process tree.
    pub timeout: Duration,
    /// CPU seconds per process, if bounded.
    pub cpu_secs: Option<u64>,
    /// Address-space ceiling in bytes, if bounded.
    pub memory_bytes: Option<u64>,
    /// Per-stream capture limit for stdout and stderr.
    pub max_output_bytes: usize,
}

/// Configuration for the sandbox executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Path or name of the `go` binary.
    #[serde(default = "default_go_binary")]
    pub go_binary: String,

    /// Path or name of the `gofmt` binary.
    #[serde(default = "default_gofmt_binary")]
    pub gofmt_binary: String,

    /// Timeout used when a request does not name one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Upper bound for request-supplied timeouts.
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    /// CPU time ceiling per process.
    #[serde(default = "default_cpu_limit_secs")]
    pub cpu_limit_secs: Option<u64>,

    /// Address-space ceiling per process, in MiB.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: Option<u64>,

    /// Per-stream output capture limit.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Number of sandboxed subprocesses allowed to run at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,

    /// Parent directory for ephemeral workspaces. Defaults to the OS temp dir.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,

    /// Name prefix for ephemeral workspace roots.
    #[serde(default = "default_workspace_prefix")]
    pub workspace_prefix: String,

    /// Module path written into synthesized `go.mod` files.
    #[serde(default = "default_module_name")]
    pub module_name: String,

    /// `go` directive written into synthesized `go.mod` files.
    #[serde(default = "default_go_version")]
    pub go_version: String,

    /// Allow the toolchain to reach module proxies.
    #[serde(default)]
    pub allow_network: bool,

    /// Host variables forwarded to the child process.
    #[serde(default = "default_env_passthrough")]
    pub env_passthrough: Vec<String>,

    /// Fixed variables set on every child process.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,

    /// How long to keep draining pipes after the process has exited or been killed.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_go_binary() -> String {
    "go".to_string()
}

fn default_gofmt_binary() -> String {
    "gofmt".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_timeout_secs() -> u64 {
    600
}

fn default_cpu_limit_secs() -> Option<u64> {
    Some(120)
}

fn default_memory_limit_mb() -> Option<u64> {
    Some(2048)
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_max_concurrent() -> usize {
    4
}

fn default_workspace_prefix() -> String {
    "go-sandbox-".to_string()
}

fn default_module_name() -> String {
    "sandbox".to_string()
}

fn default_go_version() -> String {
    "1.21".to_string()
}

fn default_env_passthrough() -> Vec<String> {
    DEFAULT_ENV_PASSTHROUGH
        .iter()
        .map(|name| name.to_string())
        .collect()
}

fn default_kill_grace_ms() -> u64 {
    2000
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            go_binary: default_go_binary(),
            gofmt_binary: default_gofmt_binary(),
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            cpu_limit_secs: default_cpu_limit_secs(),
            memory_limit_mb: default_memory_limit_mb(),
            max_output_bytes: default_max_output_bytes(),
            max_concurrent_executions: default_max_concurrent(),
            workspace_dir: None,
            workspace_prefix: default_workspace_prefix(),
            module_name: default_module_name(),
            go_version: default_go_version(),
            allow_network: false,
            env_passthrough: default_env_passthrough(),
            extra_env: BTreeMap::new(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

impl SandboxConfig {
    /// Parses a configuration from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)?;

        for warning in config.validate().into_result()? {
            tracing::warn!(path = ?path, warning = %warning, "sandbox config warning");
        }

        Ok(config)
    }

    /// Sets the parent directory for ephemeral workspaces.
    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = Some(dir.into());
        self
    }

    /// Sets the default timeout.
    pub fn with_default_timeout(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    /// Sets the per-stream output capture limit.
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Sets the number of concurrent sandboxed subprocesses.
    pub fn with_max_concurrent(mut self, slots: usize) -> Self {
        self.max_concurrent_executions = slots;
        self
    }

    /// Returns the directory ephemeral workspaces are created in.
    pub fn workspace_base(&self) -> PathBuf {
        self.workspace_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Resolves the limits for one execution, honoring a request timeout
    /// clamped to the configured maximum.
    pub fn limits_for(&self, requested_timeout_secs: Option<u64>) -> ResourceLimits {
        let timeout_secs = requested_timeout_secs
            .unwrap_or(self.default_timeout_secs)
            .min(self.max_timeout_secs);

        ResourceLimits {
            timeout: Duration::from_secs(timeout_secs),
            cpu_secs: self.cpu_limit_secs,
            memory_bytes: self.memory_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
            max_output_bytes: self.max_output_bytes,
        }
    }

    /// Returns the kill grace period.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Converts to a Result, failing with a configuration error if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }

    /// Converts to a Result, failing with an invalid-request error if there are errors.
    pub fn into_request_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::InvalidRequest(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.go_binary.trim().is_empty() {
            result.add_error("go_binary cannot be empty");
        }

        if self.gofmt_binary.trim().is_empty() {
            result.add_error("gofmt_binary cannot be empty");
        }

        if self.default_timeout_secs == 0 {
            result.add_error("default_timeout_secs must be at least 1");
        }

        if self.default_timeout_secs > self.max_timeout_secs {
            result.add_error("default_timeout_secs must not exceed max_timeout_secs");
        }

        if self.max_concurrent_executions == 0 {
            result.add_error("max_concurrent_executions must be at least 1");
        }

        if self.max_output_bytes == 0 {
            result.add_error("max_output_bytes must be at least 1");
        }

        if self.workspace_prefix.contains('/') || self.workspace_prefix.contains('\\') {
            result.add_error("workspace_prefix must not contain path separators");
        }

        if self.module_name.trim().is_empty() {
            result.add_error("module_name cannot be empty");
        }

        if self.memory_limit_mb.is_some_and(|mb| mb < 256) {
            result.add_warning("memory_limit_mb below 256 will likely starve the Go compiler");
        }

        if self.cpu_limit_secs == Some(0) {
            result.add_error("cpu_limit_secs must be at least 1 when set");
        }

        if self.allow_network {
            result.add_warning("allow_network lets the toolchain contact module proxies");
        }

        if !self.env_passthrough.iter().any(|name| name == "PATH") {
            result.add_warning("PATH is not forwarded; go_binary must be an absolute path");
        }

        result
    }
}

impl Validate for ExecutionRequest {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        let has_code = self.code.is_some();
        let has_project = self.project_path.is_some();

        if !has_code && !has_project {
            if self.test_code.is_some() {
                result.add_error("test_code requires code or project_path");
            } else {
                result.add_error("either code or project_path must be provided");
            }
        }

        if self.code.as_deref().is_some_and(|code| code.trim().is_empty()) {
            result.add_error("code cannot be empty");
        }

        if !self.target_file.ends_with(".go") {
            result.add_error(format!(
                "target_file '{}' must name a .go file",
                self.target_file
            ));
        }

        if self.target_file.ends_with("_test.go") {
            result.add_warning("target_file is a test file; pass test code via test_code");
        }

        if self.timeout_secs == Some(0) {
            result.add_error("timeout_secs must be at least 1");
        }

        if let Some(output) = &self.flags.output_path {
            if let Err(reason) = validate_relative_path(Path::new(output)) {
                result.add_error(format!("output_path: {}", reason));
            }
            if self.operation != Operation::Build {
                result.add_warning("output_path is ignored for non-build operations");
            }
        }

        if self.flags.test_pattern.is_some() && !self.operation.is_test() {
            result.add_warning("test_pattern is ignored for non-test operations");
        }

        if !self.flags.run_args.is_empty() && !self.operation.is_run() {
            result.add_warning("run_args are ignored for non-run operations");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OperationFlags;

    #[test]
    fn default_config_is_valid() {
        let config = SandboxConfig::default();
        let result = config.validate();

        assert!(result.is_valid(), "errors: {:?}", result.errors);
        assert_eq!(config.go_binary, "go");
        assert_eq!(config.default_timeout_secs, 60);
        assert_eq!(config.max_concurrent_executions, 4);
        assert!(!config.allow_network);
    }

    #[test]
    fn config_parses_partial_toml() {
        let toml = r#"
            default_timeout_secs = 15
            memory_limit_mb = 512
            workspace_prefix = "gs-"

            [extra_env]
            GODEBUG = "madvdontneed=1"
        "#;

        let config = SandboxConfig::from_toml_str(toml).unwrap();

        assert_eq!(config.default_timeout_secs, 15);
        assert_eq!(config.memory_limit_mb, Some(512));
        assert_eq!(config.workspace_prefix, "gs-");
        assert_eq!(config.go_binary, "go");
        assert_eq!(
            config.extra_env.get("GODEBUG").map(String::as_str),
            Some("madvdontneed=1")
        );
    }

    #[test]
    fn config_rejects_unparseable_toml() {
        let err = SandboxConfig::from_toml_str("default_timeout_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn config_load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sandbox.toml");
        std::fs::write(&path, "max_concurrent_executions = 2\n").unwrap();

        let config = SandboxConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrent_executions, 2);
    }

    #[test]
    fn config_load_rejects_invalid_values() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sandbox.toml");
        std::fs::write(&path, "max_concurrent_executions = 0\n").unwrap();

        let err = SandboxConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("max_concurrent_executions"));
    }

    #[test]
    fn limits_clamp_request_timeout() {
        let config = SandboxConfig {
            max_timeout_secs: 30,
            ..Default::default()
        };

        assert_eq!(config.limits_for(Some(5)).timeout, Duration::from_secs(5));
        assert_eq!(config.limits_for(Some(500)).timeout, Duration::from_secs(30));
        assert_eq!(config.limits_for(None).timeout, Duration::from_secs(30));
    }

    #[test]
    fn limits_convert_memory_to_bytes() {
        let config = SandboxConfig::default();
        let limits = config.limits_for(None);

        assert_eq!(limits.memory_bytes, Some(2048 * 1024 * 1024));
        assert_eq!(limits.cpu_secs, Some(120));
    }

    #[test]
    fn validation_flags_bad_prefix_and_zero_slots() {
        let config = SandboxConfig {
            workspace_prefix: "a/b".to_string(),
            max_concurrent_executions: 0,
            ..Default::default()
        };

        let result = config.validate();
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn request_without_code_or_project_is_invalid() {
        let request = ExecutionRequest::default();
        let result = request.validate();

        assert!(!result.is_valid());
        assert!(result.errors[0].contains("either code or project_path"));
    }

    #[test]
    fn request_with_only_test_code_is_invalid() {
        let request = ExecutionRequest {
            test_code: Some("package main".to_string()),
            ..Default::default()
        };

        let err = request.validate().into_request_result().unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(msg) if msg.contains("test_code")));
    }

    #[test]
    fn request_warns_about_ignored_flags() {
        let mut request = ExecutionRequest::code("package main\n\nfunc main() {}\n")
            .with_operation(Operation::Build);
        request.flags.test_pattern = Some("TestX".to_string());
        request.flags.run_args = vec!["--flag".to_string()];

        let result = request.validate();
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn request_target_must_be_go_file() {
        let request =
            ExecutionRequest::code("package main").with_target_file("README.md");

        assert!(!request.validate().is_valid());
    }

    #[test]
    fn request_output_path_must_stay_in_workspace() {
        for output in ["/tmp/pwned", "../../outside", "bin/../../up", ""] {
            let request = ExecutionRequest::code("package main")
                .with_operation(Operation::Build)
                .with_flags(OperationFlags {
                    output_path: Some(output.to_string()),
                    ..Default::default()
                });

            let err = request.validate().into_request_result().unwrap_err();
            assert!(matches!(err, Error::InvalidRequest(_)), "{}", output);
            assert!(err.to_string().contains("output_path"));
        }

        let request = ExecutionRequest::code("package main")
            .with_operation(Operation::Build)
            .with_flags(OperationFlags {
                output_path: Some("bin/app".to_string()),
                ..Default::default()
            });
        assert!(request.validate().is_valid());
    }
}
