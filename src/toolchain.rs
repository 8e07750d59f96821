//! Toolchain operations and the argument vectors that invoke them.
//!
//! Every operation is a closed variant. Commands are built as argument vectors
//! for the `go` or `gofmt` binary; nothing is ever passed through a shell.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::request::OperationFlags;

/// A toolchain operation run against a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// `go build`.
    Build,
    /// `go test`.
    Test,
    /// `go run`.
    #[default]
    Run,
    /// `go mod tidy`.
    ModTidy,
    /// `go mod verify`.
    ModVerify,
    /// `gofmt`.
    Format,
    /// `go vet`.
    Vet,
}

/// How an operation treats the files of the workspace it runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPolicy {
    /// Only reads sources; build output goes to the toolchain cache.
    ReadOnly,
    /// Writes artifacts or module files next to the sources.
    WritesArtifacts,
    /// Rewrites sources in place as its documented contract.
    RewritesSource,
}

impl Operation {
    /// Returns the mutation policy for this operation.
    ///
    /// Anything that is not known to be read-only must never run directly in a
    /// caller's project, except formatting whose purpose is to rewrite it.
    pub fn mutation_policy(self) -> MutationPolicy {
        match self {
            Operation::Run | Operation::Test | Operation::Vet => MutationPolicy::ReadOnly,
            Operation::Build | Operation::ModTidy | Operation::ModVerify => {
                MutationPolicy::WritesArtifacts
            }
            Operation::Format => MutationPolicy::RewritesSource,
        }
    }

    /// Returns true if the operation needs a `go.mod` to run.
    pub fn requires_module(self) -> bool {
        !matches!(self, Operation::Format)
    }

    /// Returns true for `go test`.
    pub fn is_test(self) -> bool {
        matches!(self, Operation::Test)
    }

    /// Returns true for `go run`.
    pub fn is_run(self) -> bool {
        matches!(self, Operation::Run)
    }

    /// Returns the operation name used in logs and results.
    pub fn name(self) -> &'static str {
        match self {
            Operation::Build => "build",
            Operation::Test => "test",
            Operation::Run => "run",
            Operation::ModTidy => "mod_tidy",
            Operation::ModVerify => "mod_verify",
            Operation::Format => "format",
            Operation::Vet => "vet",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A program plus its argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainCommand {
    /// Binary to execute.
    pub program: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
}

impl ToolchainCommand {
    /// Creates a command for `program` with the given arguments.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl fmt::Display for ToolchainCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {:?}", arg)?;
        }
        Ok(())
    }
}

/// Inputs needed to build a toolchain command beyond the request flags.
#[derive(Debug, Clone)]
pub struct CommandContext<'a> {
    /// The `go` binary.
    pub go_binary: &'a str,
    /// The `gofmt` binary.
    pub gofmt_binary: &'a str,
    /// Whether the workspace is the caller's own directory.
    pub in_place: bool,
    /// Files to print formatted when formatting an ephemeral workspace.
    pub format_targets: &'a [String],
}

/// Builds the argument vector for `operation`.
pub fn build_command(
    operation: Operation,
    flags: &OperationFlags,
    ctx: &CommandContext<'_>,
) -> ToolchainCommand {
    let mut args: Vec<String> = Vec::new();

    match operation {
        Operation::Build => {
            args.push("build".to_string());
            push_tags(&mut args, flags);
            if flags.verbose {
                args.push("-v".to_string());
            }
            match &flags.output_path {
                Some(output) => {
                    args.push("-o".to_string());
                    args.push(output.clone());
                    args.push(".".to_string());
                }
                None => args.push("./...".to_string()),
            }
        }
        Operation::Test => {
            args.push("test".to_string());
            push_tags(&mut args, flags);
            if flags.verbose {
                args.push("-v".to_string());
            }
            if flags.coverage {
                args.push("-cover".to_string());
            }
            if let Some(pattern) = &flags.test_pattern {
                args.push("-run".to_string());
                args.push(pattern.clone());
            }
            if !flags.vet {
                args.push("-vet=off".to_string());
            }
            args.push("./...".to_string());
        }
        Operation::Run => {
            args.push("run".to_string());
            push_tags(&mut args, flags);
            args.push(".".to_string());
            args.extend(flags.run_args.iter().cloned());
        }
        Operation::ModTidy => {
            args.extend(["mod".to_string(), "tidy".to_string()]);
            if flags.verbose {
                args.push("-v".to_string());
            }
        }
        Operation::ModVerify => {
            args.extend(["mod".to_string(), "verify".to_string()]);
        }
        Operation::Vet => {
            args.push("vet".to_string());
            push_tags(&mut args, flags);
            args.push("./...".to_string());
        }
        Operation::Format => {
            // In place: rewrite and list changed files. Ephemeral: print the
            // formatted sources, since the workspace does not outlive the call.
            if ctx.in_place {
                args.extend(["-l".to_string(), "-w".to_string(), ".".to_string()]);
            } else {
                args.extend(ctx.format_targets.iter().cloned());
            }
            return ToolchainCommand::new(ctx.gofmt_binary, args);
        }
    }

    ToolchainCommand::new(ctx.go_binary, args)
}

fn push_tags(args: &mut Vec<String>, flags: &OperationFlags) {
    let tags: Vec<&str> = flags
        .build_tags
        .iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .collect();

    if !tags.is_empty() {
        args.push("-tags".to_string());
        args.push(tags.join(","));
    }
}
