//! Execution engine wiring the sandbox pipeline together.

use std::path::Path;
use std::sync::Arc;

use crate::config::{SandboxConfig, Validate};
use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, Phase};
use crate::limiter::ExecutionLimiter;
use crate::normalize::{normalize, ExecutionResult};
use crate::request::ExecutionRequest;
use crate::runner::{ExecutionOutcome, ProcessRunner, ToolchainRunner};
use crate::sandbox::{FsMaterializer, Workspace, WorkspaceProvider};
use crate::strategy::{resolve, ExecutionPlan};

/// Runs execution requests end to end.
///
/// Each call to [`ExecutionEngine::execute`] resolves a plan, materializes its
/// workspace, runs the toolchain inside one limiter slot, normalizes the
/// outcome and releases the workspace on every path.
pub struct ExecutionEngine<P: WorkspaceProvider, R: ToolchainRunner> {
    config: Arc<SandboxConfig>,
    provider: Arc<P>,
    runner: R,
    limiter: ExecutionLimiter,
}

impl ExecutionEngine<FsMaterializer, ProcessRunner> {
    /// Creates an engine using the filesystem materializer and process runner.
    pub fn from_config(config: SandboxConfig) -> Self {
        let provider = FsMaterializer::from_config(&config);
        let runner = ProcessRunner::from_config(&config);
        Self::new(Arc::new(config), provider, runner)
    }
}

impl<P: WorkspaceProvider + 'static, R: ToolchainRunner> ExecutionEngine<P, R> {
    /// Creates an engine from its parts.
    pub fn new(config: Arc<SandboxConfig>, provider: P, runner: R) -> Self {
        let limiter = ExecutionLimiter::new(config.max_concurrent_executions);
        Self {
            config,
            provider: Arc::new(provider),
            runner,
            limiter,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Returns the concurrency limiter.
    pub fn limiter(&self) -> &ExecutionLimiter {
        &self.limiter
    }

    /// Executes one request.
    ///
    /// Toolchain failures, timeouts and resource-limit violations come back as
    /// unsuccessful results. Errors are reserved for requests that could not be
    /// run at all.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let mut lifecycle = Lifecycle::new();

        lifecycle.advance(Phase::Resolving)?;
        let plan = match self.plan(request, &execution_id) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "rejected request");
                lifecycle.finish()?;
                return Err(e);
            }
        };

        tracing::info!(
            execution_id = %execution_id,
            strategy = ?plan.strategy(),
            operation = %plan.operation(),
            origin = ?plan.origin(),
            "resolved execution plan"
        );

        lifecycle.advance(Phase::Materializing)?;
        let mut workspace = match self.materialize(&plan).await {
            Ok(workspace) => workspace,
            Err(e) => {
                tracing::error!(execution_id = %execution_id, error = %e, "failed to materialize workspace");
                lifecycle.finish()?;
                return Err(e);
            }
        };

        lifecycle.advance(Phase::Executing)?;
        let result = match self.run(&plan, workspace.root(), &execution_id).await {
            Ok(outcome) => {
                lifecycle.advance(Phase::Normalizing)?;
                Ok(normalize(outcome, &plan, &workspace))
            }
            Err(e) => {
                tracing::error!(execution_id = %execution_id, error = %e, "failed to run toolchain");
                Err(e)
            }
        };

        lifecycle.begin_cleanup()?;
        if let Err(e) = workspace.cleanup() {
            tracing::error!(execution_id = %execution_id, error = %e, "workspace cleanup failed");
        }
        lifecycle.advance(Phase::Done)?;

        if let Ok(result) = &result {
            tracing::info!(
                execution_id = %execution_id,
                success = result.success,
                exit_code = ?result.exit_code,
                failure = ?result.failure,
                duration_ms = result.duration_ms,
                "execution finished"
            );
        }

        result
    }

    fn plan(&self, request: &ExecutionRequest, execution_id: &str) -> Result<ExecutionPlan> {
        for warning in request.validate().into_request_result()? {
            tracing::warn!(execution_id = %execution_id, warning = %warning, "request warning");
        }
        request.check_project_path()?;
        resolve(request, &self.config)
    }

    /// Materializes on the blocking pool; copying a project is synchronous
    /// filesystem work that must not stall the runtime's worker threads.
    ///
    /// If the execution is cancelled meanwhile, the workspace is dropped inside
    /// the blocking task and cleans itself up.
    async fn materialize(&self, plan: &ExecutionPlan) -> Result<Workspace> {
        let provider = Arc::clone(&self.provider);
        let plan = plan.clone();

        tokio::task::spawn_blocking(move || provider.materialize(&plan))
            .await
            .unwrap_or_else(|e| {
                Err(Error::Internal(format!("materialization task failed: {}", e)))
            })
    }

    async fn run(
        &self,
        plan: &ExecutionPlan,
        workspace: &Path,
        execution_id: &str,
    ) -> Result<ExecutionOutcome> {
        let _slot = self.limiter.acquire().await?;
        tracing::debug!(
            execution_id = %execution_id,
            runner = self.runner.name(),
            root = ?workspace,
            "acquired execution slot"
        );

        self.runner.run(plan, workspace).await
    }
}
