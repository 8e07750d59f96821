//! Workspace provider trait.

use crate::error::Result;
use crate::strategy::ExecutionPlan;

use super::workspace::Workspace;

/// Provider for materializing workspaces from execution plans.
pub trait WorkspaceProvider: Send + Sync {
    /// Builds the workspace a plan describes.
    ///
    /// On error no partially built system-owned root may be left behind.
    fn materialize(&self, plan: &ExecutionPlan) -> Result<Workspace>;
}
