//! Workspace materialization and release.
//!
//! This module provides the [`WorkspaceProvider`] trait for building the
//! workspace an [`ExecutionPlan`](crate::strategy::ExecutionPlan) describes and
//! the [`FsMaterializer`] implementation on the local filesystem.

mod materializer;
mod provider;
mod workspace;

pub use materializer::FsMaterializer;
pub use provider::WorkspaceProvider;
pub use workspace::{Ownership, Workspace};
