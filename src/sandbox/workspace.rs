//! Workspaces and their guaranteed release.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::strategy::WorkspaceOrigin;

/// Who is responsible for a workspace root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The caller's own directory. Never removed.
    CallerOwned,
    /// Created for one execution. Removed when released.
    SystemOwned,
}

/// A materialized workspace.
///
/// A system-owned workspace is registered for removal from the moment its
/// root is created: [`Workspace::cleanup`] removes it, and dropping a
/// workspace that was never cleaned up removes it as well.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    ownership: Ownership,
    retain: bool,
    released: bool,
}

impl Workspace {
    /// Wraps the caller's directory. Cleanup never touches it.
    pub fn caller_owned(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ownership: Ownership::CallerOwned,
            retain: false,
            released: false,
        }
    }

    /// Registers a freshly created root for removal.
    pub(crate) fn system_owned(root: PathBuf, retain: bool) -> Self {
        Self {
            root,
            ownership: Ownership::SystemOwned,
            retain,
            released: false,
        }
    }

    /// Returns the workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the ownership of this workspace.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Returns where the workspace came from.
    pub fn origin(&self) -> WorkspaceOrigin {
        match self.ownership {
            Ownership::CallerOwned => WorkspaceOrigin::Existing,
            Ownership::SystemOwned => WorkspaceOrigin::Ephemeral,
        }
    }

    /// Returns the root if it is a system-owned workspace kept for inspection.
    pub fn retained_path(&self) -> Option<&Path> {
        (self.ownership == Ownership::SystemOwned && self.retain).then_some(self.root.as_path())
    }

    /// Returns true once the workspace has been released.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Releases the workspace.
    ///
    /// Removes a system-owned root unless retention was requested. Caller-owned
    /// roots are left alone. Calling this more than once is a no-op.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        match self.ownership {
            Ownership::CallerOwned => {}
            Ownership::SystemOwned if self.retain => {
                tracing::info!(root = ?self.root, "retaining workspace for inspection");
            }
            Ownership::SystemOwned => self.remove_root()?,
        }

        self.released = true;
        Ok(())
    }

    /// Removes a system-owned root regardless of retention.
    ///
    /// Used to roll back a half-built workspace.
    pub(crate) fn discard(&mut self) -> Result<()> {
        if self.released || self.ownership == Ownership::CallerOwned {
            self.released = true;
            return Ok(());
        }

        self.remove_root()?;
        self.released = true;
        Ok(())
    }

    fn remove_root(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {
                tracing::debug!(root = ?self.root, "removed workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::WorkspaceCleanup {
                path: self.root.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.cleanup() {
                tracing::error!(error = %e, root = ?self.root, "failed to clean up workspace on drop");
            }
        }
    }
}
