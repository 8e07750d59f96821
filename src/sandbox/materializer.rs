//! Filesystem workspace materializer.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::request::validate_relative_path;
use crate::strategy::{ExecutionPlan, Materialization, ModuleDescriptor, PlannedFile, MODULE_FILE};

use super::provider::WorkspaceProvider;
use super::workspace::Workspace;

/// Version-control metadata directories never copied into a workspace.
const SKIPPED_DIRS: &[&str] = &[".git", ".hg", ".svn", ".bzr"];

/// Maximum attempts at allocating a fresh root name.
const MAX_ALLOCATION_ATTEMPTS: u32 = 4;

/// Materializes workspaces on the local filesystem.
///
/// Every ephemeral root is `<base_dir>/<prefix><uuid>`, created with a
/// non-recursive `create_dir` so two executions can never share one.
#[derive(Debug, Clone)]
pub struct FsMaterializer {
    base_dir: PathBuf,
    prefix: String,
}

impl FsMaterializer {
    /// Creates a materializer allocating roots in `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Creates a materializer from the sandbox configuration.
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.workspace_base(), config.workspace_prefix.clone())
    }

    /// Returns the directory roots are allocated in.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Allocates a fresh root and writes `files` into it.
    pub fn create_ephemeral(&self, files: &[PlannedFile], retain: bool) -> Result<Workspace> {
        let mut workspace = self.allocate(retain)?;

        if let Err(e) = write_files(workspace.root(), files) {
            rollback(&mut workspace);
            return Err(e);
        }

        tracing::info!(
            root = ?workspace.root(),
            files = files.len(),
            "created ephemeral workspace"
        );
        Ok(workspace)
    }

    /// Copies every regular file of `source` into a fresh root.
    ///
    /// Symbolic links are never followed out of `source`: links to files inside
    /// the project are copied as regular files, links to directories and links
    /// escaping the project are skipped. When the workspace base lies inside
    /// `source`, the base and every root allocated in it are left out.
    pub fn copy_project(&self, source: &Path, retain: bool) -> Result<Workspace> {
        let source_root = std::fs::canonicalize(source)
            .map_err(|e| Error::materialization(source, e))?;

        let mut workspace = self.allocate(retain)?;

        let copied = std::fs::canonicalize(&self.base_dir)
            .map_err(|e| Error::materialization(&self.base_dir, e))
            .and_then(|base| {
                let excluded = Excluded {
                    base: &base,
                    prefix: &self.prefix,
                };
                copy_tree(&source_root, workspace.root(), &excluded)
            });

        if let Err(e) = copied {
            rollback(&mut workspace);
            return Err(e);
        }

        tracing::info!(
            source = ?source_root,
            root = ?workspace.root(),
            "copied project into workspace"
        );
        Ok(workspace)
    }

    /// Overwrites `files` in an already materialized workspace.
    pub fn overlay(&self, workspace: &Workspace, files: &[PlannedFile]) -> Result<()> {
        write_files(workspace.root(), files)?;

        for file in files {
            tracing::debug!(root = ?workspace.root(), path = ?file.path, "overlaid file");
        }
        Ok(())
    }

    /// Writes a `go.mod` if the workspace has none.
    pub fn ensure_module(&self, workspace: &Workspace, module: &ModuleDescriptor) -> Result<()> {
        let path = workspace.root().join(MODULE_FILE);
        if path.exists() {
            return Ok(());
        }

        std::fs::write(&path, module.render()).map_err(|e| Error::materialization(&path, e))?;
        tracing::debug!(root = ?workspace.root(), "synthesized module descriptor");
        Ok(())
    }

    fn allocate(&self, retain: bool) -> Result<Workspace> {
        std::fs::create_dir_all(&self.base_dir)
            .map_err(|e| Error::materialization(&self.base_dir, e))?;

        let mut last_error = None;
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let root = self
                .base_dir
                .join(format!("{}{}", self.prefix, uuid::Uuid::new_v4().simple()));

            match create_private_dir(&root) {
                Ok(()) => return Ok(Workspace::system_owned(root, retain)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => last_error = Some(e),
                Err(e) => return Err(Error::materialization(&root, e)),
            }
        }

        Err(Error::materialization(
            &self.base_dir,
            last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string()),
        ))
    }
}

impl WorkspaceProvider for FsMaterializer {
    fn materialize(&self, plan: &ExecutionPlan) -> Result<Workspace> {
        let retain = plan.retain_workspace();

        match plan.materialization() {
            Materialization::Synthesize { files } => self.create_ephemeral(files, retain),
            Materialization::InPlace { root } => match plan.module() {
                // Synthesizing go.mod would write into the caller's tree.
                Some(module) if !root.join(MODULE_FILE).exists() => {
                    tracing::info!(
                        root = ?root,
                        operation = %plan.operation(),
                        "project has no module descriptor, running on a copy"
                    );
                    self.copy_with_overlay(root, &[], Some(module), retain)
                }
                _ => Ok(Workspace::caller_owned(root.clone())),
            },
            Materialization::CopyThenOverlay { source, files } => {
                self.copy_with_overlay(source, files, plan.module(), retain)
            }
        }
    }
}

impl FsMaterializer {
    fn copy_with_overlay(
        &self,
        source: &Path,
        files: &[PlannedFile],
        module: Option<&ModuleDescriptor>,
        retain: bool,
    ) -> Result<Workspace> {
        let mut workspace = self.copy_project(source, retain)?;

        // Overlays only start once the whole copy has succeeded.
        let finished = self.overlay(&workspace, files).and_then(|()| match module {
            Some(module) => self.ensure_module(&workspace, module),
            None => Ok(()),
        });

        if let Err(e) = finished {
            rollback(&mut workspace);
            return Err(e);
        }
        Ok(workspace)
    }
}

fn rollback(workspace: &mut Workspace) {
    if let Err(e) = workspace.discard() {
        tracing::error!(error = %e, root = ?workspace.root(), "failed to roll back workspace");
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir(path)
}

fn write_files(root: &Path, files: &[PlannedFile]) -> Result<()> {
    for file in files {
        let target = root.join(&file.path);

        validate_relative_path(&file.path).map_err(|reason| Error::materialization(&target, reason))?;

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::materialization(parent, e))?;
        }

        std::fs::write(&target, &file.contents).map_err(|e| Error::materialization(&target, e))?;
    }
    Ok(())
}

fn is_skipped_dir(name: &OsStr) -> bool {
    SKIPPED_DIRS.iter().any(|skipped| name == OsStr::new(skipped))
}

/// Workspace locations a project copy must never descend into.
struct Excluded<'a> {
    base: &'a Path,
    prefix: &'a str,
}

impl Excluded<'_> {
    fn contains(&self, path: &Path) -> bool {
        if path == self.base {
            return true;
        }
        path.parent() == Some(self.base)
            && path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with(self.prefix))
    }
}

fn copy_tree(source_root: &Path, dest: &Path, excluded: &Excluded<'_>) -> Result<()> {
    let keep = |entry: &DirEntry| {
        !(entry.file_type().is_dir()
            && (is_skipped_dir(entry.file_name()) || excluded.contains(entry.path())))
    };

    let walker = WalkDir::new(source_root)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(keep);

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source_root).to_path_buf();
            Error::materialization(&path, e)
        })?;
        let path = entry.path();
        let relative = path
            .strip_prefix(source_root)
            .map_err(|e| Error::materialization(path, e))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir(&target).map_err(|e| Error::materialization(&target, e))?;
        } else if file_type.is_file() {
            std::fs::copy(path, &target).map_err(|e| Error::materialization(path, e))?;
        } else if file_type.is_symlink() {
            copy_symlink_target(source_root, path, &target)?;
        } else {
            tracing::debug!(path = ?path, "skipping special file");
        }
    }

    Ok(())
}

fn copy_symlink_target(source_root: &Path, link: &Path, target: &Path) -> Result<()> {
    let resolved = match std::fs::canonicalize(link) {
        Ok(resolved) => resolved,
        Err(_) => {
            tracing::debug!(path = ?link, "skipping dangling symlink");
            return Ok(());
        }
    };

    if !resolved.starts_with(source_root) {
        tracing::warn!(path = ?link, resolved = ?resolved, "skipping symlink escaping the project");
        return Ok(());
    }

    let metadata = std::fs::metadata(&resolved).map_err(|e| Error::materialization(link, e))?;
    if metadata.is_file() {
        std::fs::copy(&resolved, target).map_err(|e| Error::materialization(link, e))?;
    } else {
        tracing::debug!(path = ?link, "not following directory symlink");
    }

    Ok(())
}
