/// Workspace Manager - per-job staging area on the host
///
/// Every sandbox invocation gets a fresh directory named after its job id
/// under a shared root. The directory holds the submitted source and the
/// input file and is bind-mounted read-only into the container.
///
/// **Cleanup contract:**
/// Release removes every root entry whose name starts with the job id. It
/// runs from `Drop`, so it happens on success, error, panic and when the
/// owning future is cancelled by a timeout. Removal errors are logged and
/// swallowed; they never change an execution result.
///
/// Job ids are v4 UUIDs and the directory is created non-recursively, so
/// concurrent jobs can never share a workspace.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::languages::LanguageProfile;

pub const INPUT_FILE: &str = "input.txt";

/// Root is traversable but not listable by other users.
const ROOT_MODE: u32 = 0o711;
/// The sandbox user must be able to read the staged files.
const JOB_DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create workspace root {}", root.display()))?;
        fs::set_permissions(&root, fs::Permissions::from_mode(ROOT_MODE))
            .with_context(|| format!("Failed to restrict workspace root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the job directory and write the source and input files into it.
    ///
    /// The returned guard is live before any file is written, so a failed
    /// write still cleans up after itself.
    pub async fn acquire(
        &self,
        job_id: Uuid,
        profile: &LanguageProfile,
        code: &str,
        input: &str,
    ) -> Result<Workspace> {
        let dir = self.root.join(job_id.to_string());

        fs::DirBuilder::new()
            .mode(JOB_DIR_MODE)
            .create(&dir)
            .with_context(|| format!("Failed to create workspace {}", dir.display()))?;

        let workspace = Workspace {
            job_id,
            root: self.root.clone(),
            dir,
            source_file: profile.source_file(),
        };

        write_file(&workspace.source_path(), code).await?;
        write_file(&workspace.input_path(), input).await?;

        debug!(job_id = %job_id, dir = %workspace.dir.display(), "Workspace acquired");
        Ok(workspace)
    }
}

async fn write_file(path: &Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tokio::fs::set_permissions(path, fs::Permissions::from_mode(FILE_MODE))
        .await
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(())
}

/// Remove everything under `root` belonging to `job_id`. Never fails.
fn release_prefixed(root: &Path, job_id: &Uuid) {
    let prefix = job_id.to_string();

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Failed to scan workspace root during cleanup");
            return;
        }
    };

    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }

        let path = entry.path();
        let removed = match entry.file_type() {
            Ok(t) if t.is_dir() => fs::remove_dir_all(&path),
            _ => fs::remove_file(&path),
        };

        if let Err(e) = removed {
            warn!(job_id = %job_id, path = %path.display(), error = %e, "Failed to remove workspace entry");
        }
    }
}

/// Scoped handle to one job's staging directory.
#[derive(Debug)]
pub struct Workspace {
    job_id: Uuid,
    root: PathBuf,
    dir: PathBuf,
    source_file: String,
}

impl Workspace {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn source_path(&self) -> PathBuf {
        self.dir.join(&self.source_file)
    }

    pub fn input_path(&self) -> PathBuf {
        self.dir.join(INPUT_FILE)
    }

    /// Bind specification mounting this workspace read-only at `target`.
    pub fn read_only_bind(&self, target: &str) -> String {
        format!("{}:{}:ro", self.dir.display(), target)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        release_prefixed(&self.root, &self.job_id);
        debug!(job_id = %self.job_id, "Workspace released");
    }
}
