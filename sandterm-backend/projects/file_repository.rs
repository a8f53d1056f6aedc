use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::repository::ProjectRepository;
use super::{ProjectError, ProjectInfo, TreeNode, validate_id};
use crate::watcher::is_ignored;
use crate::workspace::{Workspace, WorkspaceError};

/// Projects as directories under one base directory, scaffolded by an
/// external template command.
pub struct FileProjectRepository {
    base_dir: PathBuf,
    max_projects: usize,
    template_command: String,
    tree_ignored: Vec<String>,
    /// Serialises creation so the project limit can't be raced past.
    create_lock: Mutex<()>,
}

impl FileProjectRepository {
    pub fn new(
        base_dir: impl AsRef<Path>,
        max_projects: usize,
        template_command: impl Into<String>,
        tree_ignored: Vec<String>,
    ) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            max_projects,
            template_command: template_command.into(),
            tree_ignored,
            create_lock: Mutex::new(()),
        }
    }

    fn project_dir(&self, id: &str) -> Result<PathBuf, ProjectError> {
        validate_id(id)?;
        Ok(self.base_dir.join(id))
    }

    fn existing_dir(&self, id: &str) -> Result<PathBuf, ProjectError> {
        let dir = self.project_dir(id)?;
        if !dir.is_dir() {
            return Err(ProjectError::NotFound(id.to_string()));
        }
        Ok(dir)
    }

    async fn run_template(&self, dir: &Path) -> Result<(), ProjectError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.template_command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProjectError::Template(format!("failed to spawn: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            return Err(ProjectError::Template(format!("{}: {tail}", output.status)));
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectRepository for FileProjectRepository {
    async fn create_project(&self) -> Result<String, ProjectError> {
        let _guard = self.create_lock.lock().await;

        let existing = self.list_projects().await?.len();
        if existing >= self.max_projects {
            return Err(ProjectError::LimitReached(self.max_projects));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.project_dir(&id)?;
        tokio::fs::create_dir_all(&dir).await?;

        tracing::info!(project_id = %id, command = %self.template_command, "scaffolding project");
        if let Err(e) = self.run_template(&dir).await {
            tracing::error!(project_id = %id, error = %e, "project scaffolding failed");
            if let Err(rm) = tokio::fs::remove_dir_all(&dir).await {
                tracing::warn!(project_id = %id, error = %rm, "failed to clean up project dir");
            }
            return Err(e);
        }

        Ok(id)
    }

    async fn list_projects(&self) -> Result<Vec<String>, ProjectError> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_id(&name).is_ok() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn get_project(&self, id: &str) -> Result<ProjectInfo, ProjectError> {
        let dir = self.existing_dir(id)?;
        let created_at = tokio::fs::metadata(&dir)
            .await?
            .created()
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(ProjectInfo {
            id: id.to_string(),
            path: dir.display().to_string(),
            created_at,
        })
    }

    async fn delete_project(&self, id: &str) -> Result<(), ProjectError> {
        let dir = self.existing_dir(id)?;
        tokio::fs::remove_dir_all(&dir).await?;
        tracing::info!(project_id = %id, "project deleted");
        Ok(())
    }

    async fn project_tree(&self, id: &str) -> Result<TreeNode, ProjectError> {
        let dir = self.existing_dir(id)?;
        let name = id.to_string();
        let ignored = self.tree_ignored.clone();
        tokio::task::spawn_blocking(move || build_tree(&dir, name, String::new(), &ignored))
            .await
            .map_err(io::Error::other)?
            .map_err(ProjectError::from)
    }

    fn workspace(&self, id: &str) -> Result<Workspace, ProjectError> {
        let dir = self.project_dir(id)?;
        Workspace::attach(dir).map_err(|e| match e {
            WorkspaceError::NotFound(_) => ProjectError::NotFound(id.to_string()),
            WorkspaceError::Io(e) => ProjectError::Io(e),
            other => ProjectError::Io(io::Error::other(other.to_string())),
        })
    }
}

fn build_tree(dir: &Path, name: String, rel: String, ignored: &[String]) -> io::Result<TreeNode> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let child_name = entry.file_name().to_string_lossy().into_owned();
        if is_ignored(&child_name, ignored) {
            continue;
        }
        let child_rel = if rel.is_empty() {
            child_name.clone()
        } else {
            format!("{rel}/{child_name}")
        };
        // Symlinks are listed but not followed.
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            children.push(build_tree(&entry.path(), child_name, child_rel, ignored)?);
        } else {
            children.push(TreeNode {
                name: child_name,
                path: child_rel,
                children: None,
            });
        }
    }
    children.sort_by(|a, b| {
        b.children
            .is_some()
            .cmp(&a.children.is_some())
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(TreeNode {
        name,
        path: rel,
        children: Some(children),
    })
}
