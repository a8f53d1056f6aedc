use async_trait::async_trait;

use super::{ProjectError, ProjectInfo, TreeNode};
use crate::workspace::Workspace;

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    /// Scaffold a new project and return its id.
    async fn create_project(&self) -> Result<String, ProjectError>;
    async fn list_projects(&self) -> Result<Vec<String>, ProjectError>;
    async fn get_project(&self, id: &str) -> Result<ProjectInfo, ProjectError>;
    async fn delete_project(&self, id: &str) -> Result<(), ProjectError>;
    async fn project_tree(&self, id: &str) -> Result<TreeNode, ProjectError>;
    /// File-level access to an existing project.
    fn workspace(&self, id: &str) -> Result<Workspace, ProjectError>;
}
