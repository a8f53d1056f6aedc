use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum WorkspaceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("path escapes project: {0}")]
    PathEscape(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// A project directory on the host. Every path handed in by a client is
/// relative to it and may not leave it.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Attach to an existing project directory.
    pub fn attach(root: PathBuf) -> Result<Self, WorkspaceError> {
        if !root.is_dir() {
            return Err(WorkspaceError::NotFound(root.display().to_string()));
        }
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a client path onto the host. A leading `/` means the project
    /// root, `..` may not climb above it.
    pub fn resolve(&self, client_path: &str) -> Result<PathBuf, WorkspaceError> {
        let client = Path::new(client_path);
        let relative = client.strip_prefix("/").unwrap_or(client);

        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(seg) => normalized.push(seg),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(WorkspaceError::PathEscape(client_path.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {}
            }
        }

        Ok(self.root.join(normalized))
    }

    /// Project-relative, `/`-separated form of a host path inside the root.
    pub fn relative(&self, host_path: &Path) -> Option<String> {
        let rel = host_path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(seg) => Some(seg.to_string_lossy()),
                _ => None,
            })
            .collect();
        Some(parts.join("/"))
    }

    /// Resolve to something strictly below the root.
    fn resolve_entry(&self, client_path: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.resolve(client_path)?;
        if path == self.root {
            return Err(WorkspaceError::PathEscape(client_path.to_string()));
        }
        Ok(path)
    }

    pub async fn write_file(&self, client_path: &str, data: &str) -> Result<(), WorkspaceError> {
        let path = self.resolve_entry(client_path)?;
        tokio::fs::write(&path, data).await?;
        tracing::debug!(path = %path.display(), bytes = data.len(), "file written");
        Ok(())
    }

    pub async fn read_file(&self, client_path: &str) -> Result<String, WorkspaceError> {
        let path = self.resolve_entry(client_path)?;
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    /// Create an empty file. Fails if anything already exists at the path.
    pub async fn create_file(&self, client_path: &str) -> Result<(), WorkspaceError> {
        let path = self.resolve_entry(client_path)?;
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(WorkspaceError::AlreadyExists(client_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_file(&self, client_path: &str) -> Result<(), WorkspaceError> {
        let path = self.resolve_entry(client_path)?;
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    pub async fn create_dir(&self, client_path: &str) -> Result<(), WorkspaceError> {
        let path = self.resolve_entry(client_path)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    pub async fn delete_dir(&self, client_path: &str) -> Result<(), WorkspaceError> {
        let path = self.resolve_entry(client_path)?;
        tokio::fs::remove_dir_all(&path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::attach(tmp.path().to_path_buf()).unwrap();
        (tmp, ws)
    }

    #[tokio::test]
    async fn write_then_read() {
        let (_tmp, ws) = workspace();
        ws.write_file("/hello.txt", "hello world").await.unwrap();
        assert_eq!(ws.read_file("hello.txt").await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn create_file_refuses_existing() {
        let (_tmp, ws) = workspace();
        ws.create_file("new.txt").await.unwrap();
        assert_eq!(ws.read_file("new.txt").await.unwrap(), "");

        let err = ws.create_file("new.txt").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn folders_are_created_recursively_and_removed() {
        let (_tmp, ws) = workspace();
        ws.create_dir("src/components/ui").await.unwrap();
        ws.write_file("src/components/ui/Button.jsx", "export {}").await.unwrap();
        assert!(ws.root().join("src/components/ui/Button.jsx").is_file());

        ws.delete_dir("src/components").await.unwrap();
        assert!(!ws.root().join("src/components").exists());
        assert!(ws.root().join("src").is_dir());
    }

    #[tokio::test]
    async fn delete_file_removes_it() {
        let (_tmp, ws) = workspace();
        ws.write_file("gone.txt", "x").await.unwrap();
        ws.delete_file("gone.txt").await.unwrap();
        assert!(ws.read_file("gone.txt").await.is_err());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("proj")).unwrap();
        std::fs::write(tmp.path().join("secret.txt"), "secret").unwrap();
        let ws = Workspace::attach(tmp.path().join("proj")).unwrap();

        let err = ws.read_file("../secret.txt").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::PathEscape(_)));
        assert!(ws.read_file("/a/../../secret.txt").await.is_err());
        assert!(ws.delete_dir("/").await.is_err());
        assert!(tmp.path().join("proj").is_dir());
    }

    #[test]
    fn inner_dotdot_stays_inside() {
        let (_tmp, ws) = workspace();
        let path = ws.resolve("src/../index.html").unwrap();
        assert_eq!(path, ws.root().join("index.html"));
    }

    #[test]
    fn relative_strips_root() {
        let (_tmp, ws) = workspace();
        let host = ws.root().join("src").join("main.jsx");
        assert_eq!(ws.relative(&host).as_deref(), Some("src/main.jsx"));
        assert_eq!(ws.relative(Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn attach_missing_dir_fails() {
        let err = Workspace::attach(PathBuf::from("/nonexistent/path/xyz")).unwrap_err();
        assert!(matches!(err, WorkspaceError::NotFound(_)));
    }
}
