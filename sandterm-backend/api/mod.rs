pub mod editor;
pub mod middleware;
pub mod projects;
mod routes;
pub mod sandbox;
pub mod terminal;

use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::projects::repository::ProjectRepository;
use crate::sandbox::{SandboxManager, SessionContext, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sandboxes: SandboxManager,
    pub sessions: SessionRegistry,
    pub session_ctx: SessionContext,
    pub projects: Arc<dyn ProjectRepository>,
    pub started_at: Instant,
    /// Cancelled when the server starts shutting down; long-lived sockets
    /// watch it to let go of their connection.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        sandboxes: SandboxManager,
        projects: Arc<dyn ProjectRepository>,
    ) -> Self {
        let sessions = SessionRegistry::new();
        let settings = sandboxes.settings();
        let session_ctx = SessionContext {
            runtime: sandboxes.runtime(),
            registry: sessions.clone(),
            shell: config.terminal_shell.clone(),
            user: settings.user.clone(),
            workdir: settings.workdir.clone(),
            app_port: settings.app_port,
        };
        Self {
            config,
            sandboxes,
            sessions,
            session_ctx,
            projects,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::config::RawConfig;
    use crate::projects::file_repository::FileProjectRepository;
    use crate::sandbox::SandboxSettings;
    use crate::sandbox::testing::FakeRuntime;

    /// App state over a fake runtime and a project store rooted at `base`.
    pub fn state(base: &Path, fake: Arc<FakeRuntime>) -> AppState {
        let mut config = Config::from_raw_values(RawConfig::default());
        config.projects_base = base.to_path_buf();
        config.max_projects = 2;
        config.template_command = "mkdir sandbox".into();
        config.watcher_settle = Duration::from_millis(50);

        let sandboxes = SandboxManager::new(
            fake,
            SandboxSettings {
                image: config.docker_image.clone(),
                user: config.docker_user.clone(),
                app_port: config.app_port,
                projects_base: config.projects_base.clone(),
                workdir: crate::config::SANDBOX_WORKDIR.to_string(),
                attempts: 1,
                retry_backoff: Duration::from_millis(1),
            },
        );
        let projects = Arc::new(FileProjectRepository::new(
            base,
            config.max_projects,
            config.template_command.clone(),
            config.ignored_segments(),
        ));
        AppState::new(Arc::new(config), sandboxes, projects)
    }
}
