use std::path::PathBuf;
use std::time::Duration;

/// In-instance mount point of a project directory.
pub const SANDBOX_WORKDIR: &str = "/home/sandbox/app";

/// Path segments the watcher and tree listing skip.
pub const IGNORED_SEGMENTS: [&str; 4] = ["node_modules", ".git", "dist", "build"];

const DEFAULT_TEMPLATE_COMMAND: &str = "npm create vite@latest sandbox -- --template react --yes";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub cors_origin: String,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub docker_socket: PathBuf,
    pub docker_image: String,
    pub docker_user: String,
    pub app_port: u16,
    pub projects_base: PathBuf,
    pub max_projects: usize,
    pub watcher_settle: Duration,
    pub template_command: String,
    pub provision_attempts: u32,
    /// Shell launched for each terminal session.
    pub terminal_shell: Vec<String>,
}

/// Raw, unparsed values as they come from the environment.
#[derive(Debug, Default, Clone)]
pub struct RawConfig<'a> {
    pub port: Option<&'a str>,
    pub host: Option<&'a str>,
    pub cors_origin: Option<&'a str>,
    pub sentry_dsn: Option<&'a str>,
    pub environment: Option<&'a str>,
    pub docker_socket: Option<&'a str>,
    pub docker_image: Option<&'a str>,
    pub docker_user: Option<&'a str>,
    pub app_port: Option<&'a str>,
    pub projects_base: Option<&'a str>,
    pub max_projects: Option<&'a str>,
    pub watcher_settle_ms: Option<&'a str>,
    pub template_command: Option<&'a str>,
    pub provision_attempts: Option<&'a str>,
}

impl Config {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok();
        let port = var("PORT");
        let host = var("HOST");
        let cors_origin = var("CORS_ORIGIN");
        let sentry_dsn = var("SENTRY_DSN");
        let environment = var("ENVIRONMENT");
        let docker_socket = var("DOCKER_SOCKET_PATH");
        let docker_image = var("DOCKER_DEFAULT_IMAGE");
        let docker_user = var("DOCKER_DEFAULT_USER");
        let app_port = var("DOCKER_DEFAULT_PORT");
        let projects_base = var("PROJECTS_BASE_PATH");
        let max_projects = var("MAX_PROJECTS");
        let watcher_settle_ms = var("FILE_WATCHER_STABILITY_THRESHOLD");
        let template_command = var("PROJECT_TEMPLATE_COMMAND");
        let provision_attempts = var("PROVISION_ATTEMPTS");

        let mut config = Self::from_raw_values(RawConfig {
            port: port.as_deref(),
            host: host.as_deref(),
            cors_origin: cors_origin.as_deref(),
            sentry_dsn: sentry_dsn.as_deref(),
            environment: environment.as_deref(),
            docker_socket: docker_socket.as_deref(),
            docker_image: docker_image.as_deref(),
            docker_user: docker_user.as_deref(),
            app_port: app_port.as_deref(),
            projects_base: projects_base.as_deref(),
            max_projects: max_projects.as_deref(),
            watcher_settle_ms: watcher_settle_ms.as_deref(),
            template_command: template_command.as_deref(),
            provision_attempts: provision_attempts.as_deref(),
        });

        // Bind mounts need an absolute host path.
        if config.projects_base.is_relative() {
            if let Ok(cwd) = std::env::current_dir() {
                config.projects_base = cwd.join(&config.projects_base);
            }
        }
        config
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(raw: RawConfig<'_>) -> Self {
        fn text(v: Option<&str>, default: &str) -> String {
            v.filter(|s| !s.is_empty()).unwrap_or(default).to_string()
        }

        let port = raw.port.and_then(|v| v.parse().ok()).unwrap_or(3000);
        let app_port = raw.app_port.and_then(|v| v.parse().ok()).unwrap_or(5173);
        let max_projects = raw.max_projects.and_then(|v| v.parse().ok()).unwrap_or(100);
        let watcher_settle = Duration::from_millis(
            raw.watcher_settle_ms
                .and_then(|v| v.parse().ok())
                .unwrap_or(2000),
        );
        let provision_attempts = raw
            .provision_attempts
            .and_then(|v| v.parse().ok())
            .filter(|n: &u32| *n > 0)
            .unwrap_or(3);

        let sentry_dsn = raw.sentry_dsn.filter(|s| !s.is_empty()).map(String::from);

        Config {
            port,
            host: text(raw.host, "0.0.0.0"),
            cors_origin: text(raw.cors_origin, "*"),
            sentry_dsn,
            environment: text(raw.environment, "local"),
            docker_socket: PathBuf::from(text(raw.docker_socket, "/var/run/docker.sock")),
            docker_image: text(raw.docker_image, "sandbox"),
            docker_user: text(raw.docker_user, "sandbox"),
            app_port,
            projects_base: PathBuf::from(text(raw.projects_base, "./projects")),
            max_projects,
            watcher_settle,
            template_command: text(raw.template_command, DEFAULT_TEMPLATE_COMMAND),
            provision_attempts,
            terminal_shell: ["script", "-qfc", "/bin/bash", "/dev/null"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn ignored_segments(&self) -> Vec<String> {
        IGNORED_SEGMENTS.iter().map(|s| s.to_string()).collect()
    }
}
