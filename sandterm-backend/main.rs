mod api;
mod config;
mod projects;
mod sandbox;
mod watcher;
mod workspace;

use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::projects::file_repository::FileProjectRepository;
use crate::sandbox::docker::DockerRuntime;
use crate::sandbox::{RuntimeClient, SandboxManager, SandboxSettings};

#[derive(Parser)]
#[command(name = "sandterm", about = "Sandboxed terminals and editors for web projects")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve {
        /// Listen on this port instead of $PORT
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        Cli::Serve { port: None }
    } else {
        Cli::parse()
    };

    match cli {
        Cli::Serve { port } => run_server(port).await,
    }
}

async fn run_server(port_override: Option<u16>) -> Result<(), Box<dyn Error>> {
    let mut config = config::Config::from_env();
    if let Some(port) = port_override {
        config.port = port;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sandterm=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let docker = DockerRuntime::connect(&config.docker_socket)?;
    // The daemon may come up after us; sandboxes are provisioned lazily.
    if let Err(e) = docker.ping().await {
        tracing::warn!(socket = %config.docker_socket.display(), error = %e, "container daemon not reachable");
    }
    let runtime: Arc<dyn RuntimeClient> = Arc::new(docker);

    tokio::fs::create_dir_all(&config.projects_base).await?;

    let sandboxes = SandboxManager::new(
        runtime,
        SandboxSettings {
            image: config.docker_image.clone(),
            user: config.docker_user.clone(),
            app_port: config.app_port,
            projects_base: config.projects_base.clone(),
            workdir: config::SANDBOX_WORKDIR.to_string(),
            attempts: config.provision_attempts,
            retry_backoff: Duration::from_millis(500),
        },
    );

    let projects = Arc::new(FileProjectRepository::new(
        &config.projects_base,
        config.max_projects,
        config.template_command.clone(),
        config.ignored_segments(),
    ));

    let config = Arc::new(config);
    let state = api::AppState::new(config.clone(), sandboxes, projects);

    let app = api::create_app(state.clone())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        projects = %config.projects_base.display(),
        image = %config.docker_image,
        "sandterm ready"
    );
    println!("Listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM after closing every live session.
async fn shutdown_signal(state: api::AppState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down");
    state.shutdown.cancel();
    let closed = sandbox::session::close_all(&state.sessions).await;
    tracing::info!(sessions = closed, "terminal sessions closed");
}
