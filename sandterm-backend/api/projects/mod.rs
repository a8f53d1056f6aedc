pub mod handlers;

use axum::Router;
use axum::routing::get;

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/projects",
            get(handlers::list_projects).post(handlers::create_project),
        )
        .route(
            "/projects/{id}",
            get(handlers::get_project).delete(handlers::delete_project),
        )
        .route("/projects/{id}/tree", get(handlers::project_tree))
}
