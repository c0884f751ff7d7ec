pub mod auth;
pub mod bid_forms;
pub mod bid_packages;
pub mod diagrams;
pub mod extraction;
pub mod health;
pub mod line_items;
pub mod me;
pub mod projects;
pub mod users;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::app::AppState;

/// Routes served outside `/api`
pub fn root_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health_check))
}

/// Build the API router with all routes
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        // Public routes
        .route("/health", get(health::health_check))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        // Session
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/auth/change-password", post(auth::change_password))
        .route("/me/assignments", get(me::my_assignments))
        // Users
        .route("/users", get(users::list_users))
        .route(
            "/users/:user_id",
            get(users::get_user)
                .patch(users::update_user)
                .delete(users::delete_user),
        )
        // Projects
        .route(
            "/projects",
            post(projects::create_project).get(projects::list_projects),
        )
        .route(
            "/projects/:project_id",
            get(projects::get_project)
                .patch(projects::update_project)
                .delete(projects::delete_project),
        )
        // Diagrams (nested under projects)
        .route(
            "/projects/:project_id/diagrams",
            post(diagrams::upload_diagram).get(diagrams::list_diagrams),
        )
        .route(
            "/diagrams/:diagram_id",
            get(diagrams::get_diagram).delete(diagrams::delete_diagram),
        )
        .route("/diagrams/:diagram_id/file", get(diagrams::download_diagram))
        // Extraction
        .route("/extract-bid", post(extraction::extract_bid))
        .route("/diagrams/:diagram_id/extract", post(extraction::extract_diagram))
        .route(
            "/diagrams/:diagram_id/extract/async",
            post(extraction::extract_diagram_async),
        )
        .route(
            "/diagrams/:diagram_id/categorize",
            post(extraction::categorize_diagram),
        )
        .route(
            "/extraction/jobs/:job_id",
            get(extraction::get_extraction_job),
        )
        // Bid forms
        .route(
            "/projects/:project_id/bid-forms",
            get(bid_forms::list_bid_forms),
        )
        .route(
            "/bid-forms/:form_id",
            get(bid_forms::get_bid_form).delete(bid_forms::delete_bid_form),
        )
        .route("/bid-forms/:form_id/verify", post(bid_forms::verify_bid_form))
        // Bid packages
        .route(
            "/projects/:project_id/bid-packages",
            post(bid_packages::create_bid_package).get(bid_packages::list_bid_packages),
        )
        .route(
            "/bid-packages/:package_id",
            get(bid_packages::get_bid_package)
                .patch(bid_packages::update_bid_package)
                .delete(bid_packages::delete_bid_package),
        )
        .route(
            "/bid-packages/:package_id/status",
            post(bid_packages::transition_bid_package),
        )
        .route(
            "/bid-packages/:package_id/recalculate",
            post(bid_packages::recalculate_bid_package),
        )
        .route(
            "/bid-packages/:package_id/assignments",
            post(bid_packages::assign_user).get(bid_packages::list_assignments),
        )
        .route(
            "/bid-packages/:package_id/assignments/:user_id",
            delete(bid_packages::unassign_user),
        )
        .route(
            "/bid-packages/:package_id/line-items",
            get(bid_packages::list_package_line_items)
                .post(bid_packages::create_package_line_item)
                .patch(bid_packages::bulk_update_line_items),
        )
        .route(
            "/bid-packages/:package_id/line-items/attach",
            post(bid_packages::attach_line_items),
        )
        // Line items
        .route(
            "/line-items/:line_item_id",
            get(line_items::get_line_item)
                .patch(line_items::update_line_item)
                .delete(line_items::delete_line_item),
        )
        .route(
            "/line-items/:line_item_id/review",
            post(line_items::review_line_item),
        )
}
