use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::api::handlers::AppState;
use crate::api::{branch_handlers, handlers};

pub fn create_router() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Repositories
        .route("/repositories", get(handlers::list_repositories))
        .route("/repositories", post(handlers::create_repository))
        .route("/repositories/:repo_id", get(handlers::get_repository))
        .route("/repositories/:repo_id", delete(handlers::delete_repository))
        // Branches
        .route(
            "/repositories/:repo_id/branches",
            get(branch_handlers::list_branches).post(branch_handlers::create_branch),
        )
        .route(
            "/repositories/:repo_id/branches/:branch_id",
            get(branch_handlers::get_branch).delete(branch_handlers::delete_branch),
        )
        .route(
            "/repositories/:repo_id/branches/:branch_id/reset",
            post(branch_handlers::reset_branch),
        )
        .route(
            "/repositories/:repo_id/branches/:branch_id/commits",
            post(branch_handlers::commit_branch),
        )
        .route(
            "/repositories/:repo_id/branches/:branch_id/merge",
            post(branch_handlers::merge_into_branch),
        )
        .route(
            "/repositories/:repo_id/branches/:branch_id/diff",
            get(branch_handlers::diff_uncommitted),
        )
        // Staged writes
        .route(
            "/repositories/:repo_id/branches/:branch_id/objects",
            put(handlers::put_object).delete(handlers::delete_object),
        )
        // Reads at any ref
        .route("/repositories/:repo_id/refs/:reference", get(handlers::resolve_ref))
        .route(
            "/repositories/:repo_id/refs/:reference/objects",
            get(handlers::get_object),
        )
        .route(
            "/repositories/:repo_id/refs/:reference/objects/ls",
            get(handlers::list_objects),
        )
        .route(
            "/repositories/:repo_id/refs/:reference/log",
            get(handlers::log_commits),
        )
        .route(
            "/repositories/:repo_id/refs/:left/diff/:right",
            get(handlers::diff_refs),
        )
        .route(
            "/repositories/:repo_id/commits/:commit_id",
            get(handlers::get_commit),
        )
        // Tags
        .route(
            "/repositories/:repo_id/tags",
            get(handlers::list_tags).post(handlers::create_tag),
        )
        .route(
            "/repositories/:repo_id/tags/:tag_id",
            get(handlers::get_tag).delete(handlers::delete_tag),
        )
        // Garbage collection
        .route(
            "/repositories/:repo_id/settings/gc_rules",
            get(handlers::get_gc_rules)
                .put(handlers::set_gc_rules)
                .delete(handlers::delete_gc_rules),
        )
        .route(
            "/repositories/:repo_id/settings/gc_rules/branches/:branch_id",
            get(handlers::get_branch_retention),
        )
        .route(
            "/repositories/:repo_id/gc/retention",
            get(handlers::retention_report),
        )
        .route("/repositories/:repo_id/gc/runs", post(handlers::record_gc_run))
        .route(
            "/repositories/:repo_id/gc/runs/:run_id",
            get(handlers::get_gc_run),
        )
        // Branch protection
        .route(
            "/repositories/:repo_id/settings/branch_protection",
            get(handlers::get_branch_protection).put(handlers::set_branch_protection),
        )
        .route(
            "/repositories/:repo_id/settings/branch_protection/rules",
            post(handlers::add_branch_protection_rule)
                .delete(handlers::delete_branch_protection_rule),
        )
}
