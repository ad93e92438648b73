use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{EngineError, ErrorKind};
use crate::logic::{
    BranchRetentionReport, NewRepository, ObjectStat, RecordGcRun, ResolvedRef, VersionEngine,
};
use crate::model::{
    BlockedAction, BranchProtectionRules, Commit, DiffEntry, GarbageCollectionRules,
    GcRunMetadata, Id, Repository, Tag,
};

pub type AppState = Arc<VersionEngine>;

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
            conflicts: Vec::new(),
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PolicyDenied => StatusCode::FORBIDDEN,
        ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Corruption => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Translate an engine error into a status and JSON body
pub fn error_response(err: EngineError) -> (StatusCode, Json<ErrorResponse>) {
    let status = status_for(err.kind());
    if status.is_server_error() {
        log::error!("request failed: {}", err);
    }
    let mut body = ErrorResponse::new(&err.to_string());
    if let EngineError::MergeConflict { keys, .. } = err {
        body.conflicts = keys;
    }
    (status, Json(body))
}

// --- repositories ---

pub async fn list_repositories(State(engine): State<AppState>) -> ApiResult<ListResponse<Repository>> {
    let repositories = engine.list_repositories().await.map_err(error_response)?;
    Ok(Json(repositories.into()))
}

pub async fn create_repository(
    State(engine): State<AppState>,
    RequestJson(request): RequestJson<NewRepository>,
) -> Result<(StatusCode, Json<Repository>), (StatusCode, Json<ErrorResponse>)> {
    let repository = engine.create_repository(request).await.map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(repository)))
}

pub async fn get_repository(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
) -> ApiResult<Repository> {
    engine
        .get_repository(&repo_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn delete_repository(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    engine.delete_repository(&repo_id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- refs, commits and objects ---

pub async fn resolve_ref(
    State(engine): State<AppState>,
    Path((repo_id, reference)): Path<(Id, String)>,
) -> ApiResult<ResolvedRef> {
    engine
        .resolve_ref(&repo_id, &reference)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn get_commit(
    State(engine): State<AppState>,
    Path((repo_id, commit_id)): Path<(Id, String)>,
) -> ApiResult<Commit> {
    engine
        .get_commit(&repo_id, &commit_id)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

const DEFAULT_LOG_LIMIT: usize = 100;

pub async fn log_commits(
    State(engine): State<AppState>,
    Path((repo_id, reference)): Path<(Id, String)>,
    Query(query): Query<LogQuery>,
) -> ApiResult<ListResponse<Commit>> {
    let commits = engine
        .log(&repo_id, &reference, query.limit.unwrap_or(DEFAULT_LOG_LIMIT))
        .await
        .map_err(error_response)?;
    Ok(Json(commits.into()))
}

pub async fn diff_refs(
    State(engine): State<AppState>,
    Path((repo_id, left, right)): Path<(Id, String, String)>,
) -> ApiResult<ListResponse<DiffEntry>> {
    let entries = engine
        .diff(&repo_id, &left, &right)
        .await
        .map_err(error_response)?;
    Ok(Json(entries.into()))
}

#[derive(Debug, Deserialize)]
pub struct ObjectQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    #[serde(default)]
    pub prefix: String,
}

/// Raw object data; the identity is returned as the ETag
pub async fn get_object(
    State(engine): State<AppState>,
    Path((repo_id, reference)): Path<(Id, String)>,
    Query(query): Query<ObjectQuery>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let value = engine
        .get_object(&repo_id, &reference, &query.path)
        .await
        .map_err(error_response)?;
    Ok((
        [
            (header::ETAG, format!("\"{}\"", value.identity)),
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        ],
        value.data,
    )
        .into_response())
}

pub async fn list_objects(
    State(engine): State<AppState>,
    Path((repo_id, reference)): Path<(Id, String)>,
    Query(query): Query<ListObjectsQuery>,
) -> ApiResult<ListResponse<ObjectStat>> {
    let objects = engine
        .list_objects(&repo_id, &reference, &query.prefix)
        .await
        .map_err(error_response)?;
    Ok(Json(objects.into()))
}

#[derive(Debug, Serialize)]
pub struct StagedObjectResponse {
    pub path: String,
    pub identity: String,
    pub size_bytes: u64,
}

pub async fn put_object(
    State(engine): State<AppState>,
    Path((repo_id, branch_id)): Path<(Id, String)>,
    Query(query): Query<ObjectQuery>,
    body: Bytes,
) -> ApiResult<StagedObjectResponse> {
    let value = engine
        .stage_object(&repo_id, &branch_id, &query.path, body.to_vec())
        .await
        .map_err(error_response)?;
    Ok(Json(StagedObjectResponse {
        path: query.path,
        size_bytes: value.data.len() as u64,
        identity: value.identity,
    }))
}

pub async fn delete_object(
    State(engine): State<AppState>,
    Path((repo_id, branch_id)): Path<(Id, String)>,
    Query(query): Query<ObjectQuery>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    engine
        .stage_delete(&repo_id, &branch_id, &query.path)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- tags ---

#[derive(Debug, Deserialize)]
pub struct NewTagRequest {
    pub id: String,
    /// Commit id, branch or tag to point at
    #[serde(rename = "ref")]
    pub target: String,
}

pub async fn list_tags(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
) -> ApiResult<ListResponse<Tag>> {
    let tags = engine.list_tags(&repo_id).await.map_err(error_response)?;
    Ok(Json(tags.into()))
}

pub async fn create_tag(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
    RequestJson(request): RequestJson<NewTagRequest>,
) -> Result<(StatusCode, Json<Tag>), (StatusCode, Json<ErrorResponse>)> {
    let tag = engine
        .create_tag(&repo_id, &request.id, &request.target)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(tag)))
}

pub async fn get_tag(
    State(engine): State<AppState>,
    Path((repo_id, tag_id)): Path<(Id, String)>,
) -> ApiResult<Tag> {
    engine
        .get_tag(&repo_id, &tag_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn delete_tag(
    State(engine): State<AppState>,
    Path((repo_id, tag_id)): Path<(Id, String)>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    engine
        .delete_tag(&repo_id, &tag_id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- garbage collection ---

pub async fn get_gc_rules(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
) -> ApiResult<GarbageCollectionRules> {
    engine
        .get_gc_rules(&repo_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn set_gc_rules(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
    RequestJson(rules): RequestJson<GarbageCollectionRules>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    engine
        .set_gc_rules(&repo_id, &rules)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_gc_rules(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    engine
        .delete_gc_rules(&repo_id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct RetentionResponse {
    pub branch_id: String,
    pub retention_days: i32,
}

pub async fn get_branch_retention(
    State(engine): State<AppState>,
    Path((repo_id, branch_id)): Path<(Id, String)>,
) -> ApiResult<RetentionResponse> {
    let retention_days = engine
        .effective_retention(&repo_id, &branch_id)
        .await
        .map_err(error_response)?;
    Ok(Json(RetentionResponse {
        branch_id,
        retention_days,
    }))
}

pub async fn retention_report(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
) -> ApiResult<ListResponse<BranchRetentionReport>> {
    let report = engine
        .retention_report(&repo_id)
        .await
        .map_err(error_response)?;
    Ok(Json(report.into()))
}

pub async fn record_gc_run(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
    RequestJson(request): RequestJson<RecordGcRun>,
) -> Result<(StatusCode, Json<GcRunMetadata>), (StatusCode, Json<ErrorResponse>)> {
    let run = engine
        .record_gc_run(&repo_id, request)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(run)))
}

pub async fn get_gc_run(
    State(engine): State<AppState>,
    Path((repo_id, run_id)): Path<(Id, String)>,
) -> ApiResult<GcRunMetadata> {
    engine
        .get_gc_run(&repo_id, &run_id)
        .await
        .map(Json)
        .map_err(error_response)
}

// --- branch protection ---

pub async fn get_branch_protection(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
) -> ApiResult<BranchProtectionRules> {
    engine
        .get_branch_protection_rules(&repo_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn set_branch_protection(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
    RequestJson(rules): RequestJson<BranchProtectionRules>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    engine
        .set_branch_protection_rules(&repo_id, &rules)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ProtectionRuleRequest {
    pub pattern: String,
    pub blocked_actions: BTreeSet<BlockedAction>,
}

pub async fn add_branch_protection_rule(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
    RequestJson(request): RequestJson<ProtectionRuleRequest>,
) -> ApiResult<BranchProtectionRules> {
    engine
        .add_branch_protection_rule(&repo_id, &request.pattern, request.blocked_actions)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct PatternQuery {
    pub pattern: String,
}

pub async fn delete_branch_protection_rule(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
    Query(query): Query<PatternQuery>,
) -> ApiResult<BranchProtectionRules> {
    engine
        .delete_branch_protection_rule(&repo_id, &query.pattern)
        .await
        .map(Json)
        .map_err(error_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::PolicyDenied), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(ErrorKind::BackendUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_merge_conflicts_are_listed() {
        let (status, Json(body)) = error_response(EngineError::MergeConflict {
            repository: "repo1".to_string(),
            keys: vec!["a".to_string(), "b".to_string()],
        });
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.conflicts, vec!["a".to_string(), "b".to_string()]);
    }
}
