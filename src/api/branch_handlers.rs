use crate::api::handlers::{error_response, ApiResult, AppState, ErrorResponse, ListResponse};
use crate::api::user_extractor::Committer;
use crate::model::{Branch, Commit, DiffEntry, Id, MergeRequest, MergeStrategy, NewCommit};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub struct NewBranchRequest {
    pub name: String,
    /// Ref the branch starts from
    pub source: String,
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub allow_empty: bool,
}

#[derive(Debug, Deserialize)]
pub struct MergeBranchRequest {
    pub source: String,
    pub message: Option<String>,
    #[serde(default)]
    pub strategy: MergeStrategy,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

pub async fn list_branches(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
) -> ApiResult<ListResponse<Branch>> {
    let branches = engine.list_branches(&repo_id).await.map_err(error_response)?;
    Ok(Json(branches.into()))
}

pub async fn create_branch(
    State(engine): State<AppState>,
    Path(repo_id): Path<Id>,
    RequestJson(request): RequestJson<NewBranchRequest>,
) -> Result<(StatusCode, Json<Branch>), (StatusCode, Json<ErrorResponse>)> {
    let branch = engine
        .create_branch(&repo_id, &request.name, &request.source)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(branch)))
}

pub async fn get_branch(
    State(engine): State<AppState>,
    Path((repo_id, branch_id)): Path<(Id, String)>,
) -> ApiResult<Branch> {
    engine
        .get_branch(&repo_id, &branch_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn delete_branch(
    State(engine): State<AppState>,
    Path((repo_id, branch_id)): Path<(Id, String)>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    engine
        .delete_branch(&repo_id, &branch_id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reset_branch(
    State(engine): State<AppState>,
    Path((repo_id, branch_id)): Path<(Id, String)>,
) -> ApiResult<Branch> {
    engine
        .reset_branch(&repo_id, &branch_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn diff_uncommitted(
    State(engine): State<AppState>,
    Path((repo_id, branch_id)): Path<(Id, String)>,
) -> ApiResult<ListResponse<DiffEntry>> {
    let entries = engine
        .diff_uncommitted(&repo_id, &branch_id)
        .await
        .map_err(error_response)?;
    Ok(Json(entries.into()))
}

pub async fn commit_branch(
    State(engine): State<AppState>,
    Path((repo_id, branch_id)): Path<(Id, String)>,
    committer: Committer,
    RequestJson(request): RequestJson<CommitRequest>,
) -> Result<(StatusCode, Json<Commit>), (StatusCode, Json<ErrorResponse>)> {
    let commit = engine
        .commit(
            &repo_id,
            &branch_id,
            NewCommit {
                committer: committer.0,
                message: request.message,
                metadata: request.metadata,
                allow_empty: request.allow_empty,
            },
        )
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(commit)))
}

pub async fn merge_into_branch(
    State(engine): State<AppState>,
    Path((repo_id, branch_id)): Path<(Id, String)>,
    committer: Committer,
    RequestJson(request): RequestJson<MergeBranchRequest>,
) -> Result<(StatusCode, Json<Commit>), (StatusCode, Json<ErrorResponse>)> {
    let commit = engine
        .merge(
            &repo_id,
            &branch_id,
            MergeRequest {
                source: request.source,
                committer: committer.0,
                message: request.message,
                strategy: request.strategy,
                metadata: request.metadata,
            },
        )
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(commit)))
}
