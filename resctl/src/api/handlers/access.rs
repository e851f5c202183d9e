use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use crate::{
    AppState,
    api::models::AccessUpdate,
    db::models::AccessRecord,
    errors::Result,
    types::{Caller, ResourceId, ResourceKind, UserId},
};

async fn change(
    state: &AppState,
    caller: &Caller,
    kind: ResourceKind,
    id: ResourceId,
    user: UserId,
    body: AccessUpdate,
) -> Result<Json<AccessRecord>> {
    Ok(Json(state.service.change_access(caller, kind, id, user, body.access).await?))
}

#[tracing::instrument(skip_all)]
pub async fn change_namespace_access(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, user)): Path<(ResourceId, UserId)>,
    Json(body): Json<AccessUpdate>,
) -> Result<Json<AccessRecord>> {
    change(&state, &caller, ResourceKind::Namespace, id, user, body).await
}

#[tracing::instrument(skip_all)]
pub async fn delete_namespace_access(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, user)): Path<(ResourceId, UserId)>,
) -> Result<StatusCode> {
    state.service.delete_access(&caller, ResourceKind::Namespace, id, user).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip_all)]
pub async fn change_volume_access(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, user)): Path<(ResourceId, UserId)>,
    Json(body): Json<AccessUpdate>,
) -> Result<Json<AccessRecord>> {
    change(&state, &caller, ResourceKind::Volume, id, user, body).await
}

#[tracing::instrument(skip_all)]
pub async fn delete_volume_access(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, user)): Path<(ResourceId, UserId)>,
) -> Result<StatusCode> {
    state.service.delete_access(&caller, ResourceKind::Volume, id, user).await?;
    Ok(StatusCode::NO_CONTENT)
}
