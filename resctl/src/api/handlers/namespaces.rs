use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
};

use super::ndjson;
use crate::{
    AppState,
    api::models::{CursorPage, GetParams, LabelUpdate, ListParams, LockUpdate, NamespaceCreate, StreamParams, TariffUpdate},
    db::models::Namespace,
    errors::Result,
    types::{Caller, ResourceId},
};

#[tracing::instrument(skip_all)]
pub async fn list_namespaces(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<ListParams>,
) -> Result<Json<CursorPage<Namespace>>> {
    let limit = state.service.page_limit(params.limit);
    let namespaces = state
        .service
        .list_namespaces(&caller, params.user, params.filters()?, params.after, Some(limit))
        .await?;
    Ok(Json(CursorPage::new(namespaces, limit)))
}

#[tracing::instrument(skip_all)]
pub async fn create_namespace(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<NamespaceCreate>,
) -> Result<(StatusCode, Json<Namespace>)> {
    let namespace = state.service.create_namespace(&caller, &body.label, body.tariff_id).await?;
    Ok((StatusCode::CREATED, Json(namespace)))
}

#[tracing::instrument(skip_all)]
pub async fn get_namespace(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResourceId>,
    Query(params): Query<GetParams>,
) -> Result<Json<Namespace>> {
    Ok(Json(state.service.get_namespace(&caller, id, params.user).await?))
}

#[tracing::instrument(skip_all)]
pub async fn delete_namespace(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResourceId>,
) -> Result<StatusCode> {
    state.service.delete_namespace(&caller, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip_all)]
pub async fn rename_namespace(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResourceId>,
    Json(body): Json<LabelUpdate>,
) -> Result<Json<Namespace>> {
    Ok(Json(state.service.rename_namespace(&caller, id, &body.label).await?))
}

#[tracing::instrument(skip_all)]
pub async fn resize_namespace(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResourceId>,
    Json(body): Json<TariffUpdate>,
) -> Result<Json<Namespace>> {
    Ok(Json(state.service.resize_namespace(&caller, id, body.tariff_id).await?))
}

#[tracing::instrument(skip_all)]
pub async fn lock_namespace(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResourceId>,
    Json(body): Json<LockUpdate>,
) -> Result<Json<Namespace>> {
    Ok(Json(state.service.set_namespace_limited(&caller, id, body.limited).await?))
}

/// Every namespace, as NDJSON. Admins only.
#[tracing::instrument(skip_all)]
pub async fn stream_all_namespaces(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<StreamParams>,
) -> Result<Response> {
    let stream = state.service.stream_all_namespaces(&caller, params.filters()?)?;
    Ok(ndjson(stream))
}
