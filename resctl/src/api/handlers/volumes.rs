use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
};

use super::ndjson;
use crate::{
    AppState,
    api::models::{CursorPage, GetParams, LabelUpdate, ListParams, LockUpdate, StreamParams, TariffUpdate, VolumeCreate},
    db::models::Volume,
    errors::Result,
    service::volumes::VolumePlacement,
    types::{Caller, ResourceId},
};

#[tracing::instrument(skip_all)]
pub async fn list_volumes(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<ListParams>,
) -> Result<Json<CursorPage<Volume>>> {
    let limit = state.service.page_limit(params.limit);
    let volumes = state
        .service
        .list_volumes(
            &caller,
            params.user,
            params.filters()?,
            params.namespace_id,
            params.after,
            Some(limit),
        )
        .await?;
    Ok(Json(CursorPage::new(volumes, limit)))
}

#[tracing::instrument(skip_all)]
pub async fn create_volume(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<VolumeCreate>,
) -> Result<(StatusCode, Json<Volume>)> {
    let placement = VolumePlacement {
        namespace_id: body.namespace_id,
        persistent: body.persistent,
    };
    let volume = state
        .service
        .create_volume(&caller, &body.label, body.tariff_id, placement)
        .await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

#[tracing::instrument(skip_all)]
pub async fn get_volume(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResourceId>,
    Query(params): Query<GetParams>,
) -> Result<Json<Volume>> {
    Ok(Json(state.service.get_volume(&caller, id, params.user).await?))
}

#[tracing::instrument(skip_all)]
pub async fn delete_volume(State(state): State<AppState>, caller: Caller, Path(id): Path<ResourceId>) -> Result<StatusCode> {
    state.service.delete_volume(&caller, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip_all)]
pub async fn rename_volume(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResourceId>,
    Json(body): Json<LabelUpdate>,
) -> Result<Json<Volume>> {
    Ok(Json(state.service.rename_volume(&caller, id, &body.label).await?))
}

#[tracing::instrument(skip_all)]
pub async fn resize_volume(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResourceId>,
    Json(body): Json<TariffUpdate>,
) -> Result<Json<Volume>> {
    Ok(Json(state.service.resize_volume(&caller, id, body.tariff_id).await?))
}

#[tracing::instrument(skip_all)]
pub async fn lock_volume(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<ResourceId>,
    Json(body): Json<LockUpdate>,
) -> Result<Json<Volume>> {
    Ok(Json(state.service.set_volume_limited(&caller, id, body.limited).await?))
}

/// Every volume, as NDJSON. Admins only.
#[tracing::instrument(skip_all)]
pub async fn stream_all_volumes(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<StreamParams>,
) -> Result<Response> {
    let stream = state.service.stream_all_volumes(&caller, params.filters()?)?;
    Ok(ndjson(stream))
}
