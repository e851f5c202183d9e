use axum::{
    Json,
    extract::{Path, State},
    response::Response,
};

use super::ndjson;
use crate::{
    AppState,
    db::models::ResourceCount,
    errors::Result,
    types::{Caller, UserId},
};

/// Delete all of a user's standalone volumes, streaming one outcome per volume.
#[tracing::instrument(skip_all)]
pub async fn delete_user_volumes(
    State(state): State<AppState>,
    caller: Caller,
    Path(user): Path<UserId>,
) -> Result<Response> {
    let outcomes = state.service.delete_all_volumes(&caller, user)?;
    Ok(ndjson(outcomes))
}

#[tracing::instrument(skip_all)]
pub async fn count_user_resources(
    State(state): State<AppState>,
    caller: Caller,
    Path(user): Path<UserId>,
) -> Result<Json<ResourceCount>> {
    Ok(Json(state.service.count_resources(&caller, user).await?))
}
