//! Document endpoints backed by the data service.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stowage_engine::{Document, DocumentId, Fields};

use crate::error::{AppError, AppResult};
use crate::AppState;

/// Optional single-field equality filter for collection queries.
#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    pub field: Option<String>,
    /// Parsed as JSON when possible, otherwise compared as a string
    pub equals: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Created {
    pub id: DocumentId,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/collections/{collection}",
            get(query_collection).post(create_document),
        )
        .route(
            "/collections/{collection}/{id}",
            get(get_document)
                .patch(update_document)
                .delete(remove_document),
        )
}

/// GET /collections/{collection}
async fn query_collection(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(params): Query<QueryParams>,
) -> AppResult<Json<Vec<Document>>> {
    let filter = match (params.field, params.equals) {
        (Some(field), Some(equals)) => {
            let expected = serde_json::from_str(&equals).unwrap_or(Value::String(equals));
            Some((field, expected))
        }
        (None, None) => None,
        _ => {
            return Err(AppError::BadRequest(
                "field and equals must be given together".to_string(),
            ))
        }
    };

    let documents = state
        .service
        .query(&collection, |doc| match &filter {
            Some((field, expected)) => doc.fields.get(field) == Some(expected),
            None => true,
        })
        .await?;
    Ok(Json(documents))
}

/// POST /collections/{collection}
async fn create_document(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(payload): Json<Fields>,
) -> AppResult<(StatusCode, Json<Created>)> {
    let id = state.service.create(&collection, payload).await?;
    Ok((StatusCode::CREATED, Json(Created { id })))
}

/// GET /collections/{collection}/{id}
async fn get_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> AppResult<Json<Document>> {
    state
        .service
        .get(&collection, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("{collection}/{id}")))
}

/// PATCH /collections/{collection}/{id}
async fn update_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(patch): Json<Fields>,
) -> AppResult<Json<Document>> {
    Ok(Json(state.service.update(&collection, &id, patch).await?))
}

/// DELETE /collections/{collection}/{id}
async fn remove_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    state.service.remove(&collection, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
