use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde_json::Value;

use crate::database::AppState;
use crate::documents::{Collection, Document};
use crate::error::{AppError, PipelineError};
use crate::gallery;
use crate::structs::{DownloadManifestItem, Folder, MediaAsset, NameFilterQuery};

/// Admin read views, mounted under the configured admin path segment.
pub fn routes(admin_path: &str) -> Router<Arc<AppState>> {
    let views = Router::new()
        .route("/collections/{name}", get(read_collection))
        .route("/folders", get(list_folders))
        .route("/folders/{user_id}", get(get_folder))
        .route("/gallery", get(gallery_view))
        .route("/downloadAll", get(download_all));

    Router::new().nest(&format!("/{admin_path}"), views)
}

/// Flatten a stored document into `{id, ...fields}`.
fn document_json(doc: Document) -> Value {
    let Document { id, mut fields } = doc;
    fields.insert("id".to_string(), Value::String(id));
    Value::Object(fields)
}

async fn read_collection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Value>>, AppError> {
    let collection = Collection::from_public_name(&name).ok_or_else(|| {
        AppError::not_found("read_collection", "Unknown collection").with_context("name", name)
    })?;

    let docs = state
        .documents
        .list(collection)
        .await
        .map_err(|err| PipelineError::from(err).into_app_error("read_collection"))?;
    Ok(Json(docs.into_iter().map(document_json).collect()))
}

async fn list_folders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NameFilterQuery>,
) -> Result<Json<Vec<Folder>>, AppError> {
    let folders = gallery::build_folders(state.documents.as_ref())
        .await
        .map_err(|err| err.into_app_error("list_folders"))?;
    Ok(Json(gallery::filter_by_name_prefix(folders, &query.name)))
}

async fn get_folder(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Folder>, AppError> {
    gallery::folder_for_user(state.documents.as_ref(), &user_id)
        .await
        .map(Json)
        .map_err(|err| err.into_app_error("get_folder"))
}

async fn gallery_view(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NameFilterQuery>,
) -> Result<Json<Vec<MediaAsset>>, AppError> {
    gallery::flat_gallery(state.documents.as_ref(), &query.name)
        .await
        .map(Json)
        .map_err(|err| err.into_app_error("gallery"))
}

async fn download_all(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DownloadManifestItem>>, AppError> {
    gallery::download_manifest(state.documents.as_ref())
        .await
        .map(Json)
        .map_err(|err| err.into_app_error("download_all"))
}
