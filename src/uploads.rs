use std::sync::Arc;

use axum::{
    extract::{multipart::Field, Multipart, Path, Query, State},
    Json,
};
use bytes::Bytes;
use tracing::info;
use uuid::Uuid;

use crate::database::AppState;
use crate::documents;
use crate::error::{hash_pii, AppError, PipelineError};
use crate::progress::BatchKey;
use crate::session::{resolve_user, Attested, Session};
use crate::structs::{
    IdResponse, ProgressResponse, SubmitQuery, SubmitResponse, UploadMediaRequest,
    UploadMediaResponse, UploadUserRequest, UploadWishRequest, User, Wish,
};
use crate::transcoder::{content_type_for_filename, RawFile};
use crate::uploader::record_wish;

const GENERIC_CONTENT_TYPE: &str = "application/octet-stream";

fn required(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub async fn upload_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UploadUserRequest>,
) -> Result<Json<IdResponse>, AppError> {
    let name = required(req.username)
        .ok_or_else(|| AppError::validation("upload_user", &["username"]))?;

    let user = documents::insert(
        state.documents.as_ref(),
        User {
            id: String::new(),
            name,
        },
    )
    .await
    .map_err(|err| PipelineError::from(err).into_app_error("upload_user"))?;
    Ok(Json(IdResponse { id: user.id }))
}

pub async fn upload_wish(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UploadWishRequest>,
) -> Result<Json<IdResponse>, AppError> {
    let user_id =
        required(req.user_id).ok_or_else(|| AppError::validation("upload_wish", &["userId"]))?;

    let username = match required(req.username) {
        Some(name) => name,
        None => documents::fetch_one::<User>(state.documents.as_ref(), &user_id)
            .await
            .map_err(|err| PipelineError::from(err).into_app_error("upload_wish"))?
            .map(|user| user.name)
            .unwrap_or_default(),
    };

    let wish = Wish {
        id: String::new(),
        message: req.message.unwrap_or_default(),
        user_id: Some(user_id),
        username,
        created_at: Some(chrono::Utc::now()),
    };
    let wish = documents::insert(state.documents.as_ref(), wish)
        .await
        .map_err(|err| PipelineError::from(err).into_app_error("upload_wish"))?;
    Ok(Json(IdResponse { id: wish.id }))
}

/// Record metadata for a blob that is already stored.
pub async fn upload_media(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UploadMediaRequest>,
) -> Result<Json<UploadMediaResponse>, AppError> {
    let asset = req
        .validate()
        .map_err(|missing| AppError::validation("upload_media", &missing))?;

    let result = documents::insert(state.documents.as_ref(), asset)
        .await
        .map_err(|err| PipelineError::from(err).into_app_error("upload_media"))?;
    Ok(Json(UploadMediaResponse {
        success: true,
        result,
    }))
}

#[derive(Default)]
struct SubmitForm {
    username: Option<String>,
    user_id: Option<String>,
    message: Option<String>,
    files: Vec<RawFile>,
}

async fn read_text(field: Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|err| AppError::bad_request("submit", format!("Unreadable form field: {err}")))
}

async fn read_form(mut multipart: Multipart) -> Result<SubmitForm, AppError> {
    let mut form = SubmitForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request("submit", format!("Invalid multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "username" => form.username = Some(read_text(field).await?),
            "userId" => form.user_id = Some(read_text(field).await?),
            "message" => form.message = Some(read_text(field).await?),
            "file" | "files" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let declared = field
                    .content_type()
                    .filter(|ct| !ct.is_empty() && *ct != GENERIC_CONTENT_TYPE)
                    .map(str::to_string);
                let bytes: Bytes = field.bytes().await.map_err(|err| {
                    AppError::bad_request("submit", format!("Could not read {filename}: {err}"))
                })?;
                let content_type = declared
                    .or_else(|| content_type_for_filename(&filename).map(str::to_string))
                    .unwrap_or_else(|| GENERIC_CONTENT_TYPE.to_string());
                form.files.push(RawFile {
                    filename,
                    content_type,
                    bytes,
                });
            }
            // Unknown fields are ignored.
            _ => {}
        }
    }

    Ok(form)
}

/// The whole upload form in one request: identity, files and the wish.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Attested(claims): Attested,
    Query(query): Query<SubmitQuery>,
    multipart: Multipart,
) -> Result<Json<SubmitResponse>, AppError> {
    let form = read_form(multipart).await?;

    let username = required(form.username);
    let mut missing = Vec::new();
    if username.is_none() {
        missing.push("username");
    }
    if form.files.is_empty() {
        missing.push("file");
    }
    if !missing.is_empty() {
        return Err(AppError::validation("submit", &missing));
    }
    let username = username.unwrap_or_default();

    let user = resolve_user(state.documents.as_ref(), &username, form.user_id.as_deref())
        .await
        .map_err(|err| err.into_app_error("submit"))?;
    let batch_id = query.batch_id.unwrap_or_else(Uuid::new_v4);
    let key = BatchKey::new(claims.device_id.clone(), batch_id);
    let session = Session::new(claims, user.clone());
    info!(
        %batch_id,
        files = form.files.len(),
        device = %hash_pii(&key.device_id),
        "Starting upload batch"
    );

    state.progress.start(&key);
    let report = state
        .uploader
        .upload_batch(
            &session,
            form.files,
            state.progress.reporter(key.clone()),
            state.shutdown.child_token(),
        )
        .await;
    state.progress.finish(&key);
    let report = report.map_err(|err| {
        err.into_app_error("submit")
            .with_context("batch_id", batch_id.to_string())
    })?;

    let wish = record_wish(
        state.documents.as_ref(),
        &user,
        form.message.as_deref().unwrap_or_default(),
    )
    .await
    .map_err(|err| {
        err.into_app_error("submit")
            .with_context("batch_id", batch_id.to_string())
    })?;

    Ok(Json(SubmitResponse {
        batch_id,
        user,
        media: report.uploaded,
        failed: report.failed,
        wish,
    }))
}

/// Progress of one of the caller's own batches.
pub async fn progress(
    State(state): State<Arc<AppState>>,
    Attested(claims): Attested,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<ProgressResponse>, AppError> {
    let entry = state
        .progress
        .get(&BatchKey::new(claims.device_id, batch_id))
        .ok_or_else(|| AppError::not_found("progress", "Unknown batch"))?;
    Ok(Json(ProgressResponse {
        batch_id,
        percent: entry.percent,
        finished: entry.finished,
    }))
}
