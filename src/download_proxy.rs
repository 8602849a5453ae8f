use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use futures::TryStreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::warn;

use crate::blob_store::BlobError;
use crate::database::AppState;
use crate::error::AppError;
use crate::structs::DownloadQuery;

/// Every upload lives under this prefix; locators carry the rest of the key.
pub const MEDIA_PREFIX: &str = "media/";
const LEGACY_PREFIX: &str = "media_/";

const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/downloadFile", get(download_file))
}

/// Durable locator for a stored blob, served by [`download_file`].
#[must_use]
pub fn download_url(public_base_url: &str, key: &str) -> String {
    let file_path = key.strip_prefix(MEDIA_PREFIX).unwrap_or(key);
    format!(
        "{}/downloadFile?filePath={}",
        public_base_url.trim_end_matches('/'),
        utf8_percent_encode(file_path, QUERY_VALUE)
    )
}

/// Map a `filePath` query value back to its blob key, refusing anything that
/// could climb out of the media prefix.
fn key_for_file_path(file_path: &str) -> Result<String, AppError> {
    let invalid = file_path.starts_with('/')
        || file_path.contains('\\')
        || file_path.split('/').any(|seg| seg.is_empty() || seg == "..");
    if invalid {
        return Err(AppError::bad_request("download_file", "Invalid file path"));
    }
    Ok(format!("{MEDIA_PREFIX}{file_path}"))
}

/// Name the browser saves the file under.
fn attachment_filename(file_path: &str) -> String {
    let path = file_path.strip_prefix(LEGACY_PREFIX).unwrap_or(file_path);
    path.rsplit('/')
        .next()
        .unwrap_or(path)
        .replace(['"', '\r', '\n'], "_")
}

// Streams the blob through the service so the browser downloads instead of displaying it.
pub(crate) async fn download_file(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let file_path = query
        .file_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("download_file", "File path is required"))?;
    let key = key_for_file_path(&file_path)?;

    let storage_err = |err: BlobError| {
        AppError::internal("download_file", err)
            .with_message("Download failed")
            .with_context("file_path", file_path.clone())
    };

    if !state.blobs.exists(&key).await.map_err(storage_err)? {
        return Err(AppError::not_found("download_file", "File not found"));
    }

    let metadata = state.blobs.metadata(&key).await.map_err(storage_err)?;
    let stream = state.blobs.get(&key).await.map_err(storage_err)?;

    let logged_path = file_path.clone();
    let body = Body::from_stream(stream.inspect_err(move |err| {
        warn!(file_path = %logged_path, error = %err, "Download stream failed");
    }));

    let content_type = metadata
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let disposition = format!(
        "attachment; filename=\"{}\"",
        attachment_filename(&file_path)
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CONTENT_LENGTH, metadata.size)
        .body(body)
        .map_err(|err| AppError::internal("download_file", err).with_message("Download failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStore, NoProgress};
    use crate::database::AppState;
    use axum::http::Request;
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    #[test]
    fn locator_round_trips_to_the_key() {
        let url = download_url("http://gallery.test/", "media/abc/My Photo.jpg");
        assert_eq!(
            url,
            "http://gallery.test/downloadFile?filePath=abc%2FMy%20Photo.jpg"
        );
        assert_eq!(
            key_for_file_path("abc/My Photo.jpg").unwrap(),
            "media/abc/My Photo.jpg"
        );
    }

    #[test]
    fn traversal_is_refused() {
        for path in ["../secret", "a/../../b", "/etc/passwd", "a//b", "a\\b"] {
            assert!(key_for_file_path(path).is_err(), "{path}");
        }
    }

    #[test]
    fn attachment_name_drops_directories_and_legacy_prefix() {
        assert_eq!(attachment_filename("abc/cake.jpg"), "cake.jpg");
        assert_eq!(attachment_filename("media_/cake.jpg"), "cake.jpg");
        assert_eq!(attachment_filename("we\"ird.jpg"), "we_ird.jpg");
    }

    async fn call(state: Arc<AppState>, uri: &str) -> Response {
        routes()
            .with_state(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn existing_file_is_served_as_attachment() {
        let state = AppState::for_tests();
        state
            .blobs
            .put(
                "media/abc/cake.jpg",
                Bytes::from_static(b"jpeg bytes"),
                "image/jpeg",
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let response = call(state, "/downloadFile?filePath=abc%2Fcake.jpg").await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"cake.jpg\""
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"jpeg bytes");
    }

    #[tokio::test]
    async fn missing_path_is_bad_request() {
        let response = call(AppState::for_tests(), "/downloadFile").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn absent_file_is_not_found() {
        let response = call(AppState::for_tests(), "/downloadFile?filePath=abc%2Fnone.jpg").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
