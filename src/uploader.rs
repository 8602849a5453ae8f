//! The media ingestion pipeline: every file of a batch is transcoded and
//! transferred concurrently, then recorded as a `MediaAsset`.

use std::sync::Arc;

use chrono::Utc;
use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob_store::{BlobStore, TransferObserver};
use crate::documents::{self, DocumentStore};
use crate::download_proxy;
use crate::error::PipelineError;
use crate::progress::{ProgressAccumulator, ProgressFn};
use crate::session::Session;
use crate::structs::{FailedUpload, MediaAsset, User, Wish};
use crate::transcoder::{RawFile, Transcoder};

const MAX_FILENAME_LEN: usize = 200;

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Stored assets in completion order.
    pub uploaded: Vec<MediaAsset>,
    pub failed: Vec<FailedUpload>,
}

pub struct BatchUploader {
    blobs: Arc<dyn BlobStore>,
    documents: Arc<dyn DocumentStore>,
    transcoder: Arc<Transcoder>,
    public_base_url: String,
    concurrency: usize,
}

impl BatchUploader {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        documents: Arc<dyn DocumentStore>,
        transcoder: Arc<Transcoder>,
        public_base_url: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            blobs,
            documents,
            transcoder,
            public_base_url: public_base_url.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Upload every file for the session's user.
    ///
    /// Files succeed or fail independently. The batch itself only fails when
    /// the session is not attested or has no resolved user.
    pub async fn upload_batch(
        &self,
        session: &Session,
        files: Vec<RawFile>,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<BatchReport, PipelineError> {
        let (_, user) = session.require()?;

        let progress = Arc::new(ProgressAccumulator::new(
            files.iter().map(RawFile::size).collect(),
            on_progress,
        ));
        let file_count = files.len();

        let outcomes: Vec<(String, Result<MediaAsset, PipelineError>)> =
            stream::iter(files.into_iter().enumerate())
                .map(|(index, file)| {
                    let observer = progress.observer(index);
                    let cancel = cancel.child_token();
                    async move {
                        let outcome = self.upload_one(user, &file, &observer, &cancel).await;
                        (file.filename, outcome)
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        progress.finish_empty();

        let mut report = BatchReport::default();
        for (filename, outcome) in outcomes {
            match outcome {
                Ok(asset) => report.uploaded.push(asset),
                Err(err) => {
                    warn!(filename = %filename, error = %err, "Upload failed");
                    report.failed.push(FailedUpload {
                        filename,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            user_id = %user.id,
            files = file_count,
            uploaded = report.uploaded.len(),
            failed = report.failed.len(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Transfer and transcode one file side by side, then record it.
    async fn upload_one(
        &self,
        user: &User,
        file: &RawFile,
        observer: &dyn TransferObserver,
        cancel: &CancellationToken,
    ) -> Result<MediaAsset, PipelineError> {
        let key = object_key(&file.filename);

        let (transfer, preview) = tokio::join!(
            self.blobs
                .put(&key, file.bytes.clone(), &file.content_type, observer, cancel),
            self.transcoder.transcode(file),
        );
        transfer?;

        let preview = preview.unwrap_or_else(|err| {
            warn!(filename = %file.filename, error = %err, "No preview for upload");
            sentry::add_breadcrumb(sentry::Breadcrumb {
                category: Some("transcoder".into()),
                message: Some(format!("empty preview for {}: {err}", file.filename)),
                level: sentry::Level::Warning,
                ..Default::default()
            });
            String::new()
        });

        // The blob is stored; a cancel arriving now must not leave it unrecorded.
        let asset = MediaAsset {
            id: String::new(),
            filename: file.filename.clone(),
            mime_type: file.content_type.clone(),
            size: file.size(),
            user_id: Some(user.id.clone()),
            username: user.name.clone(),
            preview,
            download_url: download_proxy::download_url(&self.public_base_url, &key),
            created_at: Some(Utc::now()),
        };

        Ok(documents::insert(self.documents.as_ref(), asset).await?)
    }
}

/// Store the wish that came with an upload. Empty messages are stored too.
pub async fn record_wish(
    store: &dyn DocumentStore,
    user: &User,
    message: &str,
) -> Result<Wish, PipelineError> {
    let wish = Wish {
        id: String::new(),
        message: message.to_string(),
        user_id: Some(user.id.clone()),
        username: user.name.clone(),
        created_at: Some(Utc::now()),
    };
    Ok(documents::insert(store, wish).await?)
}

/// Blob key for a new upload. The random segment keeps same-named files apart.
#[must_use]
pub fn object_key(filename: &str) -> String {
    format!(
        "{}{}/{}",
        download_proxy::MEDIA_PREFIX,
        Uuid::new_v4(),
        sanitize_filename(filename)
    )
}

/// Reduce a client-supplied name to a single safe path segment.
#[must_use]
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_LEN)
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
