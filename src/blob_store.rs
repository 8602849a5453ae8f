//! Blob storage for original media bytes.
//!
//! Writes are chunked so the caller can observe cumulative progress and
//! cancel mid-transfer. The S3 backend maps chunks onto multipart parts.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use aws_sdk_s3::types::CompletedPart;
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::s3_ops::{self, S3Bucket, S3OpError};

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Receives the cumulative number of bytes written so far for one blob.
/// A retried chunk may report a lower count than a previous call.
pub trait TransferObserver: Send + Sync {
    fn on_transferred(&self, cumulative: u64);
}

/// Observer for callers that do not track progress.
pub struct NoProgress;

impl TransferObserver for NoProgress {
    fn on_transferred(&self, _cumulative: u64) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    pub content_type: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    NotFound,
    Cancelled,
    Transfer(String),
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::NotFound => write!(f, "blob not found"),
            BlobError::Cancelled => write!(f, "transfer cancelled"),
            BlobError::Transfer(msg) => write!(f, "transfer failed: {msg}"),
        }
    }
}

impl std::error::Error for BlobError {}

impl From<S3OpError> for BlobError {
    fn from(err: S3OpError) -> Self {
        match err {
            S3OpError::NotFound => BlobError::NotFound,
            other => BlobError::Transfer(other.to_string()),
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `key`, reporting progress after every chunk.
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        observer: &dyn TransferObserver,
        cancel: &CancellationToken,
    ) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<ByteStream, BlobError>;

    async fn exists(&self, key: &str) -> Result<bool, BlobError>;

    async fn metadata(&self, key: &str) -> Result<BlobMetadata, BlobError>;
}

/// The object-store calls a write is made of.
#[async_trait]
pub trait PartSink: Send + Sync {
    async fn put_object(&self, key: &str, content_type: &str, body: Bytes) -> Result<(), S3OpError>;

    async fn create_multipart(&self, key: &str, content_type: &str) -> Result<String, S3OpError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, S3OpError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), S3OpError>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), S3OpError>;
}

#[async_trait]
impl PartSink for S3Bucket {
    async fn put_object(
        &self,
        key: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<(), S3OpError> {
        s3_ops::put_object(self, key, content_type, body).await
    }

    async fn create_multipart(&self, key: &str, content_type: &str) -> Result<String, S3OpError> {
        s3_ops::create_multipart_upload(self, key, content_type).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, S3OpError> {
        s3_ops::upload_part(self, key, upload_id, part_number, body).await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), S3OpError> {
        s3_ops::complete_multipart_upload(self, key, upload_id, parts).await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), S3OpError> {
        s3_ops::abort_multipart_upload(self, key, upload_id).await
    }
}

/// Write `bytes` through `sink`: one request when it fits a part, otherwise a
/// multipart upload that reports progress per part and is aborted on failure
/// or cancellation.
pub async fn put_chunked(
    sink: &dyn PartSink,
    part_size: usize,
    key: &str,
    bytes: Bytes,
    content_type: &str,
    observer: &dyn TransferObserver,
    cancel: &CancellationToken,
) -> Result<(), BlobError> {
    if cancel.is_cancelled() {
        return Err(BlobError::Cancelled);
    }

    if bytes.len() <= part_size {
        let len = bytes.len() as u64;
        tokio::select! {
            () = cancel.cancelled() => return Err(BlobError::Cancelled),
            res = sink.put_object(key, content_type, bytes) => res?,
        }
        observer.on_transferred(len);
        return Ok(());
    }

    let upload_id = sink.create_multipart(key, content_type).await?;

    match upload_parts(sink, part_size, key, &upload_id, bytes, observer, cancel).await {
        Ok(parts) => {
            sink.complete_multipart(key, &upload_id, parts).await?;
            Ok(())
        }
        Err(err) => {
            // Leaving the upload open keeps the parts billed forever.
            if let Err(abort_err) = sink.abort_multipart(key, &upload_id).await {
                debug!(key, error = %abort_err, "Abort of multipart upload failed");
            }
            Err(err)
        }
    }
}

async fn upload_parts(
    sink: &dyn PartSink,
    part_size: usize,
    key: &str,
    upload_id: &str,
    bytes: Bytes,
    observer: &dyn TransferObserver,
    cancel: &CancellationToken,
) -> Result<Vec<CompletedPart>, BlobError> {
    let mut parts = Vec::new();
    let mut offset = 0usize;
    let mut part_number = 1i32;

    while offset < bytes.len() {
        let end = (offset + part_size).min(bytes.len());
        let chunk = bytes.slice(offset..end);

        let part = tokio::select! {
            () = cancel.cancelled() => return Err(BlobError::Cancelled),
            res = sink.upload_part(key, upload_id, part_number, chunk) => res?,
        };
        parts.push(part);

        offset = end;
        part_number += 1;
        observer.on_transferred(offset as u64);
    }

    Ok(parts)
}

pub struct S3BlobStore {
    bucket: S3Bucket,
    part_size: usize,
}

impl S3BlobStore {
    #[must_use]
    pub fn new(bucket: S3Bucket, part_size: usize) -> Self {
        Self { bucket, part_size }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        observer: &dyn TransferObserver,
        cancel: &CancellationToken,
    ) -> Result<(), BlobError> {
        put_chunked(
            &self.bucket,
            self.part_size,
            key,
            bytes,
            content_type,
            observer,
            cancel,
        )
        .await
    }

    async fn get(&self, key: &str) -> Result<ByteStream, BlobError> {
        let object = s3_ops::get_object(&self.bucket, key).await?;
        let reader = object.body.into_async_read();
        Ok(Box::pin(ReaderStream::new(reader)))
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        match s3_ops::head_object(&self.bucket, key).await {
            Ok(_) => Ok(true),
            Err(S3OpError::NotFound) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn metadata(&self, key: &str) -> Result<BlobMetadata, BlobError> {
        let head = s3_ops::head_object(&self.bucket, key).await?;
        Ok(BlobMetadata {
            content_type: head.content_type().map(str::to_string),
            size: head.content_length().unwrap_or_default().max(0) as u64,
        })
    }
}

#[derive(Clone)]
struct StoredBlob {
    bytes: Bytes,
    content_type: String,
}

/// Process-local blob store. Writes in fixed chunks and yields between them
/// so that concurrent transfers interleave the way network writes do.
pub struct MemoryBlobStore {
    chunk_size: usize,
    blobs: RwLock<HashMap<String, StoredBlob>>,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::with_chunk_size(64 * 1024)
    }
}

impl MemoryBlobStore {
    #[must_use]
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn keys(&self) -> Vec<String> {
        self.blobs.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        observer: &dyn TransferObserver,
        cancel: &CancellationToken,
    ) -> Result<(), BlobError> {
        let mut written = 0usize;
        while written < bytes.len() {
            if cancel.is_cancelled() {
                return Err(BlobError::Cancelled);
            }
            written = (written + self.chunk_size).min(bytes.len());
            observer.on_transferred(written as u64);
            tokio::task::yield_now().await;
        }
        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }
        if bytes.is_empty() {
            observer.on_transferred(0);
        }

        self.blobs.write().await.insert(
            key.to_string(),
            StoredBlob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ByteStream, BlobError> {
        let blob = self
            .blobs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or(BlobError::NotFound)?;

        let chunk_size = self.chunk_size;
        let chunks: Vec<std::io::Result<Bytes>> = (0..blob.bytes.len())
            .step_by(chunk_size)
            .map(|start| {
                let end = (start + chunk_size).min(blob.bytes.len());
                Ok(blob.bytes.slice(start..end))
            })
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        Ok(self.blobs.read().await.contains_key(key))
    }

    async fn metadata(&self, key: &str) -> Result<BlobMetadata, BlobError> {
        self.blobs
            .read()
            .await
            .get(key)
            .map(|blob| BlobMetadata {
                content_type: Some(blob.content_type.clone()),
                size: blob.bytes.len() as u64,
            })
            .ok_or(BlobError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u64>>);

    impl TransferObserver for Recorder {
        fn on_transferred(&self, cumulative: u64) {
            self.0.lock().unwrap().push(cumulative);
        }
    }

    #[tokio::test]
    async fn memory_put_reports_cumulative_chunks() {
        let store = MemoryBlobStore::with_chunk_size(4);
        let recorder = Recorder::default();
        store
            .put(
                "media/a/file.bin",
                Bytes::from_static(b"0123456789"),
                "application/octet-stream",
                &recorder,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![4, 8, 10]);
        let meta = store.metadata("media/a/file.bin").await.unwrap();
        assert_eq!(meta.size, 10);
        assert_eq!(meta.content_type.as_deref(), Some("application/octet-stream"));
    }

    #[tokio::test]
    async fn memory_get_streams_back_the_original_bytes() {
        let store = MemoryBlobStore::with_chunk_size(3);
        store
            .put(
                "k",
                Bytes::from_static(b"hello world"),
                "text/plain",
                &NoProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut body = Vec::new();
        let mut stream = store.get("k").await.unwrap();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn cancelled_put_stores_nothing() {
        let store = MemoryBlobStore::with_chunk_size(2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = store
            .put("k", Bytes::from_static(b"abcdef"), "text/plain", &NoProgress, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, BlobError::Cancelled);
        assert!(!store.exists("k").await.unwrap());
    }

    /// Records every call. Part `fail_part` errors; reaching `hang_from_part`
    /// cancels `cancel` and never returns.
    #[derive(Default)]
    struct ScriptedSink {
        calls: Mutex<Vec<String>>,
        fail_part: Option<i32>,
        hang_from_part: Option<i32>,
        cancel: CancellationToken,
    }

    impl ScriptedSink {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PartSink for ScriptedSink {
        async fn put_object(
            &self,
            key: &str,
            _content_type: &str,
            body: Bytes,
        ) -> Result<(), S3OpError> {
            self.log(format!("put {key} {}", body.len()));
            Ok(())
        }

        async fn create_multipart(
            &self,
            key: &str,
            _content_type: &str,
        ) -> Result<String, S3OpError> {
            self.log(format!("create {key}"));
            Ok("upload-1".to_string())
        }

        async fn upload_part(
            &self,
            _key: &str,
            upload_id: &str,
            part_number: i32,
            body: Bytes,
        ) -> Result<CompletedPart, S3OpError> {
            if self.hang_from_part.is_some_and(|n| part_number >= n) {
                self.cancel.cancel();
                std::future::pending::<()>().await;
            }
            self.log(format!("part {upload_id} {part_number} {}", body.len()));
            if self.fail_part == Some(part_number) {
                return Err(S3OpError::Other("slow down".into(), Some(503)));
            }
            Ok(CompletedPart::builder()
                .part_number(part_number)
                .e_tag(format!("etag-{part_number}"))
                .build())
        }

        async fn complete_multipart(
            &self,
            _key: &str,
            upload_id: &str,
            parts: Vec<CompletedPart>,
        ) -> Result<(), S3OpError> {
            let numbers: Vec<String> = parts
                .iter()
                .map(|p| p.part_number().unwrap_or_default().to_string())
                .collect();
            self.log(format!("complete {upload_id} [{}]", numbers.join(",")));
            Ok(())
        }

        async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), S3OpError> {
            self.log(format!("abort {upload_id}"));
            Ok(())
        }
    }

    async fn put_ten_bytes(
        sink: &ScriptedSink,
        part_size: usize,
        recorder: &Recorder,
    ) -> Result<(), BlobError> {
        put_chunked(
            sink,
            part_size,
            "media/x/clip.mp4",
            Bytes::from_static(b"0123456789"),
            "video/mp4",
            recorder,
            &sink.cancel,
        )
        .await
    }

    #[tokio::test]
    async fn small_object_is_a_single_put() {
        let sink = ScriptedSink::default();
        let recorder = Recorder::default();
        put_ten_bytes(&sink, 10, &recorder).await.unwrap();
        assert_eq!(sink.calls(), vec!["put media/x/clip.mp4 10"]);
        assert_eq!(*recorder.0.lock().unwrap(), vec![10]);
    }

    #[tokio::test]
    async fn large_object_is_split_into_parts_with_progress_per_part() {
        let sink = ScriptedSink::default();
        let recorder = Recorder::default();
        put_ten_bytes(&sink, 4, &recorder).await.unwrap();
        assert_eq!(
            sink.calls(),
            vec![
                "create media/x/clip.mp4",
                "part upload-1 1 4",
                "part upload-1 2 4",
                "part upload-1 3 2",
                "complete upload-1 [1,2,3]",
            ]
        );
        assert_eq!(*recorder.0.lock().unwrap(), vec![4, 8, 10]);
    }

    #[tokio::test]
    async fn failed_part_aborts_the_upload() {
        let sink = ScriptedSink {
            fail_part: Some(2),
            ..Default::default()
        };
        let recorder = Recorder::default();
        let err = put_ten_bytes(&sink, 4, &recorder).await.unwrap_err();
        assert!(matches!(err, BlobError::Transfer(msg) if msg.contains("503")));
        assert_eq!(
            sink.calls(),
            vec![
                "create media/x/clip.mp4",
                "part upload-1 1 4",
                "part upload-1 2 4",
                "abort upload-1",
            ]
        );
        assert_eq!(*recorder.0.lock().unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn cancel_during_a_part_aborts_the_upload() {
        let sink = ScriptedSink {
            hang_from_part: Some(2),
            ..Default::default()
        };
        let recorder = Recorder::default();
        let err = put_ten_bytes(&sink, 4, &recorder).await.unwrap_err();
        assert_eq!(err, BlobError::Cancelled);
        assert_eq!(
            sink.calls(),
            vec!["create media/x/clip.mp4", "part upload-1 1 4", "abort upload-1"]
        );
        assert_eq!(*recorder.0.lock().unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let store = MemoryBlobStore::default();
        assert!(matches!(store.get("nope").await, Err(BlobError::NotFound)));
        assert_eq!(store.metadata("nope").await, Err(BlobError::NotFound));
    }
}
