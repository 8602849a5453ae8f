use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::abort_multipart_upload::AbortMultipartUploadError;
use aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError;
use aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError;
use aws_sdk_s3::operation::get_object::{GetObjectError, GetObjectOutput};
use aws_sdk_s3::operation::head_object::{HeadObjectError, HeadObjectOutput};
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::operation::upload_part::UploadPartError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use sentry::Level;
use tokio::time::sleep;
use tracing::warn;

use crate::s3_throttle::S3Throttle;

/// Everything needed to talk to the media bucket.
#[derive(Clone, Debug)]
pub struct S3Bucket {
    pub client: S3Client,
    pub throttle: Arc<S3Throttle>,
    pub name: String,
}

fn parse_retry_delay<E>(err: &SdkError<E>) -> Option<Duration> {
    let resp = err.raw_response()?;
    let headers = resp.headers();

    // Retry-After can be either seconds or an HTTP-date; we only support seconds.
    if let Some(v) = headers.get("retry-after") {
        if let Ok(secs) = v.trim().parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
    }

    for key in ["ratelimit-reset", "x-ratelimit-reset", "x-rate-limit-reset"] {
        if let Some(v) = headers.get(key) {
            let trimmed = v.trim();
            if let Ok(secs) = trimmed.parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
            if let Ok(secs_f) = trimmed.parse::<f64>() {
                if secs_f.is_finite() && secs_f >= 0.0 {
                    return Some(Duration::from_secs_f64(secs_f));
                }
            }
        }
    }

    None
}

#[derive(Debug, Clone)]
pub enum S3OpError {
    TooManyRequests,
    NotFound,
    Forbidden,
    Other(String, Option<u16>),
}

impl std::fmt::Display for S3OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            S3OpError::TooManyRequests => write!(f, "storage rate limit exceeded"),
            S3OpError::NotFound => write!(f, "object not found"),
            S3OpError::Forbidden => write!(f, "storage access denied"),
            S3OpError::Other(msg, Some(status)) => write!(f, "storage error ({status}): {msg}"),
            S3OpError::Other(msg, None) => write!(f, "storage error: {msg}"),
        }
    }
}

const MAX_RETRIES: usize = 3;
const BASE_BACKOFF_MS: u64 = 120;

async fn call_with_retry<T, E, F, Fut>(throttle: &S3Throttle, make_call: F) -> Result<T, S3OpError>
where
    E: Send + Sync + std::fmt::Debug + 'static,
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, SdkError<E>>>,
{
    let mut attempt = 0;
    loop {
        let _slot = throttle
            .acquire()
            .await
            .map_err(|err| S3OpError::Other(format!("throttle closed: {err}"), None))?;
        match make_call().await {
            Ok(res) => return Ok(res),
            Err(err) => {
                let status = err.raw_response().map(|r| r.status().as_u16());
                match status {
                    // Transient 5xx and throttling are retried a bounded number of times.
                    Some(429 | 500 | 502 | 503 | 504) if attempt < MAX_RETRIES => {
                        attempt += 1;
                        let exp_backoff = Duration::from_millis(
                            BASE_BACKOFF_MS * 2u64.saturating_pow(attempt as u32),
                        );
                        let delay = match parse_retry_delay(&err) {
                            Some(h) if h > exp_backoff => h,
                            _ => exp_backoff,
                        };
                        sleep(delay).await;
                    }
                    Some(404) => return Err(S3OpError::NotFound),
                    Some(403) => return Err(S3OpError::Forbidden),
                    Some(429) => return Err(S3OpError::TooManyRequests),
                    _ => return Err(S3OpError::Other(format!("{err:?}"), status)),
                }
            }
        }
    }
}

fn log_s3_error(op: &str, bucket: &str, key: &str, err: &S3OpError) {
    // Existence checks hit NotFound all the time.
    if matches!(err, S3OpError::NotFound) {
        return;
    }

    warn!(op, bucket, key, error = %err, "S3 operation failed");

    sentry::add_breadcrumb(sentry::Breadcrumb {
        category: Some("s3_ops".into()),
        message: Some(format!("s3_ops {op} failed for {bucket}/{key}: {err:?}")),
        level: Level::Warning,
        ..Default::default()
    });

    // Captured without the key so Sentry groups them together.
    match err {
        S3OpError::Other(_, Some(status)) => {
            sentry::capture_message(&format!("s3_ops {op} status {status}"), Level::Error);
        }
        S3OpError::Other(_, None) => {
            sentry::capture_message(&format!("s3_ops {op} Other"), Level::Error);
        }
        S3OpError::Forbidden => {
            sentry::capture_message(&format!("s3_ops {op} Forbidden"), Level::Error);
        }
        S3OpError::TooManyRequests => {
            sentry::capture_message(&format!("s3_ops {op} TooManyRequests"), Level::Warning);
        }
        S3OpError::NotFound => {}
    }
}

pub async fn get_object(bucket: &S3Bucket, key: &str) -> Result<GetObjectOutput, S3OpError> {
    let res = call_with_retry::<_, GetObjectError, _, _>(&bucket.throttle, || {
        bucket.client.get_object().bucket(&bucket.name).key(key).send()
    })
    .await;

    if let Err(ref err) = res {
        log_s3_error("get_object", &bucket.name, key, err);
    }

    res
}

pub async fn head_object(bucket: &S3Bucket, key: &str) -> Result<HeadObjectOutput, S3OpError> {
    let res = call_with_retry::<_, HeadObjectError, _, _>(&bucket.throttle, || {
        bucket.client.head_object().bucket(&bucket.name).key(key).send()
    })
    .await;

    if let Err(ref err) = res {
        log_s3_error("head_object", &bucket.name, key, err);
    }

    res
}

pub async fn put_object(
    bucket: &S3Bucket,
    key: &str,
    content_type: &str,
    body: Bytes,
) -> Result<(), S3OpError> {
    let res = call_with_retry::<_, PutObjectError, _, _>(&bucket.throttle, || {
        bucket
            .client
            .put_object()
            .bucket(&bucket.name)
            .key(key)
            .content_type(content_type)
            .content_length(body.len() as i64)
            .body(ByteStream::from(body.clone()))
            .send()
    })
    .await;

    if let Err(ref err) = res {
        log_s3_error("put_object", &bucket.name, key, err);
    }

    res.map(|_| ())
}

/// Start a multipart upload and return its upload id.
pub async fn create_multipart_upload(
    bucket: &S3Bucket,
    key: &str,
    content_type: &str,
) -> Result<String, S3OpError> {
    let res = call_with_retry::<_, CreateMultipartUploadError, _, _>(&bucket.throttle, || {
        bucket
            .client
            .create_multipart_upload()
            .bucket(&bucket.name)
            .key(key)
            .content_type(content_type)
            .send()
    })
    .await
    .and_then(|out| {
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| S3OpError::Other("S3 did not return an upload id".to_string(), None))
    });

    if let Err(ref err) = res {
        log_s3_error("create_multipart_upload", &bucket.name, key, err);
    }

    res
}

pub async fn upload_part(
    bucket: &S3Bucket,
    key: &str,
    upload_id: &str,
    part_number: i32,
    body: Bytes,
) -> Result<CompletedPart, S3OpError> {
    let res = call_with_retry::<_, UploadPartError, _, _>(&bucket.throttle, || {
        bucket
            .client
            .upload_part()
            .bucket(&bucket.name)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(body.len() as i64)
            .body(ByteStream::from(body.clone()))
            .send()
    })
    .await
    .map(|out| {
        CompletedPart::builder()
            .e_tag(out.e_tag().unwrap_or_default())
            .part_number(part_number)
            .build()
    });

    if let Err(ref err) = res {
        log_s3_error("upload_part", &bucket.name, key, err);
    }

    res
}

pub async fn complete_multipart_upload(
    bucket: &S3Bucket,
    key: &str,
    upload_id: &str,
    parts: Vec<CompletedPart>,
) -> Result<(), S3OpError> {
    let completed = CompletedMultipartUpload::builder()
        .set_parts(Some(parts))
        .build();

    let res = call_with_retry::<_, CompleteMultipartUploadError, _, _>(&bucket.throttle, || {
        bucket
            .client
            .complete_multipart_upload()
            .bucket(&bucket.name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed.clone())
            .send()
    })
    .await;

    if let Err(ref err) = res {
        log_s3_error("complete_multipart_upload", &bucket.name, key, err);
    }

    res.map(|_| ())
}

pub async fn abort_multipart_upload(
    bucket: &S3Bucket,
    key: &str,
    upload_id: &str,
) -> Result<(), S3OpError> {
    let res = call_with_retry::<_, AbortMultipartUploadError, _, _>(&bucket.throttle, || {
        bucket
            .client
            .abort_multipart_upload()
            .bucket(&bucket.name)
            .key(key)
            .upload_id(upload_id)
            .send()
    })
    .await;

    if let Err(ref err) = res {
        log_s3_error("abort_multipart_upload", &bucket.name, key, err);
    }

    res.map(|_| ())
}
