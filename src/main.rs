#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
pub mod admin;
pub mod attestation;
pub mod blob_store;
pub mod config;
pub mod database;
pub mod documents;
pub mod download_proxy;
pub mod error;
pub mod gallery;
pub mod progress;
pub mod s3_ops;
pub mod s3_throttle;
pub mod session;
pub mod structs;
pub mod transcoder;
pub mod uploader;
pub mod uploads;

use std::{sync::Arc, time::Duration};

use axum::{
    extract::DefaultBodyLimit,
    http::{header::CONTENT_TYPE, HeaderName, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tokio::signal;
use tower_http::{
    classify::ServerErrorsFailureClass,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aws_sdk_s3::Client as S3Client;

use blob_store::{BlobStore, MemoryBlobStore, S3BlobStore};
use config::Config;
use database::{AppState, PostgresDocumentStore};
use documents::{DocumentStore, MemoryDocumentStore};
use s3_ops::S3Bucket;
use s3_throttle::S3Throttle;

/// The gallery page and the upload form may be served from another origin.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static(attestation::ATTESTATION_HEADER),
        ])
        .max_age(Duration::from_secs(60 * 60))
}

/// The full HTTP surface. Writes and admin reads sit behind attestation.
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_upload_bytes;

    let gated = Router::new()
        .route("/uploadUser", post(uploads::upload_user))
        .route("/uploadWish", post(uploads::upload_wish))
        .route("/uploadMedia", post(uploads::upload_media))
        .route("/submit", post(uploads::submit))
        .route("/progress/{batch_id}", get(uploads::progress))
        .merge(admin::routes(&state.config.admin_path))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            attestation::require_attestation,
        ));

    Router::new()
        .route("/attest", post(attestation::attest))
        .merge(download_proxy::routes())
        .merge(gated)
        .with_state(state)
        .layer(cors_layer())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            TraceLayer::new_for_http()
                .on_request(())
                .on_response(())
                .on_failure(on_failure),
        )
}

fn on_failure(error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span) {
    match &error {
        ServerErrorsFailureClass::StatusCode(code) => {
            // Handlers report their own errors; a 5xx here escaped that path.
            if code.is_server_error() {
                sentry::with_scope(
                    |scope| {
                        scope.set_fingerprint(Some(&["unhandled_server_error", code.as_str()]));
                        scope.set_tag("error_type", "unhandled_5xx");
                        scope.set_tag("status_code", code.as_str());
                        scope.set_extra("latency_ms", (latency.as_millis() as u64).into());
                    },
                    || {
                        sentry::capture_message(
                            &format!(
                                "UNHANDLED SERVER ERROR: {} latency={}ms",
                                code,
                                latency.as_millis()
                            ),
                            sentry::Level::Error,
                        );
                    },
                );
                tracing::error!(
                    status = %code,
                    latency_ms = %latency.as_millis(),
                    "Unhandled server error - check error handling"
                );
            }
        }
        ServerErrorsFailureClass::Error(msg) => {
            let msg_str = msg.to_string();

            // Browsers abort uploads and downloads all the time.
            let is_expected = msg_str.contains("connection reset")
                || msg_str.contains("broken pipe")
                || msg_str.contains("connection closed")
                || msg_str.contains("client disconnect");

            if !is_expected {
                sentry::with_scope(
                    |scope| {
                        scope.set_fingerprint(Some(&["protocol_error", &msg_str]));
                        scope.set_tag("error_type", "protocol");
                        scope.set_extra("latency_ms", (latency.as_millis() as u64).into());
                    },
                    || {
                        sentry::capture_message(
                            &format!("Protocol/connection error: {msg_str}"),
                            sentry::Level::Warning,
                        );
                    },
                );
            }
            tracing::warn!(
                error = %msg,
                latency_ms = %latency.as_millis(),
                expected = is_expected,
                "Connection/protocol issue"
            );
        }
    }
}

fn init_sentry(dsn: Option<String>) -> sentry::ClientInitGuard {
    sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            traces_sample_rate: 0.2,
            max_breadcrumbs: 50,
            send_default_pii: false,
            before_send: Some(Arc::new(|mut event| {
                if let Some(user) = &mut event.user {
                    user.ip_address = None;
                    user.email = None;
                    user.username = None;
                    if let Some(id) = &user.id {
                        if !id.starts_with("hash_") {
                            user.id = None;
                        }
                    }
                }

                static LAST_ERRORS: once_cell::sync::Lazy<
                    std::sync::Mutex<std::collections::HashMap<String, std::time::Instant>>,
                > = once_cell::sync::Lazy::new(|| {
                    std::sync::Mutex::new(std::collections::HashMap::new())
                });

                let event_key = format!(
                    "{}:{}:{}",
                    event.message.as_deref().unwrap_or(""),
                    event.level,
                    event
                        .exception
                        .values
                        .first()
                        .map_or("", |e| e.ty.as_str())
                );

                let mut last_errors = LAST_ERRORS
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let now = std::time::Instant::now();

                // Same event within a minute is dropped.
                if let Some(last_seen) = last_errors.get(&event_key) {
                    if now.duration_since(*last_seen).as_secs() < 60 {
                        return None;
                    }
                }
                last_errors.insert(event_key, now);
                last_errors.retain(|_, &mut v| now.duration_since(v).as_secs() < 300);

                Some(event)
            })),
            ..Default::default()
        },
    ))
}

fn init_tracing() {
    let env_filter = if cfg!(debug_assertions) {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!(
                "{}=debug,tower_http=debug,axum=trace",
                env!("CARGO_CRATE_NAME")
            )
            .into()
        })
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!(
                "{}=info,tower_http=info,axum=info",
                env!("CARGO_CRATE_NAME")
            )
            .into()
        })
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}

async fn document_store(config: &Config) -> Arc<dyn DocumentStore> {
    let Some(database_url) = &config.database_url else {
        info!("DATABASE_URL not set, keeping documents in memory");
        return Arc::new(MemoryDocumentStore::new());
    };

    let pool = database::establish_pool_connection(database_url)
        .await
        .expect("Failed to establish database connection pool");
    let store = PostgresDocumentStore::new(Arc::new(pool));
    store
        .migrate()
        .await
        .expect("Failed to create the documents table");
    Arc::new(store)
}

async fn blob_store(config: &Config) -> Arc<dyn BlobStore> {
    let Some(bucket_name) = &config.s3_bucket else {
        info!("S3_BUCKET_NAME not set, keeping media in memory");
        return Arc::new(MemoryBlobStore::default());
    };

    let region_provider = aws_config::meta::region::RegionProviderChain::default_provider()
        .or_else(aws_sdk_s3::config::Region::new(config.s3_region.clone()));
    let mut loader = aws_config::from_env().region(region_provider);
    if let Some((access_key_id, secret_access_key)) = &config.s3_credentials {
        let credentials = aws_sdk_s3::config::Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "s3-credentials",
        );
        loader = loader.credentials_provider(
            aws_sdk_s3::config::SharedCredentialsProvider::new(credentials),
        );
    }
    if let Some(endpoint) = &config.s3_endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    let s3_config = loader.load().await;

    // Most S3-compatible providers only understand path-style addressing.
    let s3_service_config = aws_sdk_s3::config::Builder::from(&s3_config)
        .force_path_style(config.s3_endpoint.is_some())
        .build();

    let bucket = S3Bucket {
        client: S3Client::from_conf(s3_service_config),
        throttle: Arc::new(S3Throttle::new(
            config.s3_max_concurrency,
            config.s3_max_rps,
        )),
        name: bucket_name.clone(),
    };
    Arc::new(S3BlobStore::new(bucket, config.multipart_part_size))
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("Invalid configuration");
    let _guard = init_sentry(config.sentry_dsn.clone());
    init_tracing();

    let documents = document_store(&config).await;
    let blobs = blob_store(&config).await;
    let bind_addr = config.bind_addr.clone();

    let state = Arc::new(
        AppState::new(config, documents, blobs).expect("Failed to initialize attestation"),
    );

    progress::start_cleanup_task(state.progress.clone());

    let shutdown = state.shutdown.clone();
    let app = app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind listener");
    info!(
        addr = %listener.local_addr().map_or(bind_addr, |a| a.to_string()),
        "listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // In-flight batches abort their uploads instead of leaving parts behind.
            shutdown.cancel();
        })
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
