use std::sync::Arc;

use async_trait::async_trait;
use bb8_postgres::bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use serde_json::{Map, Value};
use tokio_postgres::{NoTls, Row};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::attestation::{AttestationError, AttestationService};
use crate::blob_store::BlobStore;
use crate::config::Config;
use crate::documents::{Collection, Document, DocumentStore, StoreError};
use crate::progress::ProgressRegistry;
use crate::transcoder::{FfmpegFrameExtractor, Transcoder};
use crate::uploader::BatchUploader;

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

pub type SharedConn =
    bb8_postgres::bb8::PooledConnection<'static, PostgresConnectionManager<tokio_postgres::NoTls>>;

pub struct AppState {
    pub config: Config,
    pub documents: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub attestation: AttestationService,
    pub uploader: BatchUploader,
    pub progress: ProgressRegistry,
    /// Cancelled on shutdown; every batch runs on a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, AttestationError> {
        let attestation =
            AttestationService::new(config.attestation_secret.clone(), config.attestation_ttl)?;
        let transcoder = Arc::new(Transcoder::new(
            config.preview_max_dimension,
            Arc::new(FfmpegFrameExtractor::new(config.ffmpeg_path.clone())),
        ));
        let uploader = BatchUploader::new(
            blobs.clone(),
            documents.clone(),
            transcoder,
            config.public_base_url.clone(),
            config.upload_concurrency,
        );

        Ok(Self {
            config,
            documents,
            blobs,
            attestation,
            uploader,
            progress: ProgressRegistry::new(),
            shutdown: CancellationToken::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Self> {
        use crate::blob_store::MemoryBlobStore;
        use crate::documents::MemoryDocumentStore;

        Arc::new(
            Self::new(
                crate::config::test_config(),
                Arc::new(MemoryDocumentStore::new()),
                Arc::new(MemoryBlobStore::default()),
            )
            .expect("test state"),
        )
    }
}

pub async fn establish_pool_connection(
    database_url: &str,
) -> Result<PgPool, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let conn_manager = PostgresConnectionManager::new_from_stringlike(database_url, NoTls)?;

    let pool = Pool::builder()
        .min_idle(Some(1))
        .max_size(15)
        .build(conn_manager)
        .await?;
    Ok(pool)
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        seq         BIGSERIAL PRIMARY KEY,
        id          UUID NOT NULL UNIQUE,
        collection  TEXT NOT NULL,
        body        JSONB NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    CREATE INDEX IF NOT EXISTS documents_collection_seq ON documents (collection, seq);
    CREATE INDEX IF NOT EXISTS documents_body ON documents USING GIN (body jsonb_path_ops);
";

/// Documents as jsonb rows in one table, ordered by insertion.
pub struct PostgresDocumentStore {
    pool: Arc<PgPool>,
}

impl PostgresDocumentStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        let client = self.conn().await?;
        client.batch_execute(SCHEMA).await.map_err(backend)?;
        Ok(())
    }

    async fn conn(&self) -> Result<SharedConn, StoreError> {
        self.pool
            .get_owned()
            .await
            .map_err(|err| StoreError::Backend(format!("pool: {err}")))
    }
}

fn backend(err: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn row_to_document(row: &Row) -> Result<Document, StoreError> {
    let id: Uuid = row.try_get(0).map_err(backend)?;
    let body: Value = row.try_get(1).map_err(backend)?;
    let fields = match body {
        Value::Object(map) => map,
        other => {
            return Err(StoreError::Schema(format!(
                "document {id} body is not an object: {other}"
            )))
        }
    };
    Ok(Document {
        id: id.to_string(),
        fields,
    })
}

fn rows_to_documents(rows: &[Row]) -> Vec<Document> {
    rows.iter()
        .filter_map(|row| match row_to_document(row) {
            Ok(doc) => Some(doc),
            Err(err) => {
                tracing::warn!(error = %err, "Skipping unreadable document row");
                None
            }
        })
        .collect()
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn add(
        &self,
        collection: Collection,
        record: Map<String, Value>,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4();
        let client = self.conn().await?;
        client
            .execute(
                "INSERT INTO documents (id, collection, body) VALUES ($1, $2, $3)",
                &[&id, &collection.as_str(), &Value::Object(record)],
            )
            .await
            .map_err(backend)?;
        Ok(id.to_string())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        // Ids are always UUIDs here, anything else cannot exist.
        let Ok(id) = Uuid::parse_str(id) else {
            return Ok(None);
        };
        let client = self.conn().await?;
        let row = client
            .query_opt(
                "SELECT id, body FROM documents WHERE collection = $1 AND id = $2",
                &[&collection.as_str(), &id],
            )
            .await
            .map_err(backend)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Document>, StoreError> {
        let client = self.conn().await?;
        let rows = client
            .query(
                "SELECT id, body FROM documents WHERE collection = $1 ORDER BY seq",
                &[&collection.as_str()],
            )
            .await
            .map_err(backend)?;
        Ok(rows_to_documents(&rows))
    }

    async fn query(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, StoreError> {
        let mut filter = Map::new();
        filter.insert(field.to_string(), value.clone());
        let filter = Value::Object(filter);

        let client = self.conn().await?;
        let rows = client
            .query(
                "SELECT id, body FROM documents WHERE collection = $1 AND body @> $2 ORDER BY seq",
                &[&collection.as_str(), &filter],
            )
            .await
            .map_err(backend)?;
        Ok(rows_to_documents(&rows))
    }
}
