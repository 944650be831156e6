//! SQLite-backed request store.

use std::{str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    QueryBuilder, Sqlite, SqlitePool,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{RequestStore, StoreFuture};
use crate::{
    error::{CoreError, Result},
    models::{
        CallbackDelivery, DeliveryStatus, RequestFilter, RequestId, RequestMode, RequestPage,
        RequestPatch, RequestStatus, WorkInput, WorkRequest, WorkResult,
    },
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS work_requests (
        id TEXT PRIMARY KEY,
        mode TEXT NOT NULL CHECK (mode IN ('sync', 'async')),
        input_text TEXT NOT NULL,
        input_count INTEGER NOT NULL,
        callback_url TEXT,
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
        result TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        callback_status TEXT
            CHECK (callback_status IN ('pending', 'sent', 'failed') OR callback_status IS NULL),
        callback_attempts INTEGER,
        callback_last_error TEXT,
        callback_next_attempt_at TEXT,
        callback_sent_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_work_requests_mode ON work_requests(mode)",
    "CREATE INDEX IF NOT EXISTS idx_work_requests_status ON work_requests(status)",
    "CREATE INDEX IF NOT EXISTS idx_work_requests_created_at ON work_requests(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_work_requests_callback_status ON work_requests(callback_status)",
];

const COLUMNS: &str = "id, mode, input_text, input_count, callback_url, status, result, error, \
     created_at, completed_at, callback_status, callback_attempts, callback_last_error, \
     callback_next_attempt_at, callback_sent_at";

/// Request store persisting to SQLite through sqlx.
///
/// Writes are serialized through an async mutex and each one runs inside a
/// transaction, so readers always see either the old or the new record.
#[derive(Clone)]
pub struct SqliteRequestStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SqliteRequestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRequestStore").finish_non_exhaustive()
    }
}

impl SqliteRequestStore {
    /// Wraps an existing pool. Call `migrate` before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, write_lock: Arc::new(Mutex::new(())) }
    }

    /// Opens (creating if missing) the database at `url` and migrates it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the URL is invalid or the database
    /// cannot be opened.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Opens a private in-memory database with the schema applied.
    ///
    /// The pool holds exactly one connection that never expires, since every
    /// new SQLite memory connection would see an empty database.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if SQLite cannot be opened.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Creates the table and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if a DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("request store schema ready");
        Ok(())
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert(&self, request: WorkRequest) -> Result<()> {
        let row = RequestRow::from_request(&request)?;
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            "INSERT INTO work_requests (id, mode, input_text, input_count, callback_url, status, \
             result, error, created_at, completed_at, callback_status, callback_attempts, \
             callback_last_error, callback_next_attempt_at, callback_sent_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.mode)
        .bind(&row.input_text)
        .bind(row.input_count)
        .bind(&row.callback_url)
        .bind(&row.status)
        .bind(&row.result)
        .bind(&row.error)
        .bind(row.created_at)
        .bind(row.completed_at)
        .bind(&row.callback_status)
        .bind(row.callback_attempts)
        .bind(&row.callback_last_error)
        .bind(row.callback_next_attempt_at)
        .bind(row.callback_sent_at)
        .execute(&self.pool)
        .await?;

        debug!(request_id = %request.id, mode = %request.mode, "request created");
        Ok(())
    }

    async fn apply_patch(&self, id: RequestId, patch: RequestPatch) -> Result<WorkRequest> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row: Option<RequestRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM work_requests WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let mut request = WorkRequest::try_from(
            row.ok_or_else(|| CoreError::NotFound(format!("request {id}")))?,
        )?;

        request.apply(patch)?;
        let row = RequestRow::from_request(&request)?;

        sqlx::query(
            "UPDATE work_requests SET status = ?, result = ?, error = ?, completed_at = ?, \
             callback_status = ?, callback_attempts = ?, callback_last_error = ?, \
             callback_next_attempt_at = ?, callback_sent_at = ? WHERE id = ?",
        )
        .bind(&row.status)
        .bind(&row.result)
        .bind(&row.error)
        .bind(row.completed_at)
        .bind(&row.callback_status)
        .bind(row.callback_attempts)
        .bind(&row.callback_last_error)
        .bind(row.callback_next_attempt_at)
        .bind(row.callback_sent_at)
        .bind(&row.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(request)
    }

    async fn fetch(&self, id: RequestId) -> Result<WorkRequest> {
        let row: Option<RequestRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM work_requests WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| CoreError::NotFound(format!("request {id}")))?.try_into()
    }

    async fn fetch_page(&self, filter: RequestFilter) -> Result<RequestPage> {
        filter.validate()?;

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM work_requests");
        push_filters(&mut count, &filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM work_requests"));
        push_filters(&mut select, &filter);
        select
            .push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
            .push_bind(i64::from(filter.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset));
        let rows: Vec<RequestRow> = select.build_query_as().fetch_all(&self.pool).await?;

        Ok(RequestPage {
            requests: rows.into_iter().map(WorkRequest::try_from).collect::<Result<_>>()?,
            total: u64::try_from(total).unwrap_or_default(),
            limit: filter.limit,
            offset: filter.offset,
        })
    }

    async fn fetch_pending_deliveries(&self) -> Result<Vec<WorkRequest>> {
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM work_requests \
             WHERE mode = 'async' AND status = 'completed' AND callback_status = 'pending' \
             ORDER BY created_at ASC, rowid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkRequest::try_from).collect()
    }

    async fn ping(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

impl RequestStore for SqliteRequestStore {
    fn create(&self, request: WorkRequest) -> StoreFuture<'_, ()> {
        Box::pin(self.insert(request))
    }

    fn update(&self, id: RequestId, patch: RequestPatch) -> StoreFuture<'_, WorkRequest> {
        Box::pin(self.apply_patch(id, patch))
    }

    fn get(&self, id: RequestId) -> StoreFuture<'_, WorkRequest> {
        Box::pin(self.fetch(id))
    }

    fn list(&self, filter: RequestFilter) -> StoreFuture<'_, RequestPage> {
        Box::pin(self.fetch_page(filter))
    }

    fn pending_deliveries(&self) -> StoreFuture<'_, Vec<WorkRequest>> {
        Box::pin(self.fetch_pending_deliveries())
    }

    fn health_check(&self) -> StoreFuture<'_, ()> {
        Box::pin(self.ping())
    }
}

fn push_filters(query: &mut QueryBuilder<'_, Sqlite>, filter: &RequestFilter) {
    let mut separator = " WHERE ";
    if let Some(mode) = filter.mode {
        query.push(separator).push("mode = ").push_bind(mode.as_str());
        separator = " AND ";
    }
    if let Some(status) = filter.status {
        query.push(separator).push("status = ").push_bind(status.as_str());
        separator = " AND ";
    }
    if let Some(delivery_status) = filter.delivery_status {
        query.push(separator).push("callback_status = ").push_bind(delivery_status.as_str());
    }
}

/// Flat row shape of `work_requests`.
#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    id: String,
    mode: String,
    input_text: String,
    input_count: i64,
    callback_url: Option<String>,
    status: String,
    result: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    callback_status: Option<String>,
    callback_attempts: Option<i64>,
    callback_last_error: Option<String>,
    callback_next_attempt_at: Option<DateTime<Utc>>,
    callback_sent_at: Option<DateTime<Utc>>,
}

impl RequestRow {
    fn from_request(request: &WorkRequest) -> Result<Self> {
        let result = request.result.as_ref().map(serde_json::to_string).transpose()?;
        let delivery = request.delivery.as_ref();

        Ok(Self {
            id: request.id.to_string(),
            mode: request.mode.as_str().to_string(),
            input_text: request.input.text.clone(),
            input_count: i64::from(request.input.count),
            callback_url: request.callback_url.clone(),
            status: request.status.as_str().to_string(),
            result,
            error: request.error.clone(),
            created_at: request.created_at,
            completed_at: request.completed_at,
            callback_status: delivery.map(|d| d.status.as_str().to_string()),
            callback_attempts: delivery.map(|d| i64::from(d.attempts)),
            callback_last_error: delivery.and_then(|d| d.last_error.clone()),
            callback_next_attempt_at: delivery.and_then(|d| d.next_attempt_at),
            callback_sent_at: delivery.and_then(|d| d.sent_at),
        })
    }
}

impl TryFrom<RequestRow> for WorkRequest {
    type Error = CoreError;

    fn try_from(row: RequestRow) -> Result<Self> {
        let delivery = row
            .callback_status
            .as_deref()
            .map(|status| -> Result<CallbackDelivery> {
                Ok(CallbackDelivery {
                    status: DeliveryStatus::from_str(status).map_err(corrupt)?,
                    attempts: u32::try_from(row.callback_attempts.unwrap_or_default())
                        .map_err(|e| CoreError::Database(format!("bad callback_attempts: {e}")))?,
                    last_error: row.callback_last_error,
                    next_attempt_at: row.callback_next_attempt_at,
                    sent_at: row.callback_sent_at,
                })
            })
            .transpose()?;

        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str::<WorkResult>)
            .transpose()?;

        Ok(Self {
            id: RequestId::from_str(&row.id).map_err(corrupt)?,
            mode: RequestMode::from_str(&row.mode).map_err(corrupt)?,
            input: WorkInput {
                text: row.input_text,
                count: u32::try_from(row.input_count)
                    .map_err(|e| CoreError::Database(format!("bad input_count: {e}")))?,
            },
            callback_url: row.callback_url,
            status: RequestStatus::from_str(&row.status).map_err(corrupt)?,
            result,
            error: row.error,
            created_at: row.created_at,
            completed_at: row.completed_at,
            delivery,
        })
    }
}

// Parsing stored values only fails on a corrupted row.
fn corrupt(err: CoreError) -> CoreError {
    CoreError::Database(format!("corrupt row: {err}"))
}
