//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, Record, RecordFilter, RecordKind};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ───────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Column order: 0:seq, 1:kind, 2:key, 3:correlation_id, 4:body, 5:recorded_at
const RECORD_COLUMNS: &str = "seq, kind, key, correlation_id, body, recorded_at";

fn row_to_record(row: &libsql::Row) -> Result<Record, DatabaseError> {
    let seq: i64 = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let kind_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let key: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let correlation: Option<String> = row.get(3).ok();
    let body_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let recorded_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;

    let kind: RecordKind = kind_str.parse().map_err(DatabaseError::Serialization)?;
    let body = serde_json::from_str(&body_str)
        .map_err(|e| DatabaseError::Serialization(format!("record {seq} body: {e}")))?;

    Ok(Record {
        seq,
        kind,
        key,
        correlation_id: correlation.and_then(|s| Uuid::parse_str(&s).ok()),
        body,
        recorded_at: parse_datetime(&recorded_str),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn append(&self, record: &Record) -> Result<i64, DatabaseError> {
        let body = serde_json::to_string(&record.body)
            .map_err(|e| DatabaseError::Serialization(format!("append: {e}")))?;
        let conn = self.conn();
        let mut rows = conn
            .query(
                "INSERT INTO records (kind, key, correlation_id, body, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 RETURNING seq",
                params![
                    record.kind.as_str(),
                    record.key.clone(),
                    opt_text(record.correlation_id.map(|id| id.to_string())),
                    body,
                    record.recorded_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append: {e}")))?;

        let seq = match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("append seq: {e}")))?,
            Ok(None) => return Err(DatabaseError::Query("append: no seq returned".into())),
            Err(e) => return Err(DatabaseError::Query(format!("append: {e}"))),
        };

        debug!(seq, kind = %record.kind, key = %record.key, "Record appended");
        Ok(seq)
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, DatabaseError> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE (?1 IS NULL OR kind = ?1)
                       AND (?2 IS NULL OR key = ?2)
                       AND (?3 IS NULL OR correlation_id = ?3)
                       AND seq > ?4
                     ORDER BY seq ASC
                     LIMIT ?5"
                ),
                params![
                    opt_text(filter.kind.map(|k| k.as_str().to_string())),
                    opt_text(filter.key.clone()),
                    opt_text(filter.correlation_id.map(|id| id.to_string())),
                    filter.after_seq.unwrap_or(0),
                    limit,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("query: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("query: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn put_vector(&self, key: &str, vector: &[f32]) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO vectors (key, dimensions, data, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                dimensions = excluded.dimensions,
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![
                key,
                vector.len() as i64,
                libsql::Value::Blob(encode_vector(vector)),
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("put_vector: {e}")))?;
        Ok(())
    }

    async fn get_vector(&self, key: &str) -> Result<Option<Vec<f32>>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT data FROM vectors WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_vector: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let bytes: Vec<u8> = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(decode_vector(&bytes)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_vector: {e}"))),
        }
    }

    async fn list_vectors(&self) -> Result<Vec<(String, Vec<f32>)>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT key, data FROM vectors ORDER BY key", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_vectors: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_vectors: {e}")))?
        {
            let key: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let bytes: Vec<u8> = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            out.push((key, decode_vector(&bytes)));
        }
        Ok(out)
    }
}
