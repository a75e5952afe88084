//! One storage abstraction, two engines.
//!
//! Repositories write SQL with positional `?` placeholders; the postgres
//! backend rewrites them to `$N` with a quote-aware pass. The embedded
//! backend drives rusqlite behind a shared handle, the networked backend a
//! tokio-postgres client. Transactions stay short: every call is one
//! statement, and multi-statement flows commit between steps.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rasil_core::config::{DatabaseConfig, DatabaseKind};
use tracing::info;

use crate::error::{Result, StoreError};
use crate::value::{format_timestamp, parse_timestamp, Row, Value};

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> DatabaseKind;

    /// Run a statement, returning the affected row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    async fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>>;

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run an INSERT and return the new row id.
    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> Result<i64>;
}

/// Shared database handle. Cheap to clone; all repositories take `&Database`.
#[derive(Clone)]
pub struct Database {
    backend: Arc<dyn Backend>,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.kind {
            DatabaseKind::Sqlite => {
                info!(path = %config.path, "opening sqlite database");
                Arc::new(SqliteBackend::open(&config.path)?)
            }
            DatabaseKind::Postgres => {
                let url = config.url.as_deref().ok_or_else(|| {
                    StoreError::Config("DATABASE_URL is required for PostgreSQL".into())
                })?;
                info!("connecting to postgres");
                Arc::new(PostgresBackend::connect(url).await?)
            }
        };
        Ok(Self { backend })
    }

    pub fn from_backend(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// In-memory sqlite handle for tests.
    pub fn memory() -> Result<Self> {
        Ok(Self {
            backend: Arc::new(SqliteBackend::open(":memory:")?),
        })
    }

    pub fn kind(&self) -> DatabaseKind {
        self.backend.kind()
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.backend.execute(sql, params).await
    }

    pub async fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        self.backend.fetch_one(sql, params).await
    }

    pub async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.backend.fetch_all(sql, params).await
    }

    pub async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.backend.insert_returning_id(sql, params).await
    }

    /// Current UTC time as a bindable value; each backend encodes it in its
    /// own timestamp convention.
    pub fn now(&self) -> Value {
        Value::Timestamp(chrono::Utc::now().naive_utc())
    }
}

/// Rewrite positional `?` placeholders to `$1..$N`, leaving quoted literals
/// untouched.
pub fn numbered_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0u32;
    let mut in_string = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_string = !in_string;
                out.push(ch);
            }
            '?' if !in_string => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}

impl StoreError {
    /// Unique-index violations are swallowed on the ingest path as
    /// "already ingested".
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Duplicate(_) => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
            }
            StoreError::Postgres(e) => {
                e.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
            }
            _ => false,
        }
    }
}

// ── SQLite ────────────────────────────────────────────────────────────────────

pub struct SqliteBackend {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteBackend {
    pub fn open(path: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl rusqlite::types::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value as SqlValue};
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Int(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::Text(v) => ToSqlOutput::Owned(SqlValue::Text(v.clone())),
            Value::Bool(v) => ToSqlOutput::Owned(SqlValue::Integer(*v as i64)),
            // The embedded backend stores timestamps as ISO-8601 strings.
            Value::Timestamp(v) => ToSqlOutput::Owned(SqlValue::Text(format_timestamp(v))),
        })
    }
}

fn sqlite_row_to_row(row: &rusqlite::Row<'_>, columns: &[String]) -> Result<Row> {
    use rusqlite::types::ValueRef;
    let mut values = Vec::with_capacity(columns.len());
    for i in 0..columns.len() {
        let v = match row.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::Int(n),
            ValueRef::Real(f) => Value::Float(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
        };
        values.push(v);
    }
    Ok(Row::new(columns.to_vec(), values))
}

#[async_trait]
impl Backend for SqliteBackend {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(sql, rusqlite::params_from_iter(params.iter()))?;
        Ok(n as u64)
    }

    async fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        match rows.next()? {
            Some(row) => Ok(Some(sqlite_row_to_row(row, &columns)?)),
            None => Ok(None),
        }
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(sqlite_row_to_row(row, &columns)?);
        }
        Ok(out)
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(sql, rusqlite::params_from_iter(params.iter()))?;
        Ok(conn.last_insert_rowid())
    }
}

// ── PostgreSQL ────────────────────────────────────────────────────────────────

pub struct PostgresBackend {
    client: tokio_postgres::Client,
}

impl PostgresBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "postgres connection closed");
            }
        });
        Ok(Self { client })
    }

    fn params<'a>(values: &'a [Value]) -> Vec<&'a (dyn tokio_postgres::types::ToSql + Sync)> {
        values
            .iter()
            .map(|v| v as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect()
    }
}

impl tokio_postgres::types::ToSql for Value {
    fn to_sql(
        &self,
        ty: &tokio_postgres::types::Type,
        out: &mut bytes::BytesMut,
    ) -> std::result::Result<
        tokio_postgres::types::IsNull,
        Box<dyn std::error::Error + Sync + Send>,
    > {
        use tokio_postgres::types::{IsNull, ToSql, Type};
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Int(v) => {
                if *ty == Type::INT2 {
                    (*v as i16).to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    (*v as i32).to_sql(ty, out)
                } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
                    v.to_string().to_sql(ty, out)
                } else if *ty == Type::BOOL {
                    (*v != 0).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Float(v) => {
                if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Text(v) => {
                if *ty == Type::TIMESTAMP {
                    match parse_timestamp(v) {
                        Some(dt) => dt.to_sql(ty, out),
                        None => Err(format!("cannot bind '{}' as timestamp", v).into()),
                    }
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Bool(v) => {
                if *ty == Type::BOOL {
                    v.to_sql(ty, out)
                } else {
                    (*v as i64).to_sql(ty, out)
                }
            }
            Value::Timestamp(v) => {
                if *ty == Type::TEXT || *ty == Type::VARCHAR {
                    format_timestamp(v).to_sql(ty, out)
                } else if *ty == Type::DATE {
                    v.date().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
        }
    }

    fn accepts(_ty: &tokio_postgres::types::Type) -> bool {
        true
    }

    tokio_postgres::types::to_sql_checked!();
}

fn pg_row_to_row(row: &tokio_postgres::Row) -> Result<Row> {
    use tokio_postgres::types::Type;
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (i, col) in row.columns().iter().enumerate() {
        columns.push(col.name().to_string());
        let ty = col.type_();
        let v = if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(i)?
                .map(|n| Value::Int(n as i64))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(i)?
                .map(|n| Value::Int(n as i64))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(i)?.map(Value::Int)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(i)?
                .map(|f| Value::Float(f as f64))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(i)?.map(Value::Float)
        } else if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(i)?.map(Value::Bool)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<NaiveDateTime>>(i)?
                .map(Value::Timestamp)
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<chrono::NaiveDate>>(i)?
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
        } else {
            row.try_get::<_, Option<String>>(i)?.map(Value::Text)
        };
        values.push(v.unwrap_or(Value::Null));
    }
    Ok(Row::new(columns, values))
}

#[async_trait]
impl Backend for PostgresBackend {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let sql = numbered_placeholders(sql);
        let n = self.client.execute(&sql, &Self::params(params)).await?;
        Ok(n)
    }

    async fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let sql = numbered_placeholders(sql);
        let row = self.client.query_opt(&sql, &Self::params(params)).await?;
        row.map(|r| pg_row_to_row(&r)).transpose()
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = numbered_placeholders(sql);
        let rows = self.client.query(&sql, &Self::params(params)).await?;
        rows.iter().map(pg_row_to_row).collect()
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> Result<i64> {
        let sql = format!("{} RETURNING id", numbered_placeholders(sql.trim_end()));
        let row = self.client.query_one(&sql, &Self::params(params)).await?;
        Ok(row.try_get::<_, i64>(0).or_else(|_| {
            row.try_get::<_, i32>(0).map(|n| n as i64)
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_numbered_in_order() {
        assert_eq!(
            numbered_placeholders("SELECT * FROM t WHERE a = ? AND b = ?"),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
    }

    #[test]
    fn placeholders_inside_string_literals_survive() {
        assert_eq!(
            numbered_placeholders("SELECT '?' , x FROM t WHERE y = ?"),
            "SELECT '?' , x FROM t WHERE y = $1"
        );
    }

    #[tokio::test]
    async fn sqlite_round_trip_with_typed_values() {
        let db = Database::memory().unwrap();
        db.execute(
            "CREATE TABLE probe (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, active INTEGER, seen_at TEXT)",
            &[],
        )
        .await
        .unwrap();

        // Microsecond precision: anything finer is truncated by the text
        // encoding, so the fixture stays at micros.
        let now = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_micro_opt(9, 30, 15, 123456)
            .unwrap();
        let id = db
            .insert_returning_id(
                "INSERT INTO probe (name, active, seen_at) VALUES (?, ?, ?)",
                &[Value::from("probe-1"), Value::from(true), Value::Timestamp(now)],
            )
            .await
            .unwrap();
        assert_eq!(id, 1);

        let row = db
            .fetch_one("SELECT name, active, seen_at FROM probe WHERE id = ?", &[id.into()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.text("name").unwrap(), "probe-1");
        assert!(row.bool("active").unwrap());
        assert_eq!(row.timestamp("seen_at").unwrap(), now);
    }

    #[tokio::test]
    async fn unique_violation_is_recognized() {
        let db = Database::memory().unwrap();
        db.execute("CREATE TABLE u (k TEXT UNIQUE)", &[]).await.unwrap();
        db.execute("INSERT INTO u (k) VALUES (?)", &[Value::from("a")])
            .await
            .unwrap();
        let err = db
            .execute("INSERT INTO u (k) VALUES (?)", &[Value::from("a")])
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }
}
