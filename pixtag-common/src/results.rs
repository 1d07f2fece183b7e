//! Results Store: append-only classification records
//!
//! One row per classified image link. Rows are never updated; reclassifying
//! an image appends a new row and the "latest" view picks the newest one
//! (highest timestamp, then highest id).
//!
//! The table layout is fixed columns plus one column per compiled schema
//! field. Repeated fields are stored as JSON text.

use crate::db::{checked_table_name, retry_on_lock, table_columns, table_exists};
use crate::schema::validate::exact_i64;
use crate::schema::{FieldType, OutputSchema, Primitive};
use crate::{Error, ImageMetadata, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{query::Query, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed columns in table order, with their SQLite definitions
const FIXED_SQL_COLUMNS: &[(&str, &str)] = &[
    ("id", "INTEGER PRIMARY KEY AUTOINCREMENT"),
    ("offer_id", "TEXT NOT NULL"),
    ("merchant_id", "INTEGER NOT NULL"),
    ("aggregator_id", "INTEGER NOT NULL"),
    ("image_link", "TEXT NOT NULL"),
    ("mime_type", "TEXT NOT NULL"),
    ("byte_size", "INTEGER NOT NULL"),
    ("content_hash", "TEXT NOT NULL"),
    ("timestamp", "TEXT NOT NULL"),
];

const APPEND_MAX_LOCK_WAIT: Duration = Duration::from_secs(10);

/// One row to append
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledImageRow {
    pub offer_id: String,
    pub merchant_id: i64,
    pub aggregator_id: i64,
    pub image_link: String,
    #[serde(flatten)]
    pub metadata: ImageMetadata,
    /// Validated model output, keyed by schema field name
    pub fields: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// A row read back from the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub id: i64,
    #[serde(flatten)]
    pub row: LabeledImageRow,
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name)
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed width so text ordering matches time ordering
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn expected_columns(schema: &OutputSchema) -> Vec<String> {
    FIXED_SQL_COLUMNS
        .iter()
        .map(|(name, _)| name.to_string())
        .chain(schema.storage_columns().into_iter().map(|(name, _)| name))
        .collect()
}

/// Create the results table for `schema`, or verify an existing one matches.
///
/// A table whose columns differ from the compiled schema is not altered; it
/// must be reprovisioned by hand.
pub async fn provision(pool: &SqlitePool, table: &str, schema: &OutputSchema) -> Result<()> {
    let table = checked_table_name(table)?;

    if table_exists(pool, &table).await? {
        verify_columns(pool, &table, schema).await?;
        info!(table = %table, "Results table already provisioned");
        return Ok(());
    }

    let mut columns: Vec<String> = FIXED_SQL_COLUMNS
        .iter()
        .map(|(name, def)| format!("{} {}", quoted(name), def))
        .collect();
    for (name, sql_type) in schema.storage_columns() {
        columns.push(format!("{} {}", quoted(&name), sql_type));
    }

    sqlx::query(&format!(
        "CREATE TABLE {} (\n    {}\n)",
        table,
        columns.join(",\n    ")
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_image_link ON {table}(image_link, timestamp)",
        table = table
    ))
    .execute(pool)
    .await?;

    info!(
        table = %table,
        schema = schema.name(),
        fields = schema.fields().len(),
        "Provisioned results table"
    );
    Ok(())
}

async fn verify_columns(pool: &SqlitePool, table: &str, schema: &OutputSchema) -> Result<()> {
    let actual = table_columns(pool, table).await?;
    let expected = expected_columns(schema);

    if actual != expected {
        let missing: Vec<&String> = expected.iter().filter(|c| !actual.contains(c)).collect();
        let extra: Vec<&String> = actual.iter().filter(|c| !expected.contains(c)).collect();
        return Err(Error::SchemaMismatch {
            table: table.to_string(),
            detail: format!("missing columns {:?}, unexpected columns {:?}", missing, extra),
        });
    }

    Ok(())
}

/// Distinct image links with at least one row.
///
/// A results table that was never provisioned has classified nothing.
pub async fn classified_image_links(pool: &SqlitePool, table: &str) -> Result<HashSet<String>> {
    let table = checked_table_name(table)?;

    if !table_exists(pool, &table).await? {
        warn!(table = %table, "Results table not provisioned; treating every image as new");
        return Ok(HashSet::new());
    }

    let links: Vec<String> = sqlx::query_scalar(&format!("SELECT DISTINCT image_link FROM {}", table))
        .fetch_all(pool)
        .await?;

    Ok(links.into_iter().collect())
}

/// Typed access to a provisioned results table
#[derive(Debug, Clone)]
pub struct ResultsStore {
    pool: SqlitePool,
    table: String,
    schema: OutputSchema,
}

impl ResultsStore {
    /// Attach to an existing table, failing if it is missing or stale
    pub async fn open(pool: SqlitePool, table: &str, schema: OutputSchema) -> Result<Self> {
        let table = checked_table_name(table)?;

        if !table_exists(&pool, &table).await? {
            return Err(Error::Config(format!(
                "results table '{}' is not provisioned; run pixtag-provision",
                table
            )));
        }
        verify_columns(&pool, &table, &schema).await?;

        Ok(Self {
            pool,
            table,
            schema,
        })
    }

    /// Provision (if needed) and attach
    pub async fn provision(pool: SqlitePool, table: &str, schema: OutputSchema) -> Result<Self> {
        provision(&pool, table, &schema).await?;
        Self::open(pool, table, schema).await
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    /// Append rows in one transaction. Returns the number written.
    pub async fn append(&self, rows: &[LabeledImageRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        retry_on_lock("results append", APPEND_MAX_LOCK_WAIT, || self.append_once(rows)).await?;

        debug!(table = %self.table, rows = rows.len(), "Appended results");
        Ok(rows.len())
    }

    async fn append_once(&self, rows: &[LabeledImageRow]) -> Result<()> {
        let mut names: Vec<String> = FIXED_SQL_COLUMNS[1..]
            .iter()
            .map(|(name, _)| quoted(name))
            .collect();
        names.extend(self.schema.fields().iter().map(|f| quoted(&f.name)));
        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            names.join(", "),
            placeholders
        );

        let mut tx = self.pool.begin().await?;

        for row in rows {
            let mut query = sqlx::query(&sql)
                .bind(&row.offer_id)
                .bind(row.merchant_id)
                .bind(row.aggregator_id)
                .bind(&row.image_link)
                .bind(&row.metadata.mime_type)
                .bind(row.metadata.byte_size)
                .bind(&row.metadata.content_hash)
                .bind(format_timestamp(&row.timestamp));

            for field in self.schema.fields() {
                query = bind_field(query, &field.name, &field.field_type, row.fields.get(&field.name))?;
            }

            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Most recent row for one image link
    pub async fn latest_for(&self, image_link: &str) -> Result<Option<StoredRow>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE image_link = ? ORDER BY timestamp DESC, id DESC LIMIT 1",
            self.table
        ))
        .bind(image_link)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.decode(&r)).transpose()
    }

    /// Most recent row per image link, ordered by image link
    pub async fn latest_all(&self) -> Result<Vec<StoredRow>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT * FROM {table} AS r
            WHERE r.id = (
                SELECT l.id FROM {table} AS l
                WHERE l.image_link = r.image_link
                ORDER BY l.timestamp DESC, l.id DESC
                LIMIT 1
            )
            ORDER BY r.image_link
            "#,
            table = self.table
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.decode(r)).collect()
    }

    pub async fn row_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn classified_image_links(&self) -> Result<HashSet<String>> {
        classified_image_links(&self.pool, &self.table).await
    }

    fn decode(&self, row: &SqliteRow) -> Result<StoredRow> {
        let timestamp: String = row.try_get("timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| Error::Internal(format!("bad stored timestamp '{}': {}", timestamp, e)))?
            .with_timezone(&Utc);

        let mut fields = Map::new();
        for field in self.schema.fields() {
            fields.insert(field.name.clone(), decode_field(row, &field.name, &field.field_type)?);
        }

        Ok(StoredRow {
            id: row.try_get("id")?,
            row: LabeledImageRow {
                offer_id: row.try_get("offer_id")?,
                merchant_id: row.try_get("merchant_id")?,
                aggregator_id: row.try_get("aggregator_id")?,
                image_link: row.try_get("image_link")?,
                metadata: ImageMetadata {
                    mime_type: row.try_get("mime_type")?,
                    byte_size: row.try_get("byte_size")?,
                    content_hash: row.try_get("content_hash")?,
                },
                fields,
                timestamp,
            },
        })
    }
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_field<'q>(
    query: SqliteQuery<'q>,
    name: &str,
    field_type: &FieldType,
    value: Option<&Value>,
) -> Result<SqliteQuery<'q>> {
    let invalid = || {
        Error::InvalidInput(format!(
            "value for '{}' does not match {}",
            name,
            field_type.describe()
        ))
    };

    let value = match value {
        None | Some(Value::Null) => return Ok(query.bind(None::<String>)),
        Some(v) => v,
    };

    Ok(match field_type {
        FieldType::Primitive(Primitive::String) | FieldType::Enum { .. } => {
            query.bind(value.as_str().ok_or_else(invalid)?.to_string())
        }
        FieldType::Primitive(Primitive::Integer) => {
            query.bind(exact_i64(value).ok_or_else(invalid)?)
        }
        FieldType::Primitive(Primitive::Float) => query.bind(value.as_f64().ok_or_else(invalid)?),
        FieldType::Primitive(Primitive::Boolean) => query.bind(value.as_bool().ok_or_else(invalid)?),
        FieldType::Repeated(_) => query.bind(serde_json::to_string(value)?),
    })
}

fn decode_field(row: &SqliteRow, name: &str, field_type: &FieldType) -> Result<Value> {
    let column = name;
    let value = match field_type {
        FieldType::Primitive(Primitive::String) | FieldType::Enum { .. } => row
            .try_get::<Option<String>, _>(column)?
            .map(Value::String),
        FieldType::Primitive(Primitive::Integer) => {
            row.try_get::<Option<i64>, _>(column)?.map(Value::from)
        }
        FieldType::Primitive(Primitive::Float) => {
            row.try_get::<Option<f64>, _>(column)?.map(Value::from)
        }
        FieldType::Primitive(Primitive::Boolean) => {
            row.try_get::<Option<bool>, _>(column)?.map(Value::Bool)
        }
        FieldType::Repeated(_) => match row.try_get::<Option<String>, _>(column)? {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        },
    };

    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;
    use crate::schema::{compile, TypeDescription};
    use chrono::TimeZone;
    use serde_json::json;

    fn schema() -> OutputSchema {
        let description = TypeDescription::from_toml_str(
            r#"
            name = "LabeledImage"
            [enums]
            ImageType = ["silo", "lifestyle", "unknown"]
            [[fields]]
            name = "type"
            type = "ImageType"
            [[fields]]
            name = "tags"
            type = "list<string>"
            [[fields]]
            name = "confidence"
            type = "float"
            [[fields]]
            name = "has_text"
            type = "boolean"
            "#,
        )
        .unwrap();
        compile(&description).unwrap()
    }

    fn row(link: &str, image_type: &str, second: u32) -> LabeledImageRow {
        let mut fields = Map::new();
        fields.insert("type".to_string(), json!(image_type));
        fields.insert("tags".to_string(), json!(["chair", "oak"]));
        fields.insert("confidence".to_string(), json!(0.75));
        fields.insert("has_text".to_string(), json!(false));

        LabeledImageRow {
            offer_id: "offer1".to_string(),
            merchant_id: 1,
            aggregator_id: 101,
            image_link: link.to_string(),
            metadata: ImageMetadata {
                mime_type: "image/jpeg".to_string(),
                byte_size: 1024,
                content_hash: "ab".repeat(32),
            },
            fields,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, second).unwrap(),
        }
    }

    async fn store() -> ResultsStore {
        let pool = init_memory_database().await.unwrap();
        ResultsStore::provision(pool, "labeled_images", schema())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_provision_creates_fixed_and_schema_columns() {
        let store = store().await;
        let columns = table_columns(&store.pool, "labeled_images").await.unwrap();
        assert_eq!(columns[0], "id");
        assert_eq!(columns[8], "timestamp");
        assert_eq!(&columns[9..], &["type", "tags", "confidence", "has_text"]);
    }

    #[tokio::test]
    async fn test_provision_is_idempotent_but_detects_drift() {
        let store = store().await;
        assert!(provision(&store.pool, "labeled_images", &schema()).await.is_ok());

        let changed = compile(
            &TypeDescription::from_toml_str(
                r#"
                name = "LabeledImage"
                [[fields]]
                name = "caption"
                type = "string"
                "#,
            )
            .unwrap(),
        )
        .unwrap();

        let err = provision(&store.pool, "labeled_images", &changed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
        assert!(err.to_string().contains("reprovision required"));
    }

    #[tokio::test]
    async fn test_open_requires_provisioned_table() {
        let pool = init_memory_database().await.unwrap();
        assert!(matches!(
            ResultsStore::open(pool, "labeled_images", schema()).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let store = store().await;
        let written = store
            .append(&[row("http://x", "silo", 0), row("http://y", "lifestyle", 0)])
            .await
            .unwrap();
        assert_eq!(written, 2);

        let latest = store.latest_for("http://y").await.unwrap().unwrap();
        assert_eq!(latest.row, row("http://y", "lifestyle", 0));
        assert_eq!(latest.row.fields["tags"], json!(["chair", "oak"]));
    }

    #[tokio::test]
    async fn test_latest_view_prefers_newest_then_highest_id() {
        let store = store().await;
        store.append(&[row("http://x", "silo", 5)]).await.unwrap();
        store.append(&[row("http://x", "unknown", 1)]).await.unwrap();
        store.append(&[row("http://y", "silo", 3)]).await.unwrap();
        store.append(&[row("http://y", "lifestyle", 3)]).await.unwrap();

        assert_eq!(store.row_count().await.unwrap(), 4);

        let all = store.latest_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].row.image_link, "http://x");
        assert_eq!(all[0].row.fields["type"], "silo");
        assert_eq!(all[1].row.fields["type"], "lifestyle");
    }

    #[tokio::test]
    async fn test_classified_links() {
        let store = store().await;
        store
            .append(&[row("http://x", "silo", 0), row("http://x", "silo", 1)])
            .await
            .unwrap();

        let links = store.classified_image_links().await.unwrap();
        assert_eq!(links, HashSet::from(["http://x".to_string()]));
    }

    #[tokio::test]
    async fn test_classified_links_without_table_is_empty() {
        let pool = init_memory_database().await.unwrap();
        let links = classified_image_links(&pool, "labeled_images").await.unwrap();
        assert!(links.is_empty());
    }

    #[tokio::test]
    async fn test_append_rejects_mistyped_value() {
        let store = store().await;
        let mut bad = row("http://x", "silo", 0);
        bad.fields.insert("confidence".to_string(), json!("high"));

        assert!(matches!(
            store.append(&[bad]).await,
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(store.row_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_rejects_integer_outside_i64() {
        let description = TypeDescription::from_toml_str(
            r#"
            name = "Counted"
            [[fields]]
            name = "people"
            type = "integer"
            "#,
        )
        .unwrap();
        let pool = init_memory_database().await.unwrap();
        let store = ResultsStore::provision(pool, "counted", compile(&description).unwrap())
            .await
            .unwrap();

        let mut ok = row("http://x", "silo", 0);
        ok.fields = Map::new();
        ok.fields.insert("people".to_string(), json!(4.0));
        store.append(&[ok]).await.unwrap();
        let stored = store.latest_for("http://x").await.unwrap().unwrap();
        assert_eq!(stored.row.fields["people"], 4);

        let mut huge = row("http://y", "silo", 0);
        huge.fields = Map::new();
        huge.fields.insert("people".to_string(), json!(1e20));
        assert!(matches!(
            store.append(&[huge]).await,
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(store.row_count().await.unwrap(), 1);
    }
}
