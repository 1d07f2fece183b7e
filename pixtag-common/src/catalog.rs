//! Product catalog snapshots
//!
//! The catalog is loaded in ingestion batches. Selection always reads one
//! batch (the highest `ingestion_batch`), never a mix of a finished batch and
//! one still being written.

use crate::db::{checked_table_name, table_exists};
use crate::{Error, Product, Result};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

/// Products of a single ingestion batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    /// `None` when the catalog table holds no rows
    pub batch: Option<i64>,
    pub products: Vec<Product>,
}

impl CatalogSnapshot {
    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
    table: String,
}

impl CatalogStore {
    pub fn new(pool: SqlitePool, table: &str) -> Result<Self> {
        Ok(Self {
            pool,
            table: checked_table_name(table)?,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn create_table(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                ingestion_batch INTEGER NOT NULL,
                offer_id TEXT NOT NULL,
                merchant_id INTEGER NOT NULL,
                aggregator_id INTEGER NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                product_type TEXT,
                brand TEXT,
                image_link TEXT,
                additional_image_links TEXT NOT NULL DEFAULT '[]'
            )
            "#,
            table = self.table
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_batch ON {table}(ingestion_batch)",
            table = self.table
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Read the latest ingestion batch.
    ///
    /// A missing table is a selection error; an empty table is an empty
    /// snapshot.
    pub async fn latest_snapshot(&self) -> Result<CatalogSnapshot> {
        if !table_exists(&self.pool, &self.table).await? {
            return Err(Error::Selection(format!(
                "catalog table '{}' does not exist",
                self.table
            )));
        }

        let batch: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(ingestion_batch) FROM {}",
            self.table
        ))
        .fetch_one(&self.pool)
        .await?;

        let Some(batch) = batch else {
            debug!(table = %self.table, "Catalog is empty");
            return Ok(CatalogSnapshot::default());
        };

        let rows = sqlx::query(&format!(
            r#"
            SELECT offer_id, merchant_id, aggregator_id, title, product_type, brand,
                   image_link, additional_image_links
            FROM {}
            WHERE ingestion_batch = ?
            ORDER BY offer_id, title, merchant_id, aggregator_id
            "#,
            self.table
        ))
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        let mut products = Vec::with_capacity(rows.len());
        for row in rows {
            let additional: String = row.try_get("additional_image_links")?;
            let additional_image_links: Vec<String> = serde_json::from_str(&additional)
                .map_err(|e| {
                    Error::Selection(format!(
                        "catalog row has malformed additional_image_links: {}",
                        e
                    ))
                })?;

            products.push(Product {
                offer_id: row.try_get("offer_id")?,
                merchant_id: row.try_get("merchant_id")?,
                aggregator_id: row.try_get("aggregator_id")?,
                title: row.try_get("title")?,
                product_type: row.try_get("product_type")?,
                brand: row.try_get("brand")?,
                image_link: row.try_get("image_link")?,
                additional_image_links,
            });
        }

        debug!(batch, products = products.len(), "Loaded catalog snapshot");

        Ok(CatalogSnapshot {
            batch: Some(batch),
            products,
        })
    }

    /// Write `products` as a new batch and return its number.
    ///
    /// An empty batch is rejected: batches are numbered from their rows, so
    /// it would leave the previous batch as the latest snapshot.
    pub async fn ingest_batch(&self, products: &[Product]) -> Result<i64> {
        if products.is_empty() {
            return Err(Error::InvalidInput(
                "catalog batch has no products".to_string(),
            ));
        }

        self.create_table().await?;

        let mut tx = self.pool.begin().await?;

        let previous: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(ingestion_batch) FROM {}",
            self.table
        ))
        .fetch_one(&mut *tx)
        .await?;
        let batch = previous.unwrap_or(0) + 1;

        let insert = format!(
            r#"
            INSERT INTO {} (ingestion_batch, offer_id, merchant_id, aggregator_id, title,
                            product_type, brand, image_link, additional_image_links)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            self.table
        );

        for product in products {
            sqlx::query(&insert)
                .bind(batch)
                .bind(&product.offer_id)
                .bind(product.merchant_id)
                .bind(product.aggregator_id)
                .bind(&product.title)
                .bind(&product.product_type)
                .bind(&product.brand)
                .bind(&product.image_link)
                .bind(serde_json::to_string(&product.additional_image_links)?)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        info!(
            table = %self.table,
            batch,
            products = products.len(),
            "Ingested catalog batch"
        );
        Ok(batch)
    }
}

/// Parse newline-delimited product JSON. Blank lines are skipped.
pub fn parse_json_lines(content: &str) -> Result<Vec<Product>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<Product>(line)
                .map_err(|e| Error::InvalidInput(format!("line {}: {}", n + 1, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_database;

    fn product(offer_id: &str, image: &str) -> Product {
        Product {
            offer_id: offer_id.to_string(),
            merchant_id: 1,
            aggregator_id: 101,
            title: format!("Title {}", offer_id),
            product_type: Some("Home > Chairs".to_string()),
            brand: None,
            image_link: Some(image.to_string()),
            additional_image_links: vec![format!("{}/alt", image)],
        }
    }

    #[tokio::test]
    async fn test_missing_table_is_selection_error() {
        let pool = init_memory_database().await.unwrap();
        let store = CatalogStore::new(pool, "products").unwrap();

        assert!(matches!(
            store.latest_snapshot().await,
            Err(Error::Selection(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_table_is_empty_snapshot() {
        let pool = init_memory_database().await.unwrap();
        let store = CatalogStore::new(pool, "products").unwrap();
        store.create_table().await.unwrap();

        let snapshot = store.latest_snapshot().await.unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.batch, None);
    }

    #[tokio::test]
    async fn test_snapshot_pins_latest_batch() {
        let pool = init_memory_database().await.unwrap();
        let store = CatalogStore::new(pool, "products").unwrap();

        let first = store
            .ingest_batch(&[product("a", "http://x"), product("b", "http://y")])
            .await
            .unwrap();
        let second = store.ingest_batch(&[product("c", "http://z")]).await.unwrap();
        assert_eq!((first, second), (1, 2));

        let snapshot = store.latest_snapshot().await.unwrap();
        assert_eq!(snapshot.batch, Some(2));
        assert_eq!(snapshot.products, vec![product("c", "http://z")]);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected_and_latest_unchanged() {
        let pool = init_memory_database().await.unwrap();
        let store = CatalogStore::new(pool, "products").unwrap();
        store.ingest_batch(&[product("a", "http://x")]).await.unwrap();

        assert!(matches!(
            store.ingest_batch(&[]).await,
            Err(Error::InvalidInput(_))
        ));

        let snapshot = store.latest_snapshot().await.unwrap();
        assert_eq!(snapshot.batch, Some(1));
        assert_eq!(store.ingest_batch(&[product("b", "http://y")]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rejects_unsafe_table_name() {
        let pool = init_memory_database().await.unwrap();
        assert!(matches!(
            CatalogStore::new(pool, "products; DROP TABLE x"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_parse_json_lines() {
        let content = r#"{"offer_id":"a","merchant_id":1,"aggregator_id":2,"image_link":"http://x"}

{"offer_id":"b","merchant_id":1,"aggregator_id":2,"title":"B","additional_image_links":["http://y"]}
"#;
        let products = parse_json_lines(content).unwrap();
        assert_eq!(products.len(), 2);
        assert_eq!(products[1].additional_image_links, vec!["http://y"]);

        let err = parse_json_lines("{\"offer_id\": 5}").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
