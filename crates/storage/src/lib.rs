use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

use stock_notify_core::{NewProduct, Product};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to interact with the products table.
    pub fn products(&self) -> ProductRepository {
        ProductRepository {
            pool: self.pool.clone(),
        }
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
}

/// Error returned when a product could not be written.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for created products.
///
/// `insert` is called at most once per request and returns the generated id.
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn insert(&self, product: &NewProduct) -> Result<i64, StoreError>;
}

/// Repository responsible for the `products` table.
#[derive(Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

impl ProductRepository {
    /// Inserts a product and returns the identifier SQLite assigned to it.
    pub async fn insert_at(
        &self,
        product: &NewProduct,
        created_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO products (name, price, stock, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(product.name())
        .bind(product.price())
        .bind(product.stock())
        .bind(to_rfc3339(created_at))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Loads a stored product by identifier.
    pub async fn fetch(&self, id: i64) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query("SELECT id, name, price, stock FROM products WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Product {
            id: Some(row.get("id")),
            name: row.get("name"),
            price: row.get("price"),
            stock: row.get("stock"),
        }))
    }

    /// Returns the number of stored products.
    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM products")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }
}

#[async_trait]
impl ProductStore for ProductRepository {
    async fn insert(&self, product: &NewProduct) -> Result<i64, StoreError> {
        self.insert_at(product, Utc::now()).await
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
