//! # handbook-db
//!
//! PostgreSQL persistence for the handbook job queue.
//!
//! This crate provides:
//! - Connection pool management
//! - [`PgJobStore`], the conditional-update job store behind both workers
//! - [`PgDocumentRepository`], read access to imported documents
//! - In-memory twins of both for tests and local runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use handbook_db::{Database, JobStore, NewJob};
//!
//! let db = Database::connect("postgres://localhost/handbook").await?;
//! db.migrate().await?;
//! let job_id = db.jobs.enqueue(NewJob::ocr("uploads/ordningsregler.pdf")).await?;
//! ```
pub mod documents;
pub mod jobs;
pub mod memory;
pub mod pool;

// Public (behind the default `migrations` feature) so integration tests in tests/
// can use DEFAULT_TEST_DATABASE_URL
#[cfg(feature = "migrations")]
pub mod test_fixtures;

pub use handbook_core::*;

pub use documents::PgDocumentRepository;
pub use jobs::PgJobStore;
pub use memory::{MemoryDocumentSource, MemoryJobStore};
pub use pool::{create_pool, create_pool_with_config, PoolConfig};

/// Combined database context.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Job store for both job tables.
    pub jobs: PgJobStore,
    /// Imported documents read by the analyze worker.
    pub documents: PgDocumentRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobStore::new(pool.clone()),
            documents: PgDocumentRepository::new(pool.clone()),
            pool,
        }
    }

    /// Set the `max_attempts` given to jobs enqueued without one.
    pub fn with_default_max_attempts(mut self, max_attempts: i32) -> Self {
        self.jobs = self.jobs.with_default_max_attempts(max_attempts);
        self
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
