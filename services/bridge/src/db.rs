//! Postgres connection management for the mirror.

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::mirror::PgMirror;
use crate::retry::Backoff;

/// Delay between connection attempts while the server comes up.
const CONNECT_BACKOFF: Backoff = Backoff::Exponential {
    base: Duration::from_millis(100),
    max: Duration::from_secs(2),
};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Mirror database settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,

    /// How long `connect` keeps retrying an unreachable server.
    pub connect_timeout: Duration,

    /// Directory holding the mirror schema migrations.
    pub migrations_dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/kbind".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(10),
            migrations_dir: default_migrations_dir(),
        }
    }
}

/// The crate's own `migrations/` directory.
pub fn default_migrations_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations")
}

/// Connection pool handle.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    migrations_dir: PathBuf,
}

impl Database {
    /// Open the pool, retrying until `connect_timeout` runs out.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let deadline = Instant::now() + config.connect_timeout;
        let mut attempt: u32 = 0;
        loop {
            let connected = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .acquire_timeout(config.connect_timeout)
                .connect(&config.database_url)
                .await;

            match connected {
                Ok(pool) => {
                    return Ok(Self {
                        pool,
                        migrations_dir: config.migrations_dir.clone(),
                    })
                }
                Err(e) => {
                    let delay = CONNECT_BACKOFF.delay(attempt);
                    if Instant::now() + delay >= deadline {
                        return Err(DbError::Connect(e));
                    }
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Database unreachable; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Apply the mirror schema. Already-applied migrations are skipped.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let migrator = Migrator::new(self.migrations_dir.clone())
            .await
            .map_err(DbError::Migration)?;
        info!(
            migrations_dir = %self.migrations_dir.display(),
            migrations = migrator.iter().count(),
            "Applying mirror schema"
        );
        migrator.run(&self.pool).await.map_err(DbError::Migration)
    }

    /// Mirror backed by this pool.
    pub fn mirror(&self) -> PgMirror {
        PgMirror::new(self.pool.clone())
    }
}
