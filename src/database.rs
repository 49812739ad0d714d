//! Embedded SQLite storage: connection pool setup and the global (non-sharded)
//! schema migration.
//!
//! Functional core / imperative shell split, matching the teacher's
//! `database.rs`: [`DatabaseConnection::create_connect_options`] is pure, the rest
//! of this module is I/O.

use nutype::nutype;
use sqlx::{Pool, Sqlite, SqlitePool, migrate::Migrator};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain_types::ConnectionPoolSize;

/// Static migrator for the embedded global-schema migrations (configuration
/// table, channel registry). Per-channel sharded tables are created separately
/// at deploy time via dynamic DDL (see `storage::sqlite_store`), since channel
/// ids are not known at compile time.
static MIGRATOR: Migrator = sqlx::migrate!();

/// Errors from initializing or operating the database connection.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Error from `SQLx`.
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    /// IO error creating the database directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid configuration.
    #[error("configuration error: {field} - {reason}")]
    Configuration {
        /// Name of the offending field.
        field: String,
        /// Reason the value was rejected.
        reason: String,
    },
    /// Embedded migration run failed.
    #[error("migration failed: {0}")]
    Migration(String),
}

/// Result alias for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// A validated on-disk SQLite file path; must be non-empty and end in `.db`.
#[nutype(
    sanitize(with = |path: PathBuf| path),
    validate(predicate = |path| !path.as_os_str().is_empty() && path.extension().is_some_and(|ext| ext == "db")),
    derive(Clone, Debug, Eq, PartialEq)
)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Creates a new database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty or does not have a `.db` extension.
    pub fn new<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        Self::try_new(path_buf).map_err(|_| DatabaseError::Configuration {
            field: "database_path".to_string(),
            reason: "path is empty or has an invalid extension (must be .db)".to_string(),
        })
    }

    /// Returns the path as a `PathBuf`.
    #[must_use]
    pub fn as_path(&self) -> PathBuf {
        self.clone().into_inner()
    }

    /// Generates the `sqlite://` connection string.
    #[must_use]
    pub fn to_connection_string(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.as_path().display())
    }

    /// Parent directory, created at initialization time if missing.
    #[must_use]
    pub fn parent_directory(&self) -> Option<PathBuf> {
        self.as_path().parent().map(Path::to_path_buf)
    }
}

impl std::fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Database configuration with connection pool settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    path: DatabasePath,
    pool_size: ConnectionPoolSize,
    enable_wal_mode: bool,
    enable_foreign_keys: bool,
}

impl DatabaseConfig {
    /// Creates a new config with default pool settings.
    #[must_use]
    pub fn new(path: DatabasePath) -> Self {
        Self {
            path,
            pool_size: ConnectionPoolSize::default(),
            enable_wal_mode: true,
            enable_foreign_keys: true,
        }
    }

    /// Creates a minimal config for tests (single connection, no WAL).
    #[must_use]
    pub fn for_testing(path: DatabasePath) -> Self {
        Self {
            path,
            pool_size: ConnectionPoolSize::try_new(1).expect("1 is within range"),
            enable_wal_mode: false,
            enable_foreign_keys: false,
        }
    }

    /// Sets the connection pool size.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: ConnectionPoolSize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Returns the configured path.
    #[must_use]
    pub fn path(&self) -> &DatabasePath {
        &self.path
    }

    /// Returns the configured pool size.
    #[must_use]
    pub fn pool_size(&self) -> ConnectionPoolSize {
        self.pool_size
    }
}

/// A managed SQLite connection pool plus the config it was built from.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
    config: DatabaseConfig,
}

impl DatabaseConnection {
    /// Builds `SqliteConnectOptions` from config. Pure function.
    fn create_connect_options(config: &DatabaseConfig) -> sqlx::sqlite::SqliteConnectOptions {
        use sqlx::ConnectOptions;
        use sqlx::sqlite::SqliteConnectOptions;

        let mut options = SqliteConnectOptions::new()
            .filename(config.path().as_path())
            .create_if_missing(true);

        if config.enable_wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }
        if config.enable_foreign_keys {
            options = options.pragma("foreign_keys", "ON");
        }

        options.disable_statement_logging()
    }

    /// Initializes the connection pool, applies pragmas, and runs migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the pool cannot be
    /// established, or migrations fail.
    pub async fn initialize(config: DatabaseConfig) -> DatabaseResult<Self> {
        Self::ensure_parent_directory_exists(&config).await?;
        let pool = Self::create_connection_pool(&config).await?;
        Self::apply_database_settings(&pool).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool, config })
    }

    async fn ensure_parent_directory_exists(config: &DatabaseConfig) -> DatabaseResult<()> {
        if let Some(parent) = config.path().parent_directory() {
            tokio::fs::create_dir_all(&parent).await?;
        }
        Ok(())
    }

    async fn create_connection_pool(config: &DatabaseConfig) -> DatabaseResult<Pool<Sqlite>> {
        let options = Self::create_connect_options(config);
        SqlitePool::connect_with(options).await.map_err(DatabaseError::Sqlx)
    }

    async fn apply_database_settings(pool: &Pool<Sqlite>) -> DatabaseResult<()> {
        sqlx::query("PRAGMA synchronous = NORMAL").execute(pool).await?;
        sqlx::query("PRAGMA cache_size = -65536").execute(pool).await?;
        sqlx::query("PRAGMA temp_store = MEMORY").execute(pool).await?;
        sqlx::query("PRAGMA mmap_size = 268435456").execute(pool).await?;
        sqlx::query("PRAGMA optimize").execute(pool).await?;
        Ok(())
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> DatabaseResult<()> {
        info!("running embedded global-schema migrations");
        MIGRATOR.run(pool).await.map_err(|e| {
            warn!("migration failed: {e}");
            DatabaseError::Migration(e.to_string())
        })
    }

    /// Returns the underlying pool for use by per-channel sharded storage.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Returns the config this connection was built from.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rejects_non_db_extension() {
        assert!(DatabasePath::new("test.txt").is_err());
    }

    #[test]
    fn connection_string_has_rwc_mode() {
        let path = DatabasePath::new("/tmp/conduit-test.db").unwrap();
        assert!(path.to_connection_string().contains("mode=rwc"));
    }

    #[tokio::test]
    async fn initialize_creates_migration_tracking_table() {
        let dir = tempdir().unwrap();
        let path = DatabasePath::new(dir.path().join("test.db")).unwrap();
        let config = DatabaseConfig::for_testing(path);
        let conn = DatabaseConnection::initialize(config).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(conn.pool())
            .await
            .unwrap();
        assert!(count > 0);
    }
}
