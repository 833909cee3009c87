//! Database connection management for the embedded `SQLite` store.
//!
//! ## Architecture
//!
//! - **Functional core**: configuration validation, connection-string generation.
//! - **Imperative shell**: file system operations, pool creation, migrations.

use crate::domain_types::ConnectionPoolSize;
use nutype::nutype;
use sqlx::{Pool, Sqlite, SqlitePool, migrate::Migrator};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Static migrator for the embedded `SQLite` migrations under `migrations/`.
static MIGRATOR: Migrator = sqlx::migrate!();

/// Lower-level storage failures, independent of any particular entity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A query or transaction failed.
    #[error("database error: {message}")]
    Database {
        /// Message from the underlying driver.
        message: String,
    },

    /// A filesystem operation (usually directory creation) failed.
    #[error("file system error: {message}")]
    FileSystem {
        /// Message describing the failure.
        message: String,
    },

    /// A `DatabaseConfig` field failed validation.
    #[error("configuration error: {field} - {reason}")]
    Configuration {
        /// Name of the invalid field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The connection pool could not be established.
    #[error("connection pool error: {message}")]
    ConnectionPool {
        /// Message describing the failure.
        message: String,
    },

    /// `sqlx::migrate!()` failed to apply the embedded migrations.
    #[error("migration failed: {message}")]
    Migration {
        /// Message describing the failure.
        message: String,
    },
}

/// Top-level database error.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Raw `sqlx` error not otherwise classified.
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    /// IO error encountered outside of `sqlx`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A classified storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result alias for fallible database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Result alias for pure validation functions.
pub type StorageResult<T> = Result<T, StorageError>;

#[nutype(
    sanitize(with = |path: PathBuf| path),
    validate(predicate = |path| !path.as_os_str().is_empty() && path.extension().is_some_and(|ext| ext == "db")),
    derive(Clone, Debug, Eq, PartialEq)
)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Validates and wraps a filesystem path as a database path.
    ///
    /// # Errors
    /// Returns an error if the path is empty or does not end in `.db`.
    pub fn new<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        Self::try_new(path_buf).map_err(|_| {
            DatabaseError::Storage(StorageError::Configuration {
                field: "database_path".to_string(),
                reason: "path is empty or has invalid extension (must be .db)".to_string(),
            })
        })
    }

    /// Returns the path as an owned `PathBuf`.
    pub fn as_path(&self) -> PathBuf {
        self.clone().into_inner()
    }

    /// Renders the `sqlite://` connection string `sqlx` expects.
    pub fn to_connection_string(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.as_path().display())
    }

    /// Parent directory, created on demand during `initialize`.
    pub fn parent_directory(&self) -> Option<PathBuf> {
        self.as_path().parent().map(std::path::Path::to_path_buf)
    }

    /// Whether the underlying file already exists on disk.
    pub fn exists(&self) -> bool {
        self.as_path().exists()
    }
}

impl std::fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Tunables for the `SQLite` connection and pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    path: DatabasePath,
    pool_size: ConnectionPoolSize,
    enable_wal_mode: bool,
    enable_foreign_keys: bool,
}

impl DatabaseConfig {
    /// Production-leaning defaults: WAL mode, foreign keys on, pool size from the type default.
    pub fn new(path: DatabasePath) -> Self {
        Self {
            path,
            pool_size: ConnectionPoolSize::default(),
            enable_wal_mode: true,
            enable_foreign_keys: true,
        }
    }

    /// A minimal configuration for ephemeral test databases.
    ///
    /// # Panics
    /// Never, in practice: `1` is always within `ConnectionPoolSize`'s valid range.
    pub fn for_testing(path: DatabasePath) -> Self {
        Self {
            path,
            pool_size: ConnectionPoolSize::try_new(1).expect("pool size 1 is always valid"),
            enable_wal_mode: false,
            enable_foreign_keys: true,
        }
    }

    /// Builder: override the pool size.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: ConnectionPoolSize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Builder: toggle WAL journal mode.
    #[must_use]
    pub fn with_wal_mode(mut self, enable: bool) -> Self {
        self.enable_wal_mode = enable;
        self
    }

    /// Builder: toggle `PRAGMA foreign_keys`.
    #[must_use]
    pub fn with_foreign_keys(mut self, enable: bool) -> Self {
        self.enable_foreign_keys = enable;
        self
    }

    /// The configured path.
    pub fn path(&self) -> &DatabasePath {
        &self.path
    }

    /// The configured pool size.
    pub fn pool_size(&self) -> ConnectionPoolSize {
        self.pool_size
    }

    /// Whether WAL mode is requested.
    pub fn wal_mode_enabled(&self) -> bool {
        self.enable_wal_mode
    }

    /// Whether foreign key enforcement is requested.
    pub fn foreign_keys_enabled(&self) -> bool {
        self.enable_foreign_keys
    }

    /// Pure cross-field validation, independent of any I/O.
    ///
    /// # Errors
    /// Returns an error if the pool size is unusable.
    pub fn validate(&self) -> StorageResult<()> {
        if self.pool_size.as_u32() == 0 {
            return Err(StorageError::Configuration {
                field: "pool_size".to_string(),
                reason: "pool size must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// A live `SQLite` connection pool plus the configuration it was built from.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
    config: DatabaseConfig,
}

impl DatabaseConnection {
    fn create_connect_options(config: &DatabaseConfig) -> sqlx::sqlite::SqliteConnectOptions {
        use sqlx::ConnectOptions;
        use sqlx::sqlite::SqliteConnectOptions;

        let mut options = SqliteConnectOptions::new()
            .filename(config.path().as_path())
            .create_if_missing(true);

        if config.wal_mode_enabled() {
            options = options.pragma("journal_mode", "WAL");
        }
        if config.foreign_keys_enabled() {
            options = options.pragma("foreign_keys", "ON");
        }

        options.disable_statement_logging()
    }

    /// Opens (creating if necessary) the `SQLite` file at `config.path()`, applies pragma
    /// tuning, and runs the embedded forward-only migrations.
    ///
    /// # Errors
    /// Returns an error if validation, directory creation, connection, or migration fails.
    pub async fn initialize(config: DatabaseConfig) -> DatabaseResult<Self> {
        config.validate().map_err(DatabaseError::Storage)?;

        Self::ensure_parent_directory_exists(&config).await?;
        let pool = Self::create_connection_pool(&config).await?;
        Self::apply_pragmas(&pool).await?;
        Self::run_migrations(&pool).await?;

        Ok(Self { pool, config })
    }

    async fn ensure_parent_directory_exists(config: &DatabaseConfig) -> DatabaseResult<()> {
        if let Some(parent) = config.path().parent_directory() {
            tokio::fs::create_dir_all(&parent).await.map_err(|e| {
                DatabaseError::Storage(StorageError::FileSystem {
                    message: format!("failed to create directory {}: {e}", parent.display()),
                })
            })?;
        }
        Ok(())
    }

    async fn create_connection_pool(config: &DatabaseConfig) -> DatabaseResult<Pool<Sqlite>> {
        let options = Self::create_connect_options(config);
        sqlx::pool::PoolOptions::<Sqlite>::new()
            .max_connections(config.pool_size().as_u32())
            .connect_with(options)
            .await
            .map_err(|e| {
                DatabaseError::Storage(StorageError::ConnectionPool {
                    message: format!("failed to create connection pool: {e}"),
                })
            })
    }

    async fn apply_pragmas(pool: &Pool<Sqlite>) -> DatabaseResult<()> {
        for pragma in [
            "PRAGMA synchronous = NORMAL",
            "PRAGMA cache_size = -65536",
            "PRAGMA temp_store = MEMORY",
            "PRAGMA mmap_size = 268435456",
        ] {
            sqlx::query(pragma).execute(pool).await.map_err(|e| {
                DatabaseError::Storage(StorageError::Database {
                    message: format!("failed to apply `{pragma}`: {e}"),
                })
            })?;
        }
        Ok(())
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> DatabaseResult<()> {
        info!("applying embedded schema migrations");
        MIGRATOR.run(pool).await.map_err(|e| {
            DatabaseError::Storage(StorageError::Migration {
                message: format!("schema migration failed: {e}"),
            })
        })?;
        info!("schema migrations up to date");
        Ok(())
    }

    /// Whether the backing file exists on disk.
    pub fn database_file_exists(&self) -> bool {
        self.config.path().exists()
    }

    /// Runs a trivial query to confirm the pool is usable.
    ///
    /// # Errors
    /// Returns an error if the connection cannot execute `SELECT 1`.
    pub async fn test_connection(&self) -> DatabaseResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Borrows the underlying pool, for store implementations.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Borrows the configuration this connection was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rejects_empty_path() {
        assert!(DatabasePath::new("").is_err());
    }

    #[test]
    fn rejects_non_db_extension() {
        assert!(DatabasePath::new("test.txt").is_err());
    }

    #[test]
    fn connection_string_uses_rwc_mode() {
        let path = DatabasePath::new("/tmp/test.db").unwrap();
        let conn_str = path.to_connection_string();
        assert!(conn_str.starts_with("sqlite://"));
        assert!(conn_str.ends_with("mode=rwc"));
    }

    #[test]
    fn testing_config_uses_single_connection_pool() {
        let path = DatabasePath::new("test.db").unwrap();
        let config = DatabaseConfig::for_testing(path);
        assert_eq!(config.pool_size().as_u32(), 1);
        assert!(!config.wal_mode_enabled());
    }

    #[tokio::test]
    async fn initialize_creates_file_and_applies_migrations() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let path = DatabasePath::new(db_path).unwrap();
        let config = DatabaseConfig::for_testing(path);

        let connection = DatabaseConnection::initialize(config).await.unwrap();
        assert!(connection.database_file_exists());
        connection.test_connection().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(connection.pool())
            .await
            .unwrap();
        assert!(count > 0);
    }
}
