//! SQLite connection pools.
//!
//! Boot, hooks and the offloader all write through the store concurrently,
//! while SQLite admits a single writer. The engine database therefore opens
//! two pools over one WAL file: a read-only pool sized for concurrent
//! lookups and a one-connection writer that serializes every mutation.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// File name of the engine database inside the data directory.
pub const DATABASE_FILE: &str = "autoflow.db";

const READER_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Reader/writer pool pair over one SQLite database.
#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only connections for SELECTs.
    pub reader: SqlitePool,
    /// The single connection every INSERT/UPDATE/DELETE goes through.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Connect to `database_url` and apply pending migrations.
    ///
    /// Migrations run on the writer before the reader pool is opened, so
    /// readers never observe a half-migrated schema.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(opts.read_only(true))
            .await?;

        tracing::debug!(database_url, "database pools ready");
        Ok(Self { reader, writer })
    }

    /// Open (creating if missing) the engine database in `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self, sqlx::Error> {
        Self::new(&database_url(data_dir)).await
    }

    /// Close both pools, waiting for in-flight queries to finish.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

/// Connection URL of the engine database in `data_dir`.
pub fn database_url(data_dir: &Path) -> String {
    format!(
        "sqlite://{}?mode=rwc",
        data_dir.join(DATABASE_FILE).display()
    )
}
