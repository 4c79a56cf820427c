//! SQLite adapter for the crash-recovery journal.

pub mod connection;
pub mod journal;
pub mod migrations;

pub use connection::{open_journal, open_test_pool, ConnectionError};
pub use journal::SqliteStateJournal;
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Opens `state_dir/agent.db` and brings it up to the latest schema.
pub async fn open_and_migrate(db_path: &Path) -> Result<sqlx::SqlitePool, DatabaseError> {
    let pool = open_journal(db_path).await?;
    Migrator::new(pool.clone())
        .run_embedded_migrations(all_embedded_migrations())
        .await?;
    Ok(pool)
}
