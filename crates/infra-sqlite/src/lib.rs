// Tessera Infrastructure - SQLite Adapter
// Implements: ResourceStore

mod connection;
mod error;
mod migration;
mod resource_store;

pub use connection::create_pool;
pub use migration::run_migrations;
pub use resource_store::SqliteResourceStore;

use tessera_core::error::Result;

/// Open (creating if needed) and migrate the database, ready for the storage actor
pub async fn open_store(database: &str) -> Result<SqliteResourceStore> {
    let pool = create_pool(database).await?;
    run_migrations(&pool).await?;
    Ok(SqliteResourceStore::new(pool))
}
