//! Schema migrations.

use courier_store::PgStore;
use miette::Result;
use tracing::info;

/// Apply every pending migration to the database at `database_url`.
pub async fn run(database_url: &str) -> Result<()> {
    let store = PgStore::connect(database_url, 1)
        .await
        .map_err(|e| miette::miette!("failed to connect to database: {}", e))?;

    store
        .migrate()
        .await
        .map_err(|e| miette::miette!("migration failed: {}", e))?;

    info!("database schema is up to date");
    Ok(())
}
