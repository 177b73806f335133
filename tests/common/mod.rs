//! Shared helpers for integration tests that need a live database.

use fiscal_recon::config::DatabaseConfig;
use fiscal_recon::services::database::Database;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,fiscal_recon=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Connect to the test database and apply migrations.
pub async fn test_db() -> Database {
    init_tracing();

    let url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run database tests");

    let db = Database::new(&DatabaseConfig {
        url,
        max_connections: 2,
        min_connections: 1,
    })
    .await
    .expect("failed to connect to test database");

    db.run_migrations().await.expect("failed to run migrations");
    db
}
