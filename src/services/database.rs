//! Database service: local receipt store, tax receipt cache, service name
//! catalogue and settings.

use crate::config::DatabaseConfig;
use crate::error::AppError;
use crate::models::{LocalReceipt, TaxReceipt};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};

/// Everything the store records about a successful filing.
#[derive(Debug, Clone)]
pub struct FiledReceiptRecord {
    pub payment_id: String,
    pub receipt_uuid: String,
    pub receipt_url_print: Option<String>,
    pub receipt_url_json: Option<String>,
    pub service_name: Option<String>,
    pub amount: Option<rust_decimal::Decimal>,
    pub sale_date: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub synced_from_tax: bool,
}

/// Outcome of the promotion pass that runs after a cache replace.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromotionCounts {
    pub marked_sent: u64,
    pub marked_canceled: u64,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(config))]
    pub async fn new(config: &DatabaseConfig) -> Result<Self, AppError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run pending migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations applied");
        Ok(())
    }

    // ========================================================================
    // Local receipt store
    // ========================================================================

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn get_receipt(&self, payment_id: &str) -> Result<Option<LocalReceipt>, AppError> {
        sqlx::query_as::<_, LocalReceipt>(
            "SELECT * FROM local_receipts WHERE payment_id = $1",
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get receipt: {}", e)))
    }

    /// Rows for a batch of payments, keyed by payment id.
    #[instrument(skip(self, payment_ids), fields(count = payment_ids.len()))]
    pub async fn get_receipts_for_payments(
        &self,
        payment_ids: &[String],
    ) -> Result<HashMap<String, LocalReceipt>, AppError> {
        if payment_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, LocalReceipt>(
            "SELECT * FROM local_receipts WHERE payment_id = ANY($1)",
        )
        .bind(payment_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get receipts: {}", e)))?;

        Ok(rows.into_iter().map(|r| (r.payment_id.clone(), r)).collect())
    }

    #[instrument(skip(self))]
    pub async fn list_receipts(&self) -> Result<Vec<LocalReceipt>, AppError> {
        sqlx::query_as::<_, LocalReceipt>("SELECT * FROM local_receipts ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list receipts: {}", e)))
    }

    /// Record a successful filing. Overwrites any previous outcome for the
    /// payment and clears stale error and cancellation fields.
    #[instrument(skip(self, record), fields(payment_id = %record.payment_id))]
    pub async fn mark_sent(&self, record: &FiledReceiptRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO local_receipts
                (payment_id, receipt_uuid, status, receipt_url_print, receipt_url_json,
                 service_name, amount, sale_date, sent_at, synced_from_tax)
            VALUES ($1, $2, 'sent', $3, $4, $5, $6, $7, COALESCE($8, NOW()), $9)
            ON CONFLICT (payment_id) DO UPDATE SET
                receipt_uuid = EXCLUDED.receipt_uuid,
                status = 'sent',
                receipt_url_print = EXCLUDED.receipt_url_print,
                receipt_url_json = EXCLUDED.receipt_url_json,
                service_name = EXCLUDED.service_name,
                amount = EXCLUDED.amount,
                sale_date = EXCLUDED.sale_date,
                sent_at = EXCLUDED.sent_at,
                synced_from_tax = EXCLUDED.synced_from_tax,
                error_message = NULL,
                error_at = NULL,
                canceled_at = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(&record.payment_id)
        .bind(&record.receipt_uuid)
        .bind(&record.receipt_url_print)
        .bind(&record.receipt_url_json)
        .bind(&record.service_name)
        .bind(record.amount)
        .bind(&record.sale_date)
        .bind(record.sent_at)
        .bind(record.synced_from_tax)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to mark sent: {}", e)))?;
        Ok(())
    }

    /// Record a failed filing attempt. A confirmed `sent` or `canceled`
    /// outcome is never downgraded.
    #[instrument(skip(self, message), fields(payment_id = %payment_id))]
    pub async fn mark_error(&self, payment_id: &str, message: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO local_receipts (payment_id, status, error_message, error_at)
            VALUES ($1, 'error', $2, NOW())
            ON CONFLICT (payment_id) DO UPDATE SET
                status = 'error',
                error_message = EXCLUDED.error_message,
                error_at = NOW(),
                updated_at = NOW()
            WHERE local_receipts.status NOT IN ('sent', 'canceled')
            "#,
        )
        .bind(payment_id)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to mark error: {}", e)))?;
        Ok(())
    }

    /// Record a locally requested cancellation.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn mark_canceled(
        &self,
        payment_id: &str,
        canceled_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE local_receipts
            SET status = 'canceled', canceled_at = $2, updated_at = NOW()
            WHERE payment_id = $1
            "#,
        )
        .bind(payment_id)
        .bind(canceled_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to mark canceled: {}", e)))?;
        Ok(())
    }

    /// Mark canceled by receipt uuid. Used by the verification task when the
    /// tax authority reports a just-filed receipt as already canceled. Rows
    /// in `error` keep their error outcome.
    #[instrument(skip(self), fields(receipt_uuid = %receipt_uuid))]
    pub async fn mark_canceled_by_uuid(
        &self,
        receipt_uuid: &str,
        canceled_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE local_receipts
            SET status = 'canceled', canceled_at = $2, updated_at = NOW()
            WHERE receipt_uuid = $1 AND status NOT IN ('canceled', 'error')
            "#,
        )
        .bind(receipt_uuid)
        .bind(canceled_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark canceled by uuid: {}", e))
        })?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Tax receipt cache
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn load_tax_receipts(&self) -> Result<Vec<TaxReceipt>, AppError> {
        sqlx::query_as::<_, TaxReceipt>("SELECT * FROM tax_receipts_cache")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to load tax cache: {}", e))
            })
    }

    /// Replace the whole tax receipt cache and promote matching local rows,
    /// in a single transaction. A failure anywhere leaves the previous cache
    /// and all local rows untouched.
    #[instrument(skip(self, receipts), fields(count = receipts.len()))]
    pub async fn replace_tax_cache_and_promote(
        &self,
        receipts: &[TaxReceipt],
    ) -> Result<PromotionCounts, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query("DELETE FROM tax_receipts_cache")
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to clear tax cache: {}", e))
            })?;

        for receipt in receipts {
            sqlx::query(
                r#"
                INSERT INTO tax_receipts_cache
                    (receipt_uuid, alternate_uuid, total_amount, operation_time, request_time,
                     service_name, is_canceled, canceled_at, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(&receipt.receipt_uuid)
            .bind(&receipt.alternate_uuid)
            .bind(receipt.total_amount)
            .bind(receipt.operation_time)
            .bind(receipt.request_time)
            .bind(&receipt.service_name)
            .bind(receipt.is_canceled)
            .bind(receipt.canceled_at)
            .bind(&receipt.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to insert tax receipt: {}", e))
            })?;
        }

        // Promotion: rows still pending whose uuid the tax authority confirms
        // become sent; rows the tax authority reports canceled become
        // canceled unless a local error outcome exists.
        let sent = sqlx::query(
            r#"
            UPDATE local_receipts AS l
            SET status = 'sent',
                sent_at = COALESCE(l.sent_at, c.operation_time, NOW()),
                synced_from_tax = TRUE,
                updated_at = NOW()
            FROM tax_receipts_cache AS c
            WHERE l.receipt_uuid = c.receipt_uuid
              AND c.is_canceled = FALSE
              AND l.status NOT IN ('sent', 'canceled', 'error')
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Promotion failed: {}", e)))?;

        // Cancellation matches the alternate uuid too: older local rows may
        // have stored the filing request uuid rather than the approved one.
        let canceled = sqlx::query(
            r#"
            UPDATE local_receipts AS l
            SET status = 'canceled',
                canceled_at = COALESCE(c.canceled_at, NOW()),
                updated_at = NOW()
            FROM tax_receipts_cache AS c
            WHERE (l.receipt_uuid = c.receipt_uuid OR l.receipt_uuid = c.alternate_uuid)
              AND c.is_canceled = TRUE
              AND l.status NOT IN ('canceled', 'error')
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Promotion failed: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit sync: {}", e))
        })?;

        Ok(PromotionCounts {
            marked_sent: sent.rows_affected(),
            marked_canceled: canceled.rows_affected(),
        })
    }

    /// Refresh a single cache row in place. Used by the verification task and
    /// the point lookup; the listing sync replaces wholesale instead.
    #[instrument(skip(self, receipt), fields(receipt_uuid = %receipt.receipt_uuid))]
    pub async fn upsert_tax_receipt(&self, receipt: &TaxReceipt) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO tax_receipts_cache
                (receipt_uuid, alternate_uuid, total_amount, operation_time, request_time,
                 service_name, is_canceled, canceled_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (receipt_uuid) DO UPDATE SET
                alternate_uuid = EXCLUDED.alternate_uuid,
                total_amount = EXCLUDED.total_amount,
                operation_time = EXCLUDED.operation_time,
                request_time = EXCLUDED.request_time,
                service_name = EXCLUDED.service_name,
                is_canceled = EXCLUDED.is_canceled,
                canceled_at = EXCLUDED.canceled_at,
                payload = EXCLUDED.payload
            "#,
        )
        .bind(&receipt.receipt_uuid)
        .bind(&receipt.alternate_uuid)
        .bind(receipt.total_amount)
        .bind(receipt.operation_time)
        .bind(receipt.request_time)
        .bind(&receipt.service_name)
        .bind(receipt.is_canceled)
        .bind(receipt.canceled_at)
        .bind(&receipt.payload)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to upsert tax receipt: {}", e))
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(receipt_uuid = %receipt_uuid))]
    pub async fn mark_tax_receipt_canceled(
        &self,
        receipt_uuid: &str,
        canceled_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE tax_receipts_cache
            SET is_canceled = TRUE, canceled_at = $2
            WHERE receipt_uuid = $1
            "#,
        )
        .bind(receipt_uuid)
        .bind(canceled_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to cancel cached receipt: {}", e))
        })?;
        Ok(())
    }

    // ========================================================================
    // Service name catalogue
    // ========================================================================

    #[instrument(skip(self))]
    pub async fn list_service_names(&self) -> Result<Vec<String>, AppError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM service_names ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to list service names: {}", e))
                })?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    #[instrument(skip(self), fields(name = %name))]
    pub async fn add_service_name(&self, name: &str) -> Result<(), AppError> {
        sqlx::query("INSERT INTO service_names (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to add service name: {}", e))
            })?;
        Ok(())
    }

    #[instrument(skip(self), fields(name = %name))]
    pub async fn remove_service_name(&self, name: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM service_names WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to remove service name: {}", e))
            })?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn clear_service_names(&self) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM service_names")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to clear service names: {}", e))
            })?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    #[instrument(skip(self), fields(key = %key))]
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to get setting: {}", e))
                })?;
        Ok(row.map(|(value,)| value))
    }

    #[instrument(skip(self, value), fields(key = %key))]
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to set setting: {}", e)))?;
        Ok(())
    }
}
