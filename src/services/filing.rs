//! Filing workflow: file, cancel and verify receipts for individual
//! payments, with per-payment mutual exclusion.

use crate::error::AppError;
use crate::models::{LocalReceipt, ReceiptStatus, TaxReceipt};
use crate::services::database::{Database, FiledReceiptRecord};
use crate::services::inflight::InflightSet;
use crate::services::tax_api::{ReceiptLookup, TaxClient};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Serialize)]
pub struct FilingOutcome {
    pub success: bool,
    pub already_sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_url_print: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub success: bool,
    pub canceled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub found: bool,
    pub is_canceled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<serde_json::Value>,
}

/// Filing a payment that already holds a `sent` row is a no-op answered from
/// the store.
pub fn short_circuit_already_sent(row: Option<&LocalReceipt>) -> Option<FilingOutcome> {
    let row = row?;
    if row.status() != ReceiptStatus::Sent {
        return None;
    }
    Some(FilingOutcome {
        success: true,
        already_sent: true,
        receipt_uuid: row.receipt_uuid.clone(),
        receipt_url_print: row.receipt_url_print.clone(),
        error: None,
    })
}

#[derive(Clone)]
pub struct FilingWorkflow {
    db: Arc<Database>,
    tax: Arc<TaxClient>,
    inflight: Arc<InflightSet>,
    shutdown: CancellationToken,
    verify_delay: Duration,
}

impl FilingWorkflow {
    pub fn new(
        db: Arc<Database>,
        tax: Arc<TaxClient>,
        inflight: Arc<InflightSet>,
        shutdown: CancellationToken,
        verify_delay: Duration,
    ) -> Self {
        Self {
            db,
            tax,
            inflight,
            shutdown,
            verify_delay,
        }
    }

    /// File a receipt for one payment. Concurrent requests for the same
    /// payment are rejected; a repeat request for an already-sent payment
    /// returns the stored result without contacting the tax authority.
    #[instrument(skip(self), fields(payment_id = %payment_id, amount = %amount))]
    pub async fn file(
        &self,
        payment_id: &str,
        amount: Decimal,
        service_name: &str,
        sale_date: DateTime<Utc>,
    ) -> Result<FilingOutcome, AppError> {
        let _guard = self.inflight.try_acquire(payment_id).ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!(
                "an operation for payment {} is already in progress",
                payment_id
            ))
        })?;

        let existing = self.db.get_receipt(payment_id).await?;
        if let Some(outcome) = short_circuit_already_sent(existing.as_ref()) {
            info!(payment_id, "already sent, returning stored receipt");
            return Ok(outcome);
        }

        let filed = match self.tax.file_receipt(amount, service_name, sale_date).await {
            Ok(filed) => filed,
            Err(err) => {
                let message = err.to_string();
                warn!(payment_id, error = %message, "filing failed");
                self.db.mark_error(payment_id, &message).await?;
                return Ok(FilingOutcome {
                    success: false,
                    already_sent: false,
                    receipt_uuid: None,
                    receipt_url_print: None,
                    error: Some(message),
                });
            }
        };

        self.db
            .mark_sent(&FiledReceiptRecord {
                payment_id: payment_id.to_string(),
                receipt_uuid: filed.uuid.clone(),
                receipt_url_print: Some(filed.print_url.clone()),
                receipt_url_json: Some(filed.json_url.clone()),
                service_name: Some(service_name.to_string()),
                amount: Some(amount.round_dp(2)),
                sale_date: Some(sale_date.to_rfc3339()),
                sent_at: Some(Utc::now()),
                synced_from_tax: false,
            })
            .await?;

        self.spawn_verification(filed.uuid.clone());

        Ok(FilingOutcome {
            success: true,
            already_sent: false,
            receipt_uuid: Some(filed.uuid),
            receipt_url_print: Some(filed.print_url),
            error: None,
        })
    }

    /// Cancel the filed receipt for one payment.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn cancel(&self, payment_id: &str, comment: &str) -> Result<CancelOutcome, AppError> {
        let _guard = self.inflight.try_acquire(payment_id).ok_or_else(|| {
            AppError::Conflict(anyhow::anyhow!(
                "an operation for payment {} is already in progress",
                payment_id
            ))
        })?;

        let row = self
            .db
            .get_receipt(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("no receipt for this payment")))?;

        if row.status() == ReceiptStatus::Canceled {
            return Ok(CancelOutcome {
                success: true,
                canceled_at: row.canceled_at.unwrap_or_else(Utc::now),
            });
        }

        let uuid = row.receipt_uuid.as_deref().ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("receipt was never filed, nothing to cancel"))
        })?;

        self.tax.cancel_receipt(uuid, comment).await?;

        let canceled_at = Utc::now();
        self.db.mark_canceled(payment_id, canceled_at).await?;
        self.db.mark_tax_receipt_canceled(uuid, canceled_at).await?;

        Ok(CancelOutcome {
            success: true,
            canceled_at,
        })
    }

    /// Check a payment's receipt against the authority.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn check_payment(&self, payment_id: &str) -> Result<CheckOutcome, AppError> {
        let row = self
            .db
            .get_receipt(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("no receipt for this payment")))?;

        let uuid = row.receipt_uuid.as_deref().ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("receipt was never filed, nothing to check"))
        })?;

        self.check_uuid(uuid).await
    }

    /// Look up the authority's current view of a receipt and fold it back
    /// into the cache and the local store.
    #[instrument(skip(self), fields(uuid = %receipt_uuid))]
    pub async fn check_uuid(&self, receipt_uuid: &str) -> Result<CheckOutcome, AppError> {
        match self.tax.get_receipt(receipt_uuid).await? {
            ReceiptLookup::Found(receipt) => {
                self.absorb_lookup(&receipt).await?;
                Ok(CheckOutcome {
                    found: true,
                    is_canceled: receipt.is_canceled,
                    receipt: Some(receipt.payload),
                })
            }
            ReceiptLookup::NotFound => Ok(CheckOutcome {
                found: false,
                is_canceled: false,
                receipt: None,
            }),
        }
    }

    async fn absorb_lookup(&self, receipt: &TaxReceipt) -> Result<(), AppError> {
        self.db.upsert_tax_receipt(receipt).await?;
        if receipt.is_canceled {
            let canceled_at = receipt.canceled_at.unwrap_or_else(Utc::now);
            let mut updated = self
                .db
                .mark_canceled_by_uuid(&receipt.receipt_uuid, canceled_at)
                .await?;
            // The local row may hold the filing request uuid instead.
            if let Some(alternate) = &receipt.alternate_uuid {
                updated += self.db.mark_canceled_by_uuid(alternate, canceled_at).await?;
            }
            if updated > 0 {
                info!(uuid = %receipt.receipt_uuid, "local receipt marked canceled from lookup");
            }
        }
        Ok(())
    }

    /// Detached verification: after a short delay, confirm the just-filed
    /// receipt against the authority and absorb what it reports. Cancelled by
    /// shutdown; failures are logged, never surfaced to the filing caller.
    fn spawn_verification(&self, receipt_uuid: String) {
        let workflow = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = workflow.shutdown.cancelled() => return,
                _ = tokio::time::sleep(workflow.verify_delay) => {}
            }

            match workflow.tax.get_receipt(&receipt_uuid).await {
                Ok(ReceiptLookup::Found(receipt)) => {
                    if let Err(err) = workflow.absorb_lookup(&receipt).await {
                        error!(uuid = %receipt_uuid, error = %err, "verification update failed");
                    }
                }
                Ok(ReceiptLookup::NotFound) => {
                    warn!(uuid = %receipt_uuid, "filed receipt not visible yet");
                }
                Err(err) => {
                    warn!(uuid = %receipt_uuid, error = %err, "verification lookup failed");
                }
            }
        });
    }
}
