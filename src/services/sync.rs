//! Sync workflow: rebuild the tax receipt cache from the authority's
//! listings and promote local rows the listings confirm.

use crate::error::AppError;
use crate::models::TaxReceipt;
use crate::services::database::Database;
use crate::services::tax_api::TaxClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const LAST_SYNC_KEY: &str = "last_tax_sync";

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub active: usize,
    pub canceled: usize,
    pub marked_sent: u64,
    pub marked_canceled: u64,
    /// Set when the canceled listing could not be fetched and the merge ran
    /// on active receipts only.
    pub partial: bool,
    pub last_sync: DateTime<Utc>,
}

/// Merge the active and canceled listings into one cache snapshot. A uuid
/// present in both keeps the canceled entry.
pub fn merge_listings(active: Vec<TaxReceipt>, canceled: Vec<TaxReceipt>) -> Vec<TaxReceipt> {
    let mut by_uuid: HashMap<String, TaxReceipt> = HashMap::new();
    for receipt in active {
        by_uuid.insert(receipt.receipt_uuid.clone(), receipt);
    }
    for mut receipt in canceled {
        // The canceled listing sometimes omits the cancellation marker on the
        // item itself; presence in that listing is the marker.
        if !receipt.is_canceled {
            receipt.is_canceled = true;
            receipt.canceled_at = receipt.canceled_at.or_else(|| Some(Utc::now()));
        }
        by_uuid.insert(receipt.receipt_uuid.clone(), receipt);
    }
    by_uuid.into_values().collect()
}

pub struct SyncWorkflow {
    db: Arc<Database>,
    tax: Arc<TaxClient>,
}

impl SyncWorkflow {
    pub fn new(db: Arc<Database>, tax: Arc<TaxClient>) -> Self {
        Self { db, tax }
    }

    /// Run one full sync. The active listing is required; if it fails the old
    /// cache is left untouched and the sync fails. A failed canceled listing
    /// degrades to a partial sync.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<SyncOutcome, AppError> {
        let active = self.tax.fetch_all_receipts(None).await?;

        let (canceled, partial) = match self.tax.fetch_all_receipts(Some("CANCELLED")).await {
            Ok(list) => (list, false),
            Err(err) => {
                warn!(error = %err, "canceled listing failed, running partial sync");
                (Vec::new(), true)
            }
        };

        let active_count = active.len();
        let canceled_count = canceled.len();
        let snapshot = merge_listings(active, canceled);

        let counts = self.db.replace_tax_cache_and_promote(&snapshot).await?;

        let last_sync = Utc::now();
        self.db
            .set_setting(LAST_SYNC_KEY, &last_sync.to_rfc3339())
            .await?;

        info!(
            active = active_count,
            canceled = canceled_count,
            marked_sent = counts.marked_sent,
            marked_canceled = counts.marked_canceled,
            partial,
            "tax sync complete"
        );

        Ok(SyncOutcome {
            active: active_count,
            canceled: canceled_count,
            marked_sent: counts.marked_sent,
            marked_canceled: counts.marked_canceled,
            partial,
            last_sync,
        })
    }

    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        let value = self.db.get_setting(LAST_SYNC_KEY).await?;
        Ok(value
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }
}
