//! Payment source client: read-only listing of succeeded payments with
//! cursor pagination and a short in-process cache.

use crate::config::PaymentSourceConfig;
use crate::error::AppError;
use crate::models::{Payment, RawPayment};
use crate::services::retry::{retry_http, RetryConfig, UpstreamError};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

const PAGE_SIZE: u32 = 100;
const CACHE_TTL: Duration = Duration::from_secs(15);

/// Listing result. `partial` is set when a page after the first failed and
/// the earlier pages are returned as-is.
#[derive(Debug, Clone)]
pub struct PaymentListing {
    pub payments: Vec<Payment>,
    pub partial: bool,
}

#[derive(Debug, Deserialize)]
struct ListingPage {
    #[serde(default)]
    items: Vec<RawPayment>,
    next_cursor: Option<String>,
}

pub struct PaymentSourceClient {
    http: reqwest::Client,
    base_url: String,
    shop_id: String,
    secret_key: Secret<String>,
    retry: RetryConfig,
    cache: RwLock<HashMap<String, (Instant, PaymentListing)>>,
}

impl PaymentSourceClient {
    pub fn new(config: &PaymentSourceConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            shop_id: config.shop_id.clone(),
            secret_key: config.secret_key.clone(),
            retry: RetryConfig::default(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// List succeeded payments in the optional date window, newest first as
    /// returned by the source. Results are cached briefly so a dashboard
    /// refresh does not re-walk the whole listing.
    #[instrument(skip(self))]
    pub async fn list_payments(
        &self,
        date_from: Option<&str>,
        date_to: Option<&str>,
    ) -> Result<PaymentListing, AppError> {
        let cache_key = format!(
            "{}..{}",
            date_from.unwrap_or_default(),
            date_to.unwrap_or_default()
        );

        if let Some((at, listing)) = self.cache.read().await.get(&cache_key) {
            if at.elapsed() < CACHE_TTL {
                return Ok(listing.clone());
            }
        }

        let listing = self.fetch_all(date_from, date_to).await?;

        // Partial results stay out of the cache so the next call retries the
        // failed pages.
        if !listing.partial {
            self.cache
                .write()
                .await
                .insert(cache_key, (Instant::now(), listing.clone()));
        }

        Ok(listing)
    }

    async fn fetch_all(
        &self,
        date_from: Option<&str>,
        date_to: Option<&str>,
    ) -> Result<PaymentListing, AppError> {
        let mut payments = Vec::new();
        let mut cursor: Option<String> = None;
        let mut first_page = true;

        loop {
            let page = match self.fetch_page(date_from, date_to, cursor.as_deref()).await {
                Ok(page) => page,
                Err(err) if first_page => {
                    return Err(AppError::Upstream(format!(
                        "payment listing failed: {}",
                        err
                    )));
                }
                Err(err) => {
                    warn!(error = %err, fetched = payments.len(), "payment listing truncated");
                    return Ok(PaymentListing {
                        payments,
                        partial: true,
                    });
                }
            };

            payments.extend(page.items.into_iter().map(RawPayment::into_payment));
            first_page = false;

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        info!(count = payments.len(), "payment listing fetched");
        Ok(PaymentListing {
            payments,
            partial: false,
        })
    }

    async fn fetch_page(
        &self,
        date_from: Option<&str>,
        date_to: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<ListingPage, UpstreamError> {
        let url = format!("{}/payments", self.base_url);

        retry_http(&self.retry, "payments.list", || {
            let mut query: Vec<(&str, String)> = vec![
                ("limit", PAGE_SIZE.to_string()),
                ("status", "succeeded".to_string()),
            ];
            if let Some(from) = date_from {
                query.push(("created_at.gte", from.to_string()));
            }
            if let Some(to) = date_to {
                query.push(("created_at.lte", to.to_string()));
            }
            if let Some(c) = cursor {
                query.push(("cursor", c.to_string()));
            }

            let request = self
                .http
                .get(&url)
                .basic_auth(&self.shop_id, Some(self.secret_key.expose_secret()))
                .query(&query);

            async move {
                let response = request
                    .send()
                    .await
                    .map_err(UpstreamError::from_request_error)?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(UpstreamError::from_status(status, body));
                }
                response
                    .json::<ListingPage>()
                    .await
                    .map_err(|e| UpstreamError::Rejected(format!("malformed listing page: {}", e)))
            }
        })
        .await
    }
}
