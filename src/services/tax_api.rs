//! Tax authority client: authentication, receipt filing and cancellation,
//! paginated listings and point lookup.

use crate::config::TaxAuthorityConfig;
use crate::error::AppError;
use crate::models::{tax_tz, RawTaxReceipt, TaxReceipt};
use crate::services::reconcile::print_url;
use crate::services::retry::{retry_http, RetryConfig, UpstreamError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

const LISTING_PAGE_SIZE: u32 = 100;
const INTER_PAGE_DELAY: Duration = Duration::from_millis(300);

/// What a successful filing hands back to the caller.
#[derive(Debug, Clone)]
pub struct FiledReceipt {
    pub uuid: String,
    pub print_url: String,
    pub json_url: String,
}

/// Point lookup result. The authority 404s receipts that exist but have not
/// propagated to the lookup endpoint yet, so absence from the listings is the
/// only authoritative `NotFound`.
#[derive(Debug, Clone)]
pub enum ReceiptLookup {
    Found(TaxReceipt),
    NotFound,
}

#[derive(Debug, Default)]
struct TokenState {
    access: Option<String>,
    refresh: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    token: String,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomeResponse {
    approved_receipt_uuid: String,
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default, rename = "hasMore")]
    has_more: Option<bool>,
}

pub struct TaxClient {
    http: reqwest::Client,
    base_url: String,
    login: String,
    password: Secret<String>,
    device_id: String,
    retry: RetryConfig,
    tokens: Mutex<TokenState>,
}

impl TaxClient {
    pub fn new(config: &TaxAuthorityConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            login: config.login.clone(),
            password: config.password.clone(),
            // Stable for the process lifetime; the authority ties refresh
            // tokens to the device id.
            device_id: uuid::Uuid::new_v4().simple().to_string(),
            retry: RetryConfig::default(),
            tokens: Mutex::new(TokenState::default()),
        }
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn device_info(&self) -> serde_json::Value {
        json!({
            "sourceDeviceId": self.device_id,
            "sourceType": "WEB",
            "appVersion": "1.0.0",
            "metaDetails": { "userAgent": "fiscal-recon" }
        })
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Full username/password login. Replaces any cached tokens.
    #[instrument(skip(self))]
    pub async fn authenticate(&self) -> Result<(), AppError> {
        let mut tokens = self.tokens.lock().await;
        self.login_locked(&mut tokens).await
    }

    async fn login_locked(&self, tokens: &mut TokenState) -> Result<(), AppError> {
        let body = json!({
            "username": self.login,
            "password": self.password.expose_secret(),
            "deviceInfo": self.device_info(),
        });

        let response = self
            .http
            .post(format!("{}/auth/lkfl", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("tax auth failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "tax authority rejected credentials"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "tax auth failed: {}: {}",
                status, text
            )));
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("malformed auth response: {}", e)))?;

        tokens.access = Some(auth.token);
        tokens.refresh = auth.refresh_token;
        info!("tax authority session established");
        Ok(())
    }

    async fn refresh_locked(&self, tokens: &mut TokenState) -> Result<(), AppError> {
        let Some(refresh) = tokens.refresh.clone() else {
            return self.login_locked(tokens).await;
        };

        let body = json!({
            "deviceInfo": self.device_info(),
            "refreshToken": refresh,
        });

        let response = self
            .http
            .post(format!("{}/auth/token", self.base_url))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let auth: AuthResponse = resp
                    .json()
                    .await
                    .map_err(|e| AppError::Upstream(format!("malformed auth response: {}", e)))?;
                tokens.access = Some(auth.token);
                if auth.refresh_token.is_some() {
                    tokens.refresh = auth.refresh_token;
                }
                Ok(())
            }
            // A dead refresh token falls back to the full login.
            _ => {
                warn!("token refresh failed, re-authenticating");
                tokens.refresh = None;
                self.login_locked(tokens).await
            }
        }
    }

    async fn access_token(&self) -> Result<String, AppError> {
        let mut tokens = self.tokens.lock().await;
        if let Some(access) = &tokens.access {
            return Ok(access.clone());
        }
        self.refresh_locked(&mut tokens).await?;
        tokens
            .access
            .clone()
            .ok_or_else(|| AppError::Upstream("no access token after auth".to_string()))
    }

    async fn invalidate_access_token(&self) {
        self.tokens.lock().await.access = None;
    }

    /// Authorized request that treats a 401 as transient after dropping the
    /// cached token, so the retry loop re-authenticates and tries again.
    async fn authorized_json<T, F>(&self, description: &str, build: F) -> Result<T, UpstreamError>
    where
        T: serde::de::DeserializeOwned,
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let this = self;
        let build = &build;
        retry_http(&self.retry, description, move || async move {
            let token = this
                .access_token()
                .await
                .map_err(|e| UpstreamError::Transient(e.to_string()))?;

            let response = build(&token)
                .send()
                .await
                .map_err(UpstreamError::from_request_error)?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                this.invalidate_access_token().await;
                return Err(UpstreamError::Transient("session expired".to_string()));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(UpstreamError::from_status(status, body));
            }
            response
                .json::<T>()
                .await
                .map_err(|e| UpstreamError::Rejected(format!("malformed response: {}", e)))
        })
        .await
    }

    // ========================================================================
    // Filing and cancellation
    // ========================================================================

    /// File an income receipt. `sale_date` in the future is clamped to now,
    /// and the request time never precedes the operation time.
    #[instrument(skip(self), fields(amount = %amount, service = %service_name))]
    pub async fn file_receipt(
        &self,
        amount: Decimal,
        service_name: &str,
        sale_date: DateTime<Utc>,
    ) -> Result<FiledReceipt, AppError> {
        let now = Utc::now();
        let operation_time = sale_date.min(now);
        let request_time = now.max(operation_time);

        let body = json!({
            "operationTime": format_tax_time(operation_time),
            "requestTime": format_tax_time(request_time),
            "paymentType": "CASH",
            "ignoreMaxTotalIncomeRestriction": false,
            "client": {
                "contactPhone": null,
                "displayName": null,
                "incomeType": "FROM_INDIVIDUAL",
                "inn": null
            },
            "services": [{
                "name": service_name,
                "amount": amount.round_dp(2),
                "quantity": 1
            }],
            "totalAmount": amount.round_dp(2).to_string(),
        });

        let income: IncomeResponse = self
            .authorized_json("tax.income", |token| {
                self.http
                    .post(format!("{}/income", self.base_url))
                    .bearer_auth(token)
                    .json(&body)
            })
            .await
            .map_err(map_upstream)?;

        info!(uuid = %income.approved_receipt_uuid, "receipt filed");
        Ok(FiledReceipt {
            print_url: print_url(&self.base_url, &self.login, &income.approved_receipt_uuid),
            json_url: format!(
                "{}/receipt/{}/{}/json",
                self.base_url, self.login, income.approved_receipt_uuid
            ),
            uuid: income.approved_receipt_uuid,
        })
    }

    /// Cancel a filed receipt. `comment` is the authority's fixed reason
    /// vocabulary, e.g. "Чек сформирован ошибочно" or "Возврат средств".
    #[instrument(skip(self), fields(uuid = %receipt_uuid))]
    pub async fn cancel_receipt(
        &self,
        receipt_uuid: &str,
        comment: &str,
    ) -> Result<(), AppError> {
        let now = format_tax_time(Utc::now());
        let body = json!({
            "operationTime": now,
            "requestTime": now,
            "comment": comment,
            "receiptUuid": receipt_uuid,
            "partnerCode": null,
        });

        let _: serde_json::Value = self
            .authorized_json("tax.cancel", |token| {
                self.http
                    .post(format!("{}/cancel", self.base_url))
                    .bearer_auth(token)
                    .json(&body)
            })
            .await
            .map_err(map_upstream)?;

        info!(uuid = %receipt_uuid, "receipt canceled");
        Ok(())
    }

    // ========================================================================
    // Listings and lookup
    // ========================================================================

    /// Fetch the full receipt listing. `receipt_type` of `CANCELLED` selects
    /// the canceled listing; `None` selects active receipts.
    #[instrument(skip(self))]
    pub async fn fetch_all_receipts(
        &self,
        receipt_type: Option<&str>,
    ) -> Result<Vec<TaxReceipt>, AppError> {
        let mut receipts = Vec::new();
        let mut offset: u32 = 0;

        loop {
            let page: ListingResponse = self
                .authorized_json("tax.incomes", |token| {
                    let mut query: Vec<(&str, String)> = vec![
                        ("limit", LISTING_PAGE_SIZE.to_string()),
                        ("offset", offset.to_string()),
                        ("sortBy", "operation_time:desc".to_string()),
                    ];
                    if let Some(kind) = receipt_type {
                        query.push(("receiptType", kind.to_string()));
                    }
                    self.http
                        .get(format!("{}/incomes", self.base_url))
                        .bearer_auth(token)
                        .query(&query)
                })
                .await
                .map_err(map_upstream)?;

            let fetched = page.items.len();
            for payload in page.items {
                let raw: RawTaxReceipt = match serde_json::from_value(payload.clone()) {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(error = %err, "skipping unparseable receipt item");
                        continue;
                    }
                };
                if let Some(receipt) = raw.into_tax_receipt(payload) {
                    receipts.push(receipt);
                }
            }

            let more = page
                .has_more
                .unwrap_or(fetched as u32 == LISTING_PAGE_SIZE);
            if !more || fetched == 0 {
                break;
            }
            offset += fetched as u32;
            tokio::time::sleep(INTER_PAGE_DELAY).await;
        }

        info!(
            count = receipts.len(),
            receipt_type = receipt_type.unwrap_or("active"),
            "tax listing fetched"
        );
        Ok(receipts)
    }

    /// Point lookup by uuid, falling back to a listing scan when the lookup
    /// endpoint 404s.
    #[instrument(skip(self), fields(uuid = %receipt_uuid))]
    pub async fn get_receipt(&self, receipt_uuid: &str) -> Result<ReceiptLookup, AppError> {
        let this = self;
        let lookup = retry_http(&self.retry, "tax.receipt", move || async move {
            let token = this
                .access_token()
                .await
                .map_err(|e| UpstreamError::Transient(e.to_string()))?;

            let response = this
                .http
                .get(format!(
                    "{}/receipt/{}/{}/json",
                    this.base_url, this.login, receipt_uuid
                ))
                .bearer_auth(token)
                .send()
                .await
                .map_err(UpstreamError::from_request_error)?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                this.invalidate_access_token().await;
                return Err(UpstreamError::Transient("session expired".to_string()));
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(UpstreamError::from_status(status, body));
            }
            response
                .json::<serde_json::Value>()
                .await
                .map(Some)
                .map_err(|e| UpstreamError::Rejected(format!("malformed receipt: {}", e)))
        })
        .await
        .map_err(map_upstream)?;

        if let Some(payload) = lookup {
            let raw: RawTaxReceipt = serde_json::from_value(payload.clone())
                .map_err(|e| AppError::Upstream(format!("malformed receipt: {}", e)))?;
            if let Some(receipt) = raw.into_tax_receipt(payload) {
                return Ok(ReceiptLookup::Found(receipt));
            }
        }

        // Freshly filed receipts can 404 here for a while; the listings are
        // the authoritative fallback.
        for kind in [None, Some("CANCELLED")] {
            let listing = self.fetch_all_receipts(kind).await?;
            if let Some(receipt) = listing.into_iter().find(|r| r.receipt_uuid == receipt_uuid) {
                return Ok(ReceiptLookup::Found(receipt));
            }
        }

        Ok(ReceiptLookup::NotFound)
    }
}

/// Timestamps sent to the authority carry its home offset explicitly.
pub fn format_tax_time(t: DateTime<Utc>) -> String {
    t.with_timezone(&tax_tz())
        .format("%Y-%m-%dT%H:%M:%S%:z")
        .to_string()
}

fn map_upstream(err: UpstreamError) -> AppError {
    match err {
        UpstreamError::Rejected(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
        UpstreamError::Transient(msg) => AppError::Upstream(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn tax_time_carries_home_offset() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(format_tax_time(t), "2024-03-01T13:00:00+03:00");
    }
}
