//! HTTP handlers. Thin JSON layer over the services; all domain logic lives
//! below.

use crate::error::AppError;
use crate::models::AnnotatedPayment;
use crate::services::reconcile;
use crate::services::stats;
use crate::startup::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

// ============================================================================
// Health
// ============================================================================

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": state.config.service_name,
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": state.config.service_name,
                    "error": e.to_string()
                })),
            )
        }
    }
}

// ============================================================================
// Payments
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PaymentsQuery {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    /// When set, the date window is dropped and the full listing is fetched.
    #[serde(default)]
    pub ignore_dates: bool,
}

#[derive(Debug, Serialize)]
pub struct PaymentsResponse {
    pub payments: Vec<AnnotatedPayment>,
    /// Set when the payment source listing was truncated by an upstream
    /// failure after the first page.
    pub partial: bool,
}

async fn annotated_batch(
    state: &AppState,
    date_from: Option<&str>,
    date_to: Option<&str>,
) -> Result<PaymentsResponse, AppError> {
    let listing = state.payments.list_payments(date_from, date_to).await?;

    let ids: Vec<String> = listing.payments.iter().map(|p| p.id.clone()).collect();
    let local = state.db.get_receipts_for_payments(&ids).await?;
    let tax = state.db.load_tax_receipts().await?;

    let annotated = reconcile::annotate(
        &listing.payments,
        &local,
        &tax,
        state.tax.login(),
        state.tax.base_url(),
    );

    Ok(PaymentsResponse {
        payments: annotated,
        partial: listing.partial,
    })
}

pub async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<PaymentsQuery>,
) -> Result<Json<PaymentsResponse>, AppError> {
    let (date_from, date_to) = if query.ignore_dates {
        (None, None)
    } else {
        (query.date_from.as_deref(), query.date_to.as_deref())
    };
    let response = annotated_batch(&state, date_from, date_to).await?;
    Ok(Json(response))
}

// ============================================================================
// Stats
// ============================================================================

pub async fn get_stats(
    State(state): State<AppState>,
) -> Result<Json<stats::StatsReport>, AppError> {
    let batch = annotated_batch(&state, None, None).await?;
    let mut report = stats::compute(&batch.payments, Utc::now());
    report.last_sync = state.sync.last_sync().await?;
    Ok(Json(report))
}

// ============================================================================
// Filing
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct FileReceiptRequest {
    pub payment_id: String,
    pub amount: Decimal,
    pub service_name: String,
    /// RFC 3339. Defaults to now; future dates are clamped when filing.
    pub sale_date: Option<String>,
}

pub async fn file_receipt(
    State(state): State<AppState>,
    Json(request): Json<FileReceiptRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.payment_id.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("payment_id is required")));
    }
    if request.service_name.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("service_name is required")));
    }
    if request.amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!("amount must be positive")));
    }

    let sale_date = match request.sale_date.as_deref() {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| AppError::BadRequest(anyhow::anyhow!("invalid sale_date")))?,
        None => Utc::now(),
    };

    let outcome = state
        .filing
        .file(
            &request.payment_id,
            request.amount,
            request.service_name.trim(),
            sale_date,
        )
        .await?;

    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct CancelReceiptRequest {
    pub payment_id: String,
    pub comment: Option<String>,
}

pub async fn cancel_receipt(
    State(state): State<AppState>,
    Json(request): Json<CancelReceiptRequest>,
) -> Result<impl IntoResponse, AppError> {
    let comment = request
        .comment
        .as_deref()
        .unwrap_or("Чек сформирован ошибочно");
    let outcome = state.filing.cancel(&request.payment_id, comment).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct CheckReceiptRequest {
    pub payment_id: Option<String>,
    pub receipt_uuid: Option<String>,
}

pub async fn check_receipt(
    State(state): State<AppState>,
    Json(request): Json<CheckReceiptRequest>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = match (&request.payment_id, &request.receipt_uuid) {
        (Some(payment_id), _) => state.filing.check_payment(payment_id).await?,
        (None, Some(uuid)) => state.filing.check_uuid(uuid).await?,
        (None, None) => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "payment_id or receipt_uuid is required"
            )))
        }
    };
    Ok(Json(outcome))
}

// ============================================================================
// Sync
// ============================================================================

pub async fn run_sync(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let outcome = state.sync.run().await?;
    Ok(Json(outcome))
}

// ============================================================================
// Service name catalogue
// ============================================================================

pub async fn list_service_names(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let names = state.db.list_service_names().await?;
    Ok(Json(json!({ "names": names })))
}

#[derive(Debug, Deserialize)]
pub struct AddServiceNameRequest {
    pub name: String,
}

pub async fn add_service_name(
    State(state): State<AppState>,
    Json(request): Json<AddServiceNameRequest>,
) -> Result<impl IntoResponse, AppError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("name is required")));
    }
    // The dashboard's input placeholder sometimes arrives verbatim.
    if name == "Название услуги" {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "placeholder name is not a service"
        )));
    }
    state.db.add_service_name(name).await?;
    Ok(StatusCode::CREATED)
}

pub async fn remove_service_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if state.db.remove_service_name(&name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(anyhow::anyhow!("unknown service name")))
    }
}

pub async fn clear_service_names(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let removed = state.db.clear_service_names().await?;
    Ok(Json(json!({ "removed": removed })))
}
