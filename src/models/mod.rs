//! Domain models and typed parsers for the two external payload shapes.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

/// The tax authority reports and expects timestamps in its home timezone,
/// fixed at UTC+3. The date half of the inference key depends on this offset,
/// so it is a constant rather than configuration.
pub const TAX_TZ_OFFSET_SECS: i32 = 3 * 3600;

pub fn tax_tz() -> FixedOffset {
    FixedOffset::east_opt(TAX_TZ_OFFSET_SECS).expect("UTC+3 is a valid offset")
}

// ============================================================================
// Receipt Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Pending,
    Sent,
    Error,
    Canceled,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "error" => Self::Error,
            "canceled" => Self::Canceled,
            _ => Self::Pending,
        }
    }

    /// Sync may promote a row to `sent` only when no local outcome exists yet.
    pub fn sync_may_mark_sent(self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Sync may mark a row canceled from `pending` or `sent`, never over a
    /// locally recorded `error` outcome.
    pub fn sync_may_mark_canceled(self) -> bool {
        matches!(self, Self::Pending | Self::Sent)
    }

    /// A failed filing attempt must not downgrade a confirmed outcome.
    pub fn filing_may_record_error(self) -> bool {
        !matches!(self, Self::Sent | Self::Canceled)
    }
}

// ============================================================================
// Local Receipt Store
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct LocalReceipt {
    pub payment_id: String,
    pub receipt_uuid: Option<String>,
    pub status: String,
    pub receipt_url_print: Option<String>,
    pub receipt_url_json: Option<String>,
    pub service_name: Option<String>,
    pub amount: Option<Decimal>,
    pub sale_date: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub synced_from_tax: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalReceipt {
    pub fn status(&self) -> ReceiptStatus {
        ReceiptStatus::parse(&self.status)
    }
}

// ============================================================================
// Tax Receipt Cache
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct TaxReceipt {
    pub receipt_uuid: String,
    /// The filing request uuid when it differs from `receipt_uuid`. Older
    /// local rows may have stored this one, so the canceled promotion pass
    /// matches on either.
    pub alternate_uuid: Option<String>,
    pub total_amount: Decimal,
    pub operation_time: Option<DateTime<Utc>>,
    pub request_time: Option<DateTime<Utc>>,
    pub service_name: Option<String>,
    pub is_canceled: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

impl TaxReceipt {
    /// Calendar date of the operation in the tax authority's home timezone;
    /// falls back to the request time when the operation time is absent.
    pub fn operation_date(&self) -> Option<NaiveDate> {
        self.operation_time
            .or(self.request_time)
            .map(|t| t.with_timezone(&tax_tz()).date_naive())
    }
}

// ============================================================================
// Payment (read-only, owned by the payment source)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: String,
    pub amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub payment_method: String,
    pub metadata: serde_json::Value,
}

impl Payment {
    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        self.captured_at.or(self.created_at)
    }

    /// Calendar date of payment in the tax authority's home timezone.
    pub fn paid_date_tax_tz(&self) -> Option<NaiveDate> {
        self.paid_at().map(|t| t.with_timezone(&tax_tz()).date_naive())
    }
}

/// Raw payment item as returned by the payment source listing endpoint.
#[derive(Debug, Deserialize)]
pub struct RawPayment {
    pub id: String,
    pub amount: Option<RawAmount>,
    pub description: Option<String>,
    pub created_at: Option<String>,
    pub captured_at: Option<String>,
    pub payment_method: Option<RawPaymentMethod>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RawAmount {
    pub value: String,
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawPaymentMethod {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl RawPayment {
    /// Convert into the internal type. Malformed amounts and timestamps
    /// degrade to zero/None so reconciliation falls through to `pending`
    /// instead of failing the whole batch.
    pub fn into_payment(self) -> Payment {
        let (amount, currency) = match self.amount {
            Some(a) => (
                Decimal::from_str(&a.value).unwrap_or_default(),
                a.currency.unwrap_or_else(|| "RUB".to_string()),
            ),
            None => (Decimal::ZERO, "RUB".to_string()),
        };
        Payment {
            id: self.id,
            amount,
            currency,
            description: self.description,
            created_at: self.created_at.as_deref().and_then(parse_timestamp),
            captured_at: self.captured_at.as_deref().and_then(parse_timestamp),
            payment_method: self
                .payment_method
                .and_then(|m| m.kind)
                .unwrap_or_else(|| "unknown".to_string()),
            metadata: self.metadata.unwrap_or(serde_json::Value::Null),
        }
    }
}

// ============================================================================
// Raw tax authority receipt
// ============================================================================

/// Receipt item as returned by the tax authority's listing and point-lookup
/// endpoints. The uuid may live under any of three field names depending on
/// endpoint and receipt age; cancellation likewise.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTaxReceipt {
    pub approved_receipt_uuid: Option<String>,
    pub receipt_uuid: Option<String>,
    pub uuid: Option<String>,
    pub total_amount: Option<serde_json::Value>,
    pub operation_time: Option<String>,
    pub request_time: Option<String>,
    #[serde(default)]
    pub services: Vec<RawTaxService>,
    pub cancellation_info: Option<RawCancellationInfo>,
    pub canceled_info: Option<RawCancellationInfo>,
    pub cancelled_info: Option<RawCancellationInfo>,
    #[serde(default)]
    pub canceled: bool,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTaxService {
    pub name: Option<String>,
    pub amount: Option<serde_json::Value>,
    pub quantity: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCancellationInfo {
    pub operation_time: Option<String>,
    pub request_time: Option<String>,
    pub comment: Option<String>,
}

impl RawTaxReceipt {
    /// Preferred uuid, first present wins.
    pub fn primary_uuid(&self) -> Option<&str> {
        self.approved_receipt_uuid
            .as_deref()
            .or(self.receipt_uuid.as_deref())
            .or(self.uuid.as_deref())
    }

    /// A second uuid some receipts carry (the filing request id). Carried
    /// into the cache so cancellation matching works when the local row
    /// stored this one instead of the primary.
    pub fn alternate_uuid(&self) -> Option<&str> {
        let primary = self.primary_uuid()?;
        self.receipt_uuid
            .as_deref()
            .filter(|u| *u != primary)
            .or_else(|| self.approved_receipt_uuid.as_deref().filter(|u| *u != primary))
    }

    pub fn is_canceled(&self) -> bool {
        self.cancellation_info.is_some()
            || self.canceled_info.is_some()
            || self.cancelled_info.is_some()
            || self.canceled
            || self.status.as_deref() == Some("CANCELED")
    }

    pub fn canceled_at(&self) -> Option<DateTime<Utc>> {
        if !self.is_canceled() {
            return None;
        }
        let info = self
            .cancellation_info
            .as_ref()
            .or(self.canceled_info.as_ref())
            .or(self.cancelled_info.as_ref());
        info.and_then(|i| {
            i.operation_time
                .as_deref()
                .or(i.request_time.as_deref())
                .and_then(parse_timestamp)
        })
        .or_else(|| Some(Utc::now()))
    }

    /// Convert into a cache row, keeping the full raw payload. Returns `None`
    /// when the item carries no uuid at all (observed in the wild; such
    /// entries cannot be linked to anything and are skipped).
    pub fn into_tax_receipt(self, payload: serde_json::Value) -> Option<TaxReceipt> {
        let receipt_uuid = self.primary_uuid()?.to_string();
        let alternate_uuid = self.alternate_uuid().map(str::to_string);
        let is_canceled = self.is_canceled();
        let canceled_at = self.canceled_at();
        Some(TaxReceipt {
            receipt_uuid,
            alternate_uuid,
            total_amount: self
                .total_amount
                .as_ref()
                .and_then(decimal_from_value)
                .unwrap_or_default(),
            operation_time: self.operation_time.as_deref().and_then(parse_timestamp),
            request_time: self.request_time.as_deref().and_then(parse_timestamp),
            service_name: self.services.first().and_then(|s| s.name.clone()),
            is_canceled,
            canceled_at,
            payload,
        })
    }
}

// ============================================================================
// Annotated payment (reconciliation engine output)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedPayment {
    pub id: String,
    pub amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_method: String,
    pub metadata: serde_json::Value,
    pub receipt_status: ReceiptStatus,
    pub receipt_uuid: Option<String>,
    pub receipt_url_print: Option<String>,
    pub service_name: Option<String>,
    pub receipt_amount: Option<Decimal>,
    pub receipt_date: Option<String>,
    pub error_message: Option<String>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub in_tax_service: bool,
    pub tax_service_name: Option<String>,
    pub tax_amount: Option<Decimal>,
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse a timestamp that may or may not carry an offset. Offset-less values
/// come from the tax authority and are interpreted as its home timezone.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .ok()?;
    naive
        .and_local_timezone(tax_tz())
        .single()
        .map(|t| t.with_timezone(&Utc))
}

/// The tax authority serializes amounts as either JSON numbers or strings.
pub fn decimal_from_value(v: &serde_json::Value) -> Option<Decimal> {
    match v {
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}
