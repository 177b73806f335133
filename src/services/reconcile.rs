//! Pure reconciliation engine: annotates a batch of payments with their
//! filing state from the local store and the tax receipt cache.
//!
//! No I/O happens here. Callers load the inputs and persist nothing; the
//! engine only computes the annotated view.

use crate::models::{AnnotatedPayment, LocalReceipt, Payment, ReceiptStatus, TaxReceipt};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

/// Inference key: calendar date in the tax authority's timezone plus the
/// amount rounded to two decimal places.
type MatchKey = (NaiveDate, Decimal);

/// Build the print URL for a filed receipt.
pub fn print_url(base_url: &str, login: &str, uuid: &str) -> String {
    format!(
        "{}/receipt/{}/{}/print",
        base_url.trim_end_matches('/'),
        login,
        uuid
    )
}

/// Annotate `payments` with receipt state.
///
/// Linkage is resolved in two passes:
/// 1. direct: the local store row for a payment names a receipt uuid;
/// 2. inferred: a payment with no local row is matched against an unclaimed,
///    non-canceled cached receipt sharing its (date, amount) key, but only
///    when that key identifies exactly one such payment and exactly one such
///    receipt.
///
/// Each receipt uuid is claimed at most once across the whole batch, by
/// direct and inferred links alike. Claiming runs in ascending (paid_at, id)
/// order, so when several payments dispute a uuid the earliest one wins and
/// only the winner renders as live in the tax service; the output preserves
/// input order.
pub fn annotate(
    payments: &[Payment],
    local: &HashMap<String, LocalReceipt>,
    tax: &[TaxReceipt],
    login: &str,
    tax_base_url: &str,
) -> Vec<AnnotatedPayment> {
    let tax_by_uuid: HashMap<&str, &TaxReceipt> = tax
        .iter()
        .map(|r| (r.receipt_uuid.as_str(), r))
        .collect();

    // Uuids referenced by any local row are off limits for inference.
    let referenced: HashSet<&str> = local
        .values()
        .filter_map(|r| r.receipt_uuid.as_deref())
        .collect();

    // Candidate receipts for inference, keyed by (date, amount). A key held
    // by more than one receipt is ambiguous and matches nothing.
    let mut tax_by_key: HashMap<MatchKey, Vec<&TaxReceipt>> = HashMap::new();
    for receipt in tax {
        if receipt.is_canceled || referenced.contains(receipt.receipt_uuid.as_str()) {
            continue;
        }
        if let Some(date) = receipt.operation_date() {
            tax_by_key
                .entry((date, receipt.total_amount.round_dp(2)))
                .or_default()
                .push(receipt);
        }
    }

    // Key frequency among payments that have no local row. Inference only
    // applies when the key singles out one payment.
    let mut key_counts: HashMap<MatchKey, u32> = HashMap::new();
    for payment in payments {
        if local.contains_key(&payment.id) {
            continue;
        }
        if let Some(date) = payment.paid_date_tax_tz() {
            *key_counts.entry((date, payment.amount.round_dp(2))).or_default() += 1;
        }
    }

    // Claim in ascending (paid_at, id) order regardless of input order.
    let mut order: Vec<usize> = (0..payments.len()).collect();
    order.sort_by(|&a, &b| {
        payments[a]
            .paid_at()
            .cmp(&payments[b].paid_at())
            .then_with(|| payments[a].id.cmp(&payments[b].id))
    });

    let mut claimed: HashSet<&str> = HashSet::new();
    let mut direct_claimants: HashSet<usize> = HashSet::new();
    let mut inferred: HashMap<usize, &TaxReceipt> = HashMap::new();
    for &idx in &order {
        let payment = &payments[idx];
        if let Some(row) = local.get(&payment.id) {
            // Direct links claim too: when several local rows name the same
            // uuid, only the earliest payment gets it.
            if let Some(uuid) = row.receipt_uuid.as_deref() {
                if claimed.insert(uuid) {
                    direct_claimants.insert(idx);
                }
            }
            continue;
        }
        let Some(date) = payment.paid_date_tax_tz() else {
            continue;
        };
        let key = (date, payment.amount.round_dp(2));
        if key_counts.get(&key) != Some(&1) {
            continue;
        }
        let Some(candidates) = tax_by_key.get(&key) else {
            continue;
        };
        let available: Vec<&TaxReceipt> = candidates
            .iter()
            .copied()
            .filter(|r| !claimed.contains(r.receipt_uuid.as_str()))
            .collect();
        if available.len() == 1 {
            let receipt = available[0];
            claimed.insert(receipt.receipt_uuid.as_str());
            inferred.insert(idx, receipt);
        }
    }

    payments
        .iter()
        .enumerate()
        .map(|(idx, payment)| {
            if let Some(row) = local.get(&payment.id) {
                let is_claimant = direct_claimants.contains(&idx);
                annotate_from_local(payment, row, &tax_by_uuid, login, tax_base_url, is_claimant)
            } else if let Some(receipt) = inferred.get(&idx) {
                annotate_from_inference(payment, receipt, login, tax_base_url)
            } else {
                annotate_pending(payment)
            }
        })
        .collect()
}

/// The local store is authoritative for status and filing details; the cache
/// only contributes the tax authority's view of the same receipt.
fn annotate_from_local(
    payment: &Payment,
    row: &LocalReceipt,
    tax_by_uuid: &HashMap<&str, &TaxReceipt>,
    login: &str,
    tax_base_url: &str,
    is_claimant: bool,
) -> AnnotatedPayment {
    let status = row.status();
    let cached = row
        .receipt_uuid
        .as_deref()
        .and_then(|uuid| tax_by_uuid.get(uuid).copied());

    // A canceled or errored payment is never presented as live in the tax
    // service, even while the cache still lists its receipt. A payment that
    // lost its uuid to an earlier payment is not live either.
    let in_tax_service = is_claimant
        && !matches!(status, ReceiptStatus::Canceled | ReceiptStatus::Error)
        && cached.map(|r| !r.is_canceled).unwrap_or(false);

    let receipt_url_print = row.receipt_url_print.clone().or_else(|| {
        row.receipt_uuid
            .as_deref()
            .map(|uuid| print_url(tax_base_url, login, uuid))
    });

    AnnotatedPayment {
        id: payment.id.clone(),
        amount: payment.amount,
        currency: payment.currency.clone(),
        description: payment.description.clone(),
        created_at: payment.created_at,
        paid_at: payment.paid_at(),
        payment_method: payment.payment_method.clone(),
        metadata: payment.metadata.clone(),
        receipt_status: status,
        receipt_uuid: row.receipt_uuid.clone(),
        receipt_url_print,
        service_name: row.service_name.clone(),
        receipt_amount: row.amount,
        receipt_date: row.sale_date.clone(),
        error_message: row.error_message.clone(),
        canceled_at: row.canceled_at,
        sent_at: row.sent_at,
        in_tax_service,
        tax_service_name: cached.and_then(|r| r.service_name.clone()),
        tax_amount: cached.map(|r| r.total_amount),
    }
}

fn annotate_from_inference(
    payment: &Payment,
    receipt: &TaxReceipt,
    login: &str,
    tax_base_url: &str,
) -> AnnotatedPayment {
    AnnotatedPayment {
        id: payment.id.clone(),
        amount: payment.amount,
        currency: payment.currency.clone(),
        description: payment.description.clone(),
        created_at: payment.created_at,
        paid_at: payment.paid_at(),
        payment_method: payment.payment_method.clone(),
        metadata: payment.metadata.clone(),
        receipt_status: ReceiptStatus::Sent,
        receipt_uuid: Some(receipt.receipt_uuid.clone()),
        receipt_url_print: Some(print_url(tax_base_url, login, &receipt.receipt_uuid)),
        service_name: receipt.service_name.clone(),
        receipt_amount: Some(receipt.total_amount),
        receipt_date: receipt.operation_date().map(|d| d.to_string()),
        error_message: None,
        canceled_at: None,
        sent_at: receipt.operation_time.or(receipt.request_time),
        in_tax_service: true,
        tax_service_name: receipt.service_name.clone(),
        tax_amount: Some(receipt.total_amount),
    }
}

fn annotate_pending(payment: &Payment) -> AnnotatedPayment {
    AnnotatedPayment {
        id: payment.id.clone(),
        amount: payment.amount,
        currency: payment.currency.clone(),
        description: payment.description.clone(),
        created_at: payment.created_at,
        paid_at: payment.paid_at(),
        payment_method: payment.payment_method.clone(),
        metadata: payment.metadata.clone(),
        receipt_status: ReceiptStatus::Pending,
        receipt_uuid: None,
        receipt_url_print: None,
        service_name: None,
        receipt_amount: None,
        receipt_date: None,
        error_message: None,
        canceled_at: None,
        sent_at: None,
        in_tax_service: false,
        tax_service_name: None,
        tax_amount: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_url_handles_trailing_slash() {
        assert_eq!(
            print_url("https://lknpd.nalog.ru/api/v1/", "7700", "abc"),
            "https://lknpd.nalog.ru/api/v1/receipt/7700/abc/print"
        );
        assert_eq!(
            print_url("https://lknpd.nalog.ru/api/v1", "7700", "abc"),
            "https://lknpd.nalog.ru/api/v1/receipt/7700/abc/print"
        );
    }
}
