//! Reconciliation engine behavior over the public library API.

use chrono::{DateTime, TimeZone, Utc};
use fiscal_recon::models::{LocalReceipt, Payment, ReceiptStatus, TaxReceipt};
use fiscal_recon::services::reconcile::{annotate, print_url};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

const LOGIN: &str = "770000000000";
const BASE: &str = "https://lknpd.nalog.ru/api/v1";

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn payment(id: &str, amount: &str, captured_at: &str) -> Payment {
    Payment {
        id: id.to_string(),
        amount: Decimal::from_str(amount).unwrap(),
        currency: "RUB".to_string(),
        description: None,
        created_at: Some(ts(captured_at)),
        captured_at: Some(ts(captured_at)),
        payment_method: "bank_card".to_string(),
        metadata: serde_json::Value::Null,
    }
}

fn local(payment_id: &str, status: &str, uuid: Option<&str>) -> LocalReceipt {
    let now = Utc::now();
    LocalReceipt {
        payment_id: payment_id.to_string(),
        receipt_uuid: uuid.map(str::to_string),
        status: status.to_string(),
        receipt_url_print: None,
        receipt_url_json: None,
        service_name: Some("Consulting".to_string()),
        amount: Some(Decimal::from_str("100.00").unwrap()),
        sale_date: None,
        sent_at: (status == "sent").then_some(now),
        error_message: (status == "error").then(|| "upstream said no".to_string()),
        error_at: None,
        canceled_at: (status == "canceled").then_some(now),
        synced_from_tax: false,
        created_at: now,
        updated_at: now,
    }
}

fn tax(uuid: &str, amount: &str, operation_time: &str, canceled: bool) -> TaxReceipt {
    TaxReceipt {
        receipt_uuid: uuid.to_string(),
        alternate_uuid: None,
        total_amount: Decimal::from_str(amount).unwrap(),
        operation_time: Some(ts(operation_time)),
        request_time: None,
        service_name: Some("Consulting".to_string()),
        is_canceled: canceled,
        canceled_at: canceled.then(Utc::now),
        payload: serde_json::Value::Null,
    }
}

fn local_map(rows: Vec<LocalReceipt>) -> HashMap<String, LocalReceipt> {
    rows.into_iter().map(|r| (r.payment_id.clone(), r)).collect()
}

#[test]
fn payments_without_any_linkage_are_pending() {
    let payments = vec![payment("p1", "100.00", "2024-03-01T10:00:00Z")];
    let out = annotate(&payments, &HashMap::new(), &[], LOGIN, BASE);

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].receipt_status, ReceiptStatus::Pending);
    assert!(out[0].receipt_uuid.is_none());
    assert!(!out[0].in_tax_service);
}

#[test]
fn local_row_is_authoritative_over_the_cache() {
    // The cache still lists the receipt as live, but the local outcome is
    // canceled. The canceled status wins and in_tax_service is forced off.
    let payments = vec![payment("p1", "100.00", "2024-03-01T10:00:00Z")];
    let locals = local_map(vec![local("p1", "canceled", Some("u1"))]);
    let cache = vec![tax("u1", "100.00", "2024-03-01T13:00:00+03:00", false)];

    let out = annotate(&payments, &locals, &cache, LOGIN, BASE);
    assert_eq!(out[0].receipt_status, ReceiptStatus::Canceled);
    assert!(!out[0].in_tax_service);

    let locals = local_map(vec![local("p1", "error", Some("u1"))]);
    let out = annotate(&payments, &locals, &cache, LOGIN, BASE);
    assert_eq!(out[0].receipt_status, ReceiptStatus::Error);
    assert!(!out[0].in_tax_service);
    assert_eq!(out[0].error_message.as_deref(), Some("upstream said no"));
}

#[test]
fn direct_linkage_pulls_tax_details() {
    let payments = vec![payment("p1", "100.00", "2024-03-01T10:00:00Z")];
    let locals = local_map(vec![local("p1", "sent", Some("u1"))]);
    let cache = vec![tax("u1", "99.50", "2024-03-01T13:00:00+03:00", false)];

    let out = annotate(&payments, &locals, &cache, LOGIN, BASE);
    assert_eq!(out[0].receipt_status, ReceiptStatus::Sent);
    assert!(out[0].in_tax_service);
    assert_eq!(out[0].tax_amount, Some(Decimal::from_str("99.50").unwrap()));
    assert_eq!(
        out[0].receipt_url_print.as_deref(),
        Some("https://lknpd.nalog.ru/api/v1/receipt/770000000000/u1/print")
    );
}

#[test]
fn inference_links_by_date_and_amount() {
    // Payment at 10:00 UTC March 1 is 13:00 March 1 in the tax timezone,
    // same calendar date as the receipt.
    let payments = vec![payment("p1", "100.00", "2024-03-01T10:00:00Z")];
    let cache = vec![tax("u1", "100.00", "2024-03-01T18:00:00+03:00", false)];

    let out = annotate(&payments, &HashMap::new(), &cache, LOGIN, BASE);
    assert_eq!(out[0].receipt_status, ReceiptStatus::Sent);
    assert_eq!(out[0].receipt_uuid.as_deref(), Some("u1"));
    assert!(out[0].in_tax_service);
}

#[test]
fn inference_respects_the_timezone_boundary() {
    // 22:30 UTC on March 1 is already March 2 in the tax timezone, so a
    // receipt dated March 1 there does not match.
    let payments = vec![payment("p1", "100.00", "2024-03-01T22:30:00Z")];
    let cache = vec![tax("u1", "100.00", "2024-03-01T12:00:00+03:00", false)];

    let out = annotate(&payments, &HashMap::new(), &cache, LOGIN, BASE);
    assert_eq!(out[0].receipt_status, ReceiptStatus::Pending);
}

#[test]
fn ambiguous_keys_match_nothing() {
    // Two unlinked payments share the (date, amount) key; neither may claim
    // the single candidate receipt.
    let payments = vec![
        payment("p1", "100.00", "2024-03-01T10:00:00Z"),
        payment("p2", "100.00", "2024-03-01T11:00:00Z"),
    ];
    let cache = vec![tax("u1", "100.00", "2024-03-01T13:00:00+03:00", false)];

    let out = annotate(&payments, &HashMap::new(), &cache, LOGIN, BASE);
    assert!(out.iter().all(|p| p.receipt_status == ReceiptStatus::Pending));
}

#[test]
fn ambiguous_receipts_match_nothing() {
    // One payment, two candidate receipts with the same key.
    let payments = vec![payment("p1", "100.00", "2024-03-01T10:00:00Z")];
    let cache = vec![
        tax("u1", "100.00", "2024-03-01T13:00:00+03:00", false),
        tax("u2", "100.00", "2024-03-01T14:00:00+03:00", false),
    ];

    let out = annotate(&payments, &HashMap::new(), &cache, LOGIN, BASE);
    assert_eq!(out[0].receipt_status, ReceiptStatus::Pending);
}

#[test]
fn canceled_receipts_are_never_inferred() {
    let payments = vec![payment("p1", "100.00", "2024-03-01T10:00:00Z")];
    let cache = vec![tax("u1", "100.00", "2024-03-01T13:00:00+03:00", true)];

    let out = annotate(&payments, &HashMap::new(), &cache, LOGIN, BASE);
    assert_eq!(out[0].receipt_status, ReceiptStatus::Pending);
}

#[test]
fn locally_claimed_uuids_are_off_limits_for_inference() {
    // p1's local row already names u1; p2 shares the key but must not
    // inherit u1 through inference.
    let payments = vec![
        payment("p1", "100.00", "2024-03-01T10:00:00Z"),
        payment("p2", "100.00", "2024-03-02T10:00:00Z"),
    ];
    let locals = local_map(vec![local("p1", "sent", Some("u1"))]);
    // u1's date matches p2, not p1. Still claimed by p1's row.
    let cache = vec![tax("u1", "100.00", "2024-03-02T13:00:00+03:00", false)];

    let out = annotate(&payments, &locals, &cache, LOGIN, BASE);
    assert_eq!(out[1].receipt_status, ReceiptStatus::Pending);
    assert!(out[1].receipt_uuid.is_none());
}

#[test]
fn claiming_runs_in_paid_order_but_output_keeps_input_order() {
    let payments = vec![
        payment("late", "100.00", "2024-03-02T10:00:00Z"),
        payment("early", "100.00", "2024-03-01T10:00:00Z"),
    ];
    let cache = vec![
        tax("u-early", "100.00", "2024-03-01T13:00:00+03:00", false),
        tax("u-late", "100.00", "2024-03-02T13:00:00+03:00", false),
    ];

    let out = annotate(&payments, &HashMap::new(), &cache, LOGIN, BASE);
    // Output preserves input order.
    assert_eq!(out[0].id, "late");
    assert_eq!(out[0].receipt_uuid.as_deref(), Some("u-late"));
    assert_eq!(out[1].id, "early");
    assert_eq!(out[1].receipt_uuid.as_deref(), Some("u-early"));
}

#[test]
fn each_uuid_is_claimed_at_most_once() {
    let payments = vec![
        payment("p1", "100.00", "2024-03-01T10:00:00Z"),
        payment("p2", "200.00", "2024-03-01T11:00:00Z"),
    ];
    let cache = vec![
        tax("u1", "100.00", "2024-03-01T13:00:00+03:00", false),
        tax("u2", "200.00", "2024-03-01T14:00:00+03:00", false),
    ];

    let out = annotate(&payments, &HashMap::new(), &cache, LOGIN, BASE);
    let uuids: Vec<_> = out.iter().filter_map(|p| p.receipt_uuid.clone()).collect();
    assert_eq!(uuids.len(), 2);
    assert_ne!(uuids[0], uuids[1]);
}

#[test]
fn a_shared_uuid_is_live_for_only_the_earliest_payment() {
    // Two local rows name the same uuid; only one active cache row exists.
    // The earlier payment (by paid_at) keeps the live attribution.
    let payments = vec![
        payment("p-late", "100.00", "2024-03-02T10:00:00Z"),
        payment("p-early", "100.00", "2024-03-01T10:00:00Z"),
    ];
    let locals = local_map(vec![
        local("p-late", "sent", Some("u1")),
        local("p-early", "sent", Some("u1")),
    ]);
    let cache = vec![tax("u1", "100.00", "2024-03-01T13:00:00+03:00", false)];

    let out = annotate(&payments, &locals, &cache, LOGIN, BASE);
    let live: Vec<&str> = out
        .iter()
        .filter(|p| p.in_tax_service)
        .map(|p| p.id.as_str())
        .collect();
    assert_eq!(live, vec!["p-early"]);
    // The loser keeps its local status; only the live flag is withheld.
    let late = out.iter().find(|p| p.id == "p-late").unwrap();
    assert_eq!(late.receipt_status, ReceiptStatus::Sent);
    assert!(!late.in_tax_service);
}

#[test]
fn amounts_compare_after_rounding() {
    let payments = vec![payment("p1", "100.004", "2024-03-01T10:00:00Z")];
    let cache = vec![tax("u1", "100.00", "2024-03-01T13:00:00+03:00", false)];

    let out = annotate(&payments, &HashMap::new(), &cache, LOGIN, BASE);
    assert_eq!(out[0].receipt_uuid.as_deref(), Some("u1"));
}

#[test]
fn local_row_without_url_gets_one_built() {
    let payments = vec![payment("p1", "100.00", "2024-03-01T10:00:00Z")];
    let locals = local_map(vec![local("p1", "sent", Some("u1"))]);

    let out = annotate(&payments, &locals, &[], LOGIN, BASE);
    assert_eq!(
        out[0].receipt_url_print.as_deref(),
        Some(print_url(BASE, LOGIN, "u1").as_str())
    );
    // Not in the cache, so not confirmed live in the tax service.
    assert!(!out[0].in_tax_service);
}
