//! Statistics over a reconciled batch, end to end through the engine.

use chrono::{DateTime, TimeZone, Utc};
use fiscal_recon::models::{Payment, TaxReceipt};
use fiscal_recon::services::{reconcile, stats};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

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

fn tax(uuid: &str, amount: &str, operation_time: &str) -> TaxReceipt {
    TaxReceipt {
        receipt_uuid: uuid.to_string(),
        alternate_uuid: None,
        total_amount: Decimal::from_str(amount).unwrap(),
        operation_time: Some(ts(operation_time)),
        request_time: None,
        service_name: None,
        is_canceled: false,
        canceled_at: None,
        payload: serde_json::Value::Null,
    }
}

#[test]
fn inferred_receipts_count_as_sent_earnings() {
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let payments = vec![
        payment("p1", "100.00", "2024-03-01T09:00:00Z"),
        payment("p2", "250.00", "2024-03-01T10:00:00Z"),
    ];
    // Only p1 has a matching cached receipt.
    let cache = vec![tax("u1", "100.00", "2024-03-01T12:30:00+03:00")];

    let annotated = reconcile::annotate(&payments, &HashMap::new(), &cache, "l", "https://t");
    let report = stats::compute(&annotated, now);

    assert_eq!(report.sent_count, 1);
    assert_eq!(report.pending_count, 1);
    assert_eq!(report.pending_amount, Decimal::from_str("250.00").unwrap());
    assert_eq!(report.periods.today.sent_count, 1);
    assert_eq!(
        report.periods.today.earnings,
        Decimal::from_str("100.00").unwrap()
    );
    assert_eq!(report.discrepancy, Decimal::ZERO);
}

#[test]
fn period_buckets_nest_as_expected() {
    let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
    let payments = vec![
        payment("today", "10.00", "2024-03-15T08:00:00Z"),
        payment("this_month", "20.00", "2024-03-02T08:00:00Z"),
        payment("this_year", "40.00", "2024-01-10T08:00:00Z"),
        payment("last_year", "80.00", "2023-06-10T08:00:00Z"),
    ];
    let cache = vec![
        tax("u1", "10.00", "2024-03-15T11:00:00+03:00"),
        tax("u2", "20.00", "2024-03-02T11:00:00+03:00"),
        tax("u3", "40.00", "2024-01-10T11:00:00+03:00"),
        tax("u4", "80.00", "2023-06-10T11:00:00+03:00"),
    ];

    let annotated = reconcile::annotate(&payments, &HashMap::new(), &cache, "l", "https://t");
    let report = stats::compute(&annotated, now);

    assert_eq!(report.periods.today.earnings, Decimal::from_str("10.00").unwrap());
    assert_eq!(report.periods.month.earnings, Decimal::from_str("30.00").unwrap());
    // January and March share Q1, so the quarter matches the year here.
    assert_eq!(report.periods.quarter.earnings, Decimal::from_str("70.00").unwrap());
    assert_eq!(report.periods.year.earnings, Decimal::from_str("70.00").unwrap());
    assert_eq!(report.periods.all.earnings, Decimal::from_str("150.00").unwrap());
}
