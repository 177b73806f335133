//! Database-backed tests for the receipt store and the sync promotion pass.
//!
//! These need TEST_DATABASE_URL pointing at a disposable Postgres database.

mod common;

use chrono::Utc;
use fiscal_recon::models::TaxReceipt;
use fiscal_recon::services::database::{Database, FiledReceiptRecord};
use rust_decimal::Decimal;
use uuid::Uuid;

fn cache_row(uuid: &str, alternate: Option<&str>, canceled: bool) -> TaxReceipt {
    TaxReceipt {
        receipt_uuid: uuid.to_string(),
        alternate_uuid: alternate.map(str::to_string),
        total_amount: Decimal::new(10000, 2),
        operation_time: Some(Utc::now()),
        request_time: None,
        service_name: Some("Consulting".to_string()),
        is_canceled: canceled,
        canceled_at: canceled.then(Utc::now),
        payload: serde_json::json!({}),
    }
}

fn sent_record(payment_id: &str, uuid: &str) -> FiledReceiptRecord {
    FiledReceiptRecord {
        payment_id: payment_id.to_string(),
        receipt_uuid: uuid.to_string(),
        receipt_url_print: None,
        receipt_url_json: None,
        service_name: Some("Consulting".to_string()),
        amount: Some(Decimal::new(10000, 2)),
        sale_date: None,
        sent_at: Some(Utc::now()),
        synced_from_tax: false,
    }
}

async fn insert_row(db: &Database, payment_id: &str, status: &str, uuid: &str) {
    sqlx::query("INSERT INTO local_receipts (payment_id, receipt_uuid, status) VALUES ($1, $2, $3)")
        .bind(payment_id)
        .bind(uuid)
        .bind(status)
        .execute(db.pool())
        .await
        .expect("failed to insert local row");
}

async fn status_of(db: &Database, payment_id: &str) -> String {
    db.get_receipt(payment_id)
        .await
        .expect("get receipt")
        .expect("row exists")
        .status
}

#[tokio::test]
async fn cache_replace_promotes_and_stays_atomic() {
    let db = common::test_db().await;
    let tag = Uuid::new_v4().simple().to_string();

    let uuid_active = format!("active-{tag}");
    let uuid_error = format!("error-{tag}");
    let uuid_sent = format!("sent-{tag}");
    let uuid_primary = format!("primary-{tag}");
    let uuid_request = format!("request-{tag}");

    let pending_id = format!("pay-pending-{tag}");
    let error_id = format!("pay-error-{tag}");
    let sent_id = format!("pay-sent-{tag}");
    let alt_id = format!("pay-alt-{tag}");

    insert_row(&db, &pending_id, "pending", &uuid_active).await;
    insert_row(&db, &error_id, "error", &uuid_error).await;
    db.mark_sent(&sent_record(&sent_id, &uuid_sent))
        .await
        .expect("seed sent row");
    // This row stored the filing request uuid, not the approved one.
    insert_row(&db, &alt_id, "pending", &uuid_request).await;

    let snapshot = vec![
        cache_row(&uuid_active, None, false),
        cache_row(&uuid_error, None, true),
        cache_row(&uuid_sent, None, true),
        cache_row(&uuid_primary, Some(&uuid_request), true),
    ];

    let counts = db
        .replace_tax_cache_and_promote(&snapshot)
        .await
        .expect("sync replace");

    // Confirmed pending row became sent; canceled cache rows canceled the
    // sent row and the alternate-uuid row, but never the error row.
    assert_eq!(counts.marked_sent, 1);
    assert_eq!(counts.marked_canceled, 2);
    assert_eq!(status_of(&db, &pending_id).await, "sent");
    assert_eq!(status_of(&db, &error_id).await, "error");
    assert_eq!(status_of(&db, &sent_id).await, "canceled");
    assert_eq!(status_of(&db, &alt_id).await, "canceled");

    // A snapshot that fails mid-insert must leave the previous cache intact.
    let dup = format!("dup-{tag}");
    let bad_snapshot = vec![cache_row(&dup, None, false), cache_row(&dup, None, false)];
    db.replace_tax_cache_and_promote(&bad_snapshot)
        .await
        .expect_err("duplicate uuids must fail the replace");

    let cached: Vec<String> = db
        .load_tax_receipts()
        .await
        .expect("load cache")
        .into_iter()
        .map(|r| r.receipt_uuid)
        .collect();
    for uuid in [&uuid_active, &uuid_error, &uuid_sent, &uuid_primary] {
        assert!(cached.contains(uuid), "{uuid} missing after failed replace");
    }
    assert!(!cached.contains(&dup));
}

#[tokio::test]
async fn a_failed_attempt_never_downgrades_a_sent_row() {
    let db = common::test_db().await;
    let tag = Uuid::new_v4().simple().to_string();
    let payment_id = format!("pay-keep-{tag}");
    let uuid = format!("keep-{tag}");

    db.mark_sent(&sent_record(&payment_id, &uuid))
        .await
        .expect("seed sent row");
    db.mark_error(&payment_id, "upstream refused")
        .await
        .expect("error upsert");

    let row = db
        .get_receipt(&payment_id)
        .await
        .expect("get receipt")
        .expect("row exists");
    assert_eq!(row.status, "sent");
    assert!(row.error_message.is_none());
}
