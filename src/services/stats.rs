//! Dashboard statistics, computed over the annotated payment batch.
//!
//! Pure like the reconciliation engine; all period arithmetic happens in the
//! tax authority's timezone so the buckets line up with its reporting.

use crate::models::{tax_tz, AnnotatedPayment, ReceiptStatus};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PeriodTotals {
    pub sent_count: usize,
    pub earnings: Decimal,
    /// (payment amount - filed amount) over sent payments with a known filed
    /// amount in this bucket.
    pub discrepancy: Decimal,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PeriodBreakdown {
    pub today: PeriodTotals,
    pub yesterday: PeriodTotals,
    pub week: PeriodTotals,
    pub month: PeriodTotals,
    pub quarter: PeriodTotals,
    pub year: PeriodTotals,
    pub all: PeriodTotals,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsReport {
    pub pending_count: usize,
    pub sent_count: usize,
    pub error_count: usize,
    pub canceled_count: usize,
    /// Total amount of payments still awaiting a receipt.
    pub pending_amount: Decimal,
    pub periods: PeriodBreakdown,
    /// Sum of (payment amount - filed amount) over sent payments where the
    /// filed amount is known. Zero when everything was filed exactly.
    pub discrepancy: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

pub fn compute(payments: &[AnnotatedPayment], now: DateTime<Utc>) -> StatsReport {
    let today = now.with_timezone(&tax_tz()).date_naive();
    let yesterday = today.pred_opt().unwrap_or(today);

    let mut report = StatsReport::default();

    for payment in payments {
        match payment.receipt_status {
            ReceiptStatus::Pending => {
                report.pending_count += 1;
                report.pending_amount += payment.amount;
            }
            ReceiptStatus::Sent => {
                report.sent_count += 1;

                let earned = payment.receipt_amount.unwrap_or(payment.amount);
                let gap = payment
                    .receipt_amount
                    .map(|filed| payment.amount - filed)
                    .unwrap_or_default();
                report.discrepancy += gap;

                // Bucket by when the receipt was filed; fall back to the
                // payment date for rows that never recorded a sent time.
                let date = payment
                    .sent_at
                    .or(payment.paid_at)
                    .map(|t| t.with_timezone(&tax_tz()).date_naive());

                bump(&mut report.periods.all, earned, gap);
                if let Some(date) = date {
                    if date == today {
                        bump(&mut report.periods.today, earned, gap);
                    }
                    if date == yesterday {
                        bump(&mut report.periods.yesterday, earned, gap);
                    }
                    if same_iso_week(date, today) {
                        bump(&mut report.periods.week, earned, gap);
                    }
                    if date.year() == today.year() {
                        bump(&mut report.periods.year, earned, gap);
                        if date.month() == today.month() {
                            bump(&mut report.periods.month, earned, gap);
                        }
                        if quarter_of(date) == quarter_of(today) {
                            bump(&mut report.periods.quarter, earned, gap);
                        }
                    }
                }
            }
            ReceiptStatus::Error => report.error_count += 1,
            ReceiptStatus::Canceled => report.canceled_count += 1,
        }
    }

    report
}

fn bump(totals: &mut PeriodTotals, earned: Decimal, gap: Decimal) {
    totals.sent_count += 1;
    totals.earnings += earned;
    totals.discrepancy += gap;
}

fn same_iso_week(a: NaiveDate, b: NaiveDate) -> bool {
    a.iso_week() == b.iso_week()
}

fn quarter_of(d: NaiveDate) -> u32 {
    (d.month() - 1) / 3 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn annotated(
        id: &str,
        amount: &str,
        status: ReceiptStatus,
        paid_at: Option<DateTime<Utc>>,
        receipt_amount: Option<&str>,
    ) -> AnnotatedPayment {
        AnnotatedPayment {
            id: id.into(),
            amount: Decimal::from_str(amount).unwrap(),
            currency: "RUB".into(),
            description: None,
            created_at: paid_at,
            paid_at,
            payment_method: "bank_card".into(),
            metadata: serde_json::Value::Null,
            receipt_status: status,
            receipt_uuid: None,
            receipt_url_print: None,
            service_name: None,
            receipt_amount: receipt_amount.map(|a| Decimal::from_str(a).unwrap()),
            receipt_date: None,
            error_message: None,
            canceled_at: None,
            sent_at: None,
            in_tax_service: false,
            tax_service_name: None,
            tax_amount: None,
        }
    }

    #[test]
    fn buckets_follow_tax_timezone_dates() {
        // 22:30 UTC on March 1 is already March 2 in the tax timezone.
        let now = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
        let late_evening = Utc.with_ymd_and_hms(2024, 3, 1, 22, 30, 0).unwrap();

        let payments = vec![annotated(
            "p1",
            "100.00",
            ReceiptStatus::Sent,
            Some(late_evening),
            Some("100.00"),
        )];

        let report = compute(&payments, now);
        assert_eq!(report.periods.today.sent_count, 1);
        assert_eq!(report.periods.yesterday.sent_count, 0);
    }

    #[test]
    fn sent_time_outranks_payment_date_for_bucketing() {
        // Paid in February, filed in March: the earnings belong to March.
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let paid = Utc.with_ymd_and_hms(2024, 2, 20, 10, 0, 0).unwrap();
        let sent = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap();

        let mut p = annotated("p1", "100.00", ReceiptStatus::Sent, Some(paid), Some("100.00"));
        p.sent_at = Some(sent);

        let report = compute(&[p], now);
        assert_eq!(report.periods.today.sent_count, 1);
        assert_eq!(report.periods.month.sent_count, 1);
    }

    #[test]
    fn pending_amounts_accumulate() {
        let now = Utc::now();
        let payments = vec![
            annotated("p1", "100.50", ReceiptStatus::Pending, Some(now), None),
            annotated("p2", "200.00", ReceiptStatus::Pending, Some(now), None),
            annotated("p3", "50.00", ReceiptStatus::Canceled, Some(now), None),
        ];
        let report = compute(&payments, now);
        assert_eq!(report.pending_count, 2);
        assert_eq!(report.pending_amount, Decimal::from_str("300.50").unwrap());
        assert_eq!(report.canceled_count, 1);
    }

    #[test]
    fn discrepancy_tracks_amount_mismatches() {
        let now = Utc::now();
        let payments = vec![
            annotated("p1", "100.00", ReceiptStatus::Sent, Some(now), Some("90.00")),
            annotated("p2", "50.00", ReceiptStatus::Sent, Some(now), Some("50.00")),
            // Filed amount unknown, excluded from the discrepancy.
            annotated("p3", "70.00", ReceiptStatus::Sent, Some(now), None),
        ];
        let report = compute(&payments, now);
        assert_eq!(report.discrepancy, Decimal::from_str("10.00").unwrap());
        assert_eq!(
            report.periods.all.discrepancy,
            Decimal::from_str("10.00").unwrap()
        );
        assert_eq!(report.sent_count, 3);
        assert_eq!(report.periods.all.sent_count, 3);
        // Earnings fall back to the payment amount when no filed amount.
        assert_eq!(
            report.periods.all.earnings,
            Decimal::from_str("210.00").unwrap()
        );
    }
}
