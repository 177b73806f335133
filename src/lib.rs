//! Fiscal reconciliation service - links payment-source payments to filed
//! tax receipts and drives filing, cancellation and sync.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
