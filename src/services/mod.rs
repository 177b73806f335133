pub mod database;
pub mod filing;
pub mod inflight;
pub mod payments;
pub mod reconcile;
pub mod retry;
pub mod stats;
pub mod sync;
pub mod tax_api;
