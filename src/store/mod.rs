//! Thin port over the shared row store.
//!
//! The store is a remote keyed table with row-level policies and a
//! realtime change feed. `rest` covers insert/select/update and the
//! rate-limit window; `realtime` covers the UPDATE subscription the
//! coordinator races against. Row-level policies themselves live in the
//! store (see `schema.sql`), not here.

pub mod realtime;
pub mod rest;

pub use realtime::RowSubscription;
pub use rest::RestStore;

pub const APPROVALS_TABLE: &str = "approval_requests";
pub const RATE_LIMIT_TABLE: &str = "rate_limit_events";

/// Header carrying the signed machine identity; consumed by the store's
/// row-level insert policy. The realtime transport cannot carry it.
pub const MACHINE_IDENTITY_HEADER: &str = "x-machine-identity";
