//! `herald-store`: data-access contract of the dispatch core, plus a SQLite
//! implementation.
//!
//! # Overview
//!
//! The dispatch engine only ever talks to a [`MailStore`]. The lock flag on
//! each `mail_logs` row is the sole concurrency-control primitive:
//!
//! | Operation                | Guarantee                                           |
//! |--------------------------|-----------------------------------------------------|
//! | `lock_units`             | all-or-nothing; fails if any row is already locked  |
//! | `update_campaign_status` | forward-only compare-and-set; repeat calls are no-ops |
//! | `mark_errored`           | records the failure, keeps the row locked           |
//! | `requeue_campaign`       | releases unresolved mail; in-flight only on request |

pub mod db;
pub mod error;
pub mod sqlite;
pub mod store;

pub use error::{Result, StoreError};
pub use sqlite::SqliteStore;
pub use store::{MailStore, RequeueScope, CAMPAIGN_UNAVAILABLE};
