//! `herald-core`: configuration, errors and domain types shared by every herald crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::HeraldConfig;
pub use error::{HeraldError, Result};
pub use types::{Campaign, CampaignStatus, MailLog, MailOutcome};
