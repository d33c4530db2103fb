//! `herald-worker`: the scheduling, locking and dispatch core.
//!
//! # Overview
//!
//! [`DispatchEngine`] wakes up once per tick, claims every due mail log in one
//! all-or-nothing lock, groups the claim by campaign and hands each group to
//! the [`Mailer`] from its own task. Two on-demand paths sit next to the loop:
//!
//! - [`DispatchEngine::launch_campaign`] sends a freshly scheduled campaign
//!   without waiting for the next tick.
//! - [`DispatchEngine::send_test_mail`] pushes one non-persisted [`TestMail`]
//!   through the same mailer and waits for its outcome.
//!
//! Everything the mailer receives is a [`Sendable`], which knows how to report
//! its own outcome back to the store or to a waiting caller.

pub mod engine;
pub mod error;
pub mod mail;
pub mod mailer;

#[cfg(test)]
mod testing;

pub use engine::{partition_by_campaign, DispatchEngine, EngineOptions, LaunchReport, TickReport};
pub use error::{DeliveryError, DispatchError, Result};
pub use mail::{backoff_delay, ScheduledMail, Sendable, TestMail, TestReply, TestRequest};
pub use mailer::{DryRunTransport, Mailer, QueueMailer, Transport};
