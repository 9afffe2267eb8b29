//! Autopilot: unattended AI replies for customer conversations.

pub mod api;
pub mod autopilot;
pub mod config;
pub mod error;
pub mod generator;
pub mod provider;
pub mod store;

pub use autopilot::{CycleReport, Outcome, PollCycleDriver, ReplyPipeline, RunMode};
pub use error::{Error, Result};
