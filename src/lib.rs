//! Crisis Triage: report classification and notification dispatch.

pub mod api;
pub mod channels;
pub mod classifier;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod store;
