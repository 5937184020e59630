//! Notification channels.

pub mod channel;
pub mod log;
pub mod slack;
pub mod sms;

pub use channel::*;
pub use log::LogChannel;
pub use slack::{SlackChannel, SlackConfig};
pub use sms::{SmsChannel, TwilioConfig};
