// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Doorman Shared Types
//!
//! Configuration and the enums shared across the workspace: subscription
//! status, payment kind, user lifecycle status.

pub mod config;
pub mod types;

pub use config::{Config, ConfigError};
pub use types::{PaymentKind, SubscriptionStatus, UserStatus};

/// Telegram user/chat identifier. Group chat ids are negative.
pub type TelegramId = i64;
