//! Shared domain enums
//!
//! Statuses are persisted as lowercase text columns; `as_str`/`parse` are the
//! single source of truth for the wire representation.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a subscription row.
///
/// At most one row per user may be `Active` or `Grace` at any time. `Banned`
/// is terminal with respect to automatic transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Grace,
    Expired,
    Banned,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Grace => "grace",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Banned => "banned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "grace" => Some(SubscriptionStatus::Grace),
            "expired" => Some(SubscriptionStatus::Expired),
            "banned" => Some(SubscriptionStatus::Banned),
            _ => None,
        }
    }

    /// Whether this status still grants group access.
    pub fn has_access(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Grace)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a payment entered the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    /// Single purchase of a fixed-length plan.
    OneTime,
    /// First charge of a provider-managed recurring subscription.
    RecurringInitial,
    /// Renewal charge, including those recovered by reconciliation.
    RecurringRenewal,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::OneTime => "one_time",
            PaymentKind::RecurringInitial => "recurring_initial",
            PaymentKind::RecurringRenewal => "recurring_renewal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "one_time" => Some(PaymentKind::OneTime),
            "recurring_initial" => Some(PaymentKind::RecurringInitial),
            "recurring_renewal" => Some(PaymentKind::RecurringRenewal),
            _ => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(
            self,
            PaymentKind::RecurringInitial | PaymentKind::RecurringRenewal
        )
    }
}

impl std::fmt::Display for PaymentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a user record. Users are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Banned,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Banned => "banned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(UserStatus::Active),
            "banned" => Some(UserStatus::Banned),
            _ => None,
        }
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
