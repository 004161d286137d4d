//! Environment-backed configuration
//!
//! Every tunable the engine consumes lives here with its default. Required
//! values (`BOT_TOKEN`, `GROUP_CHAT_ID`, `OWNER_IDS`, `DATABASE_URL`) fail
//! fast at startup; everything else falls back to the documented default.

use std::time::Duration as StdDuration;

use time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Runtime configuration, read once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token.
    pub bot_token: String,
    /// Target group chat id. Negative for groups/supergroups.
    pub group_chat_id: i64,
    /// User ids allowed to receive the daily digest and run admin actions.
    pub owner_ids: Vec<i64>,
    /// Postgres connection string.
    pub database_url: String,

    /// One-time plan price in Stars.
    pub plan_stars: i64,
    /// Monthly subscription price in Stars.
    pub sub_stars: i64,
    /// One-time plan duration in days.
    pub plan_days: i64,

    /// Grace period after expiry, in hours.
    pub grace_hours: i64,
    /// Minimum spacing between grace transitions for the same row, in
    /// minutes. Guards against overlapping sweep runs.
    pub grace_debounce_minutes: i64,
    /// Reconciliation look-back and overlap, in days.
    pub reconcile_window_days: i64,
    /// Reminder lead time before expiry, in days.
    pub days_before_expire: i64,

    /// Deferred-operation queue capacity.
    pub queue_max_size: usize,
    /// Attempts per queued operation before it is abandoned.
    pub queue_max_attempts: u32,

    /// Sustained Bot API call rate, per second.
    pub rate_limit_per_sec: f64,
    /// Burst capacity of the rate limiter.
    pub rate_limit_burst: f64,
    /// Request timeout for Bot API calls, in seconds.
    pub api_timeout_secs: u64,
}

impl Config {
    /// Load from the process environment. Call after `dotenvy::dotenv()`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = require("BOT_TOKEN")?;
        if bot_token.trim().is_empty() {
            return Err(ConfigError::Invalid {
                var: "BOT_TOKEN",
                reason: "must not be empty".into(),
            });
        }

        let group_chat_id: i64 = parse_required("GROUP_CHAT_ID")?;
        if group_chat_id >= 0 {
            return Err(ConfigError::Invalid {
                var: "GROUP_CHAT_ID",
                reason: "must be negative for groups/supergroups".into(),
            });
        }

        let owner_ids = parse_id_list("OWNER_IDS", &require("OWNER_IDS")?)?;
        if owner_ids.is_empty() {
            return Err(ConfigError::Invalid {
                var: "OWNER_IDS",
                reason: "must contain at least one user id".into(),
            });
        }

        let config = Self {
            bot_token,
            group_chat_id,
            owner_ids,
            database_url: require("DATABASE_URL")?,
            plan_stars: parse_or("PLAN_STARS", 499)?,
            sub_stars: parse_or("SUB_STARS", 449)?,
            plan_days: parse_or("PLAN_DAYS", 30)?,
            grace_hours: parse_or("GRACE_HOURS", 48)?,
            grace_debounce_minutes: parse_or("GRACE_DEBOUNCE_MINUTES", 60)?,
            reconcile_window_days: parse_or("RECONCILE_WINDOW_DAYS", 3)?,
            days_before_expire: parse_or("DAYS_BEFORE_EXPIRE", 3)?,
            queue_max_size: parse_or("QUEUE_MAX_SIZE", 1000)?,
            queue_max_attempts: parse_or("QUEUE_MAX_ATTEMPTS", 3)?,
            rate_limit_per_sec: parse_or("RATE_LIMIT_PER_SEC", 25.0)?,
            rate_limit_burst: parse_or("RATE_LIMIT_BURST", 30.0)?,
            api_timeout_secs: parse_or("API_TIMEOUT_SECS", 10)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.plan_stars <= 0 || self.sub_stars <= 0 {
            return Err(ConfigError::Invalid {
                var: "PLAN_STARS",
                reason: "prices must be positive".into(),
            });
        }
        if self.plan_days <= 0 {
            return Err(ConfigError::Invalid {
                var: "PLAN_DAYS",
                reason: "plan duration must be positive".into(),
            });
        }
        if self.grace_hours < 0 || self.grace_debounce_minutes < 0 {
            return Err(ConfigError::Invalid {
                var: "GRACE_HOURS",
                reason: "grace settings must not be negative".into(),
            });
        }
        if self.reconcile_window_days <= 0 {
            return Err(ConfigError::Invalid {
                var: "RECONCILE_WINDOW_DAYS",
                reason: "window must be positive".into(),
            });
        }
        if self.queue_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "QUEUE_MAX_ATTEMPTS",
                reason: "must allow at least one attempt".into(),
            });
        }
        Ok(())
    }

    pub fn plan_duration(&self) -> Duration {
        Duration::days(self.plan_days)
    }

    pub fn grace_duration(&self) -> Duration {
        Duration::hours(self.grace_hours)
    }

    pub fn grace_debounce(&self) -> Duration {
        Duration::minutes(self.grace_debounce_minutes)
    }

    pub fn reconcile_window(&self) -> Duration {
        Duration::days(self.reconcile_window_days)
    }

    pub fn reminder_lead(&self) -> Duration {
        Duration::days(self.days_before_expire)
    }

    pub fn api_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.api_timeout_secs)
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        self.owner_ids.contains(&user_id)
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::Missing(var))
}

fn parse_required<T: std::str::FromStr>(var: &'static str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    require(var)?.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })
}

fn parse_or<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Parse a comma-separated id list ("123, 456") or a single id ("123").
fn parse_id_list(var: &'static str, raw: &str) -> Result<Vec<i64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>().map_err(|e| ConfigError::Invalid {
                var,
                reason: format!("'{part}': {e}"),
            })
        })
        .collect()
}
