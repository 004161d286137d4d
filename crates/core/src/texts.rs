//! User-facing message templates, HTML parse mode.

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::types::LedgerStats;

const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]-[day] [hour]:[minute] UTC");

pub fn human_date(at: OffsetDateTime) -> String {
    at.format(&DATE_FORMAT).unwrap_or_else(|_| at.to_string())
}

pub fn payment_confirmed(expires_at: OffsetDateTime, recurring: bool) -> String {
    if recurring {
        format!(
            "✅ <b>Subscription activated!</b>\n\n\
             Your monthly subscription will auto-renew.\n\
             Current period ends: {}\n\n\
             Request to join the group and you will be approved automatically.",
            human_date(expires_at)
        )
    } else {
        format!(
            "✅ <b>Payment successful!</b>\n\n\
             Your access is active until {}.\n\n\
             Request to join the group and you will be approved automatically.",
            human_date(expires_at)
        )
    }
}

pub fn grace_warning(grace_until: OffsetDateTime) -> String {
    format!(
        "⚠️ <b>Your subscription has expired.</b>\n\n\
         You keep access until {}. Renew before then to stay in the group.",
        human_date(grace_until)
    )
}

pub fn access_expired() -> String {
    "❌ <b>Your access has ended.</b>\n\n\
     You have been removed from the group. You can purchase access again at any time."
        .to_string()
}

pub fn renewal_reminder(expires_at: OffsetDateTime, plan_stars: i64, plan_days: i64) -> String {
    format!(
        "⏰ <b>Reminder:</b> your access expires on {}.\n\n\
         Renew for {} Stars to keep your spot for another {} days.",
        human_date(expires_at),
        plan_stars,
        plan_days
    )
}

pub fn paywall(one_time_url: &str, subscription_url: &str, plan_stars: i64, sub_stars: i64) -> String {
    format!(
        "👋 This group is members-only.\n\n\
         <b>One-time pass</b> ({plan_stars} Stars / 30 days):\n{one_time_url}\n\n\
         <b>Monthly subscription</b> ({sub_stars} Stars, auto-renews):\n{subscription_url}\n\n\
         Your join request will be approved as soon as payment completes."
    )
}

pub fn daily_digest(stats: &LedgerStats, mrr: i64, at: OffsetDateTime) -> String {
    format!(
        "📊 <b>Daily digest</b> - {}\n\n\
         👥 Users: {} total, {} active in 24h, {} new today\n\
         💳 Subscriptions: {} active, {} in grace, {} recurring\n\
         ⭐ Revenue: {} Stars (24h), {} Stars (30d), {} payments in 24h\n\
         📈 MRR: {} Stars",
        human_date(at),
        stats.total_users,
        stats.active_users_24h,
        stats.new_signups_today,
        stats.active_subs,
        stats.grace_subs,
        stats.recurring_subs,
        stats.revenue_24h,
        stats.revenue_30d,
        stats.payments_24h,
        mrr
    )
}
