//! Failure handling for outbound platform calls.
//!
//! Four pieces compose around every messaging operation, in order:
//! a token-bucket [`RateLimiter`] smooths request rate, a per-operation
//! [`CircuitBreaker`] fails fast while the platform is down, a
//! [`RetryPolicy`] re-attempts transient errors with jittered exponential
//! backoff, and an [`OperationQueue`] holds deferrable work that still
//! failed, for a later drain pass.
//!
//! [`ResilienceContext`] wires the first three together. It is constructed
//! once at startup with a breaker per named operation and handed to the
//! services that need it; nothing here is global or lazily registered.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, info, warn};

use doorman_shared::Config;

use crate::error::{CoreError, CoreResult};

// --- Circuit breaker ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted.
    Closed,
    /// Calls fail fast until the recovery timeout elapses.
    Open,
    /// Probe calls pass through; one failure reopens, enough successes
    /// close.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Per-operation circuit breaker. Failures of any kind count toward the
/// threshold; only the caller decides what to retry.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Gate before a call. Open breakers fail fast without invoking the
    /// operation; an elapsed recovery timeout moves the breaker to
    /// half-open and lets the call through as a probe.
    pub async fn check(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    info!(breaker = self.name, "circuit half-open, probing");
                    Ok(())
                } else {
                    Err(CoreError::CircuitOpen(self.name.to_string()))
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    info!(breaker = self.name, "circuit closed");
                }
            }
            CircuitState::Closed => {}
            // A success while open only happens if a call raced the
            // transition; leave the breaker to its recovery timer.
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_successes = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(breaker = self.name, "probe failed, circuit reopened");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        breaker = self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}

// --- Retry policy ---

/// Exponential backoff with full attempt accounting. `max_attempts` counts
/// the initial call, so a policy of 3 performs at most two retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            first_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Base delays before jitter: `first_delay`, doubled each retry, capped
    /// at `max_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        // from_millis(2) yields 2, 4, 8, ...; the factor scales that to
        // first_delay, 2 * first_delay, 4 * first_delay, ...
        let factor = (self.first_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
    }
}

/// Multiplies a delay by a random factor in [0.5, 1.5) so synchronized
/// clients do not retry in lockstep.
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::rng().random_range(0.5..1.5))
}

// --- Named operations and their tuning ---

/// Outbound platform operations with dedicated breakers and retry tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessagingOp {
    SendMessage,
    ApproveJoinRequest,
    DeclineJoinRequest,
    GetChatMember,
    BanChatMember,
    SendInvoice,
    GetStarTransactions,
}

impl MessagingOp {
    pub const ALL: [MessagingOp; 7] = [
        MessagingOp::SendMessage,
        MessagingOp::ApproveJoinRequest,
        MessagingOp::DeclineJoinRequest,
        MessagingOp::GetChatMember,
        MessagingOp::BanChatMember,
        MessagingOp::SendInvoice,
        MessagingOp::GetStarTransactions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessagingOp::SendMessage => "send_message",
            MessagingOp::ApproveJoinRequest => "approve_join_request",
            MessagingOp::DeclineJoinRequest => "decline_join_request",
            MessagingOp::GetChatMember => "get_chat_member",
            MessagingOp::BanChatMember => "ban_chat_member",
            MessagingOp::SendInvoice => "send_invoice",
            MessagingOp::GetStarTransactions => "get_star_transactions",
        }
    }

    /// Tuning per operation. Message sends tolerate more failures before
    /// tripping than invoice creation; membership lookups are chatty and
    /// get a higher threshold with a shorter recovery.
    pub fn profile(&self) -> OpProfile {
        match self {
            MessagingOp::SendMessage | MessagingOp::ApproveJoinRequest => OpProfile {
                breaker: CircuitBreakerConfig::default(),
                retry: RetryPolicy::default(),
                timeout: Duration::from_secs(10),
            },
            MessagingOp::DeclineJoinRequest => OpProfile {
                breaker: CircuitBreakerConfig::default(),
                retry: RetryPolicy {
                    max_attempts: 2,
                    ..RetryPolicy::default()
                },
                timeout: Duration::from_secs(10),
            },
            MessagingOp::GetChatMember => OpProfile {
                breaker: CircuitBreakerConfig {
                    failure_threshold: 10,
                    recovery_timeout: Duration::from_secs(20),
                    ..CircuitBreakerConfig::default()
                },
                retry: RetryPolicy {
                    max_attempts: 2,
                    first_delay: Duration::from_millis(500),
                    ..RetryPolicy::default()
                },
                timeout: Duration::from_secs(5),
            },
            MessagingOp::BanChatMember => OpProfile {
                breaker: CircuitBreakerConfig::default(),
                retry: RetryPolicy::default(),
                timeout: Duration::from_secs(10),
            },
            MessagingOp::SendInvoice => OpProfile {
                breaker: CircuitBreakerConfig {
                    failure_threshold: 3,
                    recovery_timeout: Duration::from_secs(60),
                    ..CircuitBreakerConfig::default()
                },
                retry: RetryPolicy {
                    first_delay: Duration::from_secs(2),
                    ..RetryPolicy::default()
                },
                timeout: Duration::from_secs(15),
            },
            MessagingOp::GetStarTransactions => OpProfile {
                breaker: CircuitBreakerConfig::default(),
                retry: RetryPolicy::default(),
                timeout: Duration::from_secs(15),
            },
        }
    }
}

impl fmt::Display for MessagingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Breaker, retry, and timeout settings for one operation.
#[derive(Debug, Clone, Copy)]
pub struct OpProfile {
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

// --- Rate limiter ---

#[derive(Debug)]
struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by all outbound calls. Refills continuously at
/// `rate` tokens per second up to `burst`.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    inner: Mutex<BucketInner>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            inner: Mutex::new(BucketInner {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token, sleeping until the bucket can supply it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
                inner.tokens = (inner.tokens + elapsed * self.rate).min(self.burst);
                inner.last_refill = now;
                if inner.tokens >= 1.0 {
                    inner.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - inner.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

// --- Operation queue ---

/// Outcome of one queue drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub abandoned: usize,
}

#[derive(Debug)]
struct QueuedItem<T> {
    item: T,
    attempts: u32,
}

#[derive(Debug)]
struct QueueInner<T> {
    items: VecDeque<QueuedItem<T>>,
    draining: bool,
}

/// Bounded retry queue for deferrable operations that exhausted their
/// inline retries. When full, the oldest entry is dropped to admit the new
/// one. Items that fail `max_attempts` drain passes are abandoned with an
/// error log.
#[derive(Debug)]
pub struct OperationQueue<T> {
    max_size: usize,
    max_attempts: u32,
    inner: Mutex<QueueInner<T>>,
}

impl<T: Send + fmt::Debug> OperationQueue<T> {
    pub fn new(max_size: usize, max_attempts: u32) -> Self {
        Self {
            max_size,
            max_attempts,
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                draining: false,
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.items.is_empty()
    }

    pub async fn push(&self, item: T) {
        let mut inner = self.inner.lock().await;
        if inner.items.len() >= self.max_size {
            if let Some(dropped) = inner.items.pop_front() {
                warn!(
                    dropped = ?dropped.item,
                    attempts = dropped.attempts,
                    "operation queue full, dropping oldest entry"
                );
            }
        }
        inner.items.push_back(QueuedItem { item, attempts: 0 });
    }

    /// Runs `f` over every queued item once. Transient failures requeue the
    /// item with its attempt count bumped; permanent failures and items at
    /// the attempt ceiling are abandoned. Returns `None` when another drain
    /// is already in progress.
    pub async fn drain<F, Fut>(&self, mut f: F) -> Option<DrainSummary>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = CoreResult<()>>,
        T: Clone,
    {
        let batch = {
            let mut inner = self.inner.lock().await;
            if inner.draining {
                debug!("queue drain already in progress, skipping");
                return None;
            }
            inner.draining = true;
            std::mem::take(&mut inner.items)
        };

        let mut summary = DrainSummary::default();
        let mut requeue = Vec::new();
        for mut queued in batch {
            summary.processed += 1;
            match f(queued.item.clone()).await {
                Ok(()) => summary.succeeded += 1,
                Err(err) if err.is_transient() => {
                    queued.attempts += 1;
                    if queued.attempts >= self.max_attempts {
                        error!(
                            item = ?queued.item,
                            attempts = queued.attempts,
                            error = %err,
                            "abandoning queued operation after max attempts"
                        );
                        summary.abandoned += 1;
                    } else {
                        requeue.push(queued);
                        summary.requeued += 1;
                    }
                }
                Err(err) => {
                    error!(item = ?queued.item, error = %err, "abandoning queued operation");
                    summary.abandoned += 1;
                }
            }
        }

        let mut inner = self.inner.lock().await;
        // New pushes during the drain stay ahead of requeued failures.
        for queued in requeue {
            inner.items.push_back(queued);
        }
        inner.draining = false;
        Some(summary)
    }
}

// --- Context ---

/// Rate limiter plus one breaker per [`MessagingOp`], built eagerly at
/// startup and shared by reference.
pub struct ResilienceContext {
    rate_limiter: RateLimiter,
    breakers: HashMap<MessagingOp, Arc<CircuitBreaker>>,
}

impl ResilienceContext {
    pub fn new(config: &Config) -> Self {
        let breakers = MessagingOp::ALL
            .iter()
            .map(|op| {
                (
                    *op,
                    Arc::new(CircuitBreaker::new(op.as_str(), op.profile().breaker)),
                )
            })
            .collect();
        Self {
            rate_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            breakers,
        }
    }

    pub fn breaker(&self, op: MessagingOp) -> &CircuitBreaker {
        // ALL covers every variant, so the map always has an entry.
        &self.breakers[&op]
    }

    /// Runs `f` under the operation's full profile: rate limit, breaker
    /// gate, per-attempt timeout, and jittered retries for transient
    /// errors. A `retry_after` hint on the error replaces the computed
    /// backoff for that attempt.
    pub async fn run<T, F, Fut>(&self, op: MessagingOp, f: F) -> CoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.run_with_profile(op, op.profile(), f).await
    }

    async fn run_with_profile<T, F, Fut>(
        &self,
        op: MessagingOp,
        profile: OpProfile,
        f: F,
    ) -> CoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let breaker = self.breaker(op);
        let mut delays = profile.retry.delays();
        let mut attempt: u32 = 1;

        loop {
            self.rate_limiter.acquire().await;
            breaker.check().await?;

            let result = match tokio::time::timeout(profile.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout(profile.timeout)),
            };

            match result {
                Ok(value) => {
                    breaker.record_success().await;
                    return Ok(value);
                }
                Err(err) => {
                    breaker.record_failure().await;
                    if !err.is_transient() || attempt >= profile.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = match err.retry_after() {
                        Some(hint) => {
                            // The hint is authoritative; still consume the
                            // backoff slot so later delays keep growing.
                            let _ = delays.next();
                            hint
                        }
                        None => jittered(delays.next().unwrap_or(profile.retry.max_delay)),
                    };
                    warn!(
                        operation = %op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
