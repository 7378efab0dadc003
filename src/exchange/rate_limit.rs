// =============================================================================
// Rate Limiter — token bucket keyed per endpoint family
// =============================================================================
//
// The exchange enforces separate budgets for market-data reads, account
// reads, and order mutations. Each family gets its own bucket; callers
// `acquire()` one token before the request and sleep when the bucket is dry.
// Suspension happens in `tokio::time::sleep`, never while holding the lock.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Endpoint families with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointFamily {
    MarketData,
    Account,
    Orders,
}

impl EndpointFamily {
    /// (capacity, refill per second) for each family.
    fn budget(self) -> (f64, f64) {
        match self {
            // Market data is cheap and heavily used during ScanPhase.
            Self::MarketData => (40.0, 15.0),
            Self::Account => (10.0, 2.0),
            // Order mutations are the scarcest resource.
            Self::Orders => (5.0, 1.0),
        }
    }
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token, or return how long to wait until one is available.
    fn try_take(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Token-bucket rate limiter shared by all exchange calls.
pub struct RateLimiter {
    market_data: Mutex<Bucket>,
    account: Mutex<Bucket>,
    orders: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        let build = |family: EndpointFamily| {
            let (cap, refill) = family.budget();
            Mutex::new(Bucket::new(cap, refill))
        };
        Self {
            market_data: build(EndpointFamily::MarketData),
            account: build(EndpointFamily::Account),
            orders: build(EndpointFamily::Orders),
        }
    }

    fn bucket(&self, family: EndpointFamily) -> &Mutex<Bucket> {
        match family {
            EndpointFamily::MarketData => &self.market_data,
            EndpointFamily::Account => &self.account,
            EndpointFamily::Orders => &self.orders,
        }
    }

    /// Acquire one token for `family`, sleeping until the bucket refills if
    /// necessary.
    pub async fn acquire(&self, family: EndpointFamily) {
        loop {
            let wait = self.bucket(family).lock().try_take(Instant::now());
            match wait {
                None => return,
                Some(delay) => {
                    debug!(?family, delay_ms = delay.as_millis() as u64, "rate limiter: waiting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Non-blocking probe used by tests and pre-flight checks.
    pub fn try_acquire(&self, family: EndpointFamily) -> bool {
        self.bucket(family).lock().try_take(Instant::now()).is_none()
    }

    /// Penalize a family after the exchange returns a 429: drain the bucket
    /// so subsequent calls back off for at least `penalty`.
    pub fn penalize(&self, family: EndpointFamily, penalty: Duration) {
        let mut bucket = self.bucket(family).lock();
        bucket.tokens = -(penalty.as_secs_f64() * bucket.refill_per_sec - 1.0).max(0.0);
        warn!(?family, penalty_secs = penalty.as_secs(), "rate limiter: penalized after 429");
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}
