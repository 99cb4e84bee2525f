use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::RateBudget;
use crate::error::RateLimitError;
use crate::types::MerchantId;

/// Per-merchant admission control.
///
/// A refusal is not a failure: the caller defers the event and retries it
/// after a short fixed delay.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Reserve one send for `merchant_id` in the current window.
    async fn try_admit(&self, merchant_id: &MerchantId) -> Result<bool, RateLimitError>;
}

const WINDOW: Duration = Duration::from_secs(1);

/// One-second counting window.
#[derive(Debug)]
pub struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub limit_rps: u32,
    pub used: u32,
    pub window_age_ms: u64,
}

impl Window {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }

    /// Reserve a slot if fewer than `limit` were taken in the current window.
    pub fn try_take(&mut self, limit: u32) -> bool {
        let now = Instant::now();
        if now.duration_since(self.started) >= WINDOW {
            self.started = now;
            self.count = 0;
        }

        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }

    pub fn snapshot(&self, limit_rps: u32) -> RateLimiterStats {
        let age = Instant::now().duration_since(self.started).as_millis() as u64;
        RateLimiterStats {
            limit_rps,
            used: self.count,
            window_age_ms: age,
        }
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-local fixed-window limiter.
///
/// Counters live in this process only. With several dispatcher instances
/// active at once each enforces the budget on its own and the merchant is
/// over-admitted in aggregate.
pub struct FixedWindowLimiter {
    budget: RwLock<RateBudget>,
    windows: Mutex<HashMap<MerchantId, Window>>,
}

impl FixedWindowLimiter {
    pub fn new(budget: RateBudget) -> Self {
        Self {
            budget: RwLock::new(budget),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Override the budget of one merchant, e.g. after its tenant settings changed.
    pub async fn set_budget(&self, merchant_id: MerchantId, rps: u32) {
        self.budget.write().await.per_merchant.insert(merchant_id, rps);
    }

    pub async fn stats(&self) -> HashMap<MerchantId, RateLimiterStats> {
        let budget = self.budget.read().await;
        let windows = self.windows.lock().await;
        windows
            .iter()
            .map(|(merchant, window)| (merchant.clone(), window.snapshot(budget.rps_for(merchant))))
            .collect()
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn try_admit(&self, merchant_id: &MerchantId) -> Result<bool, RateLimitError> {
        let limit = self.budget.read().await.rps_for(merchant_id);
        if limit == 0 {
            return Ok(true);
        }
        let mut windows = self.windows.lock().await;
        let window = windows.entry(merchant_id.clone()).or_default();
        Ok(window.try_take(limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merchant(id: &str) -> MerchantId {
        MerchantId(id.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn budget_resets_with_the_window() {
        let limiter = FixedWindowLimiter::new(RateBudget::new(2));
        let m = merchant("m-1");

        assert!(limiter.try_admit(&m).await.unwrap());
        assert!(limiter.try_admit(&m).await.unwrap());
        assert!(!limiter.try_admit(&m).await.unwrap());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(limiter.try_admit(&m).await.unwrap());
    }

    #[tokio::test]
    async fn zero_budget_is_unlimited() {
        let limiter = FixedWindowLimiter::new(RateBudget::new(0));
        let m = merchant("m-1");
        for _ in 0..100 {
            assert!(limiter.try_admit(&m).await.unwrap());
        }
        assert!(limiter.stats().await.is_empty());
    }

    #[tokio::test]
    async fn merchants_have_independent_windows() {
        let limiter = FixedWindowLimiter::new(RateBudget::new(1).with_override("vip", 3));
        assert!(limiter.try_admit(&merchant("a")).await.unwrap());
        assert!(!limiter.try_admit(&merchant("a")).await.unwrap());
        assert!(limiter.try_admit(&merchant("b")).await.unwrap());
        for _ in 0..3 {
            assert!(limiter.try_admit(&merchant("vip")).await.unwrap());
        }
        assert!(!limiter.try_admit(&merchant("vip")).await.unwrap());
    }

    #[tokio::test]
    async fn runtime_override_takes_effect() {
        let limiter = FixedWindowLimiter::new(RateBudget::new(1));
        let m = merchant("m-1");
        assert!(limiter.try_admit(&m).await.unwrap());
        assert!(!limiter.try_admit(&m).await.unwrap());

        limiter.set_budget(m.clone(), 0).await;
        assert!(limiter.try_admit(&m).await.unwrap());
    }
}
