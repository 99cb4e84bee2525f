#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use tokio::sync::RwLock;

#[cfg(feature = "redis")]
use crate::config::RateBudget;
#[cfg(feature = "redis")]
use crate::error::RateLimitError;
#[cfg(feature = "redis")]
use crate::rate_limit::RateLimiter;
#[cfg(feature = "redis")]
use crate::types::MerchantId;

/// Fixed-window limiter whose counters live in Redis, shared by every
/// dispatcher instance pointed at the same prefix.
///
/// Each admission runs `INCR` and `EXPIRE` on
/// `{prefix}:{merchant}:{epoch_second}` in one atomic pipeline.
#[cfg(feature = "redis")]
pub struct RedisRateLimiter {
    client: redis::Client,
    prefix: String,
    budget: RwLock<RateBudget>,
}

#[cfg(feature = "redis")]
impl RedisRateLimiter {
    pub fn new(client: redis::Client, prefix: impl Into<String>, budget: RateBudget) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            budget: RwLock::new(budget),
        }
    }

    pub async fn set_budget(&self, merchant_id: MerchantId, rps: u32) {
        self.budget.write().await.per_merchant.insert(merchant_id, rps);
    }

    fn window_key(&self, merchant_id: &MerchantId, epoch_second: i64) -> String {
        format!("{}:{}:{}", self.prefix, merchant_id.0, epoch_second)
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn try_admit(&self, merchant_id: &MerchantId) -> Result<bool, RateLimitError> {
        let limit = self.budget.read().await.rps_for(merchant_id);
        if limit == 0 {
            return Ok(true);
        }

        let key = self.window_key(merchant_id, chrono::Utc::now().timestamp());
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .expire(&key, 2)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count <= u64::from(limit))
    }
}

#[cfg(all(test, feature = "redis"))]
mod tests {
    use super::*;

    #[test]
    fn window_keys_are_scoped_by_prefix_merchant_and_second() {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let limiter = RedisRateLimiter::new(client, "notify:rps", RateBudget::new(1));
        assert_eq!(
            limiter.window_key(&MerchantId("m-1".into()), 1_700_000_000),
            "notify:rps:m-1:1700000000"
        );
    }
}
