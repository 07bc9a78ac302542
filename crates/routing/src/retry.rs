use std::time::Duration;

use branchdb_config::CoordinatorConfig;

/// 指数退避 + 随机抖动
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            multiplier: config.backoff_multiplier,
            jitter_factor: 0.2,
        }
    }

    /// 第 retry 次重试（从0开始）前的等待时间
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let exponential = base * self.multiplier.powi(retry as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());

        // 抖动避免多个协调器同时重试同一分区
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let delay = (capped + jitter).clamp(base, self.max_delay.as_secs_f64().max(base));
        Duration::from_secs_f64(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_factor: 0.2,
        };
        for retry in 0..10 {
            let delay = policy.delay(retry);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_secs(1));
        }
        assert!(policy.delay(3) >= Duration::from_millis(640));
    }
}
