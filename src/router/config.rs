//! Router tuning knobs (§4.J), construction-time only — no env/file loading.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_retry_attempts: u32,
    pub base_delay: Duration,
    pub exp_factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
    pub retry_check_interval: Duration,
    pub cleanup_interval: Duration,
    pub confirmation_ttl: Duration,
    pub router_version: String,
    pub max_dead_letters: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            base_delay: Duration::from_secs(1),
            exp_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
            retry_check_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(300),
            confirmation_ttl: Duration::from_secs(3600),
            router_version: "1.0".to_string(),
            max_dead_letters: 1000,
        }
    }
}

/// `delay = base * exp^(attempts_so_far - 1)`, capped at `max_delay`, plus
/// optional jitter in `[0.1, 0.3) * delay` (§4.J retry semantics).
pub fn backoff_delay(config: &RouterConfig, attempts_so_far: u32) -> Duration {
    let exp = config.exp_factor.powi(attempts_so_far.saturating_sub(1) as i32);
    let base = config.base_delay.as_secs_f64() * exp;
    let capped = base.min(config.max_delay.as_secs_f64());
    let with_jitter = if config.jitter {
        let jitter_frac = 0.1 + rand::random::<f64>() * 0.2;
        capped + capped * jitter_frac
    } else {
        capped
    };
    Duration::from_secs_f64(with_jitter.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let config = RouterConfig {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        let delay = backoff_delay(
            &RouterConfig {
                jitter: false,
                ..Default::default()
            },
            10,
        );
        assert_eq!(delay, Duration::from_secs(60));
    }
}
