use anyhow::{Result, bail};
use std::time::Duration;

/// The platform's service-notification account; login codes arrive from it.
pub const DEFAULT_CODE_SENDER_ID: i64 = 777000;

/// Tunables consumed by the login manager, scheduler and broker.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Base period between heartbeats of one task.
    pub interval: Duration,
    /// Upper bound of the uniform random delay added to `interval`.
    pub jitter: Duration,
    /// Consecutive heartbeat failures that evict a task.
    pub max_consecutive_failures: u32,
    /// Maximum number of simultaneously open verification subscriptions.
    pub subscription_capacity: usize,
    /// How long a verification subscription waits for a code.
    pub subscription_timeout: Duration,
    /// Period of `heartbeat` events on an open subscription.
    pub subscription_heartbeat: Duration,
    /// Lifetime of a pending login flow.
    pub login_ttl: Duration,
    /// How often expired login flows are swept.
    pub login_sweep_interval: Duration,
    pub code_sender_id: i64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(86_400),
            jitter: Duration::from_secs(300),
            max_consecutive_failures: 3,
            subscription_capacity: 50,
            subscription_timeout: Duration::from_secs(300),
            subscription_heartbeat: Duration::from_secs(1),
            login_ttl: Duration::from_secs(600),
            login_sweep_interval: Duration::from_secs(300),
            code_sender_id: DEFAULT_CODE_SENDER_ID,
        }
    }
}

impl KeepaliveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("heartbeat interval must be greater than zero");
        }
        if self.max_consecutive_failures == 0 {
            bail!("max consecutive failures must be at least 1");
        }
        if self.subscription_capacity == 0 {
            bail!("subscription capacity must be at least 1");
        }
        if self.subscription_timeout.is_zero() || self.subscription_heartbeat.is_zero() {
            bail!("subscription timeout and heartbeat must be greater than zero");
        }
        if self.login_ttl.is_zero() || self.login_sweep_interval.is_zero() {
            bail!("login ttl and sweep interval must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = KeepaliveConfig::default();
        config.validate().unwrap();
        assert_eq!(config.subscription_capacity, 50);
        assert_eq!(config.subscription_timeout, Duration::from_secs(300));
        assert_eq!(config.login_ttl, Duration::from_secs(600));
    }

    #[test]
    fn zero_ceiling_rejected() {
        let config = KeepaliveConfig {
            max_consecutive_failures: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_interval_rejected() {
        let config = KeepaliveConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("interval"));
    }
}
