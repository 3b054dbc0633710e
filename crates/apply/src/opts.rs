use std::time::Duration;

use tracing::warn;

use crate::strategy::UpdateStrategy;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> { std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok()) }

/// Runtime knobs for a reconcile. `from_env` reads `KEEL_*` variables;
/// every field is also settable in code.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOpts {
    /// Simultaneous cluster calls per batch; 0 is unbounded.
    pub concurrency: usize,
    pub wait_timeout: Duration,
    pub wait_check_interval: Duration,
    pub default_update_strategy: UpdateStrategy,
    /// Attempts for an apply that fails on transport errors.
    pub apply_retries: u32,
    pub against_last_applied: bool,
    pub ignore_failing_api_services: bool,
    /// Value for the app label stamped next to the association label.
    pub app_label: Option<String>,
}

impl Default for ReconcileOpts {
    fn default() -> Self {
        Self {
            concurrency: 0,
            wait_timeout: Duration::from_secs(900),
            wait_check_interval: Duration::from_millis(1000),
            default_update_strategy: UpdateStrategy::Default,
            apply_retries: 3,
            against_last_applied: false,
            ignore_failing_api_services: false,
            app_label: None,
        }
    }
}

impl ReconcileOpts {
    pub fn from_env() -> Self {
        let d = Self::default();
        let default_update_strategy = match std::env::var("KEEL_DEFAULT_UPDATE_STRATEGY") {
            Ok(s) => UpdateStrategy::parse(&s).unwrap_or_else(|e| {
                warn!(error = %e, "ignoring KEEL_DEFAULT_UPDATE_STRATEGY");
                d.default_update_strategy
            }),
            Err(_) => d.default_update_strategy,
        };
        Self {
            concurrency: env_parse("KEEL_APPLY_CONCURRENCY").unwrap_or(d.concurrency),
            wait_timeout: env_parse("KEEL_WAIT_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.wait_timeout),
            wait_check_interval: env_parse("KEEL_WAIT_CHECK_INTERVAL_MS").map(Duration::from_millis).unwrap_or(d.wait_check_interval),
            default_update_strategy,
            apply_retries: env_parse::<u32>("KEEL_APPLY_RETRIES").unwrap_or(d.apply_retries).max(1),
            ..d
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_wait_check_interval(mut self, interval: Duration) -> Self {
        self.wait_check_interval = interval;
        self
    }

    pub fn with_default_update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.default_update_strategy = strategy;
        self
    }

    pub fn with_app_label(mut self, app: &str) -> Self {
        self.app_label = Some(app.to_string());
        self
    }

    pub fn with_against_last_applied(mut self, on: bool) -> Self {
        self.against_last_applied = on;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("KEEL_APPLY_CONCURRENCY", "4");
        std::env::set_var("KEEL_WAIT_TIMEOUT_SECS", "30");
        std::env::set_var("KEEL_WAIT_CHECK_INTERVAL_MS", "250");
        std::env::set_var("KEEL_DEFAULT_UPDATE_STRATEGY", "fallback-on-replace");
        std::env::set_var("KEEL_APPLY_RETRIES", "0");
        let opts = ReconcileOpts::from_env();
        for k in ["KEEL_APPLY_CONCURRENCY", "KEEL_WAIT_TIMEOUT_SECS", "KEEL_WAIT_CHECK_INTERVAL_MS", "KEEL_DEFAULT_UPDATE_STRATEGY", "KEEL_APPLY_RETRIES"] {
            std::env::remove_var(k);
        }
        assert_eq!(opts.concurrency, 4);
        assert_eq!(opts.wait_timeout, Duration::from_secs(30));
        assert_eq!(opts.wait_check_interval, Duration::from_millis(250));
        assert_eq!(opts.default_update_strategy, UpdateStrategy::FallbackOnReplace);
        assert_eq!(opts.apply_retries, 1);
        assert_eq!(ReconcileOpts::from_env(), ReconcileOpts::default());
    }
}
