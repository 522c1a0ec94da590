//! Pool configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::error::{PoolError, PoolResult};

/// Policy applied when the pool has no idle entry and the active set is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedAction {
    /// Fail the acquire immediately.
    Fail,

    /// Wait for a resource to be returned, bounded by `max_wait`.
    ///
    /// This is the default backpressure mechanism. A timeout is a retryable
    /// condition, not a fatal one.
    #[default]
    Block,

    /// Create a new resource anyway (soft ceiling).
    ///
    /// Disables backpressure entirely; only appropriate when the underlying
    /// resource is cheap or externally rate-limited.
    Grow,
}

impl fmt::Display for ExhaustedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExhaustedAction::Fail => write!(f, "fail"),
            ExhaustedAction::Block => write!(f, "block"),
            ExhaustedAction::Grow => write!(f, "grow"),
        }
    }
}

/// Immutable pool configuration, validated when the pool is constructed.
///
/// `None` means unbounded for the `Option` limits: a pool with
/// `max_active: None` never refuses to create, and `max_wait: None` blocks
/// forever in [`ExhaustedAction::Block`] mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of idle entries the pool is pre-warmed and refilled to.
    pub min_idle: usize,
    /// Upper bound on the idle set; surplus returns are destroyed.
    pub max_idle: Option<usize>,
    /// Upper bound on concurrently checked-out resources.
    pub max_active: Option<usize>,
    /// How long a blocking acquire waits before giving up.
    pub max_wait: Option<Duration>,
    /// Idle entries older than this are evicted by the sweeper; active
    /// entries held longer than this are forcibly reclaimed.
    pub max_idle_time: Option<Duration>,
    /// Entries past this total age are never pooled again.
    pub max_life_time: Option<Duration>,
    /// What to do when the pool is exhausted.
    pub exhausted_action: ExhaustedAction,
    /// Run `validate` in addition to `activate` on checkout.
    pub test_on_activate: bool,
    /// Run `validate` in addition to `deactivate` on return.
    pub test_on_deactivate: bool,
    /// Probe idle entries during sweeps.
    pub test_on_idle: bool,
    /// Record the owning thread and a checkout backtrace for leak diagnosis.
    pub track_owner: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_idle: Some(8),
            max_active: Some(8),
            max_wait: Some(Duration::from_secs(30)),
            max_idle_time: Some(Duration::from_secs(600)),
            max_life_time: None,
            exhausted_action: ExhaustedAction::default(),
            test_on_activate: false,
            test_on_deactivate: false,
            test_on_idle: false,
            track_owner: false,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the default limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle floor the pool is pre-warmed and refilled to.
    pub fn min_idle(mut self, value: usize) -> Self {
        self.min_idle = value;
        self
    }

    /// Set the idle ceiling (`None` = unbounded).
    pub fn max_idle(mut self, value: Option<usize>) -> Self {
        self.max_idle = value;
        self
    }

    /// Set the active ceiling (`None` = unbounded).
    pub fn max_active(mut self, value: Option<usize>) -> Self {
        self.max_active = value;
        self
    }

    /// Set the blocking-acquire deadline (`None` = wait forever).
    pub fn max_wait(mut self, value: Option<Duration>) -> Self {
        self.max_wait = value;
        self
    }

    /// Set the idle/held-too-long deadline used by the sweeper.
    pub fn max_idle_time(mut self, value: Option<Duration>) -> Self {
        self.max_idle_time = value;
        self
    }

    /// Set the total-lifetime ceiling (`None` = unbounded).
    pub fn max_life_time(mut self, value: Option<Duration>) -> Self {
        self.max_life_time = value;
        self
    }

    /// Set the exhaustion policy.
    pub fn exhausted_action(mut self, value: ExhaustedAction) -> Self {
        self.exhausted_action = value;
        self
    }

    /// Validate on checkout in addition to activation.
    pub fn test_on_activate(mut self, value: bool) -> Self {
        self.test_on_activate = value;
        self
    }

    /// Validate on return in addition to deactivation.
    pub fn test_on_deactivate(mut self, value: bool) -> Self {
        self.test_on_deactivate = value;
        self
    }

    /// Probe idle entries during sweeps.
    pub fn test_on_idle(mut self, value: bool) -> Self {
        self.test_on_idle = value;
        self
    }

    /// Track owning threads and checkout backtraces.
    pub fn track_owner(mut self, value: bool) -> Self {
        self.track_owner = value;
        self
    }

    /// Reject inconsistent limit combinations.
    pub fn validate(&self) -> PoolResult<()> {
        if let Some(max_idle) = self.max_idle {
            if max_idle < self.min_idle {
                return Err(PoolError::InvalidConfig(format!(
                    "max_idle ({max_idle}) is below min_idle ({})",
                    self.min_idle
                )));
            }
        }
        if let Some(max_active) = self.max_active {
            if max_active == 0 {
                return Err(PoolError::InvalidConfig(
                    "max_active must be at least 1".to_string(),
                ));
            }
            if self.min_idle > max_active {
                return Err(PoolError::InvalidConfig(format!(
                    "min_idle ({}) exceeds max_active ({max_active})",
                    self.min_idle
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_chains() {
        let config = PoolConfig::new()
            .min_idle(2)
            .max_idle(Some(4))
            .max_active(None)
            .exhausted_action(ExhaustedAction::Grow)
            .track_owner(true);
        assert_eq!(config.min_idle, 2);
        assert_eq!(config.max_idle, Some(4));
        assert_eq!(config.max_active, None);
        assert_eq!(config.exhausted_action, ExhaustedAction::Grow);
        assert!(config.track_owner);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_idle_ceiling_below_floor() {
        let config = PoolConfig::new().min_idle(5).max_idle(Some(2));
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_zero_max_active() {
        let config = PoolConfig::new().max_active(Some(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_min_idle_above_max_active() {
        let config = PoolConfig::new().min_idle(9).max_idle(None).max_active(Some(4));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let config = PoolConfig::new()
            .min_idle(1)
            .max_wait(Some(Duration::from_millis(250)))
            .exhausted_action(ExhaustedAction::Fail);
        let json = serde_json::to_string(&config).unwrap();
        let back: PoolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.min_idle, 1);
        assert_eq!(back.max_wait, Some(Duration::from_millis(250)));
        assert_eq!(back.exhausted_action, ExhaustedAction::Fail);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{"min_idle": 3}"#).unwrap();
        assert_eq!(config.min_idle, 3);
        assert_eq!(config.exhausted_action, ExhaustedAction::Block);
    }
}
