//! Per-query options
//!
//! A [`QueryConfig`] is built once, either in code through the `with_*`
//! methods or deserialized from JSON, and cloned into every target at
//! creation. Nothing reads configuration from process-wide state.

use protocol::{DedupPolicy, RequestParams};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Immutable options a target is queried with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Also fetch the server's rules.
    pub want_rules: bool,
    /// Also fetch the player list.
    pub want_players: bool,
    /// Re-sends per phase after the first attempt.
    pub retries: u32,
    /// Time to wait for a reply before re-sending.
    #[serde(rename = "retry_interval_ms", deserialize_with = "duration_from_millis")]
    pub retry_interval: Duration,
    /// Pass codec errors to the diagnostic sink.
    pub show_errors: bool,
    pub rule_policy: DedupPolicy,
    /// Protocol-specific parameters such as `password`.
    pub params: BTreeMap<String, String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            want_rules: false,
            want_players: false,
            retries: DEFAULT_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            show_errors: false,
            rule_policy: DedupPolicy::default(),
            params: BTreeMap::new(),
        }
    }
}

impl QueryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(mut self, want: bool) -> Self {
        self.want_rules = want;
        self
    }

    pub fn with_players(mut self, want: bool) -> Self {
        self.want_players = want;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_show_errors(mut self, show: bool) -> Self {
        self.show_errors = show;
        self
    }

    pub fn with_rule_policy(mut self, policy: DedupPolicy) -> Self {
        self.rule_policy = policy;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Sends allowed per phase, first attempt included.
    pub fn sends_per_phase(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Options handed to codecs when building requests and parsing replies.
    pub fn request_params(&self) -> RequestParams {
        RequestParams {
            want_rules: self.want_rules,
            want_players: self.want_players,
            rule_policy: self.rule_policy,
            extra: self.params.clone(),
        }
    }
}

fn duration_from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
