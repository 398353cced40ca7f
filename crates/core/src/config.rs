use serde::Deserialize;

use crate::duration::MAX_DELAY_MS;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `FOLLOWUP_EXPRESS__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub sequencer: SequencerConfig,
    #[serde(default)]
    pub advisor: AdvisorConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// How a follow-up crosses from one stage into the next once the current
/// stage's steps are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePolicy {
    /// Park at the boundary until the client replies.
    AwaitResponse,
    /// Cross automatically once every message of the stage is delivered.
    AfterDelivery,
}

impl std::str::FromStr for StagePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "await_response" => Ok(StagePolicy::AwaitResponse),
            "after_delivery" => Ok(StagePolicy::AfterDelivery),
            other => Err(format!("unknown stage policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequencerConfig {
    /// Multiplier applied to every step wait. 1.0 in production; small
    /// values compress campaigns for demos and tests.
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
    #[serde(default = "default_stage_policy")]
    pub stage_policy: StagePolicy,
    /// A step is considered due when at most this far in the future.
    #[serde(default = "default_due_tolerance_ms")]
    pub due_tolerance_ms: u64,
    /// Re-check interval while waiting for stage messages to be delivered.
    #[serde(default = "default_delivery_recheck_ms")]
    pub delivery_recheck_ms: u64,
    /// How long a reply without a provider event id is treated as a
    /// redelivery when the same text arrives again.
    #[serde(default = "default_duplicate_window_ms")]
    pub duplicate_window_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvisorConfig {
    #[serde(default = "default_advisor_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_advisor_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// `loopback`, `whatsapp` or `sms`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub phone_number_id: Option<String>,
    /// Twilio account for the `sms` provider.
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub from_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4().as_simple())
}

fn default_time_scale() -> f64 {
    1.0
}

fn default_stage_policy() -> StagePolicy {
    StagePolicy::AwaitResponse
}

fn default_due_tolerance_ms() -> u64 {
    1_000
}

fn default_delivery_recheck_ms() -> u64 {
    60_000
}

fn default_duplicate_window_ms() -> u64 {
    10_000
}

fn default_advisor_enabled() -> bool {
    false
}

fn default_advisor_timeout_ms() -> u64 {
    3_000
}

fn default_provider() -> String {
    "loopback".to_string()
}

fn default_api_base_url() -> String {
    "https://graph.facebook.com/v18.0".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    9091
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            time_scale: default_time_scale(),
            stage_policy: default_stage_policy(),
            due_tolerance_ms: default_due_tolerance_ms(),
            delivery_recheck_ms: default_delivery_recheck_ms(),
            duplicate_window_ms: default_duplicate_window_ms(),
        }
    }
}

impl SequencerConfig {
    /// Applies `time_scale` to a wait. Non-finite or negative scales fall
    /// back to real time.
    pub fn scaled(&self, millis: u64) -> u64 {
        let millis = millis.min(MAX_DELAY_MS);
        if !self.time_scale.is_finite() || self.time_scale < 0.0 {
            return millis;
        }
        ((millis as f64 * self.time_scale).round() as u64).min(MAX_DELAY_MS)
    }
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            enabled: default_advisor_enabled(),
            endpoint: None,
            timeout_ms: default_advisor_timeout_ms(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_base_url: default_api_base_url(),
            access_token: None,
            phone_number_id: None,
            account_sid: None,
            from_number: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            sequencer: SequencerConfig::default(),
            advisor: AdvisorConfig::default(),
            dispatch: DispatchConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file and environment variables.
    /// Environment values win over the file.
    pub fn load(file: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FOLLOWUP_EXPRESS")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.sequencer.stage_policy, StagePolicy::AwaitResponse);
        assert_eq!(config.sequencer.time_scale, 1.0);
        assert!(!config.advisor.enabled);
        assert_eq!(config.dispatch.provider, "loopback");
        assert_eq!(config.metrics.port, 9091);
    }

    #[test]
    fn test_scaled_wait() {
        let mut sequencer = SequencerConfig::default();
        assert_eq!(sequencer.scaled(60_000), 60_000);
        sequencer.time_scale = 0.01;
        assert_eq!(sequencer.scaled(60_000), 600);
        sequencer.time_scale = f64::NAN;
        assert_eq!(sequencer.scaled(60_000), 60_000);
        sequencer.time_scale = 2.0;
        assert_eq!(sequencer.scaled(u64::MAX), MAX_DELAY_MS);
    }

    #[test]
    fn test_stage_policy_from_str() {
        assert_eq!(
            "after-delivery".parse::<StagePolicy>().unwrap(),
            StagePolicy::AfterDelivery
        );
        assert_eq!(
            "await_response".parse::<StagePolicy>().unwrap(),
            StagePolicy::AwaitResponse
        );
        assert!("whenever".parse::<StagePolicy>().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.sequencer.due_tolerance_ms, 1_000);
    }
}
