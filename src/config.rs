//! Configuration types for clipflow
//!
//! The whole engine is driven by one [`Config`] value built at startup and
//! shared by reference; nothing is read from global state.

use crate::error::{Error, Result};
use crate::types::TaskKind;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// A named queue and the size of the worker pool that drains it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name referenced by routes and submissions
    pub name: String,

    /// Number of workers pulling from this queue (default: 4)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl QueueConfig {
    /// Create a queue config
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first execution (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on every further retry (default: 1 second)
    #[serde(default = "default_base_delay", with = "duration_serde")]
    pub base_delay: Duration,

    /// Maximum delay between retries (default: 5 minutes)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Spread delays by ±20% (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: true,
        }
    }
}

/// Worker timing and lease settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Per-attempt handler timeout when neither the task nor its handler sets one (default: 30 minutes)
    #[serde(default = "default_task_timeout", with = "duration_serde")]
    pub task_timeout: Duration,

    /// How long a dequeued task may stay un-acked before it is redelivered (default: 1 hour)
    #[serde(default = "default_lease_timeout", with = "duration_serde")]
    pub lease_timeout: Duration,

    /// How long an idle worker blocks on an empty queue before re-checking shutdown (default: 1 second)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// How often expired leases are reclaimed (default: 30 seconds)
    #[serde(default = "default_reaper_interval", with = "duration_serde")]
    pub reaper_interval: Duration,

    /// How long shutdown waits for running tasks (default: 30 seconds)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            task_timeout: default_task_timeout(),
            lease_timeout: default_lease_timeout(),
            poll_interval: default_poll_interval(),
            reaper_interval: default_reaper_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Batch fan-out limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Items in flight when a batch request does not say (default: 5)
    #[serde(default = "default_batch_concurrency")]
    pub default_concurrency: usize,

    /// Upper bound accepted for a batch's concurrency limit (default: 50)
    #[serde(default = "default_max_batch_concurrency")]
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_batch_concurrency(),
            max_concurrency: default_max_batch_concurrency(),
        }
    }
}

/// Notification configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Webhooks called for terminal workflows and batches
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
}

/// Webhook configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// URL to POST to
    pub url: String,

    /// Events that trigger this webhook
    pub events: Vec<WebhookEvent>,

    /// Optional authentication header value
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Timeout for webhook requests (default: 30 seconds)
    #[serde(default = "default_webhook_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

/// Webhook trigger event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEvent {
    /// A workflow succeeded
    OnWorkflowComplete,
    /// A workflow failed or was cancelled
    OnWorkflowFailed,
    /// A batch completed (individual items may have failed)
    OnBatchComplete,
    /// A batch failed or was cancelled
    OnBatchFailed,
}

/// Task history archive
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database for terminal task history (None = history disabled)
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Main configuration for the engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Queues and their worker pool sizes
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueConfig>,

    /// Per-kind queue overrides; kinds without an entry use their default queue
    #[serde(default)]
    pub routes: HashMap<TaskKind, String>,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Worker timing and leases
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Batch fan-out limits
    #[serde(default)]
    pub batch: BatchConfig,

    /// Completion webhooks
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Task history archive
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            routes: HashMap::new(),
            retry: RetryConfig::default(),
            execution: ExecutionConfig::default(),
            batch: BatchConfig::default(),
            notifications: NotificationConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Config {
    /// Queue a kind is routed to
    pub fn route(&self, kind: TaskKind) -> &str {
        self.routes
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.default_queue())
    }

    /// Look up a configured queue by name
    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Check the configuration for contradictions
    ///
    /// Called by [`crate::Engine::new`]; an engine never runs with a config
    /// that fails here.
    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(config_error("at least one queue is required", "queues"));
        }
        for (i, queue) in self.queues.iter().enumerate() {
            if queue.name.trim().is_empty() {
                return Err(config_error("queue name must not be empty", "queues"));
            }
            if queue.concurrency == 0 {
                return Err(config_error(
                    format!("queue '{}' needs at least one worker", queue.name),
                    "queues.concurrency",
                ));
            }
            if self.queues[..i].iter().any(|q| q.name == queue.name) {
                return Err(config_error(
                    format!("queue '{}' is defined twice", queue.name),
                    "queues",
                ));
            }
        }
        for kind in TaskKind::ALL {
            let target = self.route(kind);
            if self.queue(target).is_none() {
                return Err(config_error(
                    format!("task kind {} routes to unknown queue '{}'", kind, target),
                    "routes",
                ));
            }
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(config_error(
                "base_delay must not exceed max_delay",
                "retry.base_delay",
            ));
        }

        let exec = &self.execution;
        if exec.task_timeout.is_zero() {
            return Err(config_error(
                "task_timeout must be positive",
                "execution.task_timeout",
            ));
        }
        if exec.lease_timeout <= exec.task_timeout {
            return Err(config_error(
                "lease_timeout must be longer than task_timeout",
                "execution.lease_timeout",
            ));
        }
        if exec.poll_interval.is_zero() || exec.reaper_interval.is_zero() {
            return Err(config_error(
                "poll and reaper intervals must be positive",
                "execution.poll_interval",
            ));
        }

        if self.batch.default_concurrency == 0
            || self.batch.default_concurrency > self.batch.max_concurrency
        {
            return Err(config_error(
                "default_concurrency must be between 1 and max_concurrency",
                "batch.default_concurrency",
            ));
        }

        for webhook in &self.notifications.webhooks {
            url::Url::parse(&webhook.url).map_err(|e| {
                config_error(
                    format!("invalid webhook url '{}': {}", webhook.url, e),
                    "notifications.webhooks.url",
                )
            })?;
        }

        Ok(())
    }
}

fn config_error(message: impl Into<String>, key: &str) -> Error {
    Error::Config {
        message: message.into(),
        key: Some(key.to_string()),
    }
}

// Default value functions
fn default_queues() -> Vec<QueueConfig> {
    vec![
        QueueConfig::new("default", 4),
        QueueConfig::new("video_processing", 2),
        QueueConfig::new("ai_processing", 4),
        QueueConfig::new("publishing", 3),
    ]
}

fn default_concurrency() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_lease_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_batch_concurrency() -> usize {
    5
}

fn default_max_batch_concurrency() -> usize {
    50
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Optional Duration serialization helper (milliseconds, for per-task timeouts)
pub(crate) mod optional_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn default_queues_match_pipeline_worker_counts() {
        let config = Config::default();
        assert_eq!(config.queue("video_processing").unwrap().concurrency, 2);
        assert_eq!(config.queue("ai_processing").unwrap().concurrency, 4);
        assert_eq!(config.queue("publishing").unwrap().concurrency, 3);
        assert_eq!(config.queue("default").unwrap().concurrency, 4);
    }

    #[test]
    fn empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.batch.default_concurrency, 5);
        assert_eq!(config.queues.len(), 4);
        assert!(config.persistence.database_path.is_none());
    }

    #[test]
    fn routes_override_default_queue() {
        let config: Config = serde_json::from_str(
            r#"{"routes": {"transcribe": "default"}, "retry": {"base_delay": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.route(TaskKind::Transcribe), "default");
        assert_eq!(config.route(TaskKind::Publish), "publishing");
        assert_eq!(config.retry.base_delay, Duration::from_secs(2));
        config.validate().unwrap();
    }

    #[test]
    fn route_to_unknown_queue_is_rejected() {
        let mut config = Config::default();
        config
            .routes
            .insert(TaskKind::Publish, "nowhere".to_string());
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config { key: Some(ref k), .. } if k == "routes"));
    }

    #[test]
    fn lease_must_outlast_task_timeout() {
        let mut config = Config::default();
        config.execution.lease_timeout = config.execution.task_timeout;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_queue_names_are_rejected() {
        let mut config = Config::default();
        config.queues.push(QueueConfig::new("default", 1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_webhook_url_is_rejected() {
        let mut config = Config::default();
        config.notifications.webhooks.push(WebhookConfig {
            url: "not a url".to_string(),
            events: vec![WebhookEvent::OnBatchComplete],
            auth_header: None,
            timeout: Duration::from_secs(5),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_worker_queue_is_rejected() {
        let mut config = Config::default();
        config.queues[0].concurrency = 0;
        assert!(config.validate().is_err());
    }
}
