use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `HUB_MODULE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub module: ModuleConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Identity of the module on the bus: `<scope>/<name>`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleConfig {
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_module_name")]
    pub name: String,
}

impl ModuleConfig {
    pub fn fullname(&self) -> String {
        format!("{}/{}", self.scope, self.name)
    }
}

/// What the dispatcher does when a submission finds the backlog full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Return `ModuleError::BacklogFull` to the submitter.
    Reject,
    /// Park the submitter until the backlog has room.
    Block,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
    #[serde(default = "default_backlog_policy")]
    pub backlog_policy: BackpressurePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name sensors refer to in their `service.name` field.
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_poll_at_startup")]
    pub poll_at_startup: bool,
    #[serde(default = "default_jitter_secs")]
    pub jitter_secs: u64,
    #[serde(default = "default_startup_delay_min_secs")]
    pub startup_delay_min_secs: u64,
    #[serde(default = "default_startup_delay_max_secs")]
    pub startup_delay_max_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_scope() -> String {
    "notification".to_string()
}
fn default_module_name() -> String {
    "console".to_string()
}
fn default_backlog_capacity() -> usize {
    10
}
fn default_backlog_policy() -> BackpressurePolicy {
    BackpressurePolicy::Reject
}
fn default_service_name() -> String {
    "echo".to_string()
}
fn default_poll_at_startup() -> bool {
    true
}
fn default_jitter_secs() -> u64 {
    15
}
fn default_startup_delay_min_secs() -> u64 {
    5
}
fn default_startup_delay_max_secs() -> u64 {
    20
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            name: default_module_name(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: default_backlog_capacity(),
            backlog_policy: default_backlog_policy(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            poll_at_startup: default_poll_at_startup(),
            jitter_secs: default_jitter_secs(),
            startup_delay_min_secs: default_startup_delay_min_secs(),
            startup_delay_max_secs: default_startup_delay_max_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            module: ModuleConfig::default(),
            notification: NotificationConfig::default(),
            service: ServiceConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("HUB_MODULE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.module.fullname(), "notification/console");
        assert_eq!(config.notification.backlog_capacity, 10);
        assert_eq!(config.notification.backlog_policy, BackpressurePolicy::Reject);
        assert!(config.service.poll_at_startup);
        assert_eq!(config.service.jitter_secs, 15);
        assert_eq!(
            (config.service.startup_delay_min_secs, config.service.startup_delay_max_secs),
            (5, 20)
        );
    }

    #[test]
    fn test_partial_deserialize() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "notification": {"backlog_policy": "block"},
            "service": {"poll_at_startup": false}
        }))
        .unwrap();
        assert_eq!(config.notification.backlog_policy, BackpressurePolicy::Block);
        assert_eq!(config.notification.backlog_capacity, 10);
        assert!(!config.service.poll_at_startup);
        assert_eq!(config.module.name, "console");
        assert_eq!(config.metrics.port, 9091);

        let config: AppConfig =
            serde_json::from_value(serde_json::json!({"metrics": {"port": 9200}})).unwrap();
        assert_eq!(config.metrics.port, 9200);
    }
}
