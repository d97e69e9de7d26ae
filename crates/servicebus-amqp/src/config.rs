//! Namespace and link configuration.
//!
//! Configuration can be built in code or loaded from layered sources:
//!
//! 1. An optional YAML file
//! 2. Environment variables prefixed `SERVICEBUS__` (double-underscore separator),
//!    e.g. `SERVICEBUS__RETRY__CLAIMS__ATTEMPTS=5`
//!
//! Every field carries a default so an empty source set still yields a
//! usable configuration once `namespace` is supplied.

use crate::error::ConfigurationError;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Standard tier maximum message size in bytes
pub const STANDARD_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Premium tier maximum message size in bytes
pub const PREMIUM_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default DNS suffix for public cloud namespaces
pub const DEFAULT_NAMESPACE_SUFFIX: &str = "servicebus.windows.net";

/// Environment variable prefix for layered loading
pub const ENV_PREFIX: &str = "SERVICEBUS";

/// Configuration for a Service Bus namespace connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceBusConfig {
    /// Namespace name, without the DNS suffix
    pub namespace: String,

    /// DNS suffix appended to the namespace name
    pub suffix: String,

    /// Link credit granted to receivers
    pub receiver_prefetch: u32,

    /// Interval between claim refreshes for open links, in seconds.
    ///
    /// `None` disables periodic refresh.
    pub claim_refresh_interval_seconds: Option<u64>,

    /// Default number of messages fetched per peek page
    pub peek_page_size: u32,

    /// Byte ceiling for message batches
    pub max_message_size: usize,

    /// Retry policies per call site
    pub retry: RetryConfig,
}

impl Default for ServiceBusConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            suffix: DEFAULT_NAMESPACE_SUFFIX.to_string(),
            receiver_prefetch: 1,
            claim_refresh_interval_seconds: Some(600),
            peek_page_size: 10,
            max_message_size: STANDARD_MAX_MESSAGE_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

impl ServiceBusConfig {
    /// Create configuration for a namespace with default settings
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Load configuration from an optional YAML file and the environment.
    ///
    /// A missing `file` is an error only when a path was given; environment
    /// variables override file values.
    pub fn load(file: Option<&str>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            info!(path = %path, "Loading Service Bus configuration from file");
            builder = builder.add_source(
                config::File::with_name(path)
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
        }

        let loaded = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let config: Self = loaded
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the link layer cannot work with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.namespace.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "namespace".to_string(),
            });
        }

        if !self
            .namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "namespace '{}' may only contain ASCII alphanumerics and hyphens",
                    self.namespace
                ),
            });
        }

        if self.suffix.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "suffix".to_string(),
            });
        }

        if self.receiver_prefetch == 0 {
            return Err(ConfigurationError::Invalid {
                message: "receiver_prefetch must be at least 1".to_string(),
            });
        }

        if self.peek_page_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "peek_page_size must be at least 1".to_string(),
            });
        }

        if self.max_message_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_message_size must be greater than zero".to_string(),
            });
        }

        for (name, policy) in [
            ("claims", &self.retry.claims),
            ("lock_renewal", &self.retry.lock_renewal),
            ("management", &self.retry.management),
        ] {
            if policy.attempts == 0 {
                return Err(ConfigurationError::Invalid {
                    message: format!("retry.{}.attempts must be at least 1", name),
                });
            }
        }

        Ok(())
    }

    /// Fully qualified host name of the namespace
    pub fn host(&self) -> String {
        format!("{}.{}", self.namespace, self.suffix)
    }

    /// Claim audience for an entity path
    pub fn resource_uri(&self, entity_path: &str) -> String {
        format!("amqp://{}/{}", self.host(), entity_path)
    }

    pub fn claim_refresh_interval(&self) -> Option<Duration> {
        self.claim_refresh_interval_seconds
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
    }
}
