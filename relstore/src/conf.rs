use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a row that references its own store-generated key is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfReferenceStrategy {
    /// Insert with the reference null, then update it once the key is known.
    #[default]
    TwoPhaseUpdate,
    /// Same-table references are checked at commit, so rows with client-known
    /// keys may point at each other in any order. A row cannot reference its
    /// own generated key.
    DeferredConstraints,
    /// Rows referencing their own generated key are rejected.
    Unsupported,
}

/// Behavioral limits of the backend the commands are sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub max_batch_size: usize,
    pub max_parameters: usize,
    pub supports_multi_statement: bool,
    pub self_reference: SelfReferenceStrategy,
}

impl ProviderCapabilities {
    /// PostgreSQL accepts one parameterized statement per extended-protocol
    /// exchange, so every command is its own round trip.
    pub const fn postgres() -> Self {
        Self {
            max_batch_size: 128,
            max_parameters: 65_535,
            supports_multi_statement: false,
            self_reference: SelfReferenceStrategy::TwoPhaseUpdate,
        }
    }

    /// A backend that takes a whole batch in one round trip.
    pub const fn multi_statement() -> Self {
        Self {
            supports_multi_statement: true,
            ..Self::postgres()
        }
    }

    pub const fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Commands allowed in one round trip.
    pub fn effective_batch_size(&self) -> usize {
        if self.supports_multi_statement {
            self.max_batch_size.max(1)
        } else {
            1
        }
    }
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self::postgres()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
        }
    }

    /// Linear backoff before the given retry (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(retry)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoreConf {
    pub database: String,

    pub capabilities: ProviderCapabilities,

    pub retry: RetryPolicy,

    pub log_init: bool,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            database: "".to_string(),
            capabilities: ProviderCapabilities::default(),
            retry: RetryPolicy::default(),
            log_init: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl StoreConf {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        #[cfg(test)]
        {
            dotenvy::from_filename_override(".env.test").ok();
        }

        #[cfg(all(debug_assertions, not(test)))]
        {
            dotenvy::from_filename_override(".env.dev").ok();
        }

        let defaults = Self::default();
        let database =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres:///relstore".to_string());

        let capabilities = ProviderCapabilities {
            max_batch_size: env_parse(
                "RELSTORE_MAX_BATCH_SIZE",
                defaults.capabilities.max_batch_size,
            ),
            max_parameters: env_parse(
                "RELSTORE_MAX_PARAMETERS",
                defaults.capabilities.max_parameters,
            ),
            supports_multi_statement: env_parse(
                "RELSTORE_MULTI_STATEMENT",
                defaults.capabilities.supports_multi_statement,
            ),
            ..defaults.capabilities
        };

        let retry = RetryPolicy {
            max_retries: env_parse("RELSTORE_MAX_RETRIES", defaults.retry.max_retries),
            base_delay_ms: env_parse("RELSTORE_RETRY_DELAY_MS", defaults.retry.base_delay_ms),
        };

        Self {
            database,
            capabilities,
            retry,
            ..defaults
        }
    }
}
