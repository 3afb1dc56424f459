use crate::core::{DomainError, Result};
use std::time::Duration;

/// Tenant assumed when a request carries none.
pub const SUPER_ORG_ID: &str = "SUP";

/// Currency assumed when neither the request nor the value names one.
pub const DEFAULT_CURRENCY: &str = "INR";

/// Framework-wide settings
///
/// Built once at startup and handed to the pieces that need it
/// (request contexts, the in-memory driver, id generation).
#[derive(Debug, Clone)]
pub struct FrameworkConfig {
    /// Tenant used by contexts that do not set one
    pub default_tenant_id: String,

    /// Currency used by contexts that do not set one
    pub default_currency: String,

    /// Random parts in ids synthesized by entity sets
    pub entity_set_id_parts: usize,

    /// Random suffix length used by `generate_id_with_prefix`
    pub id_suffix_length: usize,

    /// Whether `load(.., for_update = true)` fails fast on a held lock
    pub lock_nowait: bool,

    /// How long a blocking lock request waits before giving up
    pub lock_wait_timeout: Duration,
}

impl FrameworkConfig {
    pub fn new() -> Self {
        Self {
            default_tenant_id: SUPER_ORG_ID.to_string(),
            default_currency: DEFAULT_CURRENCY.to_string(),
            entity_set_id_parts: 2,
            id_suffix_length: 4,
            lock_nowait: true,
            lock_wait_timeout: Duration::from_secs(5),
        }
    }

    /// Reads overrides from `DDDKIT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new().merge_env(|key| std::env::var(key).ok())
    }

    /// Overlay values looked up through `lookup` (exposed for tests).
    pub fn merge_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(tenant) = lookup("DDDKIT_DEFAULT_TENANT") {
            self.default_tenant_id = tenant;
        }
        if let Some(currency) = lookup("DDDKIT_DEFAULT_CURRENCY") {
            self.default_currency = currency.to_ascii_uppercase();
        }
        if let Some(raw) = lookup("DDDKIT_LOCK_NOWAIT") {
            self.lock_nowait = match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(DomainError::Configuration(format!(
                        "DDDKIT_LOCK_NOWAIT must be a boolean, got '{}'",
                        raw
                    )));
                }
            };
        }
        if let Some(raw) = lookup("DDDKIT_LOCK_TIMEOUT_MS") {
            let millis: u64 = raw.parse().map_err(|_| {
                DomainError::Configuration(format!(
                    "DDDKIT_LOCK_TIMEOUT_MS must be an integer, got '{}'",
                    raw
                ))
            })?;
            self.lock_wait_timeout = Duration::from_millis(millis);
        }
        Ok(self)
    }

    /// Set the default tenant
    pub fn default_tenant_id(mut self, tenant_id: &str) -> Self {
        self.default_tenant_id = tenant_id.to_string();
        self
    }

    /// Set the default currency
    pub fn default_currency(mut self, currency: &str) -> Self {
        self.default_currency = currency.to_ascii_uppercase();
        self
    }

    /// Set the number of random parts in entity-set ids
    pub fn entity_set_id_parts(mut self, parts: usize) -> Self {
        self.entity_set_id_parts = parts;
        self
    }

    /// Set the random suffix length for prefixed ids
    pub fn id_suffix_length(mut self, length: usize) -> Self {
        self.id_suffix_length = length;
        self
    }

    /// Set lock acquisition behaviour
    pub fn lock_nowait(mut self, nowait: bool) -> Self {
        self.lock_nowait = nowait;
        self
    }

    /// Set lock wait timeout
    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = FrameworkConfig::new()
            .default_tenant_id("T1")
            .default_currency("usd")
            .lock_nowait(false);
        assert_eq!(config.default_tenant_id, "T1");
        assert_eq!(config.default_currency, "USD");
        assert!(!config.lock_nowait);
        assert_eq!(config.entity_set_id_parts, 2);
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("DDDKIT_DEFAULT_TENANT", "ACME"),
            ("DDDKIT_LOCK_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();
        let config = FrameworkConfig::new()
            .merge_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.default_tenant_id, "ACME");
        assert_eq!(config.lock_wait_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let result = FrameworkConfig::new().merge_env(|key| {
            (key == "DDDKIT_LOCK_NOWAIT").then(|| "maybe".to_string())
        });
        assert!(matches!(result, Err(DomainError::Configuration(_))));
    }
}
