//! Pool configuration.

use std::time::Duration;

/// Configuration shared by every pool, independent of the backend.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Prefix partitioning this pool's id-space from other pools sharing the
    /// same backend. Validated when the pool is constructed.
    pub namespace: String,

    /// Lifetime applied to items saved without an explicit expiry.
    /// `Duration::ZERO` means no expiry (backends may enforce a floor).
    pub default_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            default_lifetime: Duration::ZERO,
        }
    }
}

impl PoolConfig {
    /// Creates the default configuration: no namespace, no default expiry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the default lifetime.
    pub fn default_lifetime(mut self, lifetime: Duration) -> Self {
        self.default_lifetime = lifetime;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.namespace, "");
        assert_eq!(config.default_lifetime, Duration::ZERO);
    }

    #[test]
    fn test_setters() {
        let config = PoolConfig::new()
            .namespace("app")
            .default_lifetime(Duration::from_secs(3600));
        assert_eq!(config.namespace, "app");
        assert_eq!(config.default_lifetime, Duration::from_secs(3600));
    }
}
