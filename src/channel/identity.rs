//! Caller identity used to scope the socket endpoint.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::IdentityConfig;

/// Read-only access to the external identity store
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current user id, or `None` when nobody is signed in
    async fn user_id(&self) -> Option<String>;
}

/// Identity fixed at construction time
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user_id: Option<String>,
}

impl StaticIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    /// An identity store with nobody signed in
    pub fn anonymous() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

/// Identity read from an environment variable on every lookup
#[derive(Debug, Clone)]
pub struct EnvIdentity {
    var: String,
}

impl EnvIdentity {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl IdentityProvider for EnvIdentity {
    async fn user_id(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Build the provider described by the identity config
pub fn from_config(config: &IdentityConfig) -> Arc<dyn IdentityProvider> {
    match &config.user_id {
        Some(user_id) => Arc::new(StaticIdentity::new(user_id.clone())),
        None => Arc::new(EnvIdentity::new(config.env_var.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_identity() {
        assert_eq!(StaticIdentity::new("u-1").user_id().await, Some("u-1".to_string()));
        assert_eq!(StaticIdentity::anonymous().user_id().await, None);
    }

    #[tokio::test]
    async fn test_env_identity_missing_var() {
        let identity = EnvIdentity::new("OPTRACK_TEST_IDENTITY_UNSET_7F3A");
        assert_eq!(identity.user_id().await, None);
    }

    #[tokio::test]
    async fn test_configured_user_id_wins() {
        let config = IdentityConfig {
            user_id: Some("fixed-user".to_string()),
            env_var: "OPTRACK_TEST_IDENTITY_UNSET_7F3A".to_string(),
        };
        assert_eq!(
            from_config(&config).user_id().await,
            Some("fixed-user".to_string())
        );
    }
}
