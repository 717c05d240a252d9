// Credential Gateway
// Access token retrieval and validation against the provider

use crate::remote::RemoteProvider;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Source of the provider access token.
///
/// Storage of the token is the host's business; the orchestrator only reads
/// it, asks whether it is still accepted and drops it when it is not.
#[async_trait]
pub trait CredentialGateway: Send + Sync {
    /// Current token, if one is stored
    async fn token(&self) -> Option<String>;

    /// Whether the provider accepts the token
    async fn is_valid(&self, token: &str) -> bool;

    /// Forget the stored token so the host can ask for a new one
    async fn invalidate(&self);
}

/// Gateway over a token held in memory, optionally checked by connecting
/// to a provider
pub struct StaticTokenGateway {
    token: Mutex<Option<String>>,
    provider: Option<Arc<dyn RemoteProvider>>,
}

impl StaticTokenGateway {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Mutex::new(token.filter(|t| !t.trim().is_empty())),
            provider: None,
        }
    }

    /// Validate tokens by opening a session with this provider
    pub fn with_provider(mut self, provider: Arc<dyn RemoteProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CredentialGateway for StaticTokenGateway {
    async fn token(&self) -> Option<String> {
        self.slot().clone()
    }

    async fn is_valid(&self, token: &str) -> bool {
        if token.trim().is_empty() {
            return false;
        }
        match &self.provider {
            Some(provider) => match provider.connect(token).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "token rejected by provider");
                    false
                }
            },
            None => true,
        }
    }

    async fn invalidate(&self) {
        tracing::info!("invalidating stored access token");
        *self.slot() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::InMemoryCluster;

    #[tokio::test]
    async fn test_absent_token() {
        let gateway = StaticTokenGateway::new(None);
        assert!(gateway.token().await.is_none());

        let blank = StaticTokenGateway::new(Some("  ".to_string()));
        assert!(blank.token().await.is_none());
    }

    #[tokio::test]
    async fn test_validation_against_provider() {
        let cluster = Arc::new(InMemoryCluster::new(["secret"]));
        let gateway =
            StaticTokenGateway::new(Some("secret".to_string())).with_provider(cluster.clone());
        assert!(gateway.is_valid("secret").await);
        assert!(!gateway.is_valid("other").await);

        cluster.revoke_tokens();
        assert!(!gateway.is_valid("secret").await);
    }

    #[tokio::test]
    async fn test_invalidate_forgets_token() {
        let gateway = StaticTokenGateway::new(Some("abc".to_string()));
        assert_eq!(gateway.token().await.as_deref(), Some("abc"));
        gateway.invalidate().await;
        assert!(gateway.token().await.is_none());
    }
}
