use std::sync::Arc;

use async_trait::async_trait;
use azure_core::credentials::{AccessToken, Secret, TokenCredential};
use azure_identity::{
    ClientSecretCredential, ManagedIdentityCredential, ManagedIdentityCredentialOptions,
    UserAssignedId,
};
use tokio::sync::RwLock;

use crate::error::ProxyError;

/// The scope required for Azure OpenAI / Cognitive Services authentication.
pub const COGNITIVE_SERVICES_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

/// Refresh tokens this long before they actually expire.
const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;

/// Produces an upstream bearer token on demand.
///
/// Returned values are pre-formatted `Bearer <token>` header values; tokens
/// live for ~an hour and are shared across requests, so implementations hand
/// out `Arc<str>` instead of fresh strings.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn bearer_header(&self) -> Result<Arc<str>, ProxyError>;
}

/// Fixed token, for tests and mock mode.
pub struct StaticTokenSource {
    bearer_header: Arc<str>,
}

impl StaticTokenSource {
    pub fn new(token: &str) -> Self {
        Self {
            bearer_header: format!("Bearer {token}").into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn bearer_header(&self) -> Result<Arc<str>, ProxyError> {
        Ok(self.bearer_header.clone())
    }
}

#[derive(Clone)]
struct CachedToken {
    bearer_header: Arc<str>,
    expires_at: std::time::Instant,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        std::time::Instant::now() >= self.expires_at
    }
}

/// Entra ID token source backed by an Azure credential, with a cached
/// pre-formatted bearer header refreshed ahead of expiry.
pub struct EntraTokenSource {
    credential: Arc<dyn TokenCredential>,
    cached_token: RwLock<Option<CachedToken>>,
}

impl EntraTokenSource {
    /// Service principal with a client secret.
    pub fn from_client_secret(
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Self, anyhow::Error> {
        let credential = ClientSecretCredential::new(
            tenant_id,
            client_id.to_string(),
            Secret::new(client_secret.to_string()),
            None,
        )
        .map_err(|e| anyhow::anyhow!("failed to create client secret credential: {e}"))?;
        Ok(Self::from_credential(credential))
    }

    /// Managed identity; pass the client id for a user-assigned identity.
    pub fn from_managed_identity(client_id: Option<&str>) -> Result<Self, anyhow::Error> {
        let options = client_id.map(|id| ManagedIdentityCredentialOptions {
            user_assigned_id: Some(UserAssignedId::ClientId(id.to_string())),
            ..Default::default()
        });
        let credential = ManagedIdentityCredential::new(options)
            .map_err(|e| anyhow::anyhow!("failed to create managed identity credential: {e}"))?;
        Ok(Self::from_credential(credential))
    }

    /// Pick a credential from the process environment: a service principal
    /// when the `AZURE_TENANT_ID`/`AZURE_CLIENT_ID`/`AZURE_CLIENT_SECRET`
    /// triple is present, the ambient managed identity otherwise.
    pub fn from_environment() -> Result<Self, anyhow::Error> {
        let tenant_id = std::env::var("AZURE_TENANT_ID").ok();
        let client_id = std::env::var("AZURE_CLIENT_ID").ok();
        let client_secret = std::env::var("AZURE_CLIENT_SECRET").ok();
        match (tenant_id, client_id, client_secret) {
            (Some(tenant), Some(client), Some(secret)) => {
                tracing::info!("Using client secret credential for upstream tokens");
                Self::from_client_secret(&tenant, &client, &secret)
            }
            _ => {
                tracing::info!("Using managed identity credential for upstream tokens");
                Self::from_managed_identity(std::env::var("AZURE_MANAGED_IDENTITY_CLIENT_ID").ok().as_deref())
            }
        }
    }

    fn from_credential(credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            credential,
            cached_token: RwLock::new(None),
        }
    }
}

#[async_trait]
impl TokenSource for EntraTokenSource {
    async fn bearer_header(&self) -> Result<Arc<str>, ProxyError> {
        // Fast path: valid cached token
        {
            let cache = self.cached_token.read().await;
            if let Some(ref cached) = *cache
                && !cached.is_expired()
            {
                return Ok(cached.bearer_header.clone());
            }
        }

        let mut cache = self.cached_token.write().await;

        // Another request may have refreshed while we waited for the lock
        if let Some(ref cached) = *cache
            && !cached.is_expired()
        {
            return Ok(cached.bearer_header.clone());
        }

        let access_token: AccessToken = self
            .credential
            .get_token(&[COGNITIVE_SERVICES_SCOPE], None)
            .await
            .map_err(|e| ProxyError::Internal(format!("failed to acquire upstream token: {e}")))?;

        let now = time::OffsetDateTime::now_utc();
        let expires_in_secs = (access_token.expires_on - now).whole_seconds().max(0) as u64;
        let expires_at = std::time::Instant::now()
            + std::time::Duration::from_secs(expires_in_secs)
                .saturating_sub(std::time::Duration::from_secs(TOKEN_REFRESH_BUFFER_SECS));

        let bearer_header: Arc<str> = format!("Bearer {}", access_token.token.secret()).into();
        *cache = Some(CachedToken {
            bearer_header: bearer_header.clone(),
            expires_at,
        });

        tracing::debug!("Acquired upstream token, expires in {expires_in_secs}s");
        Ok(bearer_header)
    }
}
