use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::time::Instant;

use crate::error::ProviderError;

/// Resolves a credential reference (e.g. `env:ACME_WA_TOKEN`) into a secret
/// payload. References travel on envelopes; payloads never do.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<SecretString, ProviderError>;
}

/// Resolver backed by process environment variables, keyed by `env:NAME`
/// references. The worker's default; a secret-manager client slots in behind
/// the same trait.
#[derive(Default)]
pub struct EnvCredentialResolver;

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, reference: &str) -> Result<SecretString, ProviderError> {
        let name = reference
            .strip_prefix("env:")
            .ok_or_else(|| ProviderError::Credential(format!("unsupported reference `{reference}`")))?;

        std::env::var(name)
            .map(SecretString::from)
            .map_err(|_| ProviderError::Credential(format!("`{reference}` is not set")))
    }
}

struct CacheEntry {
    secret: SecretString,
    fetched_at: Instant,
}

/// Short-TTL cache in front of any resolver. The TTL is deliberately short;
/// upstream rotation must be picked up within minutes.
pub struct CachingResolver<R> {
    inner: R,
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl<R: CredentialResolver> CachingResolver<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self { inner, ttl, cache: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl<R: CredentialResolver> CredentialResolver for CachingResolver<R> {
    async fn resolve(&self, reference: &str) -> Result<SecretString, ProviderError> {
        {
            let cache = self.cache.lock().expect("secret cache lock");
            if let Some(entry) = cache.get(reference) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.secret.clone());
                }
            }
        }

        let secret = self.inner.resolve(reference).await?;

        let mut cache = self.cache.lock().expect("secret cache lock");
        cache.insert(
            reference.to_string(),
            CacheEntry { secret: secret.clone(), fetched_at: Instant::now() },
        );
        Ok(secret)
    }
}
