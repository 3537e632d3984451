use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{resolve_relative_to, SecretSourceConfig};

/// Source of the provider→secret JSON map.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch_secret_map(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn fetch_secret_map(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read secret store: {}", self.path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    var: String,
}

impl EnvSecretStore {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch_secret_map(&self) -> Result<String> {
        std::env::var(&self.var)
            .with_context(|| format!("secret store environment variable {} is not set", self.var))
    }
}

pub fn secret_store_from_config(
    source: &SecretSourceConfig,
    data_dir: &std::path::Path,
) -> Arc<dyn SecretStore> {
    match source {
        SecretSourceConfig::File { path } => {
            Arc::new(FileSecretStore::new(resolve_relative_to(data_dir, path)))
        }
        SecretSourceConfig::Env { var } => Arc::new(EnvSecretStore::new(var.clone())),
    }
}

/// Lazily fetched, process-lifetime signing secret for one provider.
///
/// The first successful [`SecretProvider::get`] caches the secret; later calls never touch the
/// store again. Two callers racing on first use may both fetch, and whichever finishes last
/// wins the cache slot. Rotation requires a new instance.
pub struct SecretProvider {
    store: Arc<dyn SecretStore>,
    provider_name: String,
    cached: Mutex<Option<Arc<str>>>,
}

impl SecretProvider {
    pub fn new(store: Arc<dyn SecretStore>, provider_name: impl Into<String>) -> Self {
        Self {
            store,
            provider_name: provider_name.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub async fn get(&self) -> Result<Arc<str>> {
        if let Some(secret) = self.cached_secret() {
            return Ok(secret);
        }

        let raw = self.store.fetch_secret_map().await?;
        let secret: Arc<str> = extract_provider_secret(&raw, &self.provider_name)?.into();
        debug!(provider = %self.provider_name, "loaded provider signing secret");

        match self.cached.lock() {
            Ok(mut guard) => *guard = Some(Arc::clone(&secret)),
            Err(err) => warn!(error = %err, "failed to cache provider secret"),
        }
        Ok(secret)
    }

    fn cached_secret(&self) -> Option<Arc<str>> {
        match self.cached.lock() {
            Ok(guard) => guard.clone(),
            Err(err) => {
                warn!(error = %err, "failed to read cached provider secret");
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        if let Ok(mut guard) = self.cached.lock() {
            *guard = None;
        }
    }
}

fn extract_provider_secret(raw: &str, provider_name: &str) -> Result<String> {
    let map: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(raw).context("secret store does not contain a JSON object")?;
    if map.is_empty() {
        bail!("secret store is empty");
    }

    let candidates = [
        provider_name.to_string(),
        provider_name.to_ascii_lowercase(),
        provider_name.to_ascii_uppercase(),
    ];
    let value = candidates
        .iter()
        .find_map(|key| map.get(key))
        .or_else(|| {
            map.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(provider_name))
                .map(|(_, value)| value)
        });

    match value.and_then(serde_json::Value::as_str) {
        Some(secret) if !secret.is_empty() => Ok(secret.to_string()),
        _ => bail!("secret store has no entry for provider {provider_name}"),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::StaticSecretStore;
    use super::*;

    #[tokio::test]
    async fn secret_is_fetched_once_and_memoized() {
        let store = Arc::new(StaticSecretStore::new(r#"{"vidu":"s3cret"}"#));
        let provider = SecretProvider::new(store.clone(), "vidu");

        assert_eq!(&*provider.get().await.unwrap(), "s3cret");
        assert_eq!(&*provider.get().await.unwrap(), "s3cret");
        assert_eq!(store.fetches(), 1);

        provider.reset();
        provider.get().await.unwrap();
        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn provider_lookup_tolerates_case_variants() {
        for raw in [r#"{"VIDU":"a"}"#, r#"{"Vidu":"a"}"#, r#"{"vidu":"a"}"#] {
            let provider = SecretProvider::new(Arc::new(StaticSecretStore::new(raw)), "vidu");
            assert_eq!(&*provider.get().await.unwrap(), "a", "{raw}");
        }
    }

    #[tokio::test]
    async fn empty_store_or_missing_entry_is_an_error() {
        let empty = SecretProvider::new(Arc::new(StaticSecretStore::new("{}")), "vidu");
        let err = empty.get().await.unwrap_err();
        assert!(err.to_string().contains("empty"), "{err}");

        let missing =
            SecretProvider::new(Arc::new(StaticSecretStore::new(r#"{"kling":"x"}"#)), "vidu");
        let err = missing.get().await.unwrap_err();
        assert!(err.to_string().contains("no entry for provider vidu"), "{err}");
    }

    #[tokio::test]
    async fn failed_fetch_is_not_memoized() {
        let store = Arc::new(StaticSecretStore::new("not json"));
        let provider = SecretProvider::new(store.clone(), "vidu");

        assert!(provider.get().await.is_err());
        assert!(provider.get().await.is_err());
        assert_eq!(store.fetches(), 2);
    }

    #[tokio::test]
    async fn file_store_resolves_relative_to_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("secrets.json"), r#"{"vidu":"from-file"}"#).unwrap();

        let store = secret_store_from_config(
            &SecretSourceConfig::File {
                path: PathBuf::from("secrets.json"),
            },
            dir.path(),
        );
        let provider = SecretProvider::new(store, "vidu");
        assert_eq!(&*provider.get().await.unwrap(), "from-file");
    }

    #[tokio::test]
    async fn env_store_reports_unset_variable() {
        let store = EnvSecretStore::new("VIDHOOK_TEST_SECRETS_THAT_IS_NEVER_SET");
        let err = store.fetch_secret_map().await.unwrap_err();
        assert!(err.to_string().contains("is not set"), "{err}");
    }
}
