//! Explicit provider registry owned by one dispatcher.

use super::ProviderPort;
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Keyed provider instances owned by one long-lived dispatcher.
///
/// Instances are created lazily on first use and live until removed or
/// [`ProviderRegistry::close_all`] is called.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Mutex<HashMap<String, Arc<dyn ProviderPort>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn ProviderPort>>> {
        self.providers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ProviderPort>> {
        self.lock().get(key).cloned()
    }

    /// Insert a provider, returning the one it replaced.
    pub fn insert(
        &self,
        key: impl Into<String>,
        provider: Arc<dyn ProviderPort>,
    ) -> Option<Arc<dyn ProviderPort>> {
        self.lock().insert(key.into(), provider)
    }

    /// Return the cached provider for `key`, creating it with `create` if absent.
    ///
    /// `create` runs under the registry lock and must not block.
    pub fn get_or_try_insert_with<F>(&self, key: &str, create: F) -> Result<Arc<dyn ProviderPort>>
    where
        F: FnOnce() -> Result<Arc<dyn ProviderPort>>,
    {
        let mut providers = self.lock();
        if let Some(existing) = providers.get(key) {
            return Ok(Arc::clone(existing));
        }
        let created = create()?;
        debug!(key, provider = created.name(), "provider registered");
        providers.insert(key.to_string(), Arc::clone(&created));
        Ok(created)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<dyn ProviderPort>> {
        self.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget every registered provider.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<dyn ProviderPort>)> = self.lock().drain().collect();
        for (key, provider) in drained {
            debug!(key = key.as_str(), provider = provider.name(), "closing provider");
            provider.close().await;
        }
    }
}
