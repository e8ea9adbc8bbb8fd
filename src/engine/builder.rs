//! Store builder with an injected permission filter
//!
//! There is no process-wide store: every `InsightsStore` is assembled from
//! an explicit backing store and permission filter.

use std::sync::Arc;

use tracing::info;

use super::InsightsStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::permissions::PermissionFilter;
use crate::store::Store;

/// Builder for [`InsightsStore`]
pub struct InsightsStoreBuilder {
    store: Option<Store>,
    permissions: Option<Arc<dyn PermissionFilter>>,
    config: Config,
}

impl InsightsStoreBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            store: None,
            permissions: None,
            config: Config::default(),
        }
    }

    /// Use an already opened backing store
    ///
    /// Without one, `build` opens the database named by the storage config.
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the permission filter
    pub fn with_permissions<P>(mut self, permissions: P) -> Self
    where
        P: PermissionFilter,
    {
        self.permissions = Some(Arc::new(permissions));
        self
    }

    /// Set a shared permission filter
    ///
    /// Use this when the caller keeps a handle to the filter, e.g. to update
    /// a [`StaticDenyList`](crate::permissions::StaticDenyList) later.
    pub fn with_permissions_arc(mut self, permissions: Arc<dyn PermissionFilter>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    /// Set configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Build the store
    pub async fn build(self) -> Result<InsightsStore> {
        self.config.validate()?;

        // A missing filter must not silently mean "allow everything"
        let permissions = self
            .permissions
            .ok_or_else(|| Error::Configuration("No permission filter configured".to_string()))?;

        let store = match self.store {
            Some(store) => store,
            None => Store::open(&self.config.storage).await?,
        };

        metrics::set_enabled(self.config.monitoring.metrics_enabled);
        info!(
            aggregation = %self.config.query.aggregation,
            deny_threshold = self.config.query.in_process_deny_threshold,
            "Insights store ready"
        );

        Ok(InsightsStore {
            store,
            permissions,
            config: self.config,
        })
    }
}

impl Default for InsightsStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::permissions::AllowAll;

    #[tokio::test]
    async fn test_build_requires_permission_filter() {
        let result = InsightsStoreBuilder::new()
            .with_store(Store::open_in_memory().unwrap())
            .build()
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_build_opens_configured_store() {
        let mut config = Config::default();
        config.storage = StorageConfig::in_memory();
        let store = InsightsStoreBuilder::new()
            .with_config(config)
            .with_permissions(AllowAll)
            .build()
            .await;
        assert!(store.is_ok());
    }
}
