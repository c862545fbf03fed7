//! Per-topology registry of HA services.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{EndpointPool, HaError, HaServiceConfig};
use crate::function::ServiceLookup;

struct HaService {
    config: Arc<HaServiceConfig>,
    pool: Arc<EndpointPool>,
}

/// Endpoint pools and HA settings of the services in one topology.
///
/// Each deployed topology owns its own provider, so failover state never
/// leaks between topologies.
#[derive(Default)]
pub struct HaProvider {
    services: DashMap<String, HaService>,
}

impl HaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service, replacing any previous entry of that name.
    pub fn add_service(&self, name: &str, urls: Vec<String>, config: HaServiceConfig) -> Result<(), HaError> {
        let pool = EndpointPool::new(name, urls)?;
        self.services.insert(
            name.to_string(),
            HaService {
                config: Arc::new(config),
                pool: Arc::new(pool),
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn config(&self, name: &str) -> Option<Arc<HaServiceConfig>> {
        self.services.get(name).map(|s| Arc::clone(&s.config))
    }

    pub fn pool(&self, name: &str) -> Option<Arc<EndpointPool>> {
        self.services.get(name).map(|s| Arc::clone(&s.pool))
    }

    pub fn active_url(&self, name: &str) -> Result<String, HaError> {
        self.pool(name)
            .ok_or_else(|| HaError::UnknownService(name.to_string()))?
            .active_url()
    }

    pub fn set_active_url(&self, name: &str, url: &str) -> bool {
        self.pool(name).is_some_and(|pool| pool.set_active(url))
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Makes the active URL of every service also registered in `previous`
    /// match the URL active there, when this provider still lists it.
    pub fn inherit_active(&self, previous: &HaProvider) {
        for name in previous.services() {
            if !self.contains(&name) {
                continue;
            }
            let Ok(active) = previous.active_url(&name) else {
                continue;
            };
            if self.set_active_url(&name, &active) {
                debug!(service = %name, active = %active, "Kept active URL across redeploy");
            }
        }
    }
}

impl ServiceLookup for HaProvider {
    fn service_urls(&self, role: &str) -> Vec<String> {
        self.pool(role).map(|pool| pool.urls()).unwrap_or_default()
    }
}
