//! Deployed topologies.
//!
//! A topology bundles everything one gateway namespace needs at request
//! time: its rewrite rules, the functions they may call, the HA state of
//! its services and the path routes to those services. Topologies are
//! immutable once built; redeploying swaps the whole `Arc`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{GatewayConfig, HostMapConfig, TopologyConfig};
use crate::dispatch::HaDispatcher;
use crate::function::{FunctionRegistry, FunctionSetup, HostMap, ServiceLookup};
use crate::ha::{HaError, HaProvider, HaServiceConfig};
use crate::rewrite::{descriptor, Resolver, RewriteError, RewriteRule, RuleStore, UrlRewriter};

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("topology `{topology}`: failed to read hostmap {path}: {source}")]
    HostMap {
        topology: String,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("topology `{topology}`: {source}")]
    Rules { topology: String, source: RewriteError },
    #[error("topology `{topology}`, service `{service}`: {source}")]
    Service {
        topology: String,
        service: String,
        source: HaError,
    },
}

/// A service reachable under `/{gateway_path}/{topology}{path}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoute {
    pub role: String,
    pub path: String,
    /// OUT rule applied to redirect headers of this service's responses.
    /// Without one, the first matching OUT rule applies.
    pub response_rule: Option<String>,
}

/// Everything needed to build a [`Topology`] without touching the filesystem.
pub struct TopologySpec {
    pub name: String,
    pub params: BTreeMap<String, String>,
    pub principal_header: Option<String>,
    pub hostmap: HostMap,
    pub rules: Vec<RewriteRule>,
    pub services: Vec<(ServiceRoute, Vec<String>, HaServiceConfig)>,
}

pub struct Topology {
    name: String,
    params: BTreeMap<String, String>,
    principal_header: Option<String>,
    routes: Vec<ServiceRoute>,
    rewriter: UrlRewriter,
    provider: Arc<HaProvider>,
    dispatcher: HaDispatcher,
}

impl Topology {
    /// Builds a topology, validating every rule against the functions and
    /// parameters it will run with.
    pub fn build(spec: TopologySpec) -> Result<Self, DeployError> {
        let TopologySpec {
            name,
            params,
            principal_header,
            hostmap,
            rules,
            services,
        } = spec;

        let provider = Arc::new(HaProvider::new());
        let mut routes = Vec::with_capacity(services.len());
        for (route, urls, config) in services {
            provider
                .add_service(&route.role, urls, config)
                .map_err(|source| DeployError::Service {
                    topology: name.clone(),
                    service: route.role.clone(),
                    source,
                })?;
            routes.push(route);
        }

        if hostmap.is_empty() {
            debug!(topology = %name, "No hostmap, host names pass through unchanged");
        }
        let lookup: Arc<dyn ServiceLookup> = provider.clone();
        let functions = FunctionRegistry::builtin(&FunctionSetup {
            hostmap: Arc::new(hostmap),
            services: lookup,
        });

        let rules_error = |source| DeployError::Rules {
            topology: name.clone(),
            source,
        };
        let mut store = RuleStore::new();
        for rule in rules {
            store.add_rule(rule).map_err(rules_error)?;
        }
        let ambient: BTreeSet<String> = params.keys().cloned().collect();
        store.validate(&ambient, &functions).map_err(rules_error)?;

        let rewriter = UrlRewriter::new(Arc::new(store), Arc::new(functions));
        if rewriter.store().is_empty() {
            debug!(topology = %name, "No rewrite rules, requests use the default URL mapping");
        }
        for rule in routes.iter().filter_map(|route| route.response_rule.as_deref()) {
            if rewriter.store().get_rule(rule).is_none() {
                return Err(rules_error(RewriteError::UnknownRule(rule.to_string())));
            }
        }
        let dispatcher = HaDispatcher::new(Arc::clone(&provider));

        Ok(Self {
            name,
            params,
            principal_header,
            routes,
            rewriter,
            provider,
            dispatcher,
        })
    }

    /// Loads hostmap and rule files and builds the topology.
    pub fn from_config(config: &TopologyConfig, gateway: &GatewayConfig) -> Result<Self, DeployError> {
        let name = config.name.clone();

        let hostmap = match &config.hostmap {
            None => HostMap::new(),
            Some(HostMapConfig::Inline(map)) => map.iter().collect(),
            Some(HostMapConfig::File { file }) => {
                let path = gateway.resolve_path(file);
                HostMap::load(&path).map_err(|source| DeployError::HostMap {
                    topology: name.clone(),
                    path,
                    source,
                })?
            }
        };

        let mut rules = Vec::new();
        for file in &config.rules {
            let loaded = descriptor::load_rules_file(&gateway.resolve_path(file)).map_err(|source| {
                DeployError::Rules {
                    topology: name.clone(),
                    source,
                }
            })?;
            rules.extend(loaded);
        }

        let mut services = Vec::with_capacity(config.services.len());
        for service in &config.services {
            let ha = service.ha_config().map_err(|source| DeployError::Service {
                topology: name.clone(),
                service: service.role.clone(),
                source,
            })?;
            let route = ServiceRoute {
                role: service.role.clone(),
                path: service.path.clone(),
                response_rule: service.response_rule.clone(),
            };
            services.push((route, service.urls.clone(), ha));
        }

        Self::build(TopologySpec {
            name,
            params: config.params.clone(),
            principal_header: config.principal_header.clone(),
            hostmap,
            rules,
            services,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn principal_header(&self) -> Option<&str> {
        self.principal_header.as_deref()
    }

    pub fn routes(&self) -> &[ServiceRoute] {
        &self.routes
    }

    pub fn rewriter(&self) -> &UrlRewriter {
        &self.rewriter
    }

    pub fn provider(&self) -> &HaProvider {
        &self.provider
    }

    pub fn dispatcher(&self) -> &HaDispatcher {
        &self.dispatcher
    }

    /// Resolver for one request made by `principal`.
    pub fn resolver<'a>(&'a self, principal: Option<&'a str>) -> TopologyResolver<'a> {
        TopologyResolver {
            params: &self.params,
            principal,
        }
    }
}

/// Topology parameters plus the request principal.
pub struct TopologyResolver<'a> {
    params: &'a BTreeMap<String, String>,
    principal: Option<&'a str>,
}

impl Resolver for TopologyResolver<'_> {
    fn resolve(&self, name: &str) -> Option<Vec<String>> {
        self.params.get(name).map(|value| vec![value.clone()])
    }

    fn principal(&self) -> Option<&str> {
        self.principal
    }
}

/// Deployed topologies by name.
#[derive(Default)]
pub struct TopologyRegistry {
    topologies: DashMap<String, Arc<Topology>>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploys `topology`, replacing any topology of the same name.
    /// Requests already holding the previous instance finish on it.
    ///
    /// A redeployed service whose active URL is still listed keeps it, so
    /// a reload does not send traffic back to an endpoint that failed.
    pub fn deploy(&self, topology: Topology) {
        let name = topology.name.clone();
        let services = topology.routes.len();
        let rules = topology.rewriter.store().len();
        if let Some(previous) = self.get(&name) {
            topology.provider.inherit_active(&previous.provider);
        }
        if self.topologies.insert(name.clone(), Arc::new(topology)).is_some() {
            info!(topology = %name, services, rules, "Redeployed topology");
        } else {
            info!(topology = %name, services, rules, "Deployed topology");
        }
    }

    pub fn undeploy(&self, name: &str) -> bool {
        let removed = self.topologies.remove(name).is_some();
        if removed {
            info!(topology = %name, "Undeployed topology");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<Topology>> {
        self.topologies.get(name).map(|t| Arc::clone(t.value()))
    }

    /// Deployed names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topologies.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.topologies.is_empty()
    }

    /// Builds every topology in `config` and, only if all succeed, deploys
    /// them and undeploys topologies the configuration no longer names.
    pub fn apply(&self, config: &GatewayConfig) -> Result<(), DeployError> {
        let built = config
            .topologies
            .iter()
            .map(|t| Topology::from_config(t, config))
            .collect::<Result<Vec<_>, _>>()?;

        let keep: BTreeSet<&str> = config.topologies.iter().map(|t| t.name.as_str()).collect();
        for name in self.names() {
            if !keep.contains(name.as_str()) {
                self.undeploy(&name);
            }
        }
        for topology in built {
            self.deploy(topology);
        }
        Ok(())
    }
}
