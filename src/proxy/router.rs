//! Request path routing.
//!
//! Maps `/{gateway_path}/{topology}/{service-path}/...` to a deployed
//! topology and one of its services.

use std::sync::Arc;

use crate::topology::{Topology, TopologyRegistry};

/// A request resolved to a topology service.
#[derive(Clone)]
pub struct RoutedRequest {
    pub topology: Arc<Topology>,
    pub role: String,
    /// Path after the service prefix, starting with `/` or empty.
    pub remaining: String,
    pub response_rule: Option<String>,
}

impl std::fmt::Debug for RoutedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedRequest")
            .field("topology", &self.topology.name())
            .field("role", &self.role)
            .field("remaining", &self.remaining)
            .field("response_rule", &self.response_rule)
            .finish()
    }
}

/// Routes request paths to topology services.
///
/// Thread-safe via shared reference to the registry; a redeploy is
/// visible to the next lookup.
pub struct ServiceRouter {
    registry: Arc<TopologyRegistry>,
    gateway_path: String,
}

impl ServiceRouter {
    pub fn new(registry: Arc<TopologyRegistry>, gateway_path: &str) -> Self {
        Self {
            registry,
            gateway_path: gateway_path.trim_matches('/').to_string(),
        }
    }

    /// Finds the topology and the service with the longest matching path
    /// prefix. Returns `None` if nothing matches.
    pub fn route(&self, path: &str) -> Option<RoutedRequest> {
        let rest = path.strip_prefix('/')?.strip_prefix(self.gateway_path.as_str())?;
        let rest = rest.strip_prefix('/')?;
        let (name, service_path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let topology = self.registry.get(name)?;

        let route = topology
            .routes()
            .iter()
            .filter(|route| Self::prefix_matches(&route.path, service_path))
            .max_by_key(|route| route.path.len())?;
        let consumed = route.path.trim_end_matches('/').len();
        let role = route.role.clone();
        let response_rule = route.response_rule.clone();
        let remaining = service_path[consumed.min(service_path.len())..].to_string();

        Some(RoutedRequest {
            topology,
            role,
            remaining,
            response_rule,
        })
    }

    /// Prefix matching respecting segment boundaries.
    /// /api matches /api, /api/, /api/users
    /// /api does NOT match /apikeys (no segment boundary)
    fn prefix_matches(prefix: &str, path: &str) -> bool {
        if path == prefix {
            return true;
        }
        if path.starts_with(prefix) {
            if prefix.ends_with('/') {
                return true;
            }
            return path.as_bytes().get(prefix.len()) == Some(&b'/');
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::function::HostMap;
    use crate::ha::HaServiceConfig;
    use crate::topology::{ServiceRoute, TopologySpec};

    // ========== Test Helpers ==========

    fn make_topology(name: &str, services: &[(&str, &str)]) -> Topology {
        Topology::build(TopologySpec {
            name: name.to_string(),
            params: BTreeMap::new(),
            principal_header: None,
            hostmap: HostMap::new(),
            rules: vec![],
            services: services
                .iter()
                .map(|(role, path)| {
                    (
                        ServiceRoute {
                            role: role.to_string(),
                            path: path.to_string(),
                            response_rule: None,
                        },
                        vec![format!("http://{}.internal:8080", role.to_lowercase())],
                        HaServiceConfig::disabled(),
                    )
                })
                .collect(),
        })
        .unwrap()
    }

    fn make_router(topologies: Vec<Topology>) -> ServiceRouter {
        let registry = Arc::new(TopologyRegistry::new());
        for topology in topologies {
            registry.deploy(topology);
        }
        ServiceRouter::new(registry, "gateway")
    }

    // ========== Phase 1: Basic Matching ==========

    #[test]
    fn test_router_with_empty_registry() {
        let router = make_router(vec![]);
        assert!(router.route("/gateway/sandbox/webhdfs").is_none());
    }

    #[test]
    fn test_router_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServiceRouter>();
    }

    #[test]
    fn test_route_to_service() {
        let router = make_router(vec![make_topology("sandbox", &[("WEBHDFS", "/webhdfs")])]);
        let routed = router.route("/gateway/sandbox/webhdfs/v1/tmp/a.txt").unwrap();
        assert_eq!(routed.topology.name(), "sandbox");
        assert_eq!(routed.role, "WEBHDFS");
        assert_eq!(routed.remaining, "/v1/tmp/a.txt");

        let exact = router.route("/gateway/sandbox/webhdfs").unwrap();
        assert_eq!(exact.remaining, "");
    }

    #[test]
    fn test_wrong_gateway_path_or_topology() {
        let router = make_router(vec![make_topology("sandbox", &[("WEBHDFS", "/webhdfs")])]);
        assert!(router.route("/other/sandbox/webhdfs").is_none());
        assert!(router.route("/gatewayx/sandbox/webhdfs").is_none());
        assert!(router.route("/gateway/prod/webhdfs").is_none());
        assert!(router.route("/gateway").is_none());
        assert!(router.route("").is_none());
    }

    // ========== Phase 2: Prefix Rules ==========

    #[test]
    fn test_prefix_requires_segment_boundary() {
        let router = make_router(vec![make_topology("sandbox", &[("WEBHDFS", "/webhdfs")])]);
        assert!(router.route("/gateway/sandbox/webhdfs/").is_some());
        assert!(router.route("/gateway/sandbox/webhdfsx").is_none());
    }

    #[test]
    fn test_longer_prefix_wins() {
        let router = make_router(vec![make_topology(
            "sandbox",
            &[("HIVE", "/hive"), ("HIVE_LLAP", "/hive/llap"), ("ROOT", "/")],
        )]);
        assert_eq!(router.route("/gateway/sandbox/hive/llap/q").unwrap().role, "HIVE_LLAP");
        assert_eq!(router.route("/gateway/sandbox/hive/q").unwrap().role, "HIVE");

        let root = router.route("/gateway/sandbox/anything/else").unwrap();
        assert_eq!(root.role, "ROOT");
        assert_eq!(root.remaining, "/anything/else");
    }

    #[test]
    fn test_multiple_topologies() {
        let router = make_router(vec![
            make_topology("sandbox", &[("WEBHDFS", "/webhdfs")]),
            make_topology("prod", &[("OOZIE", "/oozie")]),
        ]);
        assert_eq!(router.route("/gateway/prod/oozie/v1/jobs").unwrap().role, "OOZIE");
        assert!(router.route("/gateway/prod/webhdfs").is_none());
    }

    // ========== Phase 3: Concurrency ==========

    #[test]
    fn test_redeploy_while_routing() {
        use std::thread;

        let registry = Arc::new(TopologyRegistry::new());
        registry.deploy(make_topology("sandbox", &[("A", "/a")]));
        let router = Arc::new(ServiceRouter::new(Arc::clone(&registry), "gateway"));

        let router_clone = Arc::clone(&router);
        let handle = thread::spawn(move || {
            for _ in 0..500 {
                let routed = router_clone.route("/gateway/sandbox/a/x");
                assert!(routed.map(|r| r.role == "A").unwrap_or(false));
            }
        });

        for _ in 0..20 {
            registry.deploy(make_topology("sandbox", &[("A", "/a"), ("B", "/b")]));
        }

        handle.join().unwrap();
        assert_eq!(router.route("/gateway/sandbox/b").unwrap().role, "B");
    }
}
