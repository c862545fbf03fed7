//! Pingora ProxyHttp implementation for the gateway.
//!
//! Runs the per-request pipeline: route the request path to a topology
//! service, rewrite the inbound URL, pick a backend through the HA
//! dispatcher, fail over on connection errors, and rewrite redirect
//! headers on the way back.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Uri};
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};
use tracing::{debug, info, warn};

use crate::dispatch::{Failover, FailoverState, RequestMeta};
use crate::rewrite::{Direction, RewriteError};

use super::router::{RoutedRequest, ServiceRouter};

/// Response headers carrying backend URLs.
const REWRITTEN_RESPONSE_HEADERS: [&str; 2] = ["location", "content-location"];

/// Per-request context for the gateway proxy.
///
/// Stores state that needs to persist across the request lifecycle,
/// including across Pingora's connect retries.
#[derive(Default)]
pub struct GatewayCtx {
    pub route: Option<RoutedRequest>,
    pub failover: Option<FailoverState>,
    /// Principal read from the topology's trusted header.
    pub principal: Option<String>,
    /// Inbound URL after IN rewriting or the default mapping.
    pub rewritten: Option<String>,
    /// Active service URL the rewrite was made against.
    rewrite_base: Option<String>,
    /// Backend URL of the current attempt.
    pub backend_url: Option<String>,
    upstream: Option<BackendTarget>,
    /// Backoff to sleep before the next peer selection.
    backoff: Option<Duration>,
}

/// Gateway proxy that routes HTTP requests to topology services.
pub struct GatewayProxy {
    router: ServiceRouter,
    external_scheme: String,
}

impl GatewayProxy {
    pub fn new(router: ServiceRouter, external_scheme: &str) -> Self {
        Self {
            router,
            external_scheme: external_scheme.to_string(),
        }
    }

    /// Routes and rewrites the request. Runs once per request.
    pub fn prepare(&self, ctx: &mut GatewayCtx, uri: &Uri, headers: &HeaderMap) -> Result<()> {
        let path = uri.path();
        let route = self.router.route(path).ok_or_else(|| {
            Error::explain(ErrorType::HTTPStatus(404), format!("no route for path={}", path))
        })?;
        let topology = &route.topology;

        let principal = topology
            .principal_header()
            .and_then(|name| headers.get(name))
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let host_header = headers.get("host").and_then(|v| v.to_str().ok());
        let authority = request_authority(host_header, uri.authority().map(|a| a.as_str()));
        let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or(path);
        let inbound = format!("{}://{}{}", self.external_scheme, authority, path_and_query);

        let active = topology
            .provider()
            .active_url(&route.role)
            .map_err(|e| Error::explain(ErrorType::HTTPStatus(503), e.to_string()))?;

        let resolver = topology.resolver(principal.as_deref());
        let rewritten = match topology
            .rewriter()
            .rewrite_matched(&resolver, &inbound, Direction::In)
            .map_err(|e| rewrite_failure(&e))?
        {
            Some(rewritten) => rewritten,
            None => default_backend_url(&active, &route.remaining, uri.query()),
        };
        debug!(
            topology = %topology.name(),
            service = %route.role,
            inbound = %inbound,
            rewritten = %rewritten,
            "Rewrote inbound URL"
        );

        let failover = topology
            .dispatcher()
            .begin(&route.role)
            .map_err(|e| Error::explain(ErrorType::HTTPStatus(e.status()), e.to_string()))?;

        ctx.principal = principal;
        ctx.rewritten = Some(rewritten);
        ctx.rewrite_base = Some(active);
        ctx.failover = Some(failover);
        ctx.route = Some(route);
        Ok(())
    }

    /// Picks the backend for the next attempt and returns its URL.
    pub fn next_backend(&self, ctx: &mut GatewayCtx, headers: &HeaderMap) -> Result<BackendTarget> {
        let (Some(route), Some(failover), Some(rewritten)) =
            (ctx.route.as_ref(), ctx.failover.as_mut(), ctx.rewritten.as_deref())
        else {
            return Err(Error::explain(ErrorType::InternalError, "request was not prepared"));
        };

        let meta = RequestMeta {
            user_agent: headers.get("user-agent").and_then(|v| v.to_str().ok()),
            cookie: headers.get("cookie").and_then(|v| v.to_str().ok()),
        };
        let target = route
            .topology
            .dispatcher()
            .select_target(failover, &meta)
            .map_err(|e| Error::explain(ErrorType::HTTPStatus(e.status()), e.to_string()))?;

        let url = rebase(rewritten, ctx.rewrite_base.as_deref(), &target);
        let backend = parse_backend_url(&url).map_err(|e| Error::explain(ErrorType::HTTPStatus(500), e))?;
        ctx.backend_url = Some(url);
        ctx.upstream = Some(backend.clone());
        Ok(backend)
    }

    /// Resolves the backend host. A host that does not resolve is a failed
    /// connection to that endpoint and goes through failover.
    pub async fn resolve_backend(&self, ctx: &mut GatewayCtx, backend: &BackendTarget) -> Result<SocketAddr> {
        match tokio::net::lookup_host((backend.host.as_str(), backend.port)).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    return Ok(addr);
                }
                warn!(backend = ctx.backend_url.as_deref().unwrap_or("-"), "Backend host has no addresses");
            }
            Err(e) => {
                warn!(backend = ctx.backend_url.as_deref().unwrap_or("-"), error = %e, "Failed to resolve backend");
            }
        }
        Err(self.on_connect_failure(ctx, Error::new(ErrorType::ConnectNoRoute)))
    }

    /// Feeds a connection failure into the failover state machine. Returns
    /// the error Pingora should act on.
    pub fn on_connect_failure(&self, ctx: &mut GatewayCtx, mut e: Box<Error>) -> Box<Error> {
        let (Some(route), Some(failover)) = (ctx.route.as_ref(), ctx.failover.as_mut()) else {
            return e;
        };
        match route.topology.dispatcher().connection_failed(failover) {
            Failover::Retry(delay) => {
                if !delay.is_zero() {
                    ctx.backoff = Some(delay);
                }
                e.set_retry(true);
                e
            }
            Failover::Fatal(err) => {
                Error::explain(ErrorType::HTTPStatus(err.status()), err.to_string())
            }
        }
    }

    /// Rewrites backend URLs in redirect headers with the service's
    /// response rule, or the first matching OUT rule.
    pub fn rewrite_response_headers(&self, ctx: &GatewayCtx, headers: &mut HeaderMap) {
        let Some(route) = ctx.route.as_ref() else {
            return;
        };
        let topology = &route.topology;
        let resolver = topology.resolver(ctx.principal.as_deref());

        for name in REWRITTEN_RESPONSE_HEADERS {
            let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string) else {
                continue;
            };
            let result = match route.response_rule.as_deref() {
                Some(rule) => topology
                    .rewriter()
                    .rewrite_with_rule(&resolver, &value, Direction::Out, rule),
                None => topology.rewriter().rewrite(&resolver, &value, Direction::Out),
            };
            match result {
                Ok(rewritten) if rewritten != value => match rewritten.parse() {
                    Ok(header) => {
                        headers.insert(name, header);
                    }
                    Err(_) => warn!(header = name, "Rewritten response header is not a valid header value"),
                },
                Ok(_) => {}
                Err(e) => warn!(header = name, error = %e, "Failed to rewrite response header"),
            }
        }
    }

    /// `Set-Cookie` value pinning the client to the backend that answered.
    pub fn affinity_cookie(&self, ctx: &GatewayCtx) -> Option<String> {
        let route = ctx.route.as_ref()?;
        route.topology.dispatcher().affinity_cookie(ctx.failover.as_ref()?)
    }
}

#[async_trait]
impl ProxyHttp for GatewayProxy {
    type CTX = GatewayCtx;

    fn new_ctx(&self) -> Self::CTX {
        GatewayCtx::default()
    }

    /// Selects the backend for this attempt.
    ///
    /// Called again for every failover retry, after the backoff of the
    /// previous failure.
    async fn upstream_peer(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<Box<HttpPeer>> {
        if let Some(delay) = ctx.backoff.take() {
            tokio::time::sleep(delay).await;
        }
        if ctx.route.is_none() {
            let req = session.req_header();
            self.prepare(ctx, &req.uri, &req.headers)?;
        }
        let backend = self.next_backend(ctx, &session.req_header().headers)?;
        let addr = self.resolve_backend(ctx, &backend).await?;

        let sni = backend.host.clone();
        Ok(Box::new(HttpPeer::new(addr, backend.tls, sni)))
    }

    /// Points the upstream request at the backend path and host.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let Some(backend) = ctx.upstream.as_ref() else {
            return Ok(());
        };
        let uri: Uri = backend
            .path_and_query
            .parse()
            .map_err(|_| Error::explain(ErrorType::HTTPStatus(500), "invalid backend path"))?;
        upstream_request.set_uri(uri);
        upstream_request.insert_header("Host", backend.authority.as_str())?;
        Ok(())
    }

    async fn connected_to_upstream(
        &self,
        _session: &mut Session,
        reused: bool,
        _peer: &HttpPeer,
        _fd: std::os::unix::io::RawFd,
        _digest: Option<&pingora_core::protocols::Digest>,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        debug!(
            backend = ctx.backend_url.as_deref().unwrap_or("-"),
            attempt = ctx.failover.as_ref().map(|f| f.attempts()).unwrap_or(0),
            reused,
            "Connected to backend"
        );
        Ok(())
    }

    /// Marks the endpoint failed and either retries on the next one or
    /// ends the request with a generic error.
    fn fail_to_connect(&self, _session: &mut Session, _peer: &HttpPeer, ctx: &mut Self::CTX, e: Box<Error>) -> Box<Error> {
        warn!(
            backend = ctx.backend_url.as_deref().unwrap_or("-"),
            error = %e,
            "Failed to connect to backend"
        );
        self.on_connect_failure(ctx, e)
    }

    /// Rewrites backend URLs in redirects and issues the affinity cookie.
    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let mut rewritten = HeaderMap::new();
        for name in REWRITTEN_RESPONSE_HEADERS {
            if let Some(value) = upstream_response.headers.get(name) {
                rewritten.insert(name, value.clone());
            }
        }
        if !rewritten.is_empty() {
            self.rewrite_response_headers(ctx, &mut rewritten);
            for name in REWRITTEN_RESPONSE_HEADERS {
                if let Some(value) = rewritten.get(name) {
                    upstream_response.insert_header(name, value.clone())?;
                }
            }
        }
        if let Some(cookie) = self.affinity_cookie(ctx) {
            upstream_response.append_header("Set-Cookie", cookie)?;
        }
        Ok(())
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();
        let topology = ctx.route.as_ref().map(|r| r.topology.name()).unwrap_or("-");
        let service = ctx.route.as_ref().map(|r| r.role.as_str()).unwrap_or("-");
        let backend = ctx.backend_url.as_deref().unwrap_or("-");
        let attempts = ctx.failover.as_ref().map(|f| f.attempts()).unwrap_or(0);

        info!(
            method = method,
            path = path,
            status = status,
            topology = topology,
            service = service,
            backend = backend,
            attempts = attempts,
            "request completed"
        );
    }
}

/// Parsed backend URL of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    /// Host without IPv6 brackets, used for DNS and SNI.
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// `host[:port]` as sent in the `Host` header.
    pub authority: String,
    pub path_and_query: String,
}

/// Parses an absolute `http`/`https` backend URL.
///
/// Error text never contains the URL itself.
pub fn parse_backend_url(url: &str) -> Result<BackendTarget, String> {
    let uri: Uri = url.parse().map_err(|_| "invalid backend URL".to_string())?;
    let tls = match uri.scheme_str() {
        Some(s) if s.eq_ignore_ascii_case("https") => true,
        Some(s) if s.eq_ignore_ascii_case("http") => false,
        _ => return Err("unsupported backend URL scheme".to_string()),
    };
    let host = uri.host().ok_or_else(|| "backend URL has no host".to_string())?;
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let authority = uri.authority().map(|a| a.as_str().to_string()).unwrap_or_default();
    let path_and_query = match uri.path_and_query().map(|p| p.as_str()) {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => "/".to_string(),
    };

    Ok(BackendTarget {
        host: extract_sni(host),
        port,
        tls,
        authority,
        path_and_query,
    })
}

/// Strips IPv6 brackets: "[::1]" -> "::1".
pub fn extract_sni(host: &str) -> String {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string()
}

/// Authority of the inbound request, port included.
///
/// Priority:
/// 1. Host header (preferred)
/// 2. :authority pseudo-header (HTTP/2 fallback)
///
/// Falls back to `localhost` if neither is available.
pub fn request_authority(host_header: Option<&str>, authority: Option<&str>) -> String {
    host_header
        .or(authority)
        .filter(|h| !h.is_empty())
        .unwrap_or("localhost")
        .to_string()
}

/// Backend URL used when no IN rule rewrote the request.
pub fn default_backend_url(active: &str, remaining: &str, query: Option<&str>) -> String {
    let mut url = format!("{}{}", active.trim_end_matches('/'), remaining);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Moves `url` from the endpoint it was rewritten against onto `target`.
///
/// A URL under `base` keeps everything after `base`; a URL that only shares
/// the origin of `base` keeps its path. Other URLs are returned unchanged.
pub fn rebase(url: &str, base: Option<&str>, target: &str) -> String {
    let Some(base) = base else {
        return url.to_string();
    };
    if base == target {
        return url.to_string();
    }
    if let Some(rest) = url.strip_prefix(base) {
        if rest.is_empty() || rest.starts_with(['/', '?', '#']) {
            return format!("{}{}", target, rest);
        }
    }
    match (origin(url), origin(base), origin(target)) {
        (Some(url_origin), Some(base_origin), Some(target_origin)) if url_origin.eq_ignore_ascii_case(base_origin) => {
            format!("{}{}", target_origin, &url[url_origin.len()..])
        }
        _ => url.to_string(),
    }
}

/// `scheme://authority` prefix of an absolute URL.
fn origin(url: &str) -> Option<&str> {
    let start = url.find("://")? + 3;
    let end = url[start..]
        .find(['/', '?', '#'])
        .map(|i| start + i)
        .unwrap_or(url.len());
    Some(&url[..end])
}

fn rewrite_failure(e: &RewriteError) -> Box<Error> {
    let status = match e {
        RewriteError::InvalidUrl(_) => 400,
        _ => 500,
    };
    Error::explain(ErrorType::HTTPStatus(status), e.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::function::HostMap;
    use crate::ha::HaServiceConfig;
    use crate::rewrite::{RewriteRule, RewriteStep, RuleDirection};
    use crate::topology::{ServiceRoute, Topology, TopologyRegistry, TopologySpec};

    // ========== Phase 1: Backend URL Parsing ==========

    #[test]
    fn test_parse_backend_url_http() {
        let target = parse_backend_url("http://nn1.internal:50070/webhdfs/v1/tmp?op=OPEN").unwrap();
        assert_eq!(target.host, "nn1.internal");
        assert_eq!(target.port, 50070);
        assert!(!target.tls);
        assert_eq!(target.authority, "nn1.internal:50070");
        assert_eq!(target.path_and_query, "/webhdfs/v1/tmp?op=OPEN");
    }

    #[test]
    fn test_parse_backend_url_https_default_port() {
        let target = parse_backend_url("https://nn1.internal").unwrap();
        assert!(target.tls);
        assert_eq!(target.port, 443);
        assert_eq!(target.path_and_query, "/");
    }

    #[test]
    fn test_parse_backend_url_ipv6() {
        let target = parse_backend_url("http://[::1]:8080/x").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 8080);
    }

    #[test]
    fn test_parse_backend_url_errors_hide_url() {
        let err = parse_backend_url("ftp://secret.internal/x").unwrap_err();
        assert!(!err.contains("secret"));
        assert!(parse_backend_url("/relative/only").is_err());
    }

    // ========== Phase 2: SNI and Authority ==========

    #[test]
    fn test_extract_sni() {
        assert_eq!(extract_sni("backend.example.com"), "backend.example.com");
        assert_eq!(extract_sni("[::1]"), "::1");
    }

    #[test]
    fn test_request_authority_prefers_host_header() {
        assert_eq!(request_authority(Some("host.com:8443"), Some("authority.com")), "host.com:8443");
        assert_eq!(request_authority(None, Some("authority.com")), "authority.com");
        assert_eq!(request_authority(None, None), "localhost");
    }

    // ========== Phase 3: URL Mapping ==========

    #[test]
    fn test_default_backend_url() {
        assert_eq!(
            default_backend_url("http://nn1:50070/webhdfs", "/v1/tmp", Some("op=OPEN")),
            "http://nn1:50070/webhdfs/v1/tmp?op=OPEN"
        );
        assert_eq!(default_backend_url("http://oozie:11000/", "", None), "http://oozie:11000");
        assert_eq!(default_backend_url("http://a", "/x", Some("")), "http://a/x");
    }

    #[test]
    fn test_rebase_under_base() {
        assert_eq!(
            rebase("http://nn1:50070/webhdfs/v1/x?op=OPEN", Some("http://nn1:50070/webhdfs"), "http://nn2:50070/webhdfs"),
            "http://nn2:50070/webhdfs/v1/x?op=OPEN"
        );
    }

    #[test]
    fn test_rebase_same_origin_only() {
        assert_eq!(
            rebase("http://nn1:50070/other/path", Some("http://nn1:50070/webhdfs"), "http://nn2:50070/webhdfs"),
            "http://nn2:50070/other/path"
        );
    }

    #[test]
    fn test_rebase_unrelated_url_unchanged() {
        assert_eq!(
            rebase("http://elsewhere/x", Some("http://nn1:50070/webhdfs"), "http://nn2:50070/webhdfs"),
            "http://elsewhere/x"
        );
        assert_eq!(rebase("http://a/x", None, "http://b"), "http://a/x");
        // no false prefix match across a segment
        assert_eq!(
            rebase("http://nn1:50070/webhdfsx", Some("http://nn1:50070/webhdfs"), "http://nn2:50070/webhdfs"),
            "http://nn2:50070/webhdfsx"
        );
    }

    // ========== Phase 4: Pipeline ==========

    const NN1: &str = "http://nn1.internal:50070/webhdfs";
    const NN2: &str = "http://nn2.internal:50070/webhdfs";

    fn make_proxy(rules: Vec<RewriteRule>, ha: HaServiceConfig) -> GatewayProxy {
        make_proxy_with(&[NN1, NN2], rules, ha, None)
    }

    fn make_proxy_with(
        urls: &[&str],
        rules: Vec<RewriteRule>,
        ha: HaServiceConfig,
        response_rule: Option<&str>,
    ) -> GatewayProxy {
        let topology = Topology::build(TopologySpec {
            name: "sandbox".into(),
            params: BTreeMap::new(),
            principal_header: Some("X-Forwarded-User".into()),
            hostmap: HostMap::parse("gw.example.com=nn1.internal,nn2.internal"),
            rules,
            services: vec![(
                ServiceRoute {
                    role: "WEBHDFS".into(),
                    path: "/webhdfs".into(),
                    response_rule: response_rule.map(String::from),
                },
                urls.iter().map(|u| u.to_string()).collect(),
                ha,
            )],
        })
        .unwrap();
        let registry = Arc::new(TopologyRegistry::new());
        registry.deploy(topology);
        GatewayProxy::new(ServiceRouter::new(registry, "gateway"), "https")
    }

    fn active_url(ctx: &GatewayCtx) -> String {
        ctx.route.as_ref().unwrap().topology.provider().active_url("WEBHDFS").unwrap()
    }

    fn webhdfs_rules() -> Vec<RewriteRule> {
        vec![
            RewriteRule::new(
                "WEBHDFS/inbound",
                RuleDirection::In,
                "*://*:*/*/*/webhdfs/v1/{path=**}?{**}",
                vec![RewriteStep::rewrite("{$serviceUrl(WEBHDFS)}/v1/{path=**}?{**}").unwrap()],
            )
            .unwrap(),
            RewriteRule::new(
                "WEBHDFS/outbound",
                RuleDirection::Out,
                "{scheme}://{host}:{port}/webhdfs/v1/{path=**}?{**}",
                vec![RewriteStep::rewrite("https://{$hostmap(host)}:8443/gateway/sandbox/webhdfs/v1/{path=**}?{**}")
                    .unwrap()],
            )
            .unwrap(),
        ]
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn test_gateway_proxy_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GatewayProxy>();
        assert_send_sync::<GatewayCtx>();
    }

    #[test]
    fn test_gateway_ctx_default() {
        let ctx = GatewayCtx::default();
        assert!(ctx.route.is_none());
        assert!(ctx.backend_url.is_none());
    }

    #[test]
    fn test_unknown_route_is_404() {
        let proxy = make_proxy(vec![], HaServiceConfig::default());
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/prod/webhdfs/v1".parse().unwrap();
        let err = proxy.prepare(&mut ctx, &uri, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.etype(), &ErrorType::HTTPStatus(404));
    }

    #[test]
    fn test_inbound_rewrite_and_failover_rebases() {
        let proxy = make_proxy(webhdfs_rules(), HaServiceConfig::from_param_string("failoverSleep=250").unwrap());
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/sandbox/webhdfs/v1/tmp/a.txt?op=OPEN".parse().unwrap();
        let hdrs = headers(&[("host", "gw.example.com:8443"), ("x-forwarded-user", "alice")]);

        proxy.prepare(&mut ctx, &uri, &hdrs).unwrap();
        assert_eq!(ctx.principal.as_deref(), Some("alice"));

        let first = proxy.next_backend(&mut ctx, &hdrs).unwrap();
        assert_eq!(first.host, "nn1.internal");
        assert_eq!(first.path_and_query, "/webhdfs/v1/tmp/a.txt?op=OPEN");

        let err = proxy.on_connect_failure(&mut ctx, Error::new(ErrorType::ConnectRefused));
        assert!(err.retry());
        assert_eq!(ctx.backoff, Some(Duration::from_millis(250)));

        let second = proxy.next_backend(&mut ctx, &hdrs).unwrap();
        assert_eq!(second.host, "nn2.internal");
        assert_eq!(second.path_and_query, "/webhdfs/v1/tmp/a.txt?op=OPEN");
        assert_eq!(ctx.backend_url.as_deref(), Some("http://nn2.internal:50070/webhdfs/v1/tmp/a.txt?op=OPEN"));
    }

    #[test]
    fn test_default_mapping_without_rules() {
        let proxy = make_proxy(vec![], HaServiceConfig::default());
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/sandbox/webhdfs/v1/x?op=LISTSTATUS".parse().unwrap();
        let hdrs = headers(&[("host", "gw.example.com")]);

        proxy.prepare(&mut ctx, &uri, &hdrs).unwrap();
        proxy.next_backend(&mut ctx, &hdrs).unwrap();
        assert_eq!(
            ctx.backend_url.as_deref(),
            Some("http://nn1.internal:50070/webhdfs/v1/x?op=LISTSTATUS")
        );
    }

    #[test]
    fn test_exhausted_failover_is_generic_503() {
        let proxy = make_proxy(
            vec![],
            HaServiceConfig::from_param_string("maxFailoverAttempts=1;failoverSleep=0").unwrap(),
        );
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/sandbox/webhdfs/v1/x".parse().unwrap();
        let hdrs = HeaderMap::new();
        proxy.prepare(&mut ctx, &uri, &hdrs).unwrap();

        proxy.next_backend(&mut ctx, &hdrs).unwrap();
        let retry = proxy.on_connect_failure(&mut ctx, Error::new(ErrorType::ConnectRefused));
        assert!(retry.retry());
        assert!(ctx.backoff.is_none());

        proxy.next_backend(&mut ctx, &hdrs).unwrap();
        let fatal = proxy.on_connect_failure(&mut ctx, Error::new(ErrorType::ConnectRefused));
        assert!(!fatal.retry());
        assert_eq!(fatal.etype(), &ErrorType::HTTPStatus(503));
        assert!(!fatal.to_string().contains("nn1"));
        assert!(!fatal.to_string().contains("nn2"));
    }

    #[test]
    fn test_failover_fits_in_pingora_retry_budget() {
        // Pingora makes at most 16 upstream attempts per request
        let proxy = make_proxy(
            vec![],
            HaServiceConfig::from_param_string("maxFailoverAttempts=40;failoverSleep=0").unwrap(),
        );
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/sandbox/webhdfs/v1/x".parse().unwrap();
        let hdrs = HeaderMap::new();
        proxy.prepare(&mut ctx, &uri, &hdrs).unwrap();

        for _ in 0..15 {
            proxy.next_backend(&mut ctx, &hdrs).unwrap();
            assert!(proxy.on_connect_failure(&mut ctx, Error::new(ErrorType::ConnectRefused)).retry());
        }
        proxy.next_backend(&mut ctx, &hdrs).unwrap();
        let fatal = proxy.on_connect_failure(&mut ctx, Error::new(ErrorType::ConnectRefused));
        assert!(!fatal.retry());
        assert_eq!(fatal.etype(), &ErrorType::HTTPStatus(503));
    }

    #[test]
    fn test_non_ha_connect_failure_is_503() {
        let proxy = make_proxy(vec![], HaServiceConfig::disabled());
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/sandbox/webhdfs".parse().unwrap();
        let hdrs = HeaderMap::new();
        proxy.prepare(&mut ctx, &uri, &hdrs).unwrap();
        proxy.next_backend(&mut ctx, &hdrs).unwrap();

        let fatal = proxy.on_connect_failure(&mut ctx, Error::new(ErrorType::ConnectRefused));
        assert_eq!(fatal.etype(), &ErrorType::HTTPStatus(503));
    }

    #[test]
    fn test_location_header_rewritten_outbound() {
        let proxy = make_proxy(webhdfs_rules(), HaServiceConfig::default());
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/sandbox/webhdfs/v1/tmp/a.txt?op=CREATE".parse().unwrap();
        let hdrs = headers(&[("host", "gw.example.com:8443")]);
        proxy.prepare(&mut ctx, &uri, &hdrs).unwrap();

        let mut response = headers(&[
            ("location", "http://nn2.internal:50075/webhdfs/v1/tmp/a.txt?op=CREATE&overwrite=false"),
            ("content-type", "application/json"),
        ]);
        proxy.rewrite_response_headers(&ctx, &mut response);
        assert_eq!(
            response.get("location").unwrap(),
            "https://gw.example.com:8443/gateway/sandbox/webhdfs/v1/tmp/a.txt?op=CREATE&overwrite=false"
        );
        assert_eq!(response.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_sticky_cookie_issued() {
        let proxy = make_proxy(vec![], HaServiceConfig::from_param_string("enableStickySession=true").unwrap());
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/sandbox/webhdfs".parse().unwrap();
        let hdrs = HeaderMap::new();
        proxy.prepare(&mut ctx, &uri, &hdrs).unwrap();
        proxy.next_backend(&mut ctx, &hdrs).unwrap();

        let cookie = proxy.affinity_cookie(&ctx).unwrap();
        assert!(cookie.starts_with("GATEWAY_BACKEND-WEBHDFS="));
        assert!(!cookie.contains("nn1"));
    }

    #[test]
    fn test_identity_inbound_rule_is_kept() {
        let identity = RewriteRule::new(
            "WEBHDFS/identity",
            RuleDirection::In,
            "{scheme}://{host}:{port}/gateway/sandbox/webhdfs/v1/{path=**}?{**}",
            vec![RewriteStep::rewrite("{scheme}://{host}:{port}/gateway/sandbox/webhdfs/v1/{path=**}?{**}").unwrap()],
        )
        .unwrap();
        let proxy = make_proxy(vec![identity], HaServiceConfig::default());
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/sandbox/webhdfs/v1/tmp?op=OPEN".parse().unwrap();
        let hdrs = headers(&[("host", "gw.example.com:8443")]);

        proxy.prepare(&mut ctx, &uri, &hdrs).unwrap();
        assert_eq!(
            ctx.rewritten.as_deref(),
            Some("https://gw.example.com:8443/gateway/sandbox/webhdfs/v1/tmp?op=OPEN")
        );
    }

    #[test]
    fn test_response_rule_overrides_first_match() {
        let catch_all = RewriteRule::new(
            "catch-all/outbound",
            RuleDirection::Out,
            "*://*:*/{path=**}?{**}",
            vec![RewriteStep::rewrite("https://elsewhere.example.com/{path=**}?{**}").unwrap()],
        )
        .unwrap();
        let mut rules = vec![catch_all];
        rules.extend(webhdfs_rules());
        let location = "http://nn2.internal:50075/webhdfs/v1/tmp/a.txt?op=OPEN";
        let uri: Uri = "/gateway/sandbox/webhdfs/v1/tmp/a.txt?op=OPEN".parse().unwrap();
        let hdrs = headers(&[("host", "gw.example.com:8443")]);

        let first_match = make_proxy_with(&[NN1, NN2], rules.clone(), HaServiceConfig::default(), None);
        let mut ctx = GatewayCtx::default();
        first_match.prepare(&mut ctx, &uri, &hdrs).unwrap();
        let mut response = headers(&[("location", location)]);
        first_match.rewrite_response_headers(&ctx, &mut response);
        assert_eq!(
            response.get("location").unwrap(),
            "https://elsewhere.example.com/webhdfs/v1/tmp/a.txt?op=OPEN"
        );

        let named = make_proxy_with(&[NN1, NN2], rules, HaServiceConfig::default(), Some("WEBHDFS/outbound"));
        let mut ctx = GatewayCtx::default();
        named.prepare(&mut ctx, &uri, &hdrs).unwrap();
        let mut response = headers(&[("location", location)]);
        named.rewrite_response_headers(&ctx, &mut response);
        assert_eq!(
            response.get("location").unwrap(),
            "https://gw.example.com:8443/gateway/sandbox/webhdfs/v1/tmp/a.txt?op=OPEN"
        );
    }

    // ========== Phase 5: Backend Resolution ==========

    #[tokio::test]
    async fn test_unresolvable_backend_fails_over() {
        let proxy = make_proxy_with(
            &["http://nn1.invalid:50070/webhdfs", NN2],
            vec![],
            HaServiceConfig::from_param_string("failoverSleep=0").unwrap(),
            None,
        );
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/sandbox/webhdfs/v1/x".parse().unwrap();
        let hdrs = HeaderMap::new();
        proxy.prepare(&mut ctx, &uri, &hdrs).unwrap();

        let first = proxy.next_backend(&mut ctx, &hdrs).unwrap();
        assert_eq!(first.host, "nn1.invalid");

        let err = proxy.resolve_backend(&mut ctx, &first).await.unwrap_err();
        assert!(err.retry());
        assert!(!err.to_string().contains("nn1"));
        assert_eq!(active_url(&ctx), NN2);

        let second = proxy.next_backend(&mut ctx, &hdrs).unwrap();
        assert_eq!(second.host, "nn2.internal");
    }

    #[tokio::test]
    async fn test_unresolvable_last_backend_is_generic_503() {
        let proxy = make_proxy_with(
            &["http://nn1.invalid:50070/webhdfs"],
            vec![],
            HaServiceConfig::disabled(),
            None,
        );
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/sandbox/webhdfs".parse().unwrap();
        let hdrs = HeaderMap::new();
        proxy.prepare(&mut ctx, &uri, &hdrs).unwrap();
        let backend = proxy.next_backend(&mut ctx, &hdrs).unwrap();

        let err = proxy.resolve_backend(&mut ctx, &backend).await.unwrap_err();
        assert!(!err.retry());
        assert_eq!(err.etype(), &ErrorType::HTTPStatus(503));
        assert!(!err.to_string().contains("invalid"));
    }

    #[tokio::test]
    async fn test_resolve_backend_literal_address() {
        let proxy = make_proxy_with(&["http://127.0.0.1:50070/webhdfs"], vec![], HaServiceConfig::default(), None);
        let mut ctx = GatewayCtx::default();
        let uri: Uri = "/gateway/sandbox/webhdfs".parse().unwrap();
        let hdrs = HeaderMap::new();
        proxy.prepare(&mut ctx, &uri, &hdrs).unwrap();
        let backend = proxy.next_backend(&mut ctx, &hdrs).unwrap();

        let addr = proxy.resolve_backend(&mut ctx, &backend).await.unwrap();
        assert_eq!(addr, "127.0.0.1:50070".parse::<SocketAddr>().unwrap());
    }
}
