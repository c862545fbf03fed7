//! HA-aware dispatch.
//!
//! A request resolves its target through the service's [`EndpointPool`].
//! On a connection failure the failed URL is reported to the pool, the
//! dispatcher sleeps for the configured backoff and tries again on the new
//! active URL, until `maxFailoverAttempts` failovers have been spent.
//! Backend HTTP error statuses are responses, not failures, and are passed
//! through untouched.
//!
//! The state machine is exposed in two forms: [`HaDispatcher::dispatch`]
//! drives a whole request through an async `send` closure, while
//! [`HaDispatcher::begin`], [`HaDispatcher::select_target`] and
//! [`HaDispatcher::connection_failed`] let a proxy hook framework (Pingora's
//! `upstream_peer` / `fail_to_connect`) step through the same transitions.

pub mod sticky;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::ha::{EndpointPool, HaError, HaProvider, HaServiceConfig};

/// Failure reported by a `send` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The backend could not be reached. Triggers failover.
    Connect(String),
    /// Any other transport failure. Not retried.
    Other(String),
}

/// Dispatch failure as surfaced to the client.
///
/// `Display` never includes backend hosts or URLs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no backend available for service `{service}` after {attempts} attempts")]
    Exhausted { service: String, attempts: u32 },
    #[error("service `{service}` is unavailable")]
    Unavailable { service: String },
    #[error("unknown service `{0}`")]
    UnknownService(String),
    #[error("backend request for service `{service}` failed")]
    Transport { service: String, detail: String },
    #[error("endpoint pool error: {0}")]
    Pool(#[from] HaError),
}

impl DispatchError {
    /// HTTP status returned to the client.
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::Exhausted { .. } | DispatchError::Unavailable { .. } => 503,
            DispatchError::Transport { .. } => 502,
            DispatchError::UnknownService(_) | DispatchError::Pool(_) => 500,
        }
    }
}

/// What the caller should do after a connection failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failover {
    /// Sleep for the duration, then select a target again.
    Retry(Duration),
    Fatal(DispatchError),
}

/// Request attributes that influence target selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestMeta<'a> {
    pub user_agent: Option<&'a str>,
    /// Raw `Cookie` header.
    pub cookie: Option<&'a str>,
}

/// Progress of one request through the failover state machine.
#[derive(Debug)]
pub struct FailoverState {
    service: String,
    config: Arc<HaServiceConfig>,
    pool: Arc<EndpointPool>,
    attempts: u32,
    target: Option<String>,
    pinned: bool,
}

impl FailoverState {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// URL of the current attempt.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn config(&self) -> &HaServiceConfig {
        &self.config
    }
}

/// Successful dispatch.
#[derive(Debug)]
pub struct Dispatched<T> {
    pub response: T,
    /// Endpoint that produced the response.
    pub target: String,
    /// `Set-Cookie` value to return when sticky sessions are on.
    pub set_cookie: Option<String>,
}

/// Dispatcher bound to one topology's HA provider.
#[derive(Clone)]
pub struct HaDispatcher {
    provider: Arc<HaProvider>,
}

impl HaDispatcher {
    pub fn new(provider: Arc<HaProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &HaProvider {
        &self.provider
    }

    /// Starts a request against `service`.
    pub fn begin(&self, service: &str) -> Result<FailoverState, DispatchError> {
        let unknown = || DispatchError::UnknownService(service.to_string());
        let config = self.provider.config(service).ok_or_else(unknown)?;
        let pool = self.provider.pool(service).ok_or_else(unknown)?;
        Ok(FailoverState {
            service: service.to_string(),
            config,
            pool,
            attempts: 0,
            target: None,
            pinned: false,
        })
    }

    /// Picks the URL for the next attempt and records it in `state`.
    ///
    /// The first attempt honours an affinity cookie, then load balancing;
    /// failover attempts always use the pool's active URL.
    pub fn select_target(&self, state: &mut FailoverState, meta: &RequestMeta<'_>) -> Result<String, DispatchError> {
        state.attempts += 1;
        let config = Arc::clone(&state.config);

        let url = if state.attempts > 1 {
            state.pinned = false;
            state.pool.active_url()?
        } else if let Some(url) = self.sticky_target(state, meta) {
            state.pinned = true;
            url
        } else if config.enabled && config.load_balancing && !is_excluded(&config, meta) {
            state.pool.advance()?
        } else {
            state.pool.active_url()?
        };

        debug!(service = %state.service, attempt = state.attempts, url = %url, "Selected backend");
        state.target = Some(url.clone());
        Ok(url)
    }

    fn sticky_target(&self, state: &FailoverState, meta: &RequestMeta<'_>) -> Option<String> {
        if !state.config.sticky_session {
            return None;
        }
        sticky::pinned_url(
            meta.cookie,
            &state.config.sticky_cookie_name,
            &state.service,
            &state.pool.urls(),
        )
    }

    /// Handles a connection failure of the current attempt.
    pub fn connection_failed(&self, state: &mut FailoverState) -> Failover {
        let service = state.service.clone();
        let target = state.target.take().unwrap_or_default();

        if !state.config.enabled {
            warn!(service = %service, url = %target, "Backend unreachable, HA disabled for service");
            return Failover::Fatal(DispatchError::Unavailable { service });
        }
        if state.config.no_fallback {
            warn!(service = %service, url = %target, "Backend unreachable, fallback disabled");
            return Failover::Fatal(DispatchError::Unavailable { service });
        }

        state.pool.mark_failed(&target);

        if state.attempts > state.config.max_failover_attempts {
            error!(
                service = %service,
                attempts = state.attempts,
                "Failover attempts exhausted"
            );
            return Failover::Fatal(DispatchError::Exhausted {
                service,
                attempts: state.attempts,
            });
        }

        warn!(
            service = %service,
            url = %target,
            attempt = state.attempts,
            max_failover_attempts = state.config.max_failover_attempts,
            "Backend unreachable, failing over"
        );
        Failover::Retry(state.config.failover_sleep)
    }

    /// `Set-Cookie` value for the backend that served the request, if
    /// sticky sessions are on and the client is not already pinned to it.
    pub fn affinity_cookie(&self, state: &FailoverState) -> Option<String> {
        if !state.config.sticky_session || state.pinned {
            return None;
        }
        let target = state.target.as_deref()?;
        Some(sticky::set_cookie(&state.config.sticky_cookie_name, &state.service, target))
    }

    /// Runs a complete request against `service`, calling `send` once per
    /// attempt with the target URL.
    pub async fn dispatch<T, F, Fut>(
        &self,
        service: &str,
        meta: &RequestMeta<'_>,
        mut send: F,
    ) -> Result<Dispatched<T>, DispatchError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut state = self.begin(service)?;

        loop {
            let target = self.select_target(&mut state, meta)?;
            match send(target.clone()).await {
                Ok(response) => {
                    return Ok(Dispatched {
                        set_cookie: self.affinity_cookie(&state),
                        response,
                        target,
                    })
                }
                Err(TransportError::Other(detail)) => {
                    warn!(service = %service, url = %target, error = %detail, "Backend request failed");
                    return Err(DispatchError::Transport {
                        service: service.to_string(),
                        detail,
                    });
                }
                Err(TransportError::Connect(detail)) => {
                    debug!(service = %service, url = %target, error = %detail, "Connect failed");
                    match self.connection_failed(&mut state) {
                        Failover::Retry(delay) if !delay.is_zero() => tokio::time::sleep(delay).await,
                        Failover::Retry(_) => {}
                        Failover::Fatal(err) => return Err(err),
                    }
                }
            }
        }
    }
}

fn is_excluded(config: &HaServiceConfig, meta: &RequestMeta<'_>) -> bool {
    meta.user_agent
        .is_some_and(|agent| config.is_user_agent_excluded(agent))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;

    fn dispatcher(urls: &[&str], config: HaServiceConfig) -> HaDispatcher {
        let provider = HaProvider::new();
        provider
            .add_service("WEBHDFS", urls.iter().map(|u| u.to_string()).collect(), config)
            .unwrap();
        HaDispatcher::new(Arc::new(provider))
    }

    fn ha(params: &str) -> HaServiceConfig {
        HaServiceConfig::from_param_string(params).unwrap()
    }

    const URLS: [&str; 3] = ["http://nn1.internal:50070", "http://nn2.internal:50070", "http://nn3.internal:50070"];

    // ========== Phase 1: Failover ==========

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_makes_n_plus_one_attempts() {
        let d = dispatcher(&URLS, ha("maxFailoverAttempts=2;failoverSleep=10"));
        let tried = Mutex::new(Vec::new());

        let result: Result<Dispatched<()>, _> = d
            .dispatch("WEBHDFS", &RequestMeta::default(), |url| {
                tried.lock().unwrap().push(url.clone());
                async move { Err(TransportError::Connect(format!("connection refused: {}", url))) }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(
            err,
            DispatchError::Exhausted {
                service: "WEBHDFS".into(),
                attempts: 3
            }
        );
        assert_eq!(err.status(), 503);
        assert_eq!(*tried.lock().unwrap(), URLS);

        let message = err.to_string();
        for url in URLS {
            assert!(!message.contains(url));
        }
        assert!(!message.contains("nn1") && !message.contains("internal"));

        // every failure rotated the pool, including the last
        assert_eq!(d.provider().active_url("WEBHDFS").unwrap(), URLS[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts_only() {
        let d = dispatcher(&URLS, ha("maxFailoverAttempts=3;failoverSleep=1000"));
        let start = Instant::now();
        let attempts = AtomicU32::new(0);

        let result: Result<Dispatched<()>, _> = d
            .dispatch("WEBHDFS", &RequestMeta::default(), |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::Connect("refused".into())) }
            })
            .await;

        assert!(matches!(result, Err(DispatchError::Exhausted { attempts: 4, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_then_success() {
        let d = dispatcher(&URLS[..2], ha("failoverSleep=0"));
        let result = d
            .dispatch("WEBHDFS", &RequestMeta::default(), |url| async move {
                if url == URLS[0] {
                    Err(TransportError::Connect("refused".into()))
                } else {
                    Ok(200u16)
                }
            })
            .await
            .unwrap();

        assert_eq!(result.response, 200);
        assert_eq!(result.target, URLS[1]);
        assert!(result.set_cookie.is_none());
        assert_eq!(d.provider().active_url("WEBHDFS").unwrap(), URLS[1]);
    }

    #[tokio::test]
    async fn test_backend_error_status_is_not_failover() {
        let d = dispatcher(&URLS, ha("failoverSleep=0"));
        let calls = AtomicU32::new(0);
        let result = d
            .dispatch("WEBHDFS", &RequestMeta::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u16, TransportError>(503) }
            })
            .await
            .unwrap();
        assert_eq!(result.response, 503);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.provider().active_url("WEBHDFS").unwrap(), URLS[0]);
    }

    #[tokio::test]
    async fn test_other_transport_error_not_retried() {
        let d = dispatcher(&URLS, ha("failoverSleep=0"));
        let calls = AtomicU32::new(0);
        let result: Result<Dispatched<()>, _> = d
            .dispatch("WEBHDFS", &RequestMeta::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::Other("reset by peer at nn1.internal".into())) }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.status(), 502);
        assert!(!err.to_string().contains("nn1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ========== Phase 2: No-fallback and non-HA ==========

    #[tokio::test(start_paused = true)]
    async fn test_no_fallback_fails_immediately() {
        let d = dispatcher(&URLS[..1], ha("noFallback=true;failoverSleep=5000"));
        let start = Instant::now();
        let calls = AtomicU32::new(0);

        let result: Result<Dispatched<()>, _> = d
            .dispatch("WEBHDFS", &RequestMeta::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::Connect("refused".into())) }
            })
            .await;

        assert!(matches!(result, Err(DispatchError::Unavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_non_ha_service_single_attempt_without_rotation() {
        let d = dispatcher(&URLS[..2], HaServiceConfig::disabled());
        let calls = AtomicU32::new(0);
        let result: Result<Dispatched<()>, _> = d
            .dispatch("WEBHDFS", &RequestMeta::default(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::Connect("refused".into())) }
            })
            .await;
        assert_eq!(result.unwrap_err().status(), 503);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.provider().active_url("WEBHDFS").unwrap(), URLS[0]);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let d = dispatcher(&URLS, HaServiceConfig::default());
        let result: Result<Dispatched<()>, _> = d
            .dispatch("NOPE", &RequestMeta::default(), |_| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(DispatchError::UnknownService(_))));
    }

    // ========== Phase 3: Step-wise state machine ==========

    #[test]
    fn test_stepwise_transitions() {
        let d = dispatcher(&URLS[..2], ha("maxFailoverAttempts=1;failoverSleep=250"));
        let meta = RequestMeta::default();
        let mut state = d.begin("WEBHDFS").unwrap();

        assert_eq!(d.select_target(&mut state, &meta).unwrap(), URLS[0]);
        assert_eq!(d.connection_failed(&mut state), Failover::Retry(Duration::from_millis(250)));
        assert_eq!(d.select_target(&mut state, &meta).unwrap(), URLS[1]);
        assert!(matches!(
            d.connection_failed(&mut state),
            Failover::Fatal(DispatchError::Exhausted { attempts: 2, .. })
        ));
        assert_eq!(state.attempts(), 2);
    }

    // ========== Phase 4: Load balancing and affinity ==========

    #[tokio::test]
    async fn test_load_balancing_round_robin() {
        let d = dispatcher(&URLS, ha("enableLoadBalancing=true"));
        let mut targets = Vec::new();
        for _ in 0..4 {
            let done = d
                .dispatch("WEBHDFS", &RequestMeta::default(), |_| async { Ok(()) })
                .await
                .unwrap();
            targets.push(done.target);
        }
        assert_eq!(targets, [URLS[0], URLS[1], URLS[2], URLS[0]]);
    }

    #[tokio::test]
    async fn test_excluded_user_agent_not_load_balanced() {
        let d = dispatcher(&URLS, ha("enableLoadBalancing=true;disableLoadBalancingForUserAgents=Hive JDBC"));
        let meta = RequestMeta {
            user_agent: Some("Apache Hive JDBC Driver"),
            cookie: None,
        };
        for _ in 0..3 {
            let done = d.dispatch("WEBHDFS", &meta, |_| async { Ok(()) }).await.unwrap();
            assert_eq!(done.target, URLS[0]);
        }
    }

    #[tokio::test]
    async fn test_sticky_session_issues_and_honours_cookie() {
        let d = dispatcher(&URLS, ha("enableStickySession=true"));

        let first = d
            .dispatch("WEBHDFS", &RequestMeta::default(), |_| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(first.target, URLS[0]);
        let cookie = first.set_cookie.unwrap();
        assert!(cookie.starts_with("GATEWAY_BACKEND-WEBHDFS="));
        assert!(!cookie.contains("nn1"));

        d.provider().set_active_url("WEBHDFS", URLS[2]);
        let pair = cookie.split(';').next().unwrap().to_string();
        let meta = RequestMeta {
            user_agent: None,
            cookie: Some(&pair),
        };
        let pinned = d.dispatch("WEBHDFS", &meta, |_| async { Ok(()) }).await.unwrap();
        assert_eq!(pinned.target, URLS[0]);
        assert!(pinned.set_cookie.is_none());
    }

    #[tokio::test]
    async fn test_sticky_no_fallback_surfaces_failure() {
        let d = dispatcher(&URLS, ha("enableStickySession=true;noFallback=true"));
        let header = format!("GATEWAY_BACKEND-WEBHDFS={}", sticky::token(URLS[1]));
        let meta = RequestMeta {
            user_agent: None,
            cookie: Some(&header),
        };
        let tried = Mutex::new(Vec::new());
        let result: Result<Dispatched<()>, _> = d
            .dispatch("WEBHDFS", &meta, |url| {
                tried.lock().unwrap().push(url);
                async { Err(TransportError::Connect("refused".into())) }
            })
            .await;
        assert!(matches!(result, Err(DispatchError::Unavailable { .. })));
        assert_eq!(*tried.lock().unwrap(), [URLS[1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sticky_failover_issues_new_cookie() {
        let d = dispatcher(&URLS[..2], ha("enableStickySession=true;failoverSleep=0"));
        let header = format!("GATEWAY_BACKEND-WEBHDFS={}", sticky::token(URLS[0]));
        let meta = RequestMeta {
            user_agent: None,
            cookie: Some(&header),
        };
        let done = d
            .dispatch("WEBHDFS", &meta, |url| async move {
                if url == URLS[0] {
                    Err(TransportError::Connect("refused".into()))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(done.target, URLS[1]);
        assert_eq!(done.set_cookie, Some(sticky::set_cookie("GATEWAY_BACKEND", "WEBHDFS", URLS[1])));
    }

    #[test]
    fn test_dispatcher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HaDispatcher>();
        assert_send_sync::<FailoverState>();
    }
}
