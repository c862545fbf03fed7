//! HTTP health server for liveness and readiness probes.
//!
//! `/healthz` answers as long as the process serves requests; `/readyz`
//! additionally requires at least one deployed topology.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::topology::TopologyRegistry;

/// Status and body for a probe path.
pub fn probe(path: &str, registry: &TopologyRegistry) -> (StatusCode, &'static str) {
    match path {
        "/healthz" => (StatusCode::OK, "ok"),
        "/readyz" if registry.is_empty() => (StatusCode::SERVICE_UNAVAILABLE, "no topology deployed"),
        "/readyz" => (StatusCode::OK, "ok"),
        _ => (StatusCode::NOT_FOUND, "not found"),
    }
}

/// Handles health check requests.
pub async fn health_handler(
    req: Request<hyper::body::Incoming>,
    registry: Arc<TopologyRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, body) = probe(req.uri().path(), &registry);
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    Ok(response)
}

/// Starts the HTTP health server on the given address.
///
/// Runs indefinitely, accepting connections and handling health requests.
pub async fn start_health_server(addr: SocketAddr, registry: Arc<TopologyRegistry>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "health server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let registry = Arc::clone(&registry);

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, Arc::clone(&registry)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "health connection error");
            }
        });
    }
}
