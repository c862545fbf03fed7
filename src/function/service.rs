//! `{$serviceUrl(ROLE)}` and friends: parts of a service's active endpoint.

use std::sync::Arc;

use super::{FunctionContext, RewriteFunction};
use crate::rewrite::Direction;
use crate::template::{Segment, Template};

/// Looks up the endpoints registered for a service role.
pub trait ServiceLookup: Send + Sync {
    /// Endpoint URLs for `role`, active endpoint first.
    fn service_urls(&self, role: &str) -> Vec<String>;
}

/// Which part of the active endpoint URL a function returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePart {
    Url,
    Scheme,
    Host,
    Port,
    Path,
    /// `host:port`
    Addr,
}

pub struct ServiceFunction {
    part: ServicePart,
    services: Arc<dyn ServiceLookup>,
}

impl ServiceFunction {
    pub fn new(part: ServicePart, services: Arc<dyn ServiceLookup>) -> Self {
        Self { part, services }
    }

    fn extract(&self, url: &str) -> Option<String> {
        if self.part == ServicePart::Url {
            return Some(url.to_string());
        }

        let parsed = Template::parse_literal(url).ok()?;
        let literal = |seg: Option<&Segment>| seg.and_then(Segment::as_literal).map(String::from);
        let scheme = literal(parsed.scheme());
        let host = literal(parsed.host());
        let port = literal(parsed.port()).or_else(|| default_port(scheme.as_deref()?).map(String::from));

        match self.part {
            ServicePart::Url => None,
            ServicePart::Scheme => scheme,
            ServicePart::Host => host,
            ServicePart::Port => port,
            ServicePart::Path => {
                let segments: Vec<&str> = parsed.path().iter().filter_map(Segment::as_literal).collect();
                Some(format!("/{}", segments.join("/")))
            }
            ServicePart::Addr => match (host, port) {
                (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
                (host, None) => host,
                (None, Some(_)) => None,
            },
        }
    }
}

fn default_port(scheme: &str) -> Option<&'static str> {
    match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => Some("80"),
        "https" | "wss" => Some("443"),
        _ => None,
    }
}

impl RewriteFunction for ServiceFunction {
    fn resolve(&self, _ctx: &FunctionContext<'_>, _direction: Direction, param: &str) -> Vec<String> {
        self.services
            .service_urls(param)
            .first()
            .and_then(|url| self.extract(url))
            .into_iter()
            .collect()
    }
}
