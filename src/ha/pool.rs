//! Failover-ordered endpoint pool for one service.
//!
//! The front of the queue is the active URL. Failing the active URL moves
//! it to the back, so endpoints are retried in FIFO order of registration.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::HaError;

/// Candidate URLs of one service with exactly one active at a time.
///
/// Thread-safe via a `parking_lot::Mutex` that is only held for the
/// read or rotation itself.
#[derive(Debug)]
pub struct EndpointPool {
    service: String,
    urls: Mutex<VecDeque<String>>,
}

impl EndpointPool {
    /// Creates a pool whose first URL is active. Duplicate URLs collapse
    /// into their first occurrence.
    pub fn new(service: impl Into<String>, urls: Vec<String>) -> Result<Self, HaError> {
        let service = service.into();
        let urls = dedupe(urls);
        if urls.is_empty() {
            return Err(HaError::EmptyPool(service));
        }
        Ok(Self {
            service,
            urls: Mutex::new(urls),
        })
    }

    /// Returns the active URL.
    pub fn active_url(&self) -> Result<String, HaError> {
        self.urls
            .lock()
            .front()
            .cloned()
            .ok_or_else(|| HaError::NoActiveUrl(self.service.clone()))
    }

    /// Reports `url` as failed. Rotates only when `url` is the active URL,
    /// so stale or unknown reports change nothing. Returns whether the
    /// pool rotated.
    pub fn mark_failed(&self, url: &str) -> bool {
        let mut urls = self.urls.lock();
        if urls.front().map(String::as_str) != Some(url) {
            debug!(service = %self.service, url = %url, "Ignoring failure report for inactive URL");
            return false;
        }
        urls.rotate_left(1);
        if let Some(next) = urls.front() {
            info!(service = %self.service, failed = %url, active = %next, "Failed over to next URL");
        }
        true
    }

    /// Makes a known `url` active, keeping the order of the others.
    /// Unknown URLs are ignored.
    pub fn set_active(&self, url: &str) -> bool {
        let mut urls = self.urls.lock();
        match urls.iter().position(|u| u == url) {
            Some(0) => true,
            Some(idx) => {
                if let Some(found) = urls.remove(idx) {
                    urls.push_front(found);
                }
                true
            }
            None => false,
        }
    }

    /// Rotates unconditionally and returns the URL that was active.
    pub fn advance(&self) -> Result<String, HaError> {
        let mut urls = self.urls.lock();
        let current = urls
            .front()
            .cloned()
            .ok_or_else(|| HaError::NoActiveUrl(self.service.clone()))?;
        urls.rotate_left(1);
        Ok(current)
    }

    /// Returns the URLs in failover order, active first.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().iter().cloned().collect()
    }
}

fn dedupe(urls: Vec<String>) -> VecDeque<String> {
    let mut out: VecDeque<String> = VecDeque::with_capacity(urls.len());
    for url in urls {
        if !out.contains(&url) {
            out.push_back(url);
        }
    }
    out
}
