//! High availability: endpoint pools and per-service failover settings.

mod config;
mod pool;
mod provider;

use thiserror::Error;

pub use config::HaServiceConfig;
pub use pool::EndpointPool;
pub use provider::HaProvider;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HaError {
    #[error("no active URL for service `{0}`")]
    NoActiveUrl(String),
    #[error("service `{0}` has no URLs")]
    EmptyPool(String),
    #[error("unknown HA service `{0}`")]
    UnknownService(String),
    #[error("invalid HA parameter `{key}` = `{value}`")]
    InvalidConfig { key: String, value: String },
}
