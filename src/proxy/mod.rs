//! HTTP request routing and proxying.
//!
//! Routes incoming requests to a topology service by path and runs them
//! through the rewrite and HA dispatch pipeline on Pingora.

mod gateway;
mod router;

pub use gateway::{GatewayCtx, GatewayProxy};
pub use router::ServiceRouter;
