//! Request dispatch pipeline for the gangway sidecar proxy.
//!
//! The pipeline, in request order:
//!
//! ```text
//!   client ──▶ dispatcher ──▶ routing ──▶ rate limit ──▶ resolver
//!                  │                                        │
//!                  │               endpoints ◀──────────────┘
//!                  ▼
//!              balancer (consults breaker + health + cooldown)
//!                  │
//!                  ▼
//!              transport (pooled client, bounded retries)
//!                  │
//!                  ▼
//!              classification ──▶ breaker feedback + telemetry
//! ```
//!
//! The health monitor runs beside the request path as a single background
//! task and only mutates health state; everything else shares the
//! balancer's registry under its lock.

pub mod balancer;
pub mod breaker;
pub mod dispatcher;
pub mod health;
pub mod routing;
pub mod server;
pub mod transport;

pub use balancer::{Balancer, BalancerConfig};
pub use dispatcher::ProxyContext;
pub use health::{HealthConfig, HealthMonitor};
pub use server::ProxyServer;
pub use transport::{RetryPolicy, UpstreamClient};
