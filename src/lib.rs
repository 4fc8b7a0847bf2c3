//! Tandem node: distributed token bucket rate limiting behind an HTTP API.
//!
//! The limiter itself lives in [`tandem_ratelimit`]; the request and realtime
//! boundaries in [`tandem_gate`]. This crate wires them to configuration and
//! an axum router for the `tandem-node` binary.

pub mod config;
pub mod server;

pub use config::API_SCOPE;
pub use config::CHAT_SEND_SCOPE;
pub use config::ConfigError;
pub use config::NodeConfig;
pub use config::ScopePolicy;
pub use config::StoreBackend;
pub use config::load_config;
pub use server::LimiterRegistry;
pub use server::ServerError;
pub use server::build_router;
pub use server::build_store;
