//! HTTP surface: configuration, middleware, handlers, and shutdown control.

pub mod auth;
pub mod config;
pub mod downstream;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use auth::Authenticated;
pub use config::*;
pub use downstream::GatewayClient;
pub use handlers::{AppState, GatewayContext, RelayContext};
pub use module::NetworkModule;
pub use shutdown::*;
