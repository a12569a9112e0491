//! HTTP surface: the admission middleware, the security management API,
//! and the server that hosts them.

mod handlers;
mod middleware;
mod server;

pub use handlers::{security_routes, ApiError};
pub use middleware::{admission_middleware, client_ip, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING};
pub use server::HttpServer;

use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use crate::admission::AdmissionController;

/// Shared state for the middleware and management handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub controller: Arc<AdmissionController>,
    /// Resolve the client from `X-Forwarded-For` / `X-Real-IP` when set.
    pub trust_forwarded_headers: bool,
}

/// Build the full router: health probe, management API, and the caller's
/// business routes, all behind the admission middleware.
pub fn router(state: AppState, app: Router) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .merge(security_routes())
        .with_state(state.clone())
        .merge(app)
        .layer(axum::middleware::from_fn_with_state(
            state,
            admission_middleware,
        ))
}
