//! Tracing initialization for the facilitator server.

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Initializes the global tracing subscriber.
///
/// Verbosity is controlled with `RUST_LOG`; the default keeps this crate at
/// `info` and quiets the HTTP stack.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn,hyper=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Request/response tracing for the HTTP surface.
pub fn http_tracing()
-> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>>
{
    TraceLayer::new_for_http()
}
