mod health;
pub mod shutdown;

pub use health::{is_ready, router, set_ready};

/// Start the liveness/readiness endpoints. Metrics are served by the
/// exporter installed when the config is loaded.
pub fn serve_all() {
    health::serve();
}
