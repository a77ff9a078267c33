use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Ensure initialization happens only once
static INIT: Once = Once::new();

/// Initialize the logging system with sensible defaults.
///
/// Log level can be set using the RUST_LOG environment variable.
/// Example: RUST_LOG=debug,ratelimit_engine=trace
///
/// Set `RATE_LIMITER_LOG_FORMAT=json` for one JSON object per line.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let json = std::env::var("RATE_LIMITER_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let registry = tracing_subscriber::registry().with(filter);
        if json {
            registry
                .with(fmt::layer().json().with_current_span(false))
                .init();
        } else {
            registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true) // Useful for debugging concurrency issues
                        .with_line_number(true),
                )
                .init();
        }

        tracing::info!("Logging initialized");
    });
}

/// Macro for logging rate limiting decisions
#[macro_export]
macro_rules! decision_event {
    ($decision:expr) => {
        tracing::debug!(
            identifier = %$decision.identifier,
            strategy = %$decision.strategy,
            tier = ?$decision.tier,
            allowed = $decision.allowed,
            remaining = $decision.remaining,
            limit = $decision.limit,
            bypassed = $decision.bypassed,
            "Rate limit decision"
        )
    };
}

/// Macro for logging storage operations with timing
#[macro_export]
macro_rules! storage_op {
    ($operation:expr, $key:expr, $result:expr, $elapsed_ms:expr) => {
        tracing::debug!(
            operation = $operation,
            key = $key,
            success = $result.is_ok(),
            elapsed_ms = $elapsed_ms,
            "Storage operation"
        )
    };
}
