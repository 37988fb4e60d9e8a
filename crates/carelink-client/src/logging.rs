use tracing_subscriber::{fmt, EnvFilter};

/// Initialise structured logging for an embedding application.
///
/// Honors `RUST_LOG`; defaults to debug for the chat crates and warn for
/// everything else. Call at most once per process.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("carelink_client=debug,carelink_net=debug,carelink_store=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
