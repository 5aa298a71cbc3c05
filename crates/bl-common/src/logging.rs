//! Logging setup shared by the Batchline binaries
//!
//! `LOG_FORMAT=json` switches to flattened JSON events with file, line and
//! span list; any other value gives human-readable text. `RUST_LOG` filters
//! as usual and defaults to `info`, e.g. `RUST_LOG=bl_relay=debug`.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize logging for the given service.
///
/// Reads LOG_FORMAT to pick JSON or text output and RUST_LOG for filtering.
/// Calling it twice is harmless: the second installation attempt is ignored.
pub fn init_logging(service_name: &str) {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();

    let json = log_format.eq_ignore_ascii_case("json");
    let installed = if json {
        init_json_logging(default_filter())
    } else {
        init_text_logging(default_filter())
    };

    if installed {
        tracing::debug!(service = service_name, json, "Logging initialized");
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_json_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(false)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .try_init()
        .is_ok()
}

fn init_text_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true),
        )
        .try_init()
        .is_ok()
}
