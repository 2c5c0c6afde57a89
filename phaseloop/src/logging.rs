//! Diagnostic tracing for the loop.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG` or `-v`, written to
//!   stderr. Not persisted.
//!
//! - **Status sinks (`io/status_sink`)**: product artifacts in `.phaseloop/`
//!   (`status.json`, `history.jsonl`). Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `verbosity` (the count of `-v` flags)
/// selects `warn`, `info`, `debug` or `trace` for this workspace's crates.
///
/// # Example
/// ```bash
/// RUST_LOG=phaseloop=debug phaseloop run --prompt "add a parser"
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

fn default_directive(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    if verbosity == 0 {
        level.to_string()
    } else {
        format!("warn,phaseloop={level},phaseloop_ui={level}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_crate_directives() {
        assert_eq!(default_directive(0), "warn");
        assert_eq!(default_directive(1), "warn,phaseloop=info,phaseloop_ui=info");
        assert_eq!(default_directive(5), "warn,phaseloop=trace,phaseloop_ui=trace");
    }
}
