use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

const ENV_DEBUG: &str = "BENCHSINK_DEBUG";

/// Panic hook to send panic info to `tracing` instead of stderr.
///
/// A panicking reporter kills the consume loop task. The output still tears down and the driver
/// sees the stopped signal, but without the hook the panic message itself goes to stderr as a
/// multi-line block next to the JSON log lines:
/// ```text
/// {"timestamp":"...","level":"INFO","message":"Starting consume loop","output":"bench"}
///
/// thread 'tokio-runtime-worker' panicked at src/my_measure.rs:42:9:
/// called `Result::unwrap()` on an `Err` value: Closed
/// ```
///
/// With the hook it is a single structured error event:
/// ```text
/// {"timestamp":"...","level":"ERROR","message":"src/my_measure.rs:42:9: called `Result::unwrap()` on an `Err` value: Closed"}
/// ```
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    // noop unless RUST_BACKTRACE or RUST_LIB_BACKTRACE is set
    let backtrace = Backtrace::capture();
    let backtrace_captured = backtrace.status() == BacktraceStatus::Captured;

    // location() always returns Some today, the fallback covers future versions
    match (
        panic_info.location(),
        panic_payload(panic_info.payload()),
        backtrace_captured,
    ) {
        (Some(location), Some(payload), false) => {
            tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload,
            );
        }
        _ => {
            tracing::error!("{}\n{}", panic_info, backtrace);
        }
    };
}

/// `panic!("literal")` carries a `&str`, formatted panics carry a `String`.
fn panic_payload(payload: &(dyn Any + Send)) -> Option<&str> {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
}

fn is_debug_mode(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Log level used when RUST_LOG is not set.
fn default_log_level(debug_mode: bool) -> &'static str {
    if debug_mode { "debug" } else { "info" }
}

/// Installs the global subscriber. RUST_LOG overrides the filter. With BENCHSINK_DEBUG=true the
/// output is plain text at `debug`, otherwise flattened JSON at `info`.
pub fn register() {
    let debug_mode = is_debug_mode(std::env::var(ENV_DEBUG).ok().as_deref());

    let filter = EnvFilter::builder()
        .with_default_directive(
            default_log_level(debug_mode)
                .parse()
                .unwrap_or(Level::INFO.into()),
        )
        .from_env_lossy();

    let layer = if debug_mode {
        fmt::layer().boxed()
    } else {
        // one JSON object per event, span and event fields at the top level
        fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(report_panic));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_mode_switch() {
        assert!(is_debug_mode(Some("true")));
        assert!(is_debug_mode(Some("TRUE")));
        assert!(!is_debug_mode(Some("1")));
        assert!(!is_debug_mode(Some("")));
        assert!(!is_debug_mode(None));

        assert_eq!(default_log_level(true), "debug");
        assert_eq!(default_log_level(false), "info");
    }

    #[test]
    fn test_panic_payload() {
        let literal: Box<dyn Any + Send> = Box::new("reporter gone");
        assert_eq!(panic_payload(literal.as_ref()), Some("reporter gone"));

        let formatted: Box<dyn Any + Send> = Box::new(format!("window {}", 3));
        assert_eq!(panic_payload(formatted.as_ref()), Some("window 3"));

        let other: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_payload(other.as_ref()), None);
    }
}
