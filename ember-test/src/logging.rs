//! Logging during tests.

use std::{future::Future, io::Write};

use tokio::runtime::RuntimeFlavor;
use tracing::instrument::WithSubscriber;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "ember=debug,ember_prolly=info,warn";

/// Configures logging for the current test, **single-threaded runtime only**.
///
/// Logs are captured by the test harness and only shown for failing tests. Tests running
/// on a multi-threaded runtime should use [`with_logging`] instead, a thread local default
/// would miss events emitted from worker threads.
///
/// # Example
///
/// ```
/// #[tokio::test]
/// async fn test_something() {
///     let _guard = ember_test::logging::setup();
///     assert!(true);
/// }
/// ```
#[must_use = "The tracing guard must only be dropped at the end of the test"]
pub fn setup() -> tracing::subscriber::DefaultGuard {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        if !matches!(handle.runtime_flavor(), RuntimeFlavor::CurrentThread) {
            panic!("logging::setup() only works on a current-thread runtime, use with_logging");
        }
    }
    testing_subscriber().set_default()
}

/// Runs `fut` with the test subscriber attached, on any runtime flavor.
pub async fn with_logging<F: Future>(fut: F) -> F::Output {
    fut.with_subscriber(testing_subscriber()).await
}

/// Returns the [`tracing::Subscriber`] used by [`setup`] and [`with_logging`].
///
/// `RUST_LOG` overrides the default filter.
pub fn testing_subscriber() -> impl tracing::Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .event_format(tracing_subscriber::fmt::format().with_line_number(true))
            .with_writer(|| TestWriter)
            .with_filter(filter),
    )
}

/// A tracing writer that goes through `print!`, so the test harness captures it.
#[derive(Debug)]
struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        print!("{}", String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()
    }
}
