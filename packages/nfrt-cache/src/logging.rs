//! Optional `tracing` subscriber construction for hosts and integration
//! tests. The crate never installs a subscriber on its own; composing one is
//! the host's job.

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer as _, fmt};

/// Build the default subscriber: human-readable formatting, filtered by the
/// `NFRT_CACHE_LOG` environment variable, with span-capture wired up for
/// `color_eyre` backtraces.
pub fn subscriber() -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::registry().with(ErrorLayer::default()).with(
        fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_filter(EnvFilter::builder().with_env_var("NFRT_CACHE_LOG").from_env_lossy()),
    )
}

/// Install the default subscriber as the process-global default. Idempotent;
/// intended for small hosts and for this crate's own integration tests.
pub fn install() {
    let _ = subscriber().try_init();
}
