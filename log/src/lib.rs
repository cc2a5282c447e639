use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the process-wide tracing subscriber: an env-filtered,
/// non-blocking stderr layer and, when `file_dir` is given, a daily rolling
/// file layer next to it. `RUST_LOG` overrides the INFO default.
pub fn init(file_dir: Option<&Path>) {
    let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    std::mem::forget(guard);

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(stderr)
        .compact();

    let file_layer = file_dir.map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "argus.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        std::mem::forget(guard);
        tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
