use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn base_level(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn build_env_filter(level: &str) -> EnvFilter {
    let base_level = base_level(level);
    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new(base_level))
    } else {
        EnvFilter::new(format!(
            "{base_level},hyper=warn,hyper_util=warn,reqwest=warn,rusqlite=warn"
        ))
    }
}

/// Installs the stderr subscriber. Later calls are no-ops.
pub fn init(level: &str) {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let _ = tracing_subscriber::registry()
        .with(build_env_filter(level))
        .with(fmt_layer)
        .try_init();
}
