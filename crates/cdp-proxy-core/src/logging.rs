//! Tracing subscriber bootstrap for hosts embedding the proxy.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Build the filter: `RUST_LOG` wins, otherwise the configured level plus per-crate overrides.
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let mut directives = vec![config.level.clone().unwrap_or_else(|| "info".to_string())];
    directives.extend(config.filters.iter().cloned());
    EnvFilter::try_new(directives.join(",")).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a global fmt subscriber. Returns `false` if one was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = build_filter(config);
    let json = config.format == "json";
    let stdout = config.output == "stdout";

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).try_init(),
        (true, false) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, true) => builder.with_writer(std::io::stdout).try_init(),
        (false, false) => builder.with_writer(std::io::stderr).try_init(),
    };
    result.is_ok()
}
