//! Logging system configuration and initialization
//!
//! Sets up a tracing subscriber with console output and optional rolling
//! file output. Noisy dependency modules are suppressed below `trace`
//! level unless overridden via config or `RUST_LOG`.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_appender::non_blocking;
use tracing_subscriber::{
    EnvFilter, Registry,
    layer::{Layer, Layered, SubscriberExt},
    util::SubscriberInitExt,
};

pub use crate::config::LoggingConfig;

type BaseSubscriber = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<BaseSubscriber> + Send + Sync + 'static>;

// Keeps the non-blocking file writers alive for the process lifetime.
static LOG_GUARDS: Lazy<Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Log directory next to the executable, mirroring where the config lives.
pub fn default_log_directory() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    exe_dir.join("logs")
}

/// Initialize logging with default configuration.
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Initialize logging with custom configuration.
///
/// `RUST_LOG` overrides the configured filter entirely when set.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().context("Invalid RUST_LOG filter")?
    } else {
        build_env_filter(config)?
    };

    let console_layer: Option<BoxedLayer> = if config.console_output {
        if config.json_format {
            Some(tracing_subscriber::fmt::layer().json().boxed())
        } else {
            Some(tracing_subscriber::fmt::layer().boxed())
        }
    } else {
        None
    };

    let file_layer: Option<BoxedLayer> = if config.file_output {
        let dir = config
            .file_dir
            .clone()
            .unwrap_or_else(default_log_directory);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

        let appender = tracing_appender::rolling::daily(&dir, "pricescout.log");
        let (writer, guard) = non_blocking(appender);
        LOG_GUARDS
            .lock()
            .expect("log guard mutex poisoned")
            .push(guard);

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
        )
    } else {
        None
    };

    let layers: Vec<BoxedLayer> = [console_layer, file_layer]
        .into_iter()
        .flatten()
        .collect();

    Registry::default()
        .with(filter)
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let mut directives = vec![config.level.clone()];

    // Browser automation and websocket internals are extremely chatty on
    // debug; keep them quiet unless the whole app runs on trace.
    if config.level != "trace" {
        directives.push("chromiumoxide=warn".to_string());
        directives.push("tungstenite=warn".to_string());
        directives.push("hyper=warn".to_string());
    }

    for (module, level) in &config.module_filters {
        directives.push(format!("{module}={level}"));
    }

    EnvFilter::try_new(directives.join(","))
        .with_context(|| format!("Invalid log filter built from level '{}'", config.level))
}
