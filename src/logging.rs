//! Logging initialization and configuration.

use anyhow::Result;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{expand_home, Config};

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn timer() -> ChronoLocal {
    ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string())
}

/// Build a fmt layer in the configured format for `writer`.
fn format_layer<W>(cfg: &Config, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_timer(timer())
        .with_target(cfg.log.show_target);

    match cfg.log.format.to_lowercase().as_str() {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        _ => layer.boxed(),
    }
}

/// Initialize the logging system based on configuration.
///
/// `RUST_LOG` overrides the configured level. Events go to stderr so the
/// program output printed on stdout stays clean.
pub fn init_logging(cfg: &Config) -> Result<()> {
    let level = parse_log_level(&cfg.log.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dockjail={}", level)));

    let mut layers: Vec<BoxedLayer> = vec![format_layer(cfg, std::io::stderr, true)];

    let log_dir = cfg.log.dir.as_deref().map(expand_home);
    if let Some(dir) = &log_dir {
        std::fs::create_dir_all(dir)?;

        // File name: dockjail.yyyy-MM-dd.log or dockjail.yyyy-MM-dd.json
        let suffix = match cfg.log.format.to_lowercase().as_str() {
            "json" => "json",
            _ => "log",
        };
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("dockjail")
            .filename_suffix(suffix)
            .build(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create rolling file appender: {}", e))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        layers.push(format_layer(cfg, non_blocking, false));

        // The writer must outlive every event for the rest of the process.
        std::mem::forget(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install the tracing subscriber: {}", e))?;

    tracing::debug!(
        level = %cfg.log.level,
        format = %cfg.log.format,
        dir = ?log_dir,
        "Logging initialized"
    );

    Ok(())
}

/// Parse log level string to a filter directive.
fn parse_log_level(level_str: &str) -> Result<&'static str> {
    match level_str.to_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" => Ok("warn"),
        "error" => Ok("error"),
        _ => anyhow::bail!("Invalid log level: {}", level_str),
    }
}

/// Initialize simple logging for commands that don't load config.
pub fn init_simple_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dockjail=warn".into()),
        )
        .try_init();
}
