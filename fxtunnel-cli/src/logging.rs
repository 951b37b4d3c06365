// Logging initialization from the [logging] config section

use fxtunnel_config::LoggingConfig;
use tracing_appender::non_blocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the tracing subscriber based on configuration
pub fn initialize_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let enable_file = config.output_mode == "both" || config.output_mode == "file";
    let enable_console = config.output_mode == "both" || config.output_mode == "console";

    if enable_file {
        std::fs::create_dir_all(&config.logs_directory)?;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    let file_layer = if enable_file {
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("fxtunnel")
            .filename_suffix("log")
            .build(&config.logs_directory)?;
        let (writer, guard) = non_blocking(appender);
        // The guard must outlive the process for the writer to keep flushing
        std::mem::forget(guard);

        let layer = if config.format == "json" {
            fmt::layer().json().with_ansi(false).with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        };
        Some(layer)
    } else {
        None
    };

    let console_layer = if enable_console {
        let layer = if config.format == "json" {
            fmt::layer().json().with_ansi(false).with_writer(std::io::stdout).boxed()
        } else {
            fmt::layer().with_writer(std::io::stdout).boxed()
        };
        Some(layer)
    } else {
        None
    };

    registry.with(file_layer).with(console_layer).init();

    tracing::info!(
        level = %config.level,
        format = %config.format,
        output_mode = %config.output_mode,
        "logging initialized"
    );
    Ok(())
}
