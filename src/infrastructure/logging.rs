use crate::domain::settings::LogSettings;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Keeps background log writers alive; drop it last so file logs are flushed.
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

/// Map a rotation name from the settings file. Unknown names rotate daily.
pub fn parse_rotation(name: &str) -> Rotation {
    match name.trim().to_lowercase().as_str() {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// `RUST_LOG` wins over the configured level.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    let console_layer = settings.console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(settings.source_location)
            .with_line_number(settings.source_location)
            .with_thread_ids(settings.thread_ids)
            .with_target(settings.target)
            .with_ansi(settings.ansi)
    });

    let file_layer = if settings.file {
        std::fs::create_dir_all(&settings.directory)?;
        let appender = RollingFileAppender::new(
            parse_rotation(&settings.rotation),
            &settings.directory,
            &settings.file_prefix,
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(settings.source_location)
                .with_line_number(settings.source_location)
                .with_thread_ids(settings.thread_ids)
                .with_target(settings.target),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(build_filter(&settings.level))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Logging initialized (level {}, file logging {})",
        settings.level,
        if settings.file { "on" } else { "off" }
    );

    Ok(LoggingGuard { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rotation() {
        assert_eq!(parse_rotation("Hourly"), Rotation::HOURLY);
        assert_eq!(parse_rotation(" never "), Rotation::NEVER);
        assert_eq!(parse_rotation("minutely"), Rotation::MINUTELY);
        assert_eq!(parse_rotation("weekly"), Rotation::DAILY);
    }
}
