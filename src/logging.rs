use chrono::Local;
use log::{LevelFilter, Metadata, Record, SetLoggerError};
use serde::Serialize;

use crate::config::LogFormat;

#[derive(Debug, Serialize, Clone)]
pub struct LogMessage {
    level: String,
    message: String,
    target: String,
    timestamp: String,
}

/// Writes log records to stderr so stdout stays free for session events
pub struct ConsoleLogger {
    level: LevelFilter,
    format: LogFormat,
}

impl ConsoleLogger {
    pub fn new(level: LevelFilter, format: LogFormat) -> Self {
        Self { level, format }
    }

    /// Installs the logger for the rest of the process
    pub fn init(level: LevelFilter, format: LogFormat) -> Result<(), SetLoggerError> {
        let logger: &'static ConsoleLogger = Box::leak(Box::new(ConsoleLogger::new(level, format)));
        log::set_logger(logger).map(|()| log::set_max_level(level))
    }

    fn render(&self, record: &Record) -> String {
        let log_message = LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            target: record.target().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };

        match self.format {
            LogFormat::Text => format!(
                "{} [{}] {}: {}",
                log_message.timestamp, log_message.level, log_message.target, log_message.message
            ),
            LogFormat::Json => serde_json::to_string(&log_message).unwrap_or_else(|e| {
                format!("[{}] {} (unserializable: {})", log_message.level, log_message.message, e)
            }),
        }
    }
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{}", self.render(record));
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn json_lines_carry_every_field() {
        let logger = ConsoleLogger::new(LevelFilter::Debug, LogFormat::Json);
        let line = logger.render(
            &Record::builder()
                .level(Level::Warn)
                .target("ble_inspector_lib::core")
                .args(format_args!("link lost"))
                .build(),
        );
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "WARN");
        assert_eq!(value["message"], "link lost");
        assert_eq!(value["target"], "ble_inspector_lib::core");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn level_filter_applies() {
        let logger = ConsoleLogger::new(LevelFilter::Info, LogFormat::Text);
        let debug = Metadata::builder().level(Level::Debug).build();
        let error = Metadata::builder().level(Level::Error).build();
        assert!(!log::Log::enabled(&logger, &debug));
        assert!(log::Log::enabled(&logger, &error));
    }
}
