//! Structured logging for the speed test engine and server
//!
//! Entries carry a level, the emitting component, an optional correlation id
//! (the run id for engine logs) and free-form structured fields. Output goes
//! to stderr in one of three formats so that machine-readable results written
//! to stdout are never interleaved with log lines.

use crate::error::{AppError, Result};
use crate::models::{ServerConfig, TestConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl LogLevel {
    /// Get log level name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// Level implied by the verbosity flags shared by every config type
    pub fn from_flags(verbose: bool, debug: bool) -> Self {
        if debug {
            LogLevel::Debug
        } else if verbose {
            LogLevel::Info
        } else {
            LogLevel::Warn
        }
    }

    fn paint(&self, text: &str) -> String {
        use colored::Colorize;
        match self {
            LogLevel::Trace => text.white().to_string(),
            LogLevel::Debug => text.cyan().to_string(),
            LogLevel::Info => text.green().to_string(),
            LogLevel::Warn => text.yellow().to_string(),
            LogLevel::Error => text.red().to_string(),
            LogLevel::Fatal => text.magenta().bold().to_string(),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "FATAL" => Ok(LogLevel::Fatal),
            _ => Err(AppError::parse(format!("Invalid log level: {}", s))),
        }
    }
}

/// Log entry structure for structured logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    /// Emitting component, e.g. `engine` or `server`
    pub logger: String,
    pub correlation_id: Option<String>,
    pub fields: HashMap<String, serde_json::Value>,
}

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable console format
    Console,
    /// One JSON object per line
    Json,
    /// Compact single-line format
    Compact,
}

#[derive(Debug, Default)]
struct LogContext {
    session_id: Option<String>,
    context_fields: HashMap<String, serde_json::Value>,
}

/// Cloneable logger; clones share the session context
#[derive(Debug, Clone)]
pub struct Logger {
    min_level: LogLevel,
    use_color: bool,
    format: LogFormat,
    name: String,
    context: Arc<RwLock<LogContext>>,
}

impl Logger {
    /// Create a new logger at Info level
    pub fn new(name: &str) -> Self {
        Self {
            min_level: LogLevel::Info,
            use_color: false,
            format: LogFormat::Console,
            name: name.to_string(),
            context: Arc::new(RwLock::new(LogContext::default())),
        }
    }

    /// Logger configured from verbosity flags: debug selects JSON output
    pub fn from_flags(name: &str, verbose: bool, debug: bool, use_color: bool) -> Self {
        Self {
            min_level: LogLevel::from_flags(verbose, debug),
            use_color,
            format: if debug { LogFormat::Json } else { LogFormat::Console },
            name: name.to_string(),
            context: Arc::new(RwLock::new(LogContext::default())),
        }
    }

    /// Logger for one engine run
    pub fn with_config(name: &str, config: &TestConfig) -> Self {
        Self::from_flags(name, config.verbose, config.debug, config.enable_color)
    }

    /// Logger for the server primitives
    pub fn for_server(config: &ServerConfig) -> Self {
        Self::from_flags("server", config.verbose, config.debug, false)
    }

    /// Same sinks and context under a different component name
    pub fn child(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    pub fn set_format(&mut self, format: LogFormat) {
        self.format = format;
    }

    pub fn level(&self) -> LogLevel {
        self.min_level
    }

    /// Set session correlation ID
    pub async fn set_session_id(&self, session_id: String) {
        let mut context = self.context.write().await;
        context.session_id = Some(session_id);
    }

    pub async fn session_id(&self) -> Option<String> {
        self.context.read().await.session_id.clone()
    }

    /// Add context field for all subsequent log entries
    pub async fn add_context_field<T: Serialize>(&self, key: &str, value: T) {
        if let Ok(json_value) = serde_json::to_value(value) {
            let mut context = self.context.write().await;
            context.context_fields.insert(key.to_string(), json_value);
        }
    }

    /// Start a correlated operation and return its id
    pub async fn start_operation(&self, operation_name: &str) -> String {
        let correlation_id = Uuid::new_v4().to_string();
        self.debug(&format!("Started operation: {}", operation_name))
            .correlation_id(&correlation_id)
            .field("operation", operation_name)
            .log()
            .await;
        correlation_id
    }

    pub fn log(&self, level: LogLevel, message: &str) -> LogEntryBuilder<'_> {
        LogEntryBuilder::new(self, level, message.to_string())
    }

    pub fn trace(&self, message: &str) -> LogEntryBuilder<'_> {
        self.log(LogLevel::Trace, message)
    }

    pub fn debug(&self, message: &str) -> LogEntryBuilder<'_> {
        self.log(LogLevel::Debug, message)
    }

    pub fn info(&self, message: &str) -> LogEntryBuilder<'_> {
        self.log(LogLevel::Info, message)
    }

    pub fn warn(&self, message: &str) -> LogEntryBuilder<'_> {
        self.log(LogLevel::Warn, message)
    }

    pub fn error(&self, message: &str) -> LogEntryBuilder<'_> {
        self.log(LogLevel::Error, message)
    }

    /// Check if a log level would be output
    pub fn would_log(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    async fn write_entry(&self, mut entry: LogEntry) {
        if !self.would_log(entry.level) {
            return;
        }

        let context = self.context.read().await;
        if entry.correlation_id.is_none() {
            entry.correlation_id = context.session_id.clone();
        }
        for (key, value) in &context.context_fields {
            entry.fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
        drop(context);

        let output = self.format_entry(&entry);
        let _ = writeln!(io::stderr(), "{}", output);
    }

    fn format_entry(&self, entry: &LogEntry) -> String {
        match self.format {
            LogFormat::Console => self.format_console(entry),
            LogFormat::Json => self.format_json(entry),
            LogFormat::Compact => self.format_compact(entry),
        }
    }

    fn format_console(&self, entry: &LogEntry) -> String {
        let timestamp = entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
        let level = format!("{:>5}", entry.level.as_str());
        let level = if self.use_color { entry.level.paint(&level) } else { level };

        let mut output = format!("{} {} [{}] {}", timestamp, level, entry.logger, entry.message);

        if let Some(correlation_id) = &entry.correlation_id {
            let short: String = correlation_id.chars().take(8).collect();
            output.push_str(&format!(" [{}]", short));
        }

        if !entry.fields.is_empty() {
            let mut fields: Vec<String> = entry
                .fields
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            fields.sort();
            output.push_str(&format!(" {{{}}}", fields.join(", ")));
        }

        output
    }

    fn format_json(&self, entry: &LogEntry) -> String {
        match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(_) => format!(
                "{{\"error\": \"Failed to serialize log entry\", \"message\": {:?}}}",
                entry.message
            ),
        }
    }

    fn format_compact(&self, entry: &LogEntry) -> String {
        let timestamp = entry.timestamp.format("%H:%M:%S");
        format!(
            "{} {} {}: {}",
            timestamp,
            entry.level.as_str().chars().next().unwrap_or('?'),
            entry.logger,
            entry.message
        )
    }
}

/// Builder pattern for creating log entries
pub struct LogEntryBuilder<'a> {
    logger: &'a Logger,
    entry: LogEntry,
}

impl<'a> LogEntryBuilder<'a> {
    fn new(logger: &'a Logger, level: LogLevel, message: String) -> Self {
        Self {
            logger,
            entry: LogEntry {
                timestamp: Utc::now(),
                level,
                message,
                logger: logger.name.clone(),
                correlation_id: None,
                fields: HashMap::new(),
            },
        }
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.entry.correlation_id = Some(id.to_string());
        self
    }

    /// Add a structured field
    pub fn field<T: Serialize>(mut self, key: &str, value: T) -> Self {
        if let Ok(json_value) = serde_json::to_value(value) {
            self.entry.fields.insert(key.to_string(), json_value);
        }
        self
    }

    /// Attach category and recoverability of an error
    pub fn error_info(self, error: &AppError) -> Self {
        self.field("error", error.to_string())
            .field("error_category", error.category())
            .field("error_recoverable", error.is_recoverable())
    }

    pub async fn log(self) {
        self.logger.write_entry(self.entry).await;
    }
}

/// Wall-clock timing of engine phases, logged at debug level
pub struct PhaseTimer {
    logger: Logger,
    started: HashMap<String, Instant>,
}

impl PhaseTimer {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger,
            started: HashMap::new(),
        }
    }

    pub async fn start(&mut self, phase: &str) {
        self.started.insert(phase.to_string(), Instant::now());
        self.logger
            .debug(&format!("Phase started: {}", phase))
            .field("phase", phase)
            .log()
            .await;
    }

    /// Stop timing a phase; `None` if it was never started
    pub async fn finish(&mut self, phase: &str) -> Option<std::time::Duration> {
        let Some(started) = self.started.remove(phase) else {
            self.logger
                .warn(&format!("Finished timing for unknown phase: {}", phase))
                .log()
                .await;
            return None;
        };

        let elapsed = started.elapsed();
        self.logger
            .debug(&format!("Phase finished: {} in {}ms", phase, elapsed.as_millis()))
            .field("phase", phase)
            .field("duration_ms", elapsed.as_millis() as u64)
            .log()
            .await;
        Some(elapsed)
    }

    pub fn active_phases(&self) -> usize {
        self.started.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: LogLevel) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level,
            message: "download phase started".to_string(),
            logger: "engine".to_string(),
            correlation_id: Some("0123456789abcdef".to_string()),
            fields: HashMap::from([("connections".to_string(), serde_json::json!(4))]),
        }
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Fatal);
    }

    #[test]
    fn test_levels_from_flags() {
        assert_eq!(LogLevel::from_flags(false, false), LogLevel::Warn);
        assert_eq!(LogLevel::from_flags(true, false), LogLevel::Info);
        assert_eq!(LogLevel::from_flags(true, true), LogLevel::Debug);
    }

    #[test]
    fn test_logger_with_config() {
        let config = TestConfig {
            debug: true,
            ..TestConfig::default()
        };
        let logger = Logger::with_config("engine", &config);
        assert_eq!(logger.level(), LogLevel::Debug);
        assert_eq!(logger.format, LogFormat::Json);
        assert!(logger.would_log(LogLevel::Debug));
        assert!(!logger.would_log(LogLevel::Trace));
    }

    #[tokio::test]
    async fn test_child_shares_session() {
        let logger = Logger::new("engine");
        let child = logger.child("download");
        logger.set_session_id("run-1".to_string()).await;
        assert_eq!(child.session_id().await.as_deref(), Some("run-1"));
        assert_eq!(child.name, "download");
    }

    #[test]
    fn test_log_formats() {
        let mut logger = Logger::new("engine");
        let console = logger.format_entry(&entry(LogLevel::Info));
        assert!(console.contains(" INFO [engine] download phase started"));
        assert!(console.contains("[01234567]"));
        assert!(console.contains("connections=4"));

        logger.set_format(LogFormat::Json);
        let json = logger.format_entry(&entry(LogLevel::Info));
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["level"], "Info");
        assert_eq!(parsed["fields"]["connections"], 4);

        logger.set_format(LogFormat::Compact);
        let compact = logger.format_entry(&entry(LogLevel::Warn));
        assert!(compact.contains(" W engine: download phase started"));
    }

    #[tokio::test]
    async fn test_log_entry_builder() {
        let logger = Logger::new("engine");
        let error = AppError::timeout("probe");
        let builder = logger
            .warn("probe failed")
            .field("attempt", 2)
            .error_info(&error);
        assert_eq!(builder.entry.fields["attempt"], 2);
        assert_eq!(builder.entry.fields["error_category"], "TIMEOUT");
        builder.log().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_timer() {
        let mut timer = PhaseTimer::new(Logger::new("engine"));
        timer.start("download").await;
        assert_eq!(timer.active_phases(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        let elapsed = timer.finish("download").await.unwrap();
        assert!(elapsed >= std::time::Duration::from_millis(250));
        assert!(timer.finish("download").await.is_none());
    }
}
