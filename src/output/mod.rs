//! Output formatting and display system
//!
//! Renders a finished [`SpeedTestResult`] and the live progress stream for a
//! terminal, either colored or plain, or as JSON for scripts.

mod colored;
mod formatter;

pub use colored::{ColorScheme, ColoredFormatter, PerformanceLevel};
pub use formatter::{
    format_latency, format_percentage, format_rate, progress_unit, Alignment, Column,
    FormattingOptions, OutputFormatter, PlainFormatter, RowData, TableFormat,
};

use crate::{
    error::{AppError, Result},
    models::{ProgressEvent, SpeedTestResult},
    types::EngineState,
};

/// Output formatting factory for creating appropriate formatters
pub struct OutputFormatterFactory;

impl OutputFormatterFactory {
    /// Create a formatter based on color support and preferences
    pub fn create_formatter(enable_color: bool, verbose: bool) -> Box<dyn OutputFormatter> {
        let options = FormattingOptions {
            enable_color,
            verbose_mode: verbose,
            ..FormattingOptions::default()
        };

        if enable_color {
            Box::new(ColoredFormatter::new(options))
        } else {
            Box::new(PlainFormatter::new(options))
        }
    }

    /// Create a plain text formatter for scripts/logs
    pub fn create_plain_formatter() -> Box<dyn OutputFormatter> {
        Self::create_formatter(false, true)
    }
}

/// Pretty-printed JSON of the result record
pub fn format_json(result: &SpeedTestResult) -> Result<String> {
    serde_json::to_string_pretty(result)
        .map_err(|e| AppError::internal(format!("Failed to serialize result: {}", e)))
}

/// Main output coordinator that handles all result display
pub struct OutputCoordinator {
    formatter: Box<dyn OutputFormatter>,
    verbose: bool,
}

impl OutputCoordinator {
    pub fn new(formatter: Box<dyn OutputFormatter>, verbose: bool) -> Self {
        Self { formatter, verbose }
    }

    pub fn for_console(enable_color: bool, verbose: bool) -> Self {
        Self::new(OutputFormatterFactory::create_formatter(enable_color, verbose), verbose)
    }

    /// Header, headline numbers and, in verbose mode, the details block
    pub fn display_result(&self, result: &SpeedTestResult) -> Result<String> {
        let mut output = String::new();

        output.push_str(&self.formatter.format_header("Speed Test Results")?);
        output.push_str("\n\n");
        output.push_str(&self.formatter.format_result(result)?);

        if self.verbose {
            output.push_str("\n\n");
            output.push_str(&self.formatter.format_details(result)?);
        }

        Ok(output)
    }

    pub fn display_progress(&self, event: &ProgressEvent) -> String {
        self.formatter.format_progress(event)
    }

    pub fn display_state(&self, state: EngineState) -> String {
        self.formatter.format_state(state)
    }

    pub fn display_error(&self, error: &AppError) -> Result<String> {
        self.formatter.format_error(&error.user_friendly_message())
    }

    pub fn display_warning(&self, warning: &str) -> Result<String> {
        self.formatter.format_warning(warning)
    }

    pub fn display_success(&self, message: &str) -> Result<String> {
        self.formatter.format_success(message)
    }
}

/// Result shaped like the reference scenario: 106 Mbps down, 1 of 50
/// probes lost, bufferbloat rated C
#[cfg(test)]
pub(crate) fn test_result() -> SpeedTestResult {
    use crate::models::{BufferbloatResult, DegradedPhases, PacketLossStats, ProtocolOverhead};
    use crate::types::TransportKind;

    SpeedTestResult {
        id: uuid::Uuid::nil(),
        timestamp: chrono::DateTime::from_timestamp(0, 0).unwrap_or_default(),
        download_mbps: 106.0,
        upload_mbps: 42.5,
        ping_ms: 10.2,
        jitter_ms: 1.3,
        test_duration_s: 27.4,
        bufferbloat: Some(BufferbloatResult::from_latencies(10.0, 70.0)),
        packet_loss: PacketLossStats::from_counts(50, 49),
        protocol_overhead: ProtocolOverhead::new(false, 1.06),
        stability: None,
        server: "http://127.0.0.1:3000".to_string(),
        transport: TransportKind::Streaming,
        degraded: DegradedPhases::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StabilityMetrics;

    #[test]
    fn test_plain_display_result() {
        let coordinator = OutputCoordinator::new(OutputFormatterFactory::create_formatter(false, false), false);
        let output = coordinator.display_result(&test_result()).unwrap();
        assert!(output.contains("Speed Test Results"));
        assert!(output.contains("106.0 Mbps"));
        assert!(!output.contains("Details:"));
    }

    #[test]
    fn test_verbose_display_includes_details() {
        let mut result = test_result();
        result.stability = Some(StabilityMetrics {
            score: 91.0,
            variance: 4.5,
            sample_count: 32,
        });
        let output = OutputCoordinator::new(OutputFormatterFactory::create_plain_formatter(), true)
            .display_result(&result)
            .unwrap();
        assert!(output.contains("Details:"));
        assert!(output.contains("91/100 (variance 4.50, 32 samples)"));
        assert!(output.contains("Loaded latency"));
        assert!(output.contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_json_uses_camel_case() {
        let json = format_json(&test_result()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["downloadMbps"], 106.0);
        assert_eq!(value["packetLoss"]["sent"], 50);
        assert_eq!(value["bufferbloat"]["rating"], "C");
        assert_eq!(value["transport"], "streaming");
        assert!(value.get("stability").is_none());
    }

    #[test]
    fn test_error_display_uses_friendly_message() {
        let coordinator = OutputCoordinator::for_console(false, false);
        let error = AppError::config("bad duration");
        let output = coordinator.display_error(&error).unwrap();
        assert!(output.starts_with("ERROR: "));
        assert_eq!(output, format!("ERROR: {}", error.user_friendly_message()));
    }
}
