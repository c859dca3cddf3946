//! Colored formatter implementation with terminal color support
//!
//! Rates and latencies are tinted by how good they are, bufferbloat by its
//! grade. Layout is the same as the plain formatter.

use super::formatter::{
    bar_cells, detail_rows, format_latency, format_rate, phase_label, progress_unit, state_label,
    OutputFormatter, FormattingOptions,
};
use crate::{
    error::Result,
    models::{BufferbloatRating, ProgressEvent, SpeedTestResult},
    types::{EngineState, TestPhase},
};
use colored::*;

/// Performance level classification for color coding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    VeryPoor,
}

impl PerformanceLevel {
    /// Thresholds in Mbps: 500, 100, 25, 5
    pub fn from_rate(mbps: f64) -> Self {
        if mbps >= 500.0 {
            Self::Excellent
        } else if mbps >= 100.0 {
            Self::Good
        } else if mbps >= 25.0 {
            Self::Fair
        } else if mbps >= 5.0 {
            Self::Poor
        } else {
            Self::VeryPoor
        }
    }

    /// Thresholds in milliseconds: 20, 50, 100, 200
    pub fn from_latency(ms: f64) -> Self {
        if ms < 20.0 {
            Self::Excellent
        } else if ms < 50.0 {
            Self::Good
        } else if ms < 100.0 {
            Self::Fair
        } else if ms < 200.0 {
            Self::Poor
        } else {
            Self::VeryPoor
        }
    }

    pub fn from_loss(percentage: f64) -> Self {
        if percentage == 0.0 {
            Self::Excellent
        } else if percentage < 1.0 {
            Self::Good
        } else if percentage < 2.5 {
            Self::Fair
        } else if percentage < 10.0 {
            Self::Poor
        } else {
            Self::VeryPoor
        }
    }

    pub fn from_rating(rating: BufferbloatRating) -> Self {
        match rating {
            BufferbloatRating::A => Self::Excellent,
            BufferbloatRating::B => Self::Good,
            BufferbloatRating::C => Self::Fair,
            BufferbloatRating::D => Self::Poor,
            BufferbloatRating::F => Self::VeryPoor,
        }
    }

    /// Get color for this performance level
    pub fn color(&self) -> Color {
        match self {
            Self::Excellent => Color::Green,
            Self::Good => Color::Cyan,
            Self::Fair => Color::Yellow,
            Self::Poor => Color::Magenta,
            Self::VeryPoor => Color::Red,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Excellent => "●",
            Self::Good => "●",
            Self::Fair => "◐",
            Self::Poor => "○",
            Self::VeryPoor => "✗",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Excellent => "Excellent",
            Self::Good => "Good",
            Self::Fair => "Fair",
            Self::Poor => "Poor",
            Self::VeryPoor => "Very Poor",
        }
    }
}

/// Color scheme configuration
#[derive(Debug, Clone)]
pub struct ColorScheme {
    pub header: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
    pub info: Color,
    pub muted: Color,
    pub border: Color,
}

impl Default for ColorScheme {
    fn default() -> Self {
        Self {
            header: Color::Blue,
            success: Color::Green,
            warning: Color::Yellow,
            error: Color::Red,
            info: Color::Cyan,
            muted: Color::BrightBlack,
            border: Color::BrightBlack,
        }
    }
}

/// Colored formatter implementation
pub struct ColoredFormatter {
    options: FormattingOptions,
    color_scheme: ColorScheme,
}

impl ColoredFormatter {
    pub fn new(options: FormattingOptions) -> Self {
        Self {
            options,
            color_scheme: ColorScheme::default(),
        }
    }

    pub fn with_color_scheme(options: FormattingOptions, color_scheme: ColorScheme) -> Self {
        Self {
            options,
            color_scheme,
        }
    }

    fn colorize(&self, text: &str, color: Color) -> ColoredString {
        if self.options.enable_color {
            text.color(color)
        } else {
            text.normal()
        }
    }

    fn leveled(&self, text: &str, level: PerformanceLevel) -> String {
        format!("{} {}", self.colorize(level.symbol(), level.color()), self.colorize(text, level.color()).bold())
    }

    fn label(&self, text: &str) -> String {
        format!("{:<12}", text).bold().to_string()
    }

    fn line(&self, label: &str, value: String) -> String {
        format!("  {} {}", self.label(label), value)
    }
}

impl OutputFormatter for ColoredFormatter {
    fn format_header(&self, title: &str) -> Result<String> {
        let border = "═".repeat(title.chars().count() + 4);
        Ok(format!(
            "{}\n  {}  \n{}",
            self.colorize(&border, self.color_scheme.border),
            self.colorize(title, self.color_scheme.header).bold(),
            self.colorize(&border, self.color_scheme.border)
        ))
    }

    fn format_result(&self, result: &SpeedTestResult) -> Result<String> {
        let mut lines = vec![
            self.line(
                "Download",
                self.leveled(&format_rate(result.download_mbps), PerformanceLevel::from_rate(result.download_mbps)),
            ),
            self.line(
                "Upload",
                self.leveled(&format_rate(result.upload_mbps), PerformanceLevel::from_rate(result.upload_mbps)),
            ),
            self.line(
                "Ping",
                self.leveled(&format_latency(result.ping_ms), PerformanceLevel::from_latency(result.ping_ms)),
            ),
            self.line(
                "Jitter",
                self.leveled(&format_latency(result.jitter_ms), PerformanceLevel::from_latency(result.jitter_ms * 4.0)),
            ),
            self.line(
                "Packet loss",
                format!(
                    "{} {}",
                    self.leveled(
                        &format!("{:.1}%", result.packet_loss.percentage),
                        PerformanceLevel::from_loss(result.packet_loss.percentage)
                    ),
                    self.colorize(
                        &format!("({}/{} lost)", result.packet_loss.lost(), result.packet_loss.sent),
                        self.color_scheme.muted
                    )
                ),
            ),
        ];

        if let Some(bufferbloat) = &result.bufferbloat {
            let level = PerformanceLevel::from_rating(bufferbloat.rating);
            lines.push(self.line(
                "Bufferbloat",
                format!(
                    "{} {}",
                    self.leveled(&format!("{} {}", bufferbloat.rating, bufferbloat.rating.description()), level),
                    self.colorize(
                        &format!("(+{} under load)", format_latency(bufferbloat.latency_increase_ms)),
                        self.color_scheme.muted
                    )
                ),
            ));
        }

        lines.push(self.line(
            "Server",
            self.colorize(&format!("{} via {}", result.server, result.transport), self.color_scheme.info)
                .to_string(),
        ));
        lines.push(self.line(
            "Duration",
            self.colorize(&format!("{:.1}s", result.test_duration_s), self.color_scheme.muted)
                .to_string(),
        ));

        if result.is_degraded() {
            lines.push(String::new());
            lines.push(
                self.colorize(
                    "⚠ Some phases fell back to placeholder values; run with --verbose for details",
                    self.color_scheme.warning,
                )
                .to_string(),
            );
        }

        Ok(lines.join("\n"))
    }

    fn format_details(&self, result: &SpeedTestResult) -> Result<String> {
        let mut lines = vec![self.colorize("Details", self.color_scheme.header).bold().to_string()];
        for row in detail_rows(result) {
            if let [label, value] = row.as_slice() {
                let value = if label == "Degraded phases" && value != "none" {
                    self.colorize(value, self.color_scheme.warning).to_string()
                } else {
                    value.clone()
                };
                lines.push(self.line(label, value));
            }
        }
        Ok(lines.join("\n"))
    }

    fn format_progress(&self, event: &ProgressEvent) -> String {
        let (filled, empty) = bar_cells(event.progress_percent, self.options.bar_width);
        let level = match event.phase {
            TestPhase::Download | TestPhase::Upload => PerformanceLevel::from_rate(event.current_value),
            TestPhase::Latency | TestPhase::Bufferbloat => PerformanceLevel::from_latency(event.current_value),
            TestPhase::PacketLoss => PerformanceLevel::from_loss(event.current_value),
        };

        format!(
            "{:<12} {}{} {:>5.1}%  {}",
            phase_label(event.phase).bold(),
            self.colorize(&"█".repeat(filled), level.color()),
            self.colorize(&"░".repeat(empty), self.color_scheme.muted),
            event.progress_percent,
            self.colorize(
                &format!("{:.1} {}", event.current_value, progress_unit(event.phase)),
                level.color()
            )
        )
    }

    fn format_state(&self, state: EngineState) -> String {
        let color = match state {
            EngineState::Complete => self.color_scheme.success,
            EngineState::Aborted => self.color_scheme.warning,
            EngineState::Failed => self.color_scheme.error,
            _ => self.color_scheme.info,
        };
        format!("{} {}", self.colorize("▸", color), self.colorize(state_label(state), color))
    }

    fn format_error(&self, error: &str) -> Result<String> {
        Ok(format!("{} {}", self.colorize("✗", self.color_scheme.error).bold(), self.colorize(error, self.color_scheme.error)))
    }

    fn format_warning(&self, warning: &str) -> Result<String> {
        Ok(format!("{} {}", self.colorize("⚠", self.color_scheme.warning).bold(), self.colorize(warning, self.color_scheme.warning)))
    }

    fn format_success(&self, message: &str) -> Result<String> {
        Ok(format!("{} {}", self.colorize("✓", self.color_scheme.success).bold(), self.colorize(message, self.color_scheme.success)))
    }
}
