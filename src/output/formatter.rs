//! Core formatting traits and implementations
//!
//! This module defines the output formatting interface and provides
//! a plain text implementation with table formatting capabilities.

use crate::{
    error::{AppError, Result},
    models::{ProgressEvent, SpeedTestResult},
    types::{EngineState, TestPhase},
};
use std::fmt::Write as _;

/// Main trait for output formatting
pub trait OutputFormatter: Send + Sync {
    /// Format a header section
    fn format_header(&self, title: &str) -> Result<String>;

    /// Headline numbers of a finished run
    fn format_result(&self, result: &SpeedTestResult) -> Result<String>;

    /// Overhead, stability and degraded phases; shown in verbose mode
    fn format_details(&self, result: &SpeedTestResult) -> Result<String>;

    /// One-line live progress, redrawn in place by the host
    fn format_progress(&self, event: &ProgressEvent) -> String;

    fn format_state(&self, state: EngineState) -> String;

    fn format_error(&self, error: &str) -> Result<String>;

    fn format_warning(&self, warning: &str) -> Result<String>;

    fn format_success(&self, message: &str) -> Result<String>;
}

/// Configuration options for formatting
#[derive(Debug, Clone)]
pub struct FormattingOptions {
    pub enable_color: bool,
    pub verbose_mode: bool,
    pub table_borders: bool,
    /// Width of the progress bar in characters
    pub bar_width: usize,
}

impl Default for FormattingOptions {
    fn default() -> Self {
        Self {
            enable_color: true,
            verbose_mode: false,
            table_borders: true,
            bar_width: 20,
        }
    }
}

/// Table formatting configuration
#[derive(Debug, Clone)]
pub struct TableFormat {
    pub columns: Vec<Column>,
    pub show_borders: bool,
    pub show_header: bool,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub header: String,
    pub alignment: Alignment,
    pub min_width: usize,
}

impl Column {
    pub fn new(header: &str, alignment: Alignment, min_width: usize) -> Self {
        Self {
            header: header.to_string(),
            alignment,
            min_width,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Alignment {
    Left,
    Right,
}

pub type RowData = Vec<String>;

/// Unit of `ProgressEvent::current_value` for a phase
pub fn progress_unit(phase: TestPhase) -> &'static str {
    match phase {
        TestPhase::Download | TestPhase::Upload => "Mbps",
        TestPhase::Latency | TestPhase::Bufferbloat => "ms",
        TestPhase::PacketLoss => "% lost",
    }
}

/// Mbps below 1000, Gbps above
pub fn format_rate(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

pub fn format_latency(ms: f64) -> String {
    if ms < 1.0 && ms > 0.0 {
        format!("{:.0}μs", ms * 1000.0)
    } else if ms < 1000.0 {
        format!("{:.1}ms", ms)
    } else {
        format!("{:.2}s", ms / 1000.0)
    }
}

/// Format percentage with appropriate precision
pub fn format_percentage(percentage: f64) -> String {
    if percentage >= 99.95 {
        "100.0%".to_string()
    } else if percentage < 0.05 {
        "0.0%".to_string()
    } else {
        format!("{:.1}%", percentage)
    }
}

pub(crate) fn bar_cells(percent: f64, width: usize) -> (usize, usize) {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * width as f64).round() as usize;
    (filled.min(width), width - filled.min(width))
}

pub(crate) fn phase_label(phase: TestPhase) -> &'static str {
    match phase {
        TestPhase::Latency => "Latency",
        TestPhase::Download => "Download",
        TestPhase::Upload => "Upload",
        TestPhase::PacketLoss => "Packet loss",
        TestPhase::Bufferbloat => "Bufferbloat",
    }
}

pub(crate) fn state_label(state: EngineState) -> &'static str {
    match state {
        EngineState::Idle => "Idle",
        EngineState::Latency => "Measuring latency",
        EngineState::Download => "Measuring download",
        EngineState::Upload => "Measuring upload",
        EngineState::PacketLoss => "Measuring packet loss",
        EngineState::Bufferbloat => "Measuring loaded latency",
        EngineState::Complete => "Complete",
        EngineState::Aborted => "Aborted",
        EngineState::Failed => "Failed",
    }
}

/// Label/value rows shared by the plain and colored summaries
pub(crate) fn result_rows(result: &SpeedTestResult) -> Vec<RowData> {
    let mut rows = vec![
        vec!["Download".to_string(), format_rate(result.download_mbps)],
        vec!["Upload".to_string(), format_rate(result.upload_mbps)],
        vec!["Ping".to_string(), format_latency(result.ping_ms)],
        vec!["Jitter".to_string(), format_latency(result.jitter_ms)],
        vec![
            "Packet loss".to_string(),
            format!(
                "{} ({}/{})",
                format_percentage(result.packet_loss.percentage),
                result.packet_loss.lost(),
                result.packet_loss.sent
            ),
        ],
    ];

    if let Some(bufferbloat) = &result.bufferbloat {
        rows.push(vec![
            "Bufferbloat".to_string(),
            format!(
                "{} ({}, +{})",
                bufferbloat.rating,
                bufferbloat.rating.description(),
                format_latency(bufferbloat.latency_increase_ms)
            ),
        ]);
    }

    rows.push(vec!["Server".to_string(), result.server.clone()]);
    rows.push(vec!["Transport".to_string(), result.transport.to_string()]);
    rows.push(vec!["Duration".to_string(), format!("{:.1}s", result.test_duration_s)]);
    rows
}

pub(crate) fn detail_rows(result: &SpeedTestResult) -> Vec<RowData> {
    let overhead = &result.protocol_overhead;
    let mut rows = vec![vec![
        "Protocol overhead".to_string(),
        format!(
            "x{:.4} ({:.1}%, {})",
            overhead.factor,
            overhead.overhead_percent,
            if overhead.detected { "measured" } else { "assumed" }
        ),
    ]];

    if let Some(bufferbloat) = &result.bufferbloat {
        rows.push(vec![
            "Loaded latency".to_string(),
            format_latency(bufferbloat.loaded_latency_ms),
        ]);
    }

    if let Some(stability) = &result.stability {
        rows.push(vec![
            "Stability".to_string(),
            format!(
                "{:.0}/100 (variance {:.2}, {} samples)",
                stability.score, stability.variance, stability.sample_count
            ),
        ]);
    }

    let degraded = result.degraded.phases();
    rows.push(vec![
        "Degraded phases".to_string(),
        if degraded.is_empty() {
            "none".to_string()
        } else {
            degraded.iter().map(|p| phase_label(*p)).collect::<Vec<_>>().join(", ")
        },
    ]);
    rows.push(vec!["Run id".to_string(), result.id.to_string()]);
    rows
}

/// Plain text formatter implementation
pub struct PlainFormatter {
    options: FormattingOptions,
}

impl PlainFormatter {
    pub fn new(options: FormattingOptions) -> Self {
        Self { options }
    }

    fn key_value_format(&self) -> TableFormat {
        TableFormat {
            columns: vec![
                Column::new("Metric", Alignment::Left, 12),
                Column::new("Value", Alignment::Right, 12),
            ],
            show_borders: self.options.table_borders,
            show_header: false,
        }
    }

    /// Create a table with the given format and data
    pub(crate) fn create_table(&self, format: &TableFormat, rows: &[RowData]) -> String {
        if rows.is_empty() {
            return String::new();
        }

        let column_widths = self.calculate_column_widths(format, rows);
        let mut output = String::new();

        if format.show_borders {
            output.push_str(&self.create_horizontal_border(&column_widths));
            output.push('\n');
        }

        if format.show_header && !format.columns.is_empty() {
            let headers: Vec<String> = format.columns.iter().map(|c| c.header.clone()).collect();
            output.push_str(&self.create_row(&headers, &column_widths, format));
            output.push('\n');

            if format.show_borders {
                output.push_str(&self.create_horizontal_border(&column_widths));
                output.push('\n');
            }
        }

        for row in rows {
            output.push_str(&self.create_row(row, &column_widths, format));
            output.push('\n');
        }

        if format.show_borders {
            output.push_str(&self.create_horizontal_border(&column_widths));
        }

        output.trim_end().to_string()
    }

    fn calculate_column_widths(&self, format: &TableFormat, rows: &[RowData]) -> Vec<usize> {
        let num_columns = format
            .columns
            .len()
            .max(rows.iter().map(|r| r.len()).max().unwrap_or(0));

        (0..num_columns)
            .map(|col_idx| {
                let base = format
                    .columns
                    .get(col_idx)
                    .map(|c| c.min_width.max(if format.show_header { c.header.chars().count() } else { 0 }))
                    .unwrap_or(0);
                rows.iter()
                    .filter_map(|row| row.get(col_idx))
                    .map(|cell| cell.chars().count())
                    .fold(base, usize::max)
            })
            .collect()
    }

    fn create_row(&self, data: &[String], widths: &[usize], format: &TableFormat) -> String {
        let mut row = String::new();

        if format.show_borders {
            row.push('|');
        }

        for (idx, (cell, &width)) in data.iter().zip(widths.iter()).enumerate() {
            let alignment = format
                .columns
                .get(idx)
                .map(|c| c.alignment)
                .unwrap_or(Alignment::Left);

            if format.show_borders {
                row.push(' ');
            }
            row.push_str(&align_text(cell, width, alignment));
            if format.show_borders {
                row.push_str(" |");
            } else {
                row.push_str("  ");
            }
        }

        row.trim_end().to_string()
    }

    fn create_horizontal_border(&self, widths: &[usize]) -> String {
        let mut border = String::from("+");
        for &width in widths {
            border.push_str(&"-".repeat(width + 2));
            border.push('+');
        }
        border
    }
}

pub(crate) fn align_text(text: &str, width: usize, alignment: Alignment) -> String {
    let len = text.chars().count();
    if len >= width {
        return text.to_string();
    }

    let padding = width - len;
    match alignment {
        Alignment::Left => format!("{}{}", text, " ".repeat(padding)),
        Alignment::Right => format!("{}{}", " ".repeat(padding), text),
    }
}

impl OutputFormatter for PlainFormatter {
    fn format_header(&self, title: &str) -> Result<String> {
        let mut output = String::new();
        let border = "=".repeat(title.chars().count() + 4);

        writeln!(output, "{}", border).map_err(|e| AppError::io(format!("Failed to format header: {}", e)))?;
        writeln!(output, "  {}  ", title).map_err(|e| AppError::io(format!("Failed to format header: {}", e)))?;
        write!(output, "{}", border).map_err(|e| AppError::io(format!("Failed to format header: {}", e)))?;

        Ok(output)
    }

    fn format_result(&self, result: &SpeedTestResult) -> Result<String> {
        let mut output = self.create_table(&self.key_value_format(), &result_rows(result));
        if result.is_degraded() {
            output.push_str("\n\nSome phases fell back to placeholder values; see degraded phases.");
        }
        Ok(output)
    }

    fn format_details(&self, result: &SpeedTestResult) -> Result<String> {
        let mut output = String::new();
        writeln!(output, "Details:").map_err(|e| AppError::io(format!("Failed to format details: {}", e)))?;
        writeln!(output, "--------").map_err(|e| AppError::io(format!("Failed to format details: {}", e)))?;
        output.push_str(&self.create_table(&self.key_value_format(), &detail_rows(result)));
        Ok(output)
    }

    fn format_progress(&self, event: &ProgressEvent) -> String {
        let (filled, empty) = bar_cells(event.progress_percent, self.options.bar_width);
        format!(
            "{:<12} [{}{}] {:>5.1}%  {:.1} {}",
            phase_label(event.phase),
            "=".repeat(filled),
            " ".repeat(empty),
            event.progress_percent,
            event.current_value,
            progress_unit(event.phase)
        )
    }

    fn format_state(&self, state: EngineState) -> String {
        format!("-- {}", state_label(state))
    }

    fn format_error(&self, error: &str) -> Result<String> {
        Ok(format!("ERROR: {}", error))
    }

    fn format_warning(&self, warning: &str) -> Result<String> {
        Ok(format!("WARNING: {}", warning))
    }

    fn format_success(&self, message: &str) -> Result<String> {
        Ok(format!("SUCCESS: {}", message))
    }
}
