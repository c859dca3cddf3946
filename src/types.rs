//! Type definitions shared across the engine, transports and server

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use crate::error::{AppError, Result};

/// Transport binding used for a test run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Independent request/response calls per operation
    #[default]
    Streaming,
    /// One persistent socket carrying typed messages and binary frames
    Duplex,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Streaming => "streaming",
            TransportKind::Duplex => "duplex",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "streaming" | "http" => Ok(TransportKind::Streaming),
            "duplex" | "ws" | "websocket" => Ok(TransportKind::Duplex),
            other => Err(AppError::parse(format!(
                "Unknown transport '{}', expected 'streaming' or 'duplex'",
                other
            ))),
        }
    }
}

/// Measurement phase a sample or progress event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestPhase {
    Latency,
    Download,
    Upload,
    PacketLoss,
    Bufferbloat,
}

impl TestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestPhase::Latency => "latency",
            TestPhase::Download => "download",
            TestPhase::Upload => "upload",
            TestPhase::PacketLoss => "packet-loss",
            TestPhase::Bufferbloat => "bufferbloat",
        }
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    Idle,
    Latency,
    Download,
    Upload,
    PacketLoss,
    Bufferbloat,
    Complete,
    Aborted,
    /// Connection establishment failed; terminal
    Failed,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Complete | EngineState::Aborted | EngineState::Failed)
    }

    /// The measurement phase this state runs, if any
    pub fn phase(&self) -> Option<TestPhase> {
        match self {
            EngineState::Latency => Some(TestPhase::Latency),
            EngineState::Download => Some(TestPhase::Download),
            EngineState::Upload => Some(TestPhase::Upload),
            EngineState::PacketLoss => Some(TestPhase::PacketLoss),
            EngineState::Bufferbloat => Some(TestPhase::Bufferbloat),
            _ => None,
        }
    }

    /// Legal successor states. Phases run in a fixed order; bufferbloat is optional.
    pub fn can_transition_to(&self, next: EngineState) -> bool {
        use EngineState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Aborted | Failed) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Latency)
                | (Latency, Download)
                | (Download, Upload)
                | (Upload, PacketLoss)
                | (PacketLoss, Bufferbloat)
                | (PacketLoss, Complete)
                | (Bufferbloat, Complete)
        )
    }
}

impl From<TestPhase> for EngineState {
    fn from(phase: TestPhase) -> Self {
        match phase {
            TestPhase::Latency => EngineState::Latency,
            TestPhase::Download => EngineState::Download,
            TestPhase::Upload => EngineState::Upload,
            TestPhase::PacketLoss => EngineState::PacketLoss,
            TestPhase::Bufferbloat => EngineState::Bufferbloat,
        }
    }
}

/// Early-rate classification of a throughput connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    /// Above 50 Mbps
    Fast,
    /// Above 10 and up to 50 Mbps
    Medium,
    /// 10 Mbps or less
    Slow,
}

impl ConnectionClass {
    /// Boundary values resolve to the slower class
    pub fn from_rate(rate_mbps: f64) -> Self {
        if rate_mbps > 50.0 {
            ConnectionClass::Fast
        } else if rate_mbps > 10.0 {
            ConnectionClass::Medium
        } else {
            ConnectionClass::Slow
        }
    }

    /// Warm-up window excluded from the final rate
    pub fn grace_period(&self) -> Duration {
        match self {
            ConnectionClass::Fast => Duration::from_secs(1),
            ConnectionClass::Medium => Duration::from_secs(2),
            ConnectionClass::Slow => Duration::from_secs(3),
        }
    }
}

/// Tag attached to graph points so a host can colour grace samples differently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GraphTag {
    Latency,
    DownloadGrace,
    Download,
    UploadGrace,
    Upload,
    Bufferbloat,
}

impl GraphTag {
    pub fn for_throughput(phase: TestPhase, in_grace: bool) -> Self {
        match (phase, in_grace) {
            (TestPhase::Upload, true) => GraphTag::UploadGrace,
            (TestPhase::Upload, false) => GraphTag::Upload,
            (_, true) => GraphTag::DownloadGrace,
            (_, false) => GraphTag::Download,
        }
    }
}
