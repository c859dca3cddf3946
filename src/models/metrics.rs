//! Measurement records produced by the engine

use crate::stats::round_to;
use crate::types::{GraphTag, TestPhase, TransportKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One raw observation: a byte delta for throughput phases, a latency in
/// milliseconds for probe phases
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// Milliseconds since the run started
    pub timestamp_ms: f64,
    pub value: f64,
    pub phase: TestPhase,
}

/// UI-facing point on the live graph
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphPoint {
    /// Milliseconds since the run started
    pub elapsed_ms: f64,
    /// Mbps for throughput tags, milliseconds for latency tags
    pub value: f64,
    pub tag: GraphTag,
}

/// Progress of the current phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub phase: TestPhase,
    /// 0 to 100 within the phase
    pub progress_percent: f64,
    /// Current rate, latency or loss depending on the phase
    pub current_value: f64,
    /// Milliseconds since the run started
    pub elapsed_ms: f64,
}

/// Packet loss probe outcome. `received <= sent` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketLossStats {
    pub sent: u32,
    pub received: u32,
    pub percentage: f64,
}

impl PacketLossStats {
    /// Build stats from raw counts. Received is clamped to sent and the
    /// percentage rounded to one decimal.
    pub fn from_counts(sent: u32, received: u32) -> Self {
        let received = received.min(sent);
        let percentage = if sent == 0 {
            0.0
        } else {
            let lost = f64::from(sent - received);
            round_to(lost / f64::from(sent) * 100.0, 1).clamp(0.0, 100.0)
        };
        Self {
            sent,
            received,
            percentage,
        }
    }

    pub fn lost(&self) -> u32 {
        self.sent - self.received
    }
}

/// Latency-under-load grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BufferbloatRating {
    A,
    B,
    C,
    D,
    F,
}

impl BufferbloatRating {
    /// Fixed thresholds: below 20ms A, 50ms B, 100ms C, 200ms D, otherwise F
    pub fn from_increase(latency_increase_ms: f64) -> Self {
        if latency_increase_ms < 20.0 {
            BufferbloatRating::A
        } else if latency_increase_ms < 50.0 {
            BufferbloatRating::B
        } else if latency_increase_ms < 100.0 {
            BufferbloatRating::C
        } else if latency_increase_ms < 200.0 {
            BufferbloatRating::D
        } else {
            BufferbloatRating::F
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            BufferbloatRating::A => "Excellent",
            BufferbloatRating::B => "Good",
            BufferbloatRating::C => "Fair",
            BufferbloatRating::D => "Poor",
            BufferbloatRating::F => "Bad",
        }
    }
}

impl fmt::Display for BufferbloatRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            BufferbloatRating::A => "A",
            BufferbloatRating::B => "B",
            BufferbloatRating::C => "C",
            BufferbloatRating::D => "D",
            BufferbloatRating::F => "F",
        };
        f.write_str(letter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferbloatResult {
    pub rating: BufferbloatRating,
    pub latency_increase_ms: f64,
    pub loaded_latency_ms: f64,
}

impl BufferbloatResult {
    pub fn from_latencies(baseline_ms: f64, loaded_ms: f64) -> Self {
        let increase = round_to((loaded_ms - baseline_ms).max(0.0), 1);
        Self {
            rating: BufferbloatRating::from_increase(increase),
            latency_increase_ms: increase,
            loaded_latency_ms: round_to(loaded_ms.max(0.0), 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolOverhead {
    /// True once enough plausible ratios were observed
    pub detected: bool,
    pub factor: f64,
    pub overhead_percent: f64,
}

impl ProtocolOverhead {
    pub fn new(detected: bool, factor: f64) -> Self {
        let factor = factor.max(1.0);
        Self {
            detected,
            factor: round_to(factor, 4),
            overhead_percent: round_to((factor - 1.0) * 100.0, 1),
        }
    }
}

/// Throughput stability, reported when the stress test option is on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StabilityMetrics {
    /// 0 to 100, higher is steadier
    pub score: f64,
    /// Population variance of the rate samples, Mbps squared
    pub variance: f64,
    pub sample_count: usize,
}

/// Phases that fell back to a placeholder value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedPhases {
    pub latency: bool,
    pub download: bool,
    pub upload: bool,
    pub packet_loss: bool,
    pub bufferbloat: bool,
}

impl DegradedPhases {
    pub fn any(&self) -> bool {
        self.latency || self.download || self.upload || self.packet_loss || self.bufferbloat
    }

    pub fn mark(&mut self, phase: TestPhase) {
        match phase {
            TestPhase::Latency => self.latency = true,
            TestPhase::Download => self.download = true,
            TestPhase::Upload => self.upload = true,
            TestPhase::PacketLoss => self.packet_loss = true,
            TestPhase::Bufferbloat => self.bufferbloat = true,
        }
    }

    pub fn phases(&self) -> Vec<TestPhase> {
        [
            (self.latency, TestPhase::Latency),
            (self.download, TestPhase::Download),
            (self.upload, TestPhase::Upload),
            (self.packet_loss, TestPhase::PacketLoss),
            (self.bufferbloat, TestPhase::Bufferbloat),
        ]
        .into_iter()
        .filter_map(|(flag, phase)| flag.then_some(phase))
        .collect()
    }
}

/// Terminal record of one run. Built once by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedTestResult {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub jitter_ms: f64,
    pub test_duration_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bufferbloat: Option<BufferbloatResult>,
    pub packet_loss: PacketLossStats,
    pub protocol_overhead: ProtocolOverhead,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability: Option<StabilityMetrics>,
    pub server: String,
    pub transport: TransportKind,
    pub degraded: DegradedPhases,
}

impl SpeedTestResult {
    pub fn is_degraded(&self) -> bool {
        self.degraded.any()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bufferbloat_rating_boundaries() {
        assert_eq!(BufferbloatRating::from_increase(0.0), BufferbloatRating::A);
        assert_eq!(BufferbloatRating::from_increase(19.0), BufferbloatRating::A);
        assert_eq!(BufferbloatRating::from_increase(20.0), BufferbloatRating::B);
        assert_eq!(BufferbloatRating::from_increase(49.9), BufferbloatRating::B);
        assert_eq!(BufferbloatRating::from_increase(50.0), BufferbloatRating::C);
        assert_eq!(BufferbloatRating::from_increase(100.0), BufferbloatRating::D);
        assert_eq!(BufferbloatRating::from_increase(199.0), BufferbloatRating::D);
        assert_eq!(BufferbloatRating::from_increase(200.0), BufferbloatRating::F);
        assert_eq!(BufferbloatRating::from_increase(5000.0), BufferbloatRating::F);
    }

    #[test]
    fn test_bufferbloat_result_floors_increase() {
        let result = BufferbloatResult::from_latencies(40.0, 25.0);
        assert_eq!(result.latency_increase_ms, 0.0);
        assert_eq!(result.rating, BufferbloatRating::A);

        let result = BufferbloatResult::from_latencies(20.0, 95.46);
        assert_eq!(result.latency_increase_ms, 75.5);
        assert_eq!(result.rating, BufferbloatRating::C);
    }

    #[test]
    fn test_packet_loss_from_counts() {
        let stats = PacketLossStats::from_counts(50, 50);
        assert_eq!(stats.received, 50);
        assert_eq!(stats.percentage, 0.0);

        let stats = PacketLossStats::from_counts(50, 43);
        assert_eq!(stats.lost(), 7);
        assert_eq!(stats.percentage, 14.0);

        let stats = PacketLossStats::from_counts(3, 1);
        assert_eq!(stats.percentage, 66.7);

        let stats = PacketLossStats::from_counts(10, 12);
        assert_eq!(stats.received, 10);
        assert_eq!(stats.percentage, 0.0);

        let stats = PacketLossStats::from_counts(0, 0);
        assert_eq!(stats.percentage, 0.0);
    }

    #[test]
    fn test_protocol_overhead_rounding() {
        let overhead = ProtocolOverhead::new(true, 1.047_83);
        assert_eq!(overhead.factor, 1.0478);
        assert_eq!(overhead.overhead_percent, 4.8);

        let overhead = ProtocolOverhead::new(false, 1.06);
        assert!(!overhead.detected);
        assert_eq!(overhead.overhead_percent, 6.0);
    }

    #[test]
    fn test_degraded_phases() {
        let mut degraded = DegradedPhases::default();
        assert!(!degraded.any());
        degraded.mark(TestPhase::Upload);
        degraded.mark(TestPhase::Bufferbloat);
        assert!(degraded.any());
        assert_eq!(degraded.phases(), vec![TestPhase::Upload, TestPhase::Bufferbloat]);
    }

    #[test]
    fn test_result_serialization_shape() {
        let result = SpeedTestResult {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            download_mbps: 94.2,
            upload_mbps: 11.3,
            ping_ms: 12.4,
            jitter_ms: 1.1,
            test_duration_s: 31.5,
            bufferbloat: None,
            packet_loss: PacketLossStats::from_counts(50, 50),
            protocol_overhead: ProtocolOverhead::new(false, 1.06),
            stability: None,
            server: "http://localhost:3000".to_string(),
            transport: TransportKind::Streaming,
            degraded: DegradedPhases::default(),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["downloadMbps"], 94.2);
        assert_eq!(json["packetLoss"]["received"], 50);
        assert_eq!(json["protocolOverhead"]["overheadPercent"], 6.0);
        assert!(json.get("bufferbloat").is_none());
        assert_eq!(json["transport"], "streaming");
        assert!(!result.is_degraded());
    }
}
