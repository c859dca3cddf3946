//! Data models for configuration and measurement results

pub mod config;
pub mod metrics;

pub use config::{ServerConfig, TestConfig};
pub use metrics::{
    BufferbloatRating, BufferbloatResult, DegradedPhases, GraphPoint, PacketLossStats,
    ProgressEvent, ProtocolOverhead, Sample, SpeedTestResult, StabilityMetrics,
};
