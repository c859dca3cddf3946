//! Speed Test Engine
//!
//! A multi-phase network speed test: latency and jitter, download and upload
//! throughput with an adaptive warm-up window, protocol overhead estimation,
//! packet loss and bufferbloat. Measurements run over a streaming (HTTP) or a
//! duplex (WebSocket) transport, against the GENERATOR, SINK and ECHO
//! primitives served by [`server`].

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod output;
pub mod server;
pub mod stats;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use engine::{EngineEvents, EngineMessage, Orchestrator};
pub use error::{AppError, Result};
pub use models::{ServerConfig, SpeedTestResult, TestConfig};
pub use server::SpeedTestServer;
pub use transport::Transport;
pub use types::{EngineState, TestPhase, TransportKind};

/// Application version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Build metadata injected by build.rs
pub const BUILD_TIME: &str = env!("BUILD_TIME");
pub const GIT_COMMIT: &str = env!("GIT_COMMIT");
pub const TARGET_TRIPLE: &str = env!("TARGET_TRIPLE");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_SERVERS: &[&str] = &["http://localhost:3000"];
    pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);
    pub const DEFAULT_PARALLEL_CONNECTIONS: usize = 4;
    pub const DEFAULT_STATIC_GRACE: Duration = Duration::from_secs(2);
    pub const DEFAULT_OVERHEAD_FACTOR: f64 = 1.06;
    pub const DEFAULT_LATENCY_SAMPLES: usize = 10;
    pub const DEFAULT_PACKET_LOSS_PROBES: usize = 50;
    pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_DOWNLOAD_REQUEST_BYTES: u64 = 25 * 1000 * 1000;
    pub const DEFAULT_UPLOAD_CHUNK_BYTES: usize = 1024 * 1024;
    pub const DEFAULT_UPLOAD_CHUNK_TIMEOUT: Duration = Duration::from_secs(3);
    pub const DEFAULT_DUPLEX_PATH: &str = "/ws";
    pub const DEFAULT_BIND: &str = "0.0.0.0:3000";

    pub const MAX_STREAMING_DOWNLOAD_BYTES: u64 = 500 * 1024 * 1024;
    pub const MAX_DUPLEX_DOWNLOAD_BYTES: u64 = 100 * 1024 * 1024;
    pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
    /// Requests per client per window on the non-transfer routes
    pub const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 500;
    /// Widest warm-up window a connection can be classified into
    pub const MAX_DYNAMIC_GRACE: Duration = Duration::from_secs(3);
    pub const MAX_PARALLEL_CONNECTIONS: usize = 16;
    pub const MAX_OVERHEAD_FACTOR: f64 = 1.20;
    pub const MIN_LATENCY_SAMPLES: usize = 5;
}

/// `VERSION (commit, built BUILD_TIME for TARGET)`
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_COMMIT"),
    ", built ",
    env!("BUILD_TIME"),
    " for ",
    env!("TARGET_TRIPLE"),
    ")"
);
