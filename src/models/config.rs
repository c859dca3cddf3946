//! Test run and server configuration

use crate::defaults;
use crate::types::{AppError, Result, TransportKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for one speed test run. Owned by the orchestrator and never
/// mutated once the run has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Candidate server base URLs, best latency wins
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,

    /// Length of each throughput phase, excluding grace
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    #[serde(default = "default_parallel_connections")]
    pub parallel_connections: usize,

    #[serde(default = "default_true")]
    pub enable_bufferbloat: bool,

    /// Report stability metrics of the throughput samples
    #[serde(default)]
    pub enable_stress_test: bool,

    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default = "default_true")]
    pub dynamic_grace_period: bool,

    #[serde(default = "default_static_grace_secs")]
    pub static_grace_period_secs: f64,

    #[serde(default = "default_overhead_factor")]
    pub protocol_overhead_factor: f64,

    #[serde(default = "default_true")]
    pub auto_detect_overhead: bool,

    #[serde(default = "default_latency_samples")]
    pub latency_samples: usize,

    #[serde(default = "default_packet_loss_probes")]
    pub packet_loss_probes: usize,

    /// Per-probe timeout for latency and packet loss probes
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Connect and control-message timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Size asked for on each streaming download request
    #[serde(default = "default_download_request_bytes")]
    pub download_request_bytes: u64,

    #[serde(default = "default_upload_chunk_bytes")]
    pub upload_chunk_bytes: usize,

    #[serde(default = "default_upload_chunk_timeout_ms")]
    pub upload_chunk_timeout_ms: u64,

    /// Path of the duplex socket endpoint on the server
    #[serde(default = "default_duplex_path")]
    pub duplex_path: String,

    #[serde(default = "default_true")]
    pub enable_color: bool,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub debug: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            duration_secs: default_duration_secs(),
            parallel_connections: default_parallel_connections(),
            enable_bufferbloat: true,
            enable_stress_test: false,
            transport: TransportKind::default(),
            dynamic_grace_period: true,
            static_grace_period_secs: default_static_grace_secs(),
            protocol_overhead_factor: default_overhead_factor(),
            auto_detect_overhead: true,
            latency_samples: default_latency_samples(),
            packet_loss_probes: default_packet_loss_probes(),
            probe_timeout_ms: default_probe_timeout_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            download_request_bytes: default_download_request_bytes(),
            upload_chunk_bytes: default_upload_chunk_bytes(),
            upload_chunk_timeout_ms: default_upload_chunk_timeout_ms(),
            duplex_path: default_duplex_path(),
            enable_color: true,
            verbose: false,
            debug: false,
        }
    }
}

impl TestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn static_grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.static_grace_period_secs.max(0.0))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn upload_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_chunk_timeout_ms)
    }

    /// Longest time a throughput connection may run: the phase duration plus
    /// the widest grace window it could be assigned
    pub fn throughput_deadline(&self) -> Duration {
        let grace = if self.dynamic_grace_period {
            defaults::MAX_DYNAMIC_GRACE
        } else {
            self.static_grace_period()
        };
        self.duration() + grace
    }

    /// Validate the configuration and return the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(AppError::config("At least one server URL is required"));
        }

        for server in &self.servers {
            let parsed = url::Url::parse(server)
                .map_err(|e| AppError::config(format!("Invalid server URL '{}': {}", server, e)))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(AppError::config(format!(
                    "Server URL must use http or https: {}",
                    server
                )));
            }
        }

        if self.duration_secs == 0 {
            return Err(AppError::config("Duration must be at least 1 second"));
        }

        if self.duration_secs > 120 {
            return Err(AppError::config("Duration cannot exceed 120 seconds"));
        }

        if self.parallel_connections == 0 {
            return Err(AppError::config("Parallel connections must be at least 1"));
        }

        if self.parallel_connections > defaults::MAX_PARALLEL_CONNECTIONS {
            return Err(AppError::config(format!(
                "Parallel connections cannot exceed {}",
                defaults::MAX_PARALLEL_CONNECTIONS
            )));
        }

        if !(0.0..=10.0).contains(&self.static_grace_period_secs) {
            return Err(AppError::config("Static grace period must be between 0 and 10 seconds"));
        }

        if !(1.0..=defaults::MAX_OVERHEAD_FACTOR).contains(&self.protocol_overhead_factor) {
            return Err(AppError::config(format!(
                "Protocol overhead factor must be between 1.0 and {}",
                defaults::MAX_OVERHEAD_FACTOR
            )));
        }

        if self.latency_samples < defaults::MIN_LATENCY_SAMPLES || self.latency_samples > 100 {
            return Err(AppError::config(format!(
                "Latency samples must be between {} and 100",
                defaults::MIN_LATENCY_SAMPLES
            )));
        }

        if self.packet_loss_probes == 0 || self.packet_loss_probes > 1000 {
            return Err(AppError::config("Packet loss probes must be between 1 and 1000"));
        }

        if self.probe_timeout_ms == 0 || self.upload_chunk_timeout_ms == 0 || self.request_timeout_secs == 0 {
            return Err(AppError::config("Timeouts must be greater than 0"));
        }

        if self.upload_chunk_bytes < 1024 || self.upload_chunk_bytes > 16 * 1024 * 1024 {
            return Err(AppError::config("Upload chunk size must be between 1KB and 16MB"));
        }

        if self.download_request_bytes < 1024 * 1024 {
            return Err(AppError::config("Download request size must be at least 1MB"));
        }

        if !self.duplex_path.starts_with('/') {
            return Err(AppError::config("Duplex path must start with '/'"));
        }

        Ok(())
    }

    /// Merge `SPEEDTEST_*` environment variables into this configuration
    pub fn merge_from_env(&mut self) -> Result<()> {
        self.merge_from_source(|key| std::env::var(key).ok())
    }

    /// Merge values from an arbitrary key lookup
    pub fn merge_from_source<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(servers) = lookup("SPEEDTEST_SERVERS") {
            self.servers = split_list(&servers);
        }

        parse_into(&lookup, "SPEEDTEST_DURATION", &mut self.duration_secs)?;
        parse_into(&lookup, "SPEEDTEST_CONNECTIONS", &mut self.parallel_connections)?;
        parse_into(&lookup, "SPEEDTEST_BUFFERBLOAT", &mut self.enable_bufferbloat)?;
        parse_into(&lookup, "SPEEDTEST_STRESS_TEST", &mut self.enable_stress_test)?;
        parse_into(&lookup, "SPEEDTEST_TRANSPORT", &mut self.transport)?;
        parse_into(&lookup, "SPEEDTEST_DYNAMIC_GRACE", &mut self.dynamic_grace_period)?;
        parse_into(&lookup, "SPEEDTEST_STATIC_GRACE", &mut self.static_grace_period_secs)?;
        parse_into(&lookup, "SPEEDTEST_OVERHEAD_FACTOR", &mut self.protocol_overhead_factor)?;
        parse_into(&lookup, "SPEEDTEST_AUTO_OVERHEAD", &mut self.auto_detect_overhead)?;
        parse_into(&lookup, "SPEEDTEST_LATENCY_SAMPLES", &mut self.latency_samples)?;
        parse_into(&lookup, "SPEEDTEST_TIMEOUT", &mut self.request_timeout_secs)?;
        parse_into(&lookup, "SPEEDTEST_ENABLE_COLOR", &mut self.enable_color)?;

        if let Some(path) = lookup("SPEEDTEST_DUPLEX_PATH") {
            self.duplex_path = path.trim().to_string();
        }

        Ok(())
    }
}

/// Configuration of the GENERATOR / SINK / ECHO server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Hard cap on one streaming download response
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,

    /// Hard cap on one framed duplex download
    #[serde(default = "default_max_duplex_download_bytes")]
    pub max_duplex_download_bytes: u64,

    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,

    /// Requests one client may make per window; 0 disables limiting
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u32,

    /// Log every non-transfer request
    #[serde(default = "default_true")]
    pub access_log: bool,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_download_bytes: default_max_download_bytes(),
            max_duplex_download_bytes: default_max_duplex_download_bytes(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            rate_limit_max_requests: default_rate_limit_max_requests(),
            access_log: true,
            verbose: false,
            debug: false,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|e| AppError::config(format!("Invalid bind address '{}': {}", self.bind, e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if self.max_download_bytes == 0 || self.max_duplex_download_bytes == 0 {
            return Err(AppError::config("Download caps must be greater than 0"));
        }
        if self.rate_limit_window_ms == 0 {
            return Err(AppError::config("Rate limit window must be greater than 0"));
        }
        Ok(())
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn merge_from_env(&mut self) -> Result<()> {
        self.merge_from_source(|key| std::env::var(key).ok())
    }

    pub fn merge_from_source<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("SPEEDTEST_BIND") {
            self.bind = bind.trim().to_string();
        }

        if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|e| AppError::config(format!("Invalid PORT value '{}': {}", port, e)))?;
            let mut addr = self.bind_addr()?;
            addr.set_port(port);
            self.bind = addr.to_string();
        }

        parse_into(&lookup, "SPEEDTEST_MAX_DOWNLOAD_BYTES", &mut self.max_download_bytes)?;
        parse_into(
            &lookup,
            "SPEEDTEST_MAX_DUPLEX_DOWNLOAD_BYTES",
            &mut self.max_duplex_download_bytes,
        )?;
        parse_into(&lookup, "RATE_LIMIT_WINDOW_MS", &mut self.rate_limit_window_ms)?;
        parse_into(&lookup, "RATE_LIMIT_MAX_REQUESTS", &mut self.rate_limit_max_requests)?;
        parse_into(&lookup, "SPEEDTEST_ACCESS_LOG", &mut self.access_log)?;
        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_into<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| AppError::config(format!("Invalid {} value '{}': {}", key, raw, e)))?;
    }
    Ok(())
}

fn default_servers() -> Vec<String> {
    defaults::DEFAULT_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_duration_secs() -> u64 {
    defaults::DEFAULT_DURATION.as_secs()
}

fn default_parallel_connections() -> usize {
    defaults::DEFAULT_PARALLEL_CONNECTIONS
}

fn default_true() -> bool {
    true
}

fn default_static_grace_secs() -> f64 {
    defaults::DEFAULT_STATIC_GRACE.as_secs_f64()
}

fn default_overhead_factor() -> f64 {
    defaults::DEFAULT_OVERHEAD_FACTOR
}

fn default_latency_samples() -> usize {
    defaults::DEFAULT_LATENCY_SAMPLES
}

fn default_packet_loss_probes() -> usize {
    defaults::DEFAULT_PACKET_LOSS_PROBES
}

fn default_probe_timeout_ms() -> u64 {
    defaults::DEFAULT_PROBE_TIMEOUT.as_millis() as u64
}

fn default_request_timeout_secs() -> u64 {
    defaults::DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_download_request_bytes() -> u64 {
    defaults::DEFAULT_DOWNLOAD_REQUEST_BYTES
}

fn default_upload_chunk_bytes() -> usize {
    defaults::DEFAULT_UPLOAD_CHUNK_BYTES
}

fn default_upload_chunk_timeout_ms() -> u64 {
    defaults::DEFAULT_UPLOAD_CHUNK_TIMEOUT.as_millis() as u64
}

fn default_duplex_path() -> String {
    defaults::DEFAULT_DUPLEX_PATH.to_string()
}

fn default_bind() -> String {
    defaults::DEFAULT_BIND.to_string()
}

fn default_max_download_bytes() -> u64 {
    defaults::MAX_STREAMING_DOWNLOAD_BYTES
}

fn default_max_duplex_download_bytes() -> u64 {
    defaults::MAX_DUPLEX_DOWNLOAD_BYTES
}

fn default_rate_limit_window_ms() -> u64 {
    defaults::DEFAULT_RATE_LIMIT_WINDOW.as_millis() as u64
}

fn default_rate_limit_max_requests() -> u32 {
    defaults::DEFAULT_RATE_LIMIT_MAX_REQUESTS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TestConfig::default();
        assert_eq!(config.duration_secs, 10);
        assert_eq!(config.parallel_connections, 4);
        assert_eq!(config.static_grace_period_secs, 2.0);
        assert_eq!(config.protocol_overhead_factor, 1.06);
        assert!(config.dynamic_grace_period);
        assert!(config.auto_detect_overhead);
        assert_eq!(config.transport, TransportKind::Streaming);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_throughput_deadline() {
        let mut config = TestConfig::default();
        assert_eq!(config.throughput_deadline(), Duration::from_secs(13));

        config.dynamic_grace_period = false;
        config.static_grace_period_secs = 0.5;
        assert_eq!(config.throughput_deadline(), Duration::from_millis(10_500));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases: Vec<Box<dyn Fn(&mut TestConfig)>> = vec![
            Box::new(|c| c.servers.clear()),
            Box::new(|c| c.servers = vec!["ftp://example.com".to_string()]),
            Box::new(|c| c.servers = vec!["not a url".to_string()]),
            Box::new(|c| c.duration_secs = 0),
            Box::new(|c| c.parallel_connections = 0),
            Box::new(|c| c.parallel_connections = 64),
            Box::new(|c| c.static_grace_period_secs = -1.0),
            Box::new(|c| c.protocol_overhead_factor = 0.9),
            Box::new(|c| c.protocol_overhead_factor = 1.5),
            Box::new(|c| c.latency_samples = 4),
            Box::new(|c| c.probe_timeout_ms = 0),
            Box::new(|c| c.upload_chunk_bytes = 10),
            Box::new(|c| c.duplex_path = "ws".to_string()),
        ];

        for mutate in cases {
            let mut config = TestConfig::default();
            mutate(&mut config);
            let error = config.validate().unwrap_err();
            assert_eq!(error.category(), "CONFIG", "{:?}", config);
        }
    }

    #[test]
    fn test_merge_from_source() {
        let mut config = TestConfig::default();
        config
            .merge_from_source(lookup_from(&[
                ("SPEEDTEST_SERVERS", "http://a:3000, http://b:3000,"),
                ("SPEEDTEST_DURATION", "5"),
                ("SPEEDTEST_CONNECTIONS", "2"),
                ("SPEEDTEST_TRANSPORT", "duplex"),
                ("SPEEDTEST_DYNAMIC_GRACE", "false"),
                ("SPEEDTEST_STATIC_GRACE", "1.5"),
            ]))
            .unwrap();

        assert_eq!(config.servers, vec!["http://a:3000", "http://b:3000"]);
        assert_eq!(config.duration_secs, 5);
        assert_eq!(config.parallel_connections, 2);
        assert_eq!(config.transport, TransportKind::Duplex);
        assert!(!config.dynamic_grace_period);
        assert_eq!(config.static_grace_period(), Duration::from_millis(1500));
    }

    #[test]
    fn test_merge_from_source_invalid_value() {
        let mut config = TestConfig::default();
        let error = config
            .merge_from_source(lookup_from(&[("SPEEDTEST_CONNECTIONS", "many")]))
            .unwrap_err();
        assert!(error.to_string().contains("SPEEDTEST_CONNECTIONS"));
    }

    #[test]
    fn test_serde_defaults() {
        let config: TestConfig = serde_json::from_str(r#"{"duration_secs": 3, "transport": "duplex"}"#).unwrap();
        assert_eq!(config.duration_secs, 3);
        assert_eq!(config.transport, TransportKind::Duplex);
        assert_eq!(config.parallel_connections, 4);
        assert_eq!(config.upload_chunk_bytes, 1024 * 1024);
    }

    #[test]
    fn test_server_config_port_override() {
        let mut config = ServerConfig::default();
        config
            .merge_from_source(lookup_from(&[("SPEEDTEST_BIND", "127.0.0.1:3000"), ("PORT", "8080")]))
            .unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080");
        assert!(config.validate().is_ok());

        config.bind = "localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_rate_limit_from_env() {
        let config = ServerConfig::default();
        assert_eq!(config.rate_limit_window(), Duration::from_secs(60));
        assert_eq!(config.rate_limit_max_requests, 500);
        assert!(config.access_log);

        let mut config = ServerConfig::default();
        config
            .merge_from_source(lookup_from(&[
                ("RATE_LIMIT_WINDOW_MS", "1000"),
                ("RATE_LIMIT_MAX_REQUESTS", "20"),
                ("SPEEDTEST_ACCESS_LOG", "false"),
            ]))
            .unwrap();
        assert_eq!(config.rate_limit_window(), Duration::from_secs(1));
        assert_eq!(config.rate_limit_max_requests, 20);
        assert!(!config.access_log);

        config.rate_limit_window_ms = 0;
        assert!(config.validate().is_err());
    }
}
