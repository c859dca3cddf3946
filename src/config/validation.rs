//! Non-fatal configuration checks

use crate::defaults;
use crate::error::{AppError, Result};
use crate::models::{ServerConfig, TestConfig};
use crate::types::TransportKind;
use colored::*;
use std::time::Duration;

/// Configuration validator producing warnings on top of the hard checks
pub struct ConfigValidator;

impl ConfigValidator {
    /// Hard validation first, then advisory warnings
    pub fn validate_comprehensive(config: &TestConfig) -> Result<Vec<ValidationWarning>> {
        let mut warnings = Vec::new();

        config.validate()?;

        warnings.extend(Self::validate_servers(&config.servers)?);
        warnings.extend(Self::validate_phase_settings(config));
        warnings.extend(Self::validate_transport_settings(config));

        Ok(warnings)
    }

    pub fn validate_server(config: &ServerConfig) -> Result<Vec<ValidationWarning>> {
        let mut warnings = Vec::new();
        config.validate()?;

        let addr = config.bind_addr()?;
        if addr.ip().is_unspecified() {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                format!("Listening on all interfaces ({})", addr),
            ));
        }

        if config.max_download_bytes > 1024 * 1024 * 1024 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Warning,
                format!(
                    "Streaming download cap of {}MB lets one client hold a connection for a long time",
                    config.max_download_bytes / (1024 * 1024)
                ),
            ));
        }

        if config.rate_limit_max_requests == 0 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Warning,
                "Rate limiting is disabled".to_string(),
            ));
        }

        if config.max_duplex_download_bytes > config.max_download_bytes {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                "Duplex download cap is larger than the streaming cap".to_string(),
            ));
        }

        Ok(warnings)
    }

    fn validate_servers(servers: &[String]) -> Result<Vec<ValidationWarning>> {
        let mut warnings = Vec::new();

        for server in servers {
            let parsed = url::Url::parse(server)
                .map_err(|e| AppError::config(format!("Invalid server URL '{}': {}", server, e)))?;

            let is_local = match parsed.host() {
                Some(url::Host::Ipv4(ip)) => ip.is_private() || ip.is_loopback(),
                Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
                Some(url::Host::Domain(host)) => host == "localhost",
                None => false,
            };
            if is_local {
                warnings.push(ValidationWarning::new(
                    ValidationLevel::Info,
                    format!("Server '{}' is on the local network; results will not reflect the uplink", server),
                ));
            }

            if parsed.query().is_some() || parsed.fragment().is_some() {
                warnings.push(ValidationWarning::new(
                    ValidationLevel::Warning,
                    format!("Server '{}' has a query or fragment, which is dropped from endpoint paths", server),
                ));
            }
        }

        if servers.len() > 5 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                format!("Probing {} servers before the test starts", servers.len()),
            ));
        }

        Ok(warnings)
    }

    fn validate_phase_settings(config: &TestConfig) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();

        let grace = if config.dynamic_grace_period {
            defaults::MAX_DYNAMIC_GRACE
        } else {
            config.static_grace_period()
        };
        if config.duration() <= grace {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Warning,
                format!(
                    "Duration of {}s is not longer than the {:.1}s warm-up window; rates rest on few samples",
                    config.duration_secs,
                    grace.as_secs_f64()
                ),
            ));
        }

        if !config.dynamic_grace_period && config.static_grace_period_secs == 0.0 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                "No warm-up window: connection ramp-up lowers the reported rates".to_string(),
            ));
        }

        if config.latency_samples < 10 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                format!("{} latency samples give a coarse jitter estimate", config.latency_samples),
            ));
        }

        if config.packet_loss_probes < 20 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Warning,
                format!(
                    "{} packet loss probes: each lost probe counts for {:.1}%",
                    config.packet_loss_probes,
                    100.0 / config.packet_loss_probes as f64
                ),
            ));
        }

        if config.enable_stress_test && config.duration_secs < 5 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                "Stability needs several post-warm-up samples; consider a duration of 5s or more".to_string(),
            ));
        }

        let estimate = estimated_runtime(config);
        if estimate > Duration::from_secs(90) {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                format!("Test may take up to {}s", estimate.as_secs()),
            ));
        }

        warnings
    }

    fn validate_transport_settings(config: &TestConfig) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();

        if config.transport == TransportKind::Duplex && config.parallel_connections > 1 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Warning,
                format!(
                    "Duplex transport carries a single stream; {} parallel connections will run as 1",
                    config.parallel_connections
                ),
            ));
        }

        if config.transport == TransportKind::Streaming && config.auto_detect_overhead {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                format!(
                    "Streaming transport hides framing; overhead factor {} is assumed",
                    config.protocol_overhead_factor
                ),
            ));
        }

        if config.parallel_connections > 8 {
            warnings.push(ValidationWarning::new(
                ValidationLevel::Info,
                format!(
                    "{} parallel connections may saturate the server rather than the link",
                    config.parallel_connections
                ),
            ));
        }

        warnings
    }
}

/// Worst-case wall clock for one run
pub fn estimated_runtime(config: &TestConfig) -> Duration {
    let latency = config.probe_timeout() * config.latency_samples as u32;
    let throughput = config.throughput_deadline() * 2;
    let packet_loss = config.probe_timeout() * config.packet_loss_probes.div_ceil(10) as u32;
    let bufferbloat = if config.enable_bufferbloat {
        Duration::from_millis(500) + config.probe_timeout() * 5
    } else {
        Duration::ZERO
    };
    latency + throughput + packet_loss + bufferbloat
}

/// Validation warning levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    Info,
    Warning,
}

impl ValidationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub level: ValidationLevel,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(level: ValidationLevel, message: String) -> Self {
        Self { level, message }
    }

    pub fn format(&self, use_color: bool) -> String {
        let tag = format!("[{}]", self.level.as_str());
        if !use_color {
            return format!("{} {}", tag, self.message);
        }
        match self.level {
            ValidationLevel::Info => format!("{} {}", tag.blue(), self.message),
            ValidationLevel::Warning => format!("{} {}", tag.yellow().bold(), self.message),
        }
    }
}

/// Convenience function for comprehensive configuration validation
pub fn validate_config(config: &TestConfig) -> Result<Vec<ValidationWarning>> {
    ConfigValidator::validate_comprehensive(config)
}
