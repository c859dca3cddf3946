//! Environment variable handling and .env file management

use crate::error::{AppError, Result};
use crate::types::TransportKind;
use std::path::Path;

/// Environment variable configuration manager
pub struct EnvManager;

impl EnvManager {
    /// Load .env from the working directory if it exists
    pub fn load_env_file(debug: bool) -> Result<()> {
        Self::load_env_file_from(Path::new(".env"), debug)
    }

    /// Load an env file; variables already set in the process keep their value
    pub fn load_env_file_from(path: &Path, debug: bool) -> Result<()> {
        if path.exists() {
            dotenv::from_path(path)
                .map_err(|e| AppError::config(format!("Failed to load {}: {}", path.display(), e)))?;

            if debug {
                eprintln!("Loaded configuration from {}", path.display());
            }
        } else if debug {
            eprintln!("No {} file found, using defaults and CLI arguments", path.display());
        }

        Ok(())
    }

    /// Create example .env file content
    pub fn create_example_env_content() -> String {
        r#"# Speed Test Engine Configuration
#
# Values here are defaults for `speedtest run` and `speedtest serve`.
# Environment variables and command-line arguments override them.

# Candidate servers (comma-separated); the lowest latency one is used
# SPEEDTEST_SERVERS=http://localhost:3000

# Seconds per throughput phase
# SPEEDTEST_DURATION=10

# Parallel connections per throughput phase (1-16)
# SPEEDTEST_CONNECTIONS=4

# streaming (HTTP) or duplex (WebSocket)
# SPEEDTEST_TRANSPORT=streaming

# Run the loaded latency phase (true/false)
# SPEEDTEST_BUFFERBLOAT=true

# Report throughput stability (true/false)
# SPEEDTEST_STRESS_TEST=false

# Adaptive warm-up window; set false to use SPEEDTEST_STATIC_GRACE
# SPEEDTEST_DYNAMIC_GRACE=true
# SPEEDTEST_STATIC_GRACE=2

# Protocol overhead factor used when framing is not observable
# SPEEDTEST_OVERHEAD_FACTOR=1.06
# SPEEDTEST_AUTO_OVERHEAD=true

# Latency probes (5-100)
# SPEEDTEST_LATENCY_SAMPLES=10

# Connect and control timeout in seconds
# SPEEDTEST_TIMEOUT=10

# Enable colored output (true/false)
# SPEEDTEST_ENABLE_COLOR=true

# Server side
# SPEEDTEST_BIND=0.0.0.0:3000
# PORT=3000
# SPEEDTEST_MAX_DOWNLOAD_BYTES=524288000
# SPEEDTEST_MAX_DUPLEX_DOWNLOAD_BYTES=104857600
# RATE_LIMIT_WINDOW_MS=60000
# RATE_LIMIT_MAX_REQUESTS=500
# SPEEDTEST_ACCESS_LOG=true
"#
        .to_string()
    }

    /// Save example .env file to disk
    pub fn save_example_env_file(path: &Path) -> Result<()> {
        let content = Self::create_example_env_content();
        std::fs::write(path, content)
            .map_err(|e| AppError::config(format!("Failed to write example .env file: {}", e)))?;
        Ok(())
    }

    /// Validate environment variable format before parsing
    pub fn validate_env_var(key: &str, value: &str) -> Result<()> {
        match key {
            "SPEEDTEST_SERVERS" => {
                for server in value.split(',') {
                    let server = server.trim();
                    if !server.is_empty() {
                        url::Url::parse(server).map_err(|e| {
                            AppError::config(format!("Invalid SPEEDTEST_SERVERS entry '{}': {}", server, e))
                        })?;
                    }
                }
            }
            "SPEEDTEST_DURATION" => {
                let secs = parse_number::<u64>(key, value)?;
                if secs == 0 || secs > 120 {
                    return Err(AppError::config(format!(
                        "SPEEDTEST_DURATION must be between 1 and 120, got: {}",
                        secs
                    )));
                }
            }
            "SPEEDTEST_CONNECTIONS" => {
                let connections = parse_number::<usize>(key, value)?;
                if connections == 0 || connections > crate::defaults::MAX_PARALLEL_CONNECTIONS {
                    return Err(AppError::config(format!(
                        "SPEEDTEST_CONNECTIONS must be between 1 and {}, got: {}",
                        crate::defaults::MAX_PARALLEL_CONNECTIONS,
                        connections
                    )));
                }
            }
            "SPEEDTEST_TRANSPORT" => {
                value
                    .parse::<TransportKind>()
                    .map_err(|e| AppError::config(format!("Invalid SPEEDTEST_TRANSPORT value: {}", e)))?;
            }
            "SPEEDTEST_OVERHEAD_FACTOR" => {
                let factor = parse_number::<f64>(key, value)?;
                if !(1.0..=crate::defaults::MAX_OVERHEAD_FACTOR).contains(&factor) {
                    return Err(AppError::config(format!(
                        "SPEEDTEST_OVERHEAD_FACTOR must be between 1.0 and {}, got: {}",
                        crate::defaults::MAX_OVERHEAD_FACTOR,
                        factor
                    )));
                }
            }
            "SPEEDTEST_STATIC_GRACE" => {
                let grace = parse_number::<f64>(key, value)?;
                if !(0.0..=10.0).contains(&grace) {
                    return Err(AppError::config(format!(
                        "SPEEDTEST_STATIC_GRACE must be between 0 and 10, got: {}",
                        grace
                    )));
                }
            }
            "SPEEDTEST_LATENCY_SAMPLES" => {
                parse_number::<usize>(key, value)?;
            }
            "SPEEDTEST_TIMEOUT" => {
                let timeout = parse_number::<u64>(key, value)?;
                if timeout == 0 || timeout > 300 {
                    return Err(AppError::config(format!(
                        "SPEEDTEST_TIMEOUT must be between 1 and 300, got: {}",
                        timeout
                    )));
                }
            }
            "SPEEDTEST_BUFFERBLOAT" | "SPEEDTEST_STRESS_TEST" | "SPEEDTEST_DYNAMIC_GRACE"
            | "SPEEDTEST_AUTO_OVERHEAD" | "SPEEDTEST_ENABLE_COLOR" | "SPEEDTEST_ACCESS_LOG" => {
                parse_number::<bool>(key, value)?;
            }
            "SPEEDTEST_BIND" => {
                value
                    .trim()
                    .parse::<std::net::SocketAddr>()
                    .map_err(|e| AppError::config(format!("Invalid SPEEDTEST_BIND value '{}': {}", value, e)))?;
            }
            "PORT" => {
                parse_number::<u16>(key, value)?;
            }
            "SPEEDTEST_MAX_DOWNLOAD_BYTES" | "SPEEDTEST_MAX_DUPLEX_DOWNLOAD_BYTES" => {
                if parse_number::<u64>(key, value)? == 0 {
                    return Err(AppError::config(format!("{} must be greater than 0", key)));
                }
            }
            "RATE_LIMIT_WINDOW_MS" => {
                if parse_number::<u64>(key, value)? == 0 {
                    return Err(AppError::config(format!("{} must be greater than 0", key)));
                }
            }
            "RATE_LIMIT_MAX_REQUESTS" => {
                parse_number::<u32>(key, value)?;
            }
            _ => {
                // Unknown environment variable, ignore
            }
        }

        Ok(())
    }

    /// Get list of all supported environment variables with descriptions
    pub fn get_supported_env_vars() -> Vec<(&'static str, &'static str, &'static str)> {
        vec![
            ("SPEEDTEST_SERVERS", "Comma-separated list of server base URLs", "http://localhost:3000"),
            ("SPEEDTEST_DURATION", "Seconds per throughput phase (1-120)", "10"),
            ("SPEEDTEST_CONNECTIONS", "Parallel connections (1-16)", "4"),
            ("SPEEDTEST_TRANSPORT", "streaming or duplex", "streaming"),
            ("SPEEDTEST_BUFFERBLOAT", "Run the bufferbloat phase", "true"),
            ("SPEEDTEST_STRESS_TEST", "Report throughput stability", "false"),
            ("SPEEDTEST_DYNAMIC_GRACE", "Adaptive warm-up window", "true"),
            ("SPEEDTEST_STATIC_GRACE", "Fixed warm-up window in seconds (0-10)", "2"),
            ("SPEEDTEST_OVERHEAD_FACTOR", "Protocol overhead factor (1.0-1.20)", "1.06"),
            ("SPEEDTEST_AUTO_OVERHEAD", "Detect overhead from framing", "true"),
            ("SPEEDTEST_LATENCY_SAMPLES", "Latency probes (5-100)", "10"),
            ("SPEEDTEST_TIMEOUT", "Connect and control timeout in seconds (1-300)", "10"),
            ("SPEEDTEST_ENABLE_COLOR", "Enable colored output", "true"),
            ("SPEEDTEST_BIND", "Server listen address", "0.0.0.0:3000"),
            ("PORT", "Server listen port, overrides the port of SPEEDTEST_BIND", "3000"),
            ("SPEEDTEST_MAX_DOWNLOAD_BYTES", "Cap on one streaming download", "524288000"),
            ("SPEEDTEST_MAX_DUPLEX_DOWNLOAD_BYTES", "Cap on one duplex download", "104857600"),
            ("RATE_LIMIT_WINDOW_MS", "Rate limit window in milliseconds", "60000"),
            ("RATE_LIMIT_MAX_REQUESTS", "Requests per client per window, 0 disables", "500"),
            ("SPEEDTEST_ACCESS_LOG", "Log non-transfer requests", "true"),
        ]
    }

    /// Display environment variable help
    pub fn display_env_help() -> String {
        let mut help = String::new();
        help.push_str("Supported Environment Variables:\n\n");

        for (var, description, example) in Self::get_supported_env_vars() {
            help.push_str(&format!("  {:<36} {}\n", var, description));
            help.push_str(&format!("  {:<36} Example: {}\n\n", "", example));
        }

        help.push_str("Configuration Priority (highest to lowest):\n");
        help.push_str("  1. Command-line arguments\n");
        help.push_str("  2. Environment variables\n");
        help.push_str("  3. .env file values\n");
        help.push_str("  4. Default values\n");

        help
    }

    /// Validate all currently set environment variables
    pub fn validate_current_env() -> Result<Vec<String>> {
        Self::validate_source(|key| std::env::var(key).ok())
    }

    /// Warnings for every supported variable `lookup` knows about
    pub fn validate_source<F>(lookup: F) -> Result<Vec<String>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();

        for (var_name, _, _) in Self::get_supported_env_vars() {
            if let Some(value) = lookup(var_name) {
                if let Err(e) = Self::validate_env_var(var_name, &value) {
                    warnings.push(format!("Warning: {}", e));
                }
            }
        }

        Ok(warnings)
    }

    /// Check if .env file exists and validate its contents
    pub fn check_env_file() -> Result<Option<Vec<String>>> {
        Self::check_env_file_at(Path::new(".env"))
    }

    pub fn check_env_file_at(path: &Path) -> Result<Option<Vec<String>>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::config(format!("Failed to read {}: {}", path.display(), e)))?;

        let mut warnings = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"');

                if let Err(e) = Self::validate_env_var(key, value) {
                    warnings.push(format!("Line '{}': {}", line, e));
                }
            }
        }

        Ok(Some(warnings))
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| AppError::config(format!("Invalid {} value '{}': {}", key, value, e)))
}
