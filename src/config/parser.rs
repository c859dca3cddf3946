//! Configuration parsing from CLI arguments and environment variables

use crate::{
    cli::{Cli, Command, RunArgs, ServeArgs},
    config::env::EnvManager,
    error::Result,
    models::{ServerConfig, TestConfig},
};
use std::path::PathBuf;

/// Combines defaults, the .env file, environment variables and CLI arguments
pub struct ConfigParser {
    cli: Cli,
    env_file: PathBuf,
}

impl ConfigParser {
    pub fn new(cli: Cli) -> Self {
        Self {
            cli,
            env_file: PathBuf::from(".env"),
        }
    }

    /// Read a different env file instead of `./.env`
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = path.into();
        self
    }

    /// Build the configuration for `speedtest run`
    pub fn parse_test_config(&self) -> Result<TestConfig> {
        self.load_env_file()?;
        self.resolve_test_config(|key| std::env::var(key).ok())
    }

    /// Build the configuration for `speedtest serve`
    pub fn parse_server_config(&self) -> Result<ServerConfig> {
        self.load_env_file()?;
        self.resolve_server_config(|key| std::env::var(key).ok())
    }

    /// Defaults, then `lookup`, then CLI overrides, then validation
    pub fn resolve_test_config<F>(&self, lookup: F) -> Result<TestConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = TestConfig::default();
        config.merge_from_source(lookup)?;
        self.apply_run_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn resolve_server_config<F>(&self, lookup: F) -> Result<ServerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ServerConfig::default();
        config.merge_from_source(lookup)?;
        self.apply_serve_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn load_env_file(&self) -> Result<()> {
        EnvManager::load_env_file_from(&self.env_file, self.cli.debug)
    }

    fn run_args(&self) -> Option<&RunArgs> {
        match &self.cli.command {
            Some(Command::Run(run)) => Some(run),
            _ => None,
        }
    }

    fn serve_args(&self) -> Option<&ServeArgs> {
        match &self.cli.command {
            Some(Command::Serve(serve)) => Some(serve),
            _ => None,
        }
    }

    fn apply_run_overrides(&self, config: &mut TestConfig) {
        if self.cli.no_color {
            config.enable_color = false;
        } else if self.cli.color {
            config.enable_color = true;
        }

        // Verbosity is CLI-only
        config.verbose = self.cli.verbose;
        config.debug = self.cli.debug;

        let Some(run) = self.run_args() else {
            return;
        };

        if !run.servers.is_empty() {
            config.servers = run.servers.clone();
        }
        if let Some(duration) = run.duration {
            config.duration_secs = duration;
        }
        if let Some(connections) = run.connections {
            config.parallel_connections = connections;
        }
        if let Some(transport) = run.transport {
            config.transport = transport;
        }
        if run.bufferbloat {
            config.enable_bufferbloat = true;
        }
        if run.no_bufferbloat {
            config.enable_bufferbloat = false;
        }
        if run.stress {
            config.enable_stress_test = true;
        }
        if let Some(grace) = run.static_grace {
            config.dynamic_grace_period = false;
            config.static_grace_period_secs = grace;
        }
        if let Some(factor) = run.overhead_factor {
            config.protocol_overhead_factor = factor;
            config.auto_detect_overhead = false;
        }
        if run.no_auto_overhead {
            config.auto_detect_overhead = false;
        }
        if let Some(samples) = run.latency_samples {
            config.latency_samples = samples;
        }
        if let Some(probes) = run.packet_loss_probes {
            config.packet_loss_probes = probes;
        }
        if let Some(timeout) = run.timeout {
            config.request_timeout_secs = timeout;
        }

        if config.debug {
            eprintln!("Applied CLI overrides to configuration");
            eprintln!("{}", display_config_summary(config));
        }
    }

    fn apply_serve_overrides(&self, config: &mut ServerConfig) {
        config.verbose = self.cli.verbose;
        config.debug = self.cli.debug;

        let Some(serve) = self.serve_args() else {
            return;
        };

        if let Some(bind) = &serve.bind {
            config.bind = bind.clone();
        }
        if let Some(max) = serve.max_download_bytes {
            config.max_download_bytes = max;
        }
        if let Some(max) = serve.max_duplex_download_bytes {
            config.max_duplex_download_bytes = max;
        }
        if let Some(max) = serve.rate_limit {
            config.rate_limit_max_requests = max;
        }
        if let Some(window) = serve.rate_limit_window_ms {
            config.rate_limit_window_ms = window;
        }
        if serve.no_access_log {
            config.access_log = false;
        }
    }
}

/// Convenience function to load the run configuration from CLI arguments
pub fn load_config(cli: Cli) -> Result<TestConfig> {
    ConfigParser::new(cli).parse_test_config()
}

pub fn load_server_config(cli: Cli) -> Result<ServerConfig> {
    ConfigParser::new(cli).parse_server_config()
}

/// Display configuration summary for debug purposes
pub fn display_config_summary(config: &TestConfig) -> String {
    let grace = if config.dynamic_grace_period {
        "adaptive".to_string()
    } else {
        format!("{}s", config.static_grace_period_secs)
    };
    let overhead = if config.auto_detect_overhead {
        format!("auto (fallback {})", config.protocol_overhead_factor)
    } else {
        config.protocol_overhead_factor.to_string()
    };

    let summary = [
        format!("Servers: {}", config.servers.join(", ")),
        format!("Transport: {}", config.transport),
        format!("Duration: {}s", config.duration_secs),
        format!("Parallel Connections: {}", config.parallel_connections),
        format!("Grace Period: {}", grace),
        format!("Overhead Factor: {}", overhead),
        format!("Bufferbloat: {}", config.enable_bufferbloat),
        format!("Stress Test: {}", config.enable_stress_test),
        format!("Latency Samples: {}", config.latency_samples),
        format!("Packet Loss Probes: {}", config.packet_loss_probes),
        format!("Timeout: {}s", config.request_timeout_secs),
        format!("Color Output: {}", config.enable_color),
        format!("Verbose: {}", config.verbose),
        format!("Debug: {}", config.debug),
    ];

    summary.join("\n")
}

pub fn display_server_summary(config: &ServerConfig) -> String {
    [
        format!("Bind: {}", config.bind),
        format!("Max Download: {} bytes", config.max_download_bytes),
        format!("Max Duplex Download: {} bytes", config.max_duplex_download_bytes),
        format!(
            "Rate Limit: {} requests per {}ms",
            config.rate_limit_max_requests, config.rate_limit_window_ms
        ),
        format!("Access Log: {}", config.access_log),
    ]
    .join("\n")
}
