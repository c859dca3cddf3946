//! Command-line interface with `run` and `serve` subcommands

pub mod help;

pub use help::HelpSystem;

use crate::types::TransportKind;
use clap::{ArgAction, Args, Parser, Subcommand};

/// Speed Test Engine - latency, throughput, packet loss and bufferbloat
#[derive(Parser, Debug, Clone)]
#[command(name = "speedtest")]
#[command(version = crate::VERSION, long_version = crate::LONG_VERSION, about, long_about = None)]
pub struct Cli {
    /// Force colored output
    #[arg(long, global = true)]
    pub color: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Enable verbose output
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,

    /// Show help for specific topic (config, phases, transports, server, examples, output)
    #[arg(long, value_name = "TOPIC")]
    pub help_topic: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run one speed test against a server
    Run(RunArgs),
    /// Serve the download, upload and ping endpoints
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Server base URL (can be used multiple times, lowest latency wins)
    #[arg(short, long = "server", action = ArgAction::Append)]
    pub servers: Vec<String>,

    /// Seconds per throughput phase
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<u64>,

    /// Parallel connections per throughput phase
    #[arg(short = 'c', long)]
    pub connections: Option<usize>,

    /// Transport: streaming (HTTP) or duplex (WebSocket)
    #[arg(short, long)]
    pub transport: Option<TransportKind>,

    /// Run the bufferbloat phase
    #[arg(long, conflicts_with = "no_bufferbloat")]
    pub bufferbloat: bool,

    /// Skip the bufferbloat phase
    #[arg(long)]
    pub no_bufferbloat: bool,

    /// Report throughput stability
    #[arg(long)]
    pub stress: bool,

    /// Use a fixed warm-up window instead of the adaptive one
    #[arg(long, value_name = "SECONDS")]
    pub static_grace: Option<f64>,

    /// Fixed protocol overhead factor; disables auto detection
    #[arg(long, value_name = "FACTOR")]
    pub overhead_factor: Option<f64>,

    /// Use the configured overhead factor even when framing is observable
    #[arg(long)]
    pub no_auto_overhead: bool,

    /// Latency probes in the latency phase
    #[arg(long)]
    pub latency_samples: Option<usize>,

    /// Probes in the packet loss phase
    #[arg(long)]
    pub packet_loss_probes: Option<usize>,

    /// Connect and control timeout in seconds
    #[arg(long, value_parser = parse_timeout)]
    pub timeout: Option<u64>,

    /// Print the result as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Listen address, e.g. 0.0.0.0:3000
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Cap on one streaming download in bytes
    #[arg(long, value_name = "BYTES")]
    pub max_download_bytes: Option<u64>,

    /// Cap on one duplex download in bytes
    #[arg(long, value_name = "BYTES")]
    pub max_duplex_download_bytes: Option<u64>,

    /// Requests per client per window on non-transfer routes (0 disables)
    #[arg(long, value_name = "REQUESTS")]
    pub rate_limit: Option<u32>,

    /// Rate limit window in milliseconds
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub rate_limit_window_ms: Option<u64>,

    /// Do not log requests
    #[arg(long)]
    pub no_access_log: bool,
}

impl Cli {
    /// Validate CLI arguments for conflicts and requirements
    pub fn validate(&self) -> Result<(), String> {
        if self.color && self.no_color {
            return Err("Cannot specify both --color and --no-color".to_string());
        }

        if let Some(Command::Run(run)) = &self.command {
            if let Some(grace) = run.static_grace {
                if !(0.0..=10.0).contains(&grace) {
                    return Err(format!("--static-grace must be between 0 and 10 seconds, got {}", grace));
                }
            }
            if let Some(factor) = run.overhead_factor {
                if !(1.0..=crate::defaults::MAX_OVERHEAD_FACTOR).contains(&factor) {
                    return Err(format!(
                        "--overhead-factor must be between 1.0 and {}, got {}",
                        crate::defaults::MAX_OVERHEAD_FACTOR,
                        factor
                    ));
                }
            }
            if run.connections == Some(0) {
                return Err("--connections must be at least 1".to_string());
            }
        }

        Ok(())
    }

    /// Check if help should be displayed for a specific topic
    pub fn should_show_topic_help(&self) -> bool {
        self.help_topic.is_some()
    }

    pub fn get_help_topic(&self) -> Option<&str> {
        self.help_topic.as_deref()
    }

    /// Check if colors should be enabled
    pub fn use_colors(&self) -> bool {
        if self.color {
            true
        } else if self.no_color {
            false
        } else {
            supports_color()
        }
    }

    /// JSON mode keeps stdout machine readable
    pub fn wants_json(&self) -> bool {
        matches!(&self.command, Some(Command::Run(run)) if run.json)
    }

    /// Display help for the specified topic or main help
    pub fn display_help(&self) -> String {
        let help_system = HelpSystem::new();
        let use_colors = self.use_colors();

        if let Some(topic) = &self.help_topic {
            help_system.display_topic_help(topic, use_colors).unwrap_or_else(|| {
                format!(
                    "Unknown help topic: '{}'\n\nAvailable topics: {}\n\n{}",
                    topic,
                    HelpSystem::TOPICS.join(", "),
                    help_system.display_main_help(use_colors)
                )
            })
        } else {
            help_system.display_main_help(use_colors)
        }
    }
}

/// Parse phase duration from seconds string
fn parse_duration(s: &str) -> Result<u64, String> {
    parse_bounded_secs(s, 120, "Duration")
}

fn parse_timeout(s: &str) -> Result<u64, String> {
    parse_bounded_secs(s, 300, "Timeout")
}

fn parse_bounded_secs(s: &str, max: u64, what: &str) -> Result<u64, String> {
    // Reject strings with leading + sign or other invalid formats
    if s.starts_with('+') || s.starts_with("0x") || s.starts_with("0X") {
        return Err(format!("Invalid {}: {}", what.to_lowercase(), s));
    }

    s.parse::<u64>()
        .map_err(|_| format!("Invalid {}: {}", what.to_lowercase(), s))
        .and_then(|secs| {
            if secs == 0 {
                Err(format!("{} must be greater than 0", what))
            } else if secs > max {
                Err(format!("{} cannot exceed {} seconds", what, max))
            } else {
                Ok(secs)
            }
        })
}

/// Check if the terminal supports color output
pub fn supports_color() -> bool {
    if let Ok(term) = std::env::var("TERM") {
        if term == "dumb" {
            return false;
        }
    }

    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    if std::env::var("FORCE_COLOR").is_ok() {
        return true;
    }

    #[cfg(target_os = "windows")]
    {
        if std::env::var("ANSICON").is_ok() || std::env::var("ConEmuANSI").is_ok() {
            return true;
        }
    }

    #[cfg(unix)]
    {
        true
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn run_args(cli: &Cli) -> &RunArgs {
        match &cli.command {
            Some(Command::Run(run)) => run,
            other => panic!("expected run subcommand, got {:?}", other),
        }
    }

    #[test]
    fn test_run_parsing_basic() {
        let cli = Cli::parse_from(["speedtest", "run", "--duration", "5", "-c", "8"]);
        let run = run_args(&cli);
        assert_eq!(run.duration, Some(5));
        assert_eq!(run.connections, Some(8));
        assert!(run.servers.is_empty());
        assert!(!cli.verbose);
        assert!(!cli.debug);
    }

    #[test]
    fn test_run_parsing_all_options() {
        let cli = Cli::parse_from([
            "speedtest",
            "run",
            "--server", "http://a.example:3000",
            "--server", "http://b.example:3000",
            "--transport", "duplex",
            "--no-bufferbloat",
            "--stress",
            "--static-grace", "1.5",
            "--overhead-factor", "1.1",
            "--no-auto-overhead",
            "--latency-samples", "20",
            "--packet-loss-probes", "100",
            "--timeout", "30",
            "--json",
            "--verbose",
            "--no-color",
        ]);

        let run = run_args(&cli);
        assert_eq!(run.servers, vec!["http://a.example:3000", "http://b.example:3000"]);
        assert_eq!(run.transport, Some(TransportKind::Duplex));
        assert!(run.no_bufferbloat);
        assert!(run.stress);
        assert_eq!(run.static_grace, Some(1.5));
        assert_eq!(run.overhead_factor, Some(1.1));
        assert!(run.no_auto_overhead);
        assert_eq!(run.latency_samples, Some(20));
        assert_eq!(run.packet_loss_probes, Some(100));
        assert_eq!(run.timeout, Some(30));
        assert!(run.json);
        assert!(cli.verbose);
        assert!(cli.no_color);
        assert!(cli.wants_json());
    }

    #[test]
    fn test_serve_parsing() {
        let cli = Cli::parse_from(["speedtest", "serve", "--bind", "127.0.0.1:8080", "--debug"]);
        match &cli.command {
            Some(Command::Serve(serve)) => {
                assert_eq!(serve.bind.as_deref(), Some("127.0.0.1:8080"));
                assert!(serve.max_download_bytes.is_none());
            }
            other => panic!("expected serve subcommand, got {:?}", other),
        }
        assert!(cli.debug);
        assert!(!cli.wants_json());
    }

    #[test]
    fn test_bufferbloat_flags_conflict() {
        let result = Cli::try_parse_from(["speedtest", "run", "--bufferbloat", "--no-bufferbloat"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let result = Cli::try_parse_from(["speedtest", "run", "--transport", "carrier-pigeon"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_validation() {
        let cli = Cli::parse_from(["speedtest", "--color", "--no-color", "run"]);
        assert!(cli.validate().unwrap_err().contains("Cannot specify both --color and --no-color"));

        let cli = Cli::parse_from(["speedtest", "run", "--static-grace", "12"]);
        assert!(cli.validate().unwrap_err().contains("--static-grace"));

        let cli = Cli::parse_from(["speedtest", "run", "--overhead-factor", "1.5"]);
        assert!(cli.validate().unwrap_err().contains("--overhead-factor"));

        let cli = Cli::parse_from(["speedtest", "run", "--connections", "0"]);
        assert!(cli.validate().is_err());

        let cli = Cli::parse_from(["speedtest", "run", "--overhead-factor", "1.06"]);
        assert!(cli.validate().is_ok());

        let cli = Cli::parse_from(["speedtest", "serve"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(parse_duration("10").unwrap(), 10);
        assert_eq!(parse_duration("120").unwrap(), 120);
        assert_eq!(parse_duration("1").unwrap(), 1);

        assert!(parse_duration("0").is_err());
        assert!(parse_duration("121").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-5").is_err());
        assert!(parse_duration("+10").is_err());
        assert!(parse_duration("0x10").is_err());
        assert!(parse_duration("10.5").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_timeout_parsing() {
        assert_eq!(parse_timeout("300").unwrap(), 300);
        assert!(parse_timeout("301").is_err());
        assert!(parse_timeout("0").unwrap_err().contains("greater than 0"));
    }

    #[test]
    fn test_help_topic_methods() {
        let cli = Cli::parse_from(["speedtest", "--help-topic", "phases"]);
        assert!(cli.should_show_topic_help());
        assert_eq!(cli.get_help_topic(), Some("phases"));
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["speedtest", "run"]);
        assert!(!cli.should_show_topic_help());
    }

    #[test]
    fn test_help_display() {
        let cli = Cli::parse_from(["speedtest", "--no-color"]);
        let help = cli.display_help();
        assert!(help.contains("Speed Test Engine"));
        assert!(help.contains("USAGE:"));

        let cli = Cli::parse_from(["speedtest", "--no-color", "--help-topic", "config"]);
        assert!(cli.display_help().contains("CONFIGURATION REFERENCE"));

        let cli = Cli::parse_from(["speedtest", "--no-color", "--help-topic", "invalid_topic"]);
        let help = cli.display_help();
        assert!(help.contains("Unknown help topic"));
        assert!(help.contains("invalid_topic"));
        assert!(help.contains("Available topics:"));
    }

    #[test]
    fn test_use_colors_method() {
        let cli = Cli::parse_from(["speedtest", "--no-color", "run"]);
        assert!(!cli.use_colors());

        let cli = Cli::parse_from(["speedtest", "run", "--color"]);
        assert!(cli.use_colors());
    }
}
