//! Long-form help: usage, examples, environment variables and per-topic
//! explanations of how the measurements are taken.

use crate::config::env::EnvManager;
use crate::defaults;
use colored::*;

/// Topic help renderer
pub struct HelpSystem {
    platform: &'static str,
}

impl HelpSystem {
    pub const TOPICS: &'static [&'static str] = &["config", "phases", "transports", "server", "examples", "output"];

    pub fn new() -> Self {
        Self {
            platform: std::env::consts::OS,
        }
    }

    /// Display the main help message with all available options
    pub fn display_main_help(&self, use_colors: bool) -> String {
        let mut help = String::new();
        help.push_str(&self.format_header(use_colors));
        help.push('\n');
        help.push_str(&self.format_usage_section(use_colors));
        help.push('\n');
        help.push_str(&self.format_options_section(use_colors));
        help.push('\n');
        help.push_str(&self.format_examples_section(use_colors));
        help.push('\n');
        help.push_str(&self.format_environment_section(use_colors));
        help.push('\n');
        help.push_str(&self.format_footer(use_colors));
        help
    }

    /// Display quick help for specific topics
    pub fn display_topic_help(&self, topic: &str, use_colors: bool) -> Option<String> {
        match topic.to_lowercase().as_str() {
            "config" | "configuration" | "env" => Some(self.format_configuration_help(use_colors)),
            "phases" | "phase" => Some(self.format_phases_help(use_colors)),
            "transports" | "transport" => Some(self.format_transports_help(use_colors)),
            "server" | "serve" => Some(self.format_server_help(use_colors)),
            "examples" => Some(self.format_examples_section(use_colors)),
            "output" | "formatting" => Some(self.format_output_help(use_colors)),
            _ => None,
        }
    }

    fn format_header(&self, use_colors: bool) -> String {
        let title = "Speed Test Engine";
        let subtitle = "Latency, jitter, throughput, packet loss and bufferbloat measurement";
        if use_colors {
            format!(
                "{}\n{}\nVersion: {} | Platform: {}\n",
                title.bright_cyan().bold(),
                subtitle.bright_blue(),
                crate::VERSION.green(),
                self.platform.yellow()
            )
        } else {
            format!(
                "{}\n{}\nVersion: {} | Platform: {}\n",
                title,
                subtitle,
                crate::VERSION,
                self.platform
            )
        }
    }

    fn format_usage_section(&self, use_colors: bool) -> String {
        let mut usage = format!("{}\n", section("USAGE:", use_colors));
        for pattern in [
            "speedtest run [--server <URL>]... [OPTIONS]",
            "speedtest serve [--bind <ADDR>] [OPTIONS]",
            "speedtest --help-topic <TOPIC>",
        ] {
            if use_colors {
                usage.push_str(&format!("  {}\n", pattern.bright_white()));
            } else {
                usage.push_str(&format!("  {}\n", pattern));
            }
        }
        usage
    }

    fn format_options_section(&self, use_colors: bool) -> String {
        let options = [
            OptionHelp::new(Some("s"), "server", "<URL>", "Server base URL, repeatable; lowest latency wins"),
            OptionHelp::new(Some("d"), "duration", "<SECONDS>", "Length of each throughput phase (1-120)"),
            OptionHelp::new(Some("c"), "connections", "<N>", "Parallel connections per throughput phase (1-16)"),
            OptionHelp::new(Some("t"), "transport", "<KIND>", "streaming (HTTP) or duplex (WebSocket)"),
            OptionHelp::new(None, "no-bufferbloat", "", "Skip the loaded latency phase"),
            OptionHelp::new(None, "stress", "", "Report throughput stability"),
            OptionHelp::new(None, "static-grace", "<SECONDS>", "Fixed warm-up window instead of the adaptive one"),
            OptionHelp::new(None, "overhead-factor", "<FACTOR>", "Fixed protocol overhead factor (1.0-1.20)"),
            OptionHelp::new(None, "json", "", "Print the result as JSON on stdout"),
            OptionHelp::new(None, "verbose", "", "Log phase progress to stderr"),
            OptionHelp::new(None, "debug", "", "Structured debug logs on stderr"),
            OptionHelp::new(None, "no-color", "", "Disable colored output"),
        ];

        let mut output = format!("{}\n", section("OPTIONS (run):", use_colors));
        for option in options {
            output.push_str(&option.format(use_colors));
            output.push('\n');
        }
        output
    }

    fn format_examples_section(&self, use_colors: bool) -> String {
        let examples = [
            ExampleHelp {
                title: "Serve locally",
                command: "speedtest serve --bind 127.0.0.1:3000",
                description: "Host the download, upload and ping endpoints",
            },
            ExampleHelp {
                title: "Default test",
                command: "speedtest run --server http://127.0.0.1:3000",
                description: "Four connections over HTTP, ten seconds per direction",
            },
            ExampleHelp {
                title: "Duplex transport",
                command: "speedtest run --server http://127.0.0.1:3000 --transport duplex",
                description: "Every phase over one WebSocket connection",
            },
            ExampleHelp {
                title: "Pick the nearest server",
                command: "speedtest run -s http://a.example:3000 -s http://b.example:3000",
                description: "Each server is probed and the lowest latency one is used",
            },
            ExampleHelp {
                title: "Machine readable",
                command: "speedtest run --json --no-bufferbloat --duration 5",
                description: "Short test, result as JSON",
            },
        ];

        let mut output = format!("{}\n", section("EXAMPLES:", use_colors));
        for example in examples {
            output.push_str(&example.format(use_colors));
            output.push('\n');
        }
        output
    }

    fn format_environment_section(&self, use_colors: bool) -> String {
        let mut output = format!("{}\n", section("ENVIRONMENT VARIABLES:", use_colors));
        output.push_str("Configuration priority: CLI arguments > Environment variables > .env file > Defaults\n\n");

        for (var_name, description, _example) in EnvManager::get_supported_env_vars() {
            if use_colors {
                output.push_str(&format!("  {}: {}\n", var_name.bright_yellow().bold(), description.white()));
            } else {
                output.push_str(&format!("  {}: {}\n", var_name, description));
            }
        }
        output
    }

    fn format_footer(&self, use_colors: bool) -> String {
        let mut footer = format!("{}\n", section("ADDITIONAL HELP:", use_colors));
        for topic in Self::TOPICS {
            let command = format!("--help-topic {}", topic);
            if use_colors {
                footer.push_str(&format!("  {}\n", command.bright_yellow()));
            } else {
                footer.push_str(&format!("  {}\n", command));
            }
        }
        footer
    }

    fn format_configuration_help(&self, use_colors: bool) -> String {
        let mut help = format!("{}\n\n", section("CONFIGURATION REFERENCE:", use_colors));

        help.push_str("CONFIGURATION PRIORITY (highest to lowest):\n");
        help.push_str("1. Command-line arguments\n");
        help.push_str("2. Environment variables\n");
        help.push_str("3. .env file in the working directory\n");
        help.push_str("4. Default values\n\n");

        help.push_str("PARAMETER LIMITS:\n");
        help.push_str("- Duration: 1-120 seconds per throughput phase\n");
        help.push_str(&format!(
            "- Parallel connections: 1-{}\n",
            defaults::MAX_PARALLEL_CONNECTIONS
        ));
        help.push_str("- Static grace period: 0-10 seconds\n");
        help.push_str(&format!(
            "- Protocol overhead factor: 1.0-{}\n",
            defaults::MAX_OVERHEAD_FACTOR
        ));
        help.push_str(&format!(
            "- Latency samples: {}-100\n\n",
            defaults::MIN_LATENCY_SAMPLES
        ));

        help.push_str(&EnvManager::display_env_help());
        help
    }

    fn format_phases_help(&self, use_colors: bool) -> String {
        let mut help = format!("{}\n\n", section("TEST PHASES:", use_colors));
        help.push_str("1. Latency: sequential probes; ping is the mean, jitter the mean successive difference\n");
        help.push_str("2. Download: parallel connections; each gets a warm-up window excluded from the rate\n");
        help.push_str("3. Upload: same as download, in the other direction\n");
        help.push_str("4. Packet loss: short-timeout probes; lost = timed out or failed\n");
        help.push_str("5. Bufferbloat: latency while the link is saturated, rated A to F\n\n");

        help.push_str("WARM-UP WINDOW:\n");
        help.push_str("- Adaptive by default: 1s fast, 2s medium, 3s slow connections\n");
        help.push_str("- --static-grace <SECONDS> uses one fixed window for every connection\n\n");

        help.push_str("BUFFERBLOAT RATING (loaded minus idle latency):\n");
        help.push_str("  A < 20ms   B < 50ms   C < 100ms   D < 200ms   F otherwise\n");
        help
    }

    fn format_transports_help(&self, use_colors: bool) -> String {
        let mut help = format!("{}\n\n", section("TRANSPORTS:", use_colors));
        help.push_str("streaming (default):\n");
        help.push_str("  Independent HTTP requests: GET /download, POST /upload, GET /ping\n");
        help.push_str("  Supports parallel connections\n\n");
        help.push_str("duplex:\n");
        help.push_str("  One WebSocket connection carries typed control messages and binary frames\n");
        help.push_str("  Single stream: --connections above 1 is reduced to 1\n");
        help.push_str("  Frame headers are counted toward overhead; below 1% the configured factor applies\n");
        help
    }

    fn format_server_help(&self, use_colors: bool) -> String {
        let mut help = format!("{}\n\n", section("SERVER ENDPOINTS:", use_colors));
        help.push_str("  GET  /download?bytes=N   random payload, capped at the streaming limit\n");
        help.push_str("  POST /upload             counts the body and returns a receipt\n");
        help.push_str("  GET  /ping               JSON echo with server timestamp\n");
        help.push_str("  HEAD /ping               status line and X-Server-Timestamp only\n");
        help.push_str("  GET  /fastping           plain-text pong, minimal processing\n");
        help.push_str("  GET  /health             liveness and uptime\n");
        help.push_str("  GET  /status             served request and byte counters\n");
        help.push_str("  GET  /ws                 duplex socket\n\n");
        help.push_str(&format!(
            "Default caps: {}MB streaming, {}MB duplex\n",
            defaults::MAX_STREAMING_DOWNLOAD_BYTES / (1024 * 1024),
            defaults::MAX_DUPLEX_DOWNLOAD_BYTES / (1024 * 1024)
        ));
        help.push_str(&format!(
            "Rate limit: {} requests per {}s per client, except /download and /upload\n",
            defaults::DEFAULT_RATE_LIMIT_MAX_REQUESTS,
            defaults::DEFAULT_RATE_LIMIT_WINDOW.as_secs()
        ));
        help
    }

    fn format_output_help(&self, use_colors: bool) -> String {
        let mut help = format!("{}\n\n", section("OUTPUT FORMAT:", use_colors));
        help.push_str("Progress lines go to stderr, the result to stdout.\n\n");
        help.push_str("Console summary:\n");
        help.push_str("  Download / Upload in Mbps, ping and jitter in ms, packet loss in %\n");
        help.push_str("  Protocol overhead factor and whether it was detected\n");
        help.push_str("  Phases that fell back to placeholder values are marked degraded\n\n");
        help.push_str("--json prints the full result object with camelCase keys.\n");
        help
    }
}

impl Default for HelpSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn section(title: &str, use_colors: bool) -> String {
    if use_colors {
        title.bright_green().bold().to_string()
    } else {
        title.to_string()
    }
}

struct OptionHelp {
    short: Option<&'static str>,
    long: &'static str,
    value: &'static str,
    description: &'static str,
}

impl OptionHelp {
    fn new(short: Option<&'static str>, long: &'static str, value: &'static str, description: &'static str) -> Self {
        Self {
            short,
            long,
            value,
            description,
        }
    }

    fn format(&self, use_colors: bool) -> String {
        let mut option_str = String::new();

        if let Some(short) = self.short {
            if use_colors {
                option_str.push_str(&format!("  {}, ", format!("-{}", short).bright_cyan()));
            } else {
                option_str.push_str(&format!("  -{}, ", short));
            }
        } else {
            option_str.push_str("      ");
        }

        let long_with_value = if self.value.is_empty() {
            format!("--{}", self.long)
        } else {
            format!("--{} {}", self.long, self.value)
        };

        if use_colors {
            option_str.push_str(&format!("{:<30} {}", long_with_value.bright_cyan(), self.description.white()));
        } else {
            option_str.push_str(&format!("{:<30} {}", long_with_value, self.description));
        }

        option_str
    }
}

struct ExampleHelp {
    title: &'static str,
    command: &'static str,
    description: &'static str,
}

impl ExampleHelp {
    fn format(&self, use_colors: bool) -> String {
        if use_colors {
            format!(
                "  {}:\n    {}\n    {}\n",
                self.title.bright_yellow().bold(),
                self.command.bright_white(),
                self.description.bright_blue().italic()
            )
        } else {
            format!("  {}:\n    {}\n    {}\n", self.title, self.command, self.description)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_help_display() {
        let help_system = HelpSystem::new();
        let plain_help = help_system.display_main_help(false);

        assert!(plain_help.contains("Speed Test Engine"));
        assert!(plain_help.contains("USAGE:"));
        assert!(plain_help.contains("OPTIONS (run):"));
        assert!(plain_help.contains("EXAMPLES:"));
        assert!(plain_help.contains("SPEEDTEST_SERVERS"));
        assert!(plain_help.contains("--help-topic transports"));
    }

    #[test]
    fn test_every_topic_renders() {
        let help_system = HelpSystem::new();
        for topic in HelpSystem::TOPICS {
            let help = help_system.display_topic_help(topic, false);
            assert!(help.is_some_and(|h| !h.is_empty()), "topic {} missing", topic);
        }
        assert!(help_system.display_topic_help("CONFIG", false).is_some());
        assert!(help_system.display_topic_help("dns", false).is_none());
    }

    #[test]
    fn test_configuration_help_lists_limits() {
        let help = HelpSystem::new().display_topic_help("config", false).unwrap();
        assert!(help.contains("CONFIGURATION REFERENCE"));
        assert!(help.contains("Parallel connections: 1-16"));
        assert!(help.contains("Configuration Priority"));
    }

    #[test]
    fn test_phases_help_names_ratings() {
        let help = HelpSystem::new().display_topic_help("phases", false).unwrap();
        assert!(help.contains("A < 20ms"));
        assert!(help.contains("Bufferbloat"));
    }

    #[test]
    fn test_option_help_formatting() {
        let option = OptionHelp::new(Some("d"), "duration", "<SECONDS>", "Length of each phase");
        let formatted = option.format(false);
        assert!(formatted.contains("-d, "));
        assert!(formatted.contains("--duration <SECONDS>"));

        let flag = OptionHelp::new(None, "json", "", "JSON");
        assert!(flag.format(false).starts_with("      --json"));
    }

    #[test]
    fn test_color_formatting_differences() {
        let help_system = HelpSystem::new();
        colored::control::set_override(true);
        let colored_help = help_system.display_main_help(true);
        colored::control::unset_override();
        let plain_help = help_system.display_main_help(false);
        assert_ne!(colored_help, plain_help);
        assert!(!plain_help.contains("\x1b["));
    }
}
