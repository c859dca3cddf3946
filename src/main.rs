//! Speed Test Engine - Main CLI Application
//!
//! `speedtest run` measures latency, throughput, packet loss and bufferbloat
//! against a server; `speedtest serve` hosts the endpoints it measures.

use clap::Parser;
use speedtest_engine::{
    cli::{Cli, Command},
    config::{load_config, load_server_config, ConfigValidator, ValidationLevel},
    engine::{EngineMessage, Orchestrator},
    error::{AppError, Result},
    logging::Logger,
    models::TestConfig,
    output::{format_json, OutputCoordinator},
    server::SpeedTestServer,
    SpeedTestResult, PKG_NAME, VERSION,
};
use std::io::{IsTerminal, Write};
use std::process;

#[tokio::main]
async fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panic: {}", panic_info);
        eprintln!("Please report this issue with the command line that triggered it.");
        process::exit(99);
    }));

    let cli = Cli::parse();

    if let Err(message) = cli.validate() {
        eprintln!("Error: {}", message);
        process::exit(1);
    }

    let use_color = cli.use_colors();
    if let Err(e) = run_application(cli).await {
        if !e.is_abort() {
            eprintln!("{}", e.format_for_console(use_color));
            eprintln!();
            eprintln!("{}", e.user_friendly_message());
        }
        process::exit(e.exit_code());
    }
}

async fn run_application(cli: Cli) -> Result<()> {
    if cli.should_show_topic_help() || cli.command.is_none() {
        println!("{}", cli.display_help());
        return Ok(());
    }

    if cli.debug {
        eprintln!("{} v{}", PKG_NAME, VERSION);
        eprintln!("Debug mode enabled");
        eprintln!();
    }

    match cli.command.clone() {
        Some(Command::Run(_)) => run_test(cli).await,
        Some(Command::Serve(_)) => run_server(cli).await,
        None => Ok(()),
    }
}

async fn run_test(cli: Cli) -> Result<()> {
    let json = cli.wants_json();
    let config = load_config(cli)?;
    let coordinator = OutputCoordinator::for_console(config.enable_color, config.verbose);

    for warning in ConfigValidator::validate_comprehensive(&config)? {
        if config.verbose || warning.level == ValidationLevel::Warning {
            eprintln!("{}", warning.format(config.enable_color));
        }
    }

    let logger = Logger::with_config("cli", &config);
    logger
        .info("Starting speed test")
        .field("servers", &config.servers)
        .field("transport", config.transport.as_str())
        .field("duration_secs", config.duration_secs)
        .log()
        .await;

    let result = drive(&config, &coordinator, !json).await;

    match result {
        Ok(result) => {
            if json {
                println!("{}", format_json(&result)?);
            } else {
                println!("{}", coordinator.display_result(&result)?);
            }
            Ok(())
        }
        Err(e) => {
            logger.error("Speed test failed").error_info(&e).log().await;
            Err(e)
        }
    }
}

/// Run the orchestrator to completion, rendering progress on stderr.
/// Ctrl-C aborts the run.
async fn drive(config: &TestConfig, coordinator: &OutputCoordinator, show_progress: bool) -> Result<SpeedTestResult> {
    let show_progress = show_progress && std::io::stderr().is_terminal();
    let mut orchestrator = Orchestrator::new();
    let mut events = orchestrator.start(config.clone())?;
    let mut stderr = std::io::stderr();

    let outcome = loop {
        let message = tokio::select! {
            message = events.recv() => message,
            _ = tokio::signal::ctrl_c() => {
                orchestrator.abort();
                break Err(AppError::Aborted);
            }
        };

        match message {
            Some(EngineMessage::Progress(event)) if show_progress => {
                let _ = write!(stderr, "\r\x1b[2K{}", coordinator.display_progress(&event));
                let _ = stderr.flush();
            }
            Some(EngineMessage::StateChanged(state)) if config.verbose => {
                if show_progress {
                    let _ = write!(stderr, "\r\x1b[2K");
                }
                let _ = writeln!(stderr, "{}", coordinator.display_state(state));
            }
            Some(EngineMessage::Complete(result)) => break Ok(*result),
            Some(EngineMessage::Error(error)) => break Err(error),
            Some(_) => {}
            None => break Err(AppError::Aborted),
        }
    };

    if show_progress {
        let _ = writeln!(stderr, "\r\x1b[2K");
    }
    if matches!(outcome, Err(AppError::Aborted)) {
        if let Ok(line) = coordinator.display_warning("Speed test aborted") {
            let _ = writeln!(stderr, "{}", line);
        }
    }

    orchestrator.dispose().await;
    outcome
}

async fn run_server(cli: Cli) -> Result<()> {
    let use_color = cli.use_colors();
    let config = load_server_config(cli)?;

    for warning in ConfigValidator::validate_server(&config)? {
        eprintln!("{}", warning.format(use_color));
    }

    let server = SpeedTestServer::bind(config).await?;
    eprintln!("Listening on http://{}", server.local_addr());

    server
        .serve_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
