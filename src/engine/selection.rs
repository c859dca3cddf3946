//! Server selection and reachability

use crate::error::{AppError, Result};
use crate::logging::Logger;
use crate::models::TestConfig;
use crate::transport::{self, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

pub const REACHABILITY_ATTEMPTS: u32 = 3;
pub const REACHABILITY_BACKOFF: Duration = Duration::from_millis(200);

/// Probe until one attempt succeeds. Returns the network latency in
/// milliseconds, or a transport error after the last attempt.
pub async fn ensure_reachable(
    transport: &dyn Transport,
    probe_timeout: Duration,
    logger: &Logger,
) -> Result<f64> {
    let mut last_error = None;
    for attempt in 0..REACHABILITY_ATTEMPTS {
        match transport.probe_latency(probe_timeout).await {
            Ok(probe) => return Ok(probe.network_latency_ms()),
            Err(error) => {
                logger
                    .debug("Reachability probe failed")
                    .field("server", transport.endpoint())
                    .field("attempt", attempt + 1)
                    .error_info(&error)
                    .log()
                    .await;
                last_error = Some(error);
                if attempt + 1 < REACHABILITY_ATTEMPTS {
                    sleep(REACHABILITY_BACKOFF * 2u32.pow(attempt)).await;
                }
            }
        }
    }

    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
    Err(AppError::transport(format!(
        "{} unreachable after {} attempts: {}",
        transport.endpoint(),
        REACHABILITY_ATTEMPTS,
        reason
    )))
}

/// Connect to every configured server and keep the one with the lowest
/// latency. Fails only when no server could be reached.
pub async fn select_server(
    config: &TestConfig,
    logger: &Logger,
) -> Result<(String, Arc<dyn Transport>)> {
    let mut best: Option<(f64, String, Arc<dyn Transport>)> = None;
    let mut last_error = None;

    for server in &config.servers {
        let candidate = match transport::connect(config, server, logger).await {
            Ok(candidate) => candidate,
            Err(error) => {
                logger
                    .warn("Cannot connect to server")
                    .field("server", server)
                    .error_info(&error)
                    .log()
                    .await;
                last_error = Some(error);
                continue;
            }
        };

        match ensure_reachable(candidate.as_ref(), config.probe_timeout(), logger).await {
            Ok(latency) => {
                logger
                    .debug("Server candidate")
                    .field("server", server)
                    .field("latency_ms", latency)
                    .log()
                    .await;
                let better = best.as_ref().map_or(true, |(current, _, _)| latency < *current);
                if better {
                    let replaced = best.replace((latency, server.clone(), candidate));
                    if let Some((_, _, previous)) = replaced {
                        let _ = previous.close().await;
                    }
                } else {
                    let _ = candidate.close().await;
                }
            }
            Err(error) => {
                let _ = candidate.close().await;
                last_error = Some(error);
            }
        }
    }

    match best {
        Some((latency, server, transport)) => {
            logger
                .info("Selected server")
                .field("server", &server)
                .field("latency_ms", latency)
                .log()
                .await;
            Ok((server, transport))
        }
        None => Err(last_error.unwrap_or_else(|| AppError::config("No servers configured"))),
    }
}
