use std::{sync::Arc, time::Duration};

use anyhow::Context;
use cobble_agent::{
    ServerId, Severity,
    config::{AgentConfig, ServerSettings},
    log_bus::{CallbackObserver, LogBus, ObserverFilter, Replay},
    registry::ServerRegistry,
    runtime::RuntimeResolver,
    supervisor::Supervisor,
    telemetry,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Grace for the final graceful stop before the tree is killed.
const EXIT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

fn print_event(message: &str, severity: Severity, _server: Option<&ServerId>) {
    match severity {
        Severity::Error | Severity::Warning => eprintln!("{message}"),
        _ => println!("{message}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env();
    let _log_guard = telemetry::init(&config.logs_dir());

    let settings = ServerSettings::from_env();
    if settings.server_path.is_none() {
        anyhow::bail!("COBBLE_SERVER_PATH must point at a server directory");
    }
    let server_id = std::env::var("COBBLE_SERVER_ID")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(ServerId)
        .unwrap_or_default();

    tracing::info!(
        server_id = %server_id,
        data_root = %config.data_root.display(),
        version = env!("CARGO_PKG_VERSION"),
        "cobble-agent starting"
    );

    let bus = LogBus::new(config.bus);
    let bus_task = bus.spawn();
    bus.register(
        Arc::new(CallbackObserver::new("stdout", print_event)),
        ObserverFilter::default(),
        Replay::None,
    )
    .await
    .context("register console observer")?;

    let runtime = Arc::new(
        RuntimeResolver::new(config.runtime_dir(), config.runtime_api_url.clone())
            .context("init runtime resolver")?,
    );
    let supervisor = Supervisor::new(server_id, config.clone(), settings, runtime, &bus);
    let registry = ServerRegistry::new();
    registry.insert(supervisor.clone())?;

    if let Err(err) = supervisor.start().await {
        tracing::error!(error = %err, hint = err.hint().unwrap_or_default(), "server did not start");
        bus.close();
        let _ = bus_task.await;
        return Err(err.into());
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut exited = false;
    loop {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        supervisor.send(line).await;
                    }
                }
                // Operator input closed; keep supervising until exit or interrupt.
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received; stopping server");
                break;
            }
            _ = supervisor.wait_for_stop(Duration::MAX) => {
                exited = true;
                break;
            }
        }
    }

    if !exited {
        registry.shutdown_all(EXIT_STOP_TIMEOUT).await;
    }

    bus.close();
    let _ = bus_task.await;
    Ok(())
}
