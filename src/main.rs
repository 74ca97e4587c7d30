use std::process::ExitCode;

use bus_simulator::config::DEFAULT_LOG_LEVEL;
use bus_simulator::{
    http, runner, Backend, MemoryStore, RestStore, Runner, SimResult, Simulator, SimulatorConfig,
    TripStore,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
    init_logging(&log_level);

    let config = match SimulatorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match &config.backend {
        Backend::Rest { url, key } => {
            info!("Using backend at {}", url);
            match RestStore::new(url, key, config.settings.request_timeout) {
                Ok(store) => run(store, &config).await,
                Err(e) => Err(e),
            }
        }
        Backend::Fixture { dir } => match MemoryStore::from_fixture_dir(dir) {
            Ok(store) => run(store, &config).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Simulator failed to start: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run<S: TripStore>(store: S, config: &SimulatorConfig) -> SimResult<()> {
    let runner = Runner::new(Simulator::new(store, config.settings.clone()));

    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server = match config.status_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            let shutdown = async move {
                let _ = server_stopped.await;
            };
            Some(tokio::spawn(http::serve(listener, runner.subscribe(), shutdown)))
        }
        None => None,
    };

    runner.run(runner::shutdown_signal()).await;

    let _ = stop_server.send(());
    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => error!("Status endpoint failed: {}", e),
            Err(e) => error!("Status endpoint task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}

fn init_logging(level: &str) {
    // a bare level applies to this crate only; full directives pass through
    let directives = if level.contains('=') {
        level.to_string()
    } else {
        format!("warn,bus_simulator={}", level)
    };
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
