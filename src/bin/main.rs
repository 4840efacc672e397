use std::process::ExitCode;
use std::sync::Arc;

use rapp::cli::Cli;
use rapp::connector;
use rapp::env::Environment;
use rapp::logging::Logging;
use rapp::state::{self, State};
use rapp::VERSION;
use tracing::{error, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(err) = Logging::try_init() {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let cli = Cli::init();

    let environment = match Environment::from_env() {
        Ok(environment) => Arc::new(environment),
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if cli.print_debug_info() {
        println!("{environment:#?}");
        return ExitCode::SUCCESS;
    }

    warn!("starting InfraSonar RAPP v{VERSION}");

    let state = match State::init(Arc::clone(&environment)).await {
        Ok(state) => state,
        Err(err) => {
            error!("failed to start: {err}");
            return ExitCode::FAILURE;
        }
    };

    let reaper = tokio::spawn(state::remote_access_reaper(Arc::clone(&state)));

    tokio::select! {
        _ = connector::run(Arc::clone(&state)) => {}
        signal = shutdown_signal() => {
            warn!("signal '{signal}' received, stop RAPP");
        }
    }

    reaper.abort();
    state.shutdown();
    ExitCode::SUCCESS
}

async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            error!("failed to install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}
