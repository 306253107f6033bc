//! replay-companion
//!
//! Keeps a rolling replay buffer of the game you are playing and saves the
//! last seconds of gameplay into a per-game clip folder on demand.

mod capture;
mod config;
mod engine;
mod error;
mod logging;
mod monitor;
mod orchestrator;

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};

use config::Config;
use engine::obs::ObsEngine;
use orchestrator::{
    create_orchestrator_channels, parse_console_line, Command, ConsoleInput, Orchestrator, Status,
    CONSOLE_HELP,
};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let logging = logging::init_logging()?;
    info!("replay-companion {} starting...", env!("CARGO_PKG_VERSION"));
    if let Ok(dir) = logging::get_log_dir() {
        info!("Logging to {}", dir.display());
    }

    let config = Config::load()?;
    info!("Configuration loaded from {:?}", config.config_path());
    info!(
        "Monitoring {} games, clips go to {}",
        config.clipping.games.len(),
        config.output_folder().display()
    );

    run(config, logging)
}

fn run(config: Config, logging: logging::LoggingGuard) -> Result<()> {
    let runtime = Arc::new(tokio::runtime::Runtime::new()?);

    if let Err(e) = runtime.block_on(engine::obs::ensure_runtime()) {
        error!("Failed to bootstrap libobs runtime: {:#}", e);
        drop(logging);
        return Err(e);
    }

    let (cmd_tx, cmd_rx, status_tx, mut status_rx) = create_orchestrator_channels();
    let (engine, signal_rx) = ObsEngine::new();
    let mut orchestrator = Orchestrator::new(config, engine, signal_rx, cmd_rx, status_tx);

    let initialized = {
        let _enter = runtime.enter();
        orchestrator.initialize()
    };
    if let Err(e) = initialized {
        error!("Failed to initialize capture engine: {}", e);
        drop(logging);
        return Err(anyhow!("Failed to initialize capture engine: {}", e));
    }

    runtime.spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(Status::ClipSaved(path)) => println!("clip saved: {}", path.display()),
                Ok(Status::SaveFailed(reason)) => println!("save failed: {}", reason),
                Ok(Status::Error(message)) => println!("error: {}", message),
                Ok(Status::StateChanged(state)) => println!("clipping: {:?}", state),
                Ok(Status::GameDetected(game)) => println!("game detected: {}", game),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Status printer lagged by {} messages", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let ctrl_c_tx = cmd_tx.clone();
    let ctrl_c_runtime = runtime.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let tx = ctrl_c_tx.clone();
        ctrl_c_runtime.spawn(async move {
            let _ = tx.send(Command::Shutdown).await;
        });
    })?;

    // Console reader; detached because stdin reads cannot be interrupted
    let console_tx = cmd_tx.clone();
    let history = logging.history().clone();
    std::thread::spawn(move || {
        println!("{}", CONSOLE_HELP);
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match parse_console_line(&line) {
                Some(ConsoleInput::Send(cmd)) => {
                    let quit = matches!(cmd, Command::Shutdown);
                    if console_tx.blocking_send(cmd).is_err() || quit {
                        break;
                    }
                }
                Some(ConsoleInput::ShowLog(count)) => {
                    for entry in history.tail(count) {
                        println!("{}", entry);
                    }
                }
                Some(ConsoleInput::Help) => println!("{}", CONSOLE_HELP),
                None if line.trim().is_empty() => {}
                None => println!("unknown command, type `help`"),
            }
        }
    });

    if let Err(e) = runtime.block_on(orchestrator.run()) {
        error!("Orchestrator error: {:#}", e);
    }

    info!("Shutdown complete");
    drop(logging);
    Ok(())
}

fn print_help() {
    println!("replay-companion - Instant replay clips for your games");
    println!();
    println!("USAGE:");
    println!("    replay-companion [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help    Print this help message");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                    Set log level (e.g., debug, info, warn)");
    println!("    REPLAY_COMPANION_LOG_PATH   Override the log directory");
    println!("    REPLAY_COMPANION_OBS_DIR    Install and load the libobs runtime from here");
    println!();
    println!("Edit the config file to choose games, encoder and audio settings.");
}
