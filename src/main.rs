// SPDX-FileCopyrightText: 2025 The swarmseed Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod cli;

use std::env;
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use fs2::FileExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

use swarmseed::announce::{LocalPayments, SeedList};
use swarmseed::catalog::store::DirStore;
use swarmseed::config::{self, Settings};
use swarmseed::engine::events::EngineEvent;
use swarmseed::engine::{Engine, EngineParameters};
use swarmseed::networking::transport::TcpTransport;
use swarmseed::status::{self, EngineStatus};

use cli::{Cli, Commands};

const DEFAULT_LOG_FILTER: LevelFilter = LevelFilter::INFO;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let base_data_dir = config::get_app_paths()
        .map(|(_, data_dir)| data_dir)
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if let Commands::Status = cli.command {
        return print_status(&base_data_dir);
    }

    let _log_guard = init_logging(&base_data_dir, cli.verbose)?;
    tracing::info!("STARTING SWARMSEED");

    let lock_path = base_data_dir.join("swarmseed.lock");
    let lock_file = File::create(&lock_path)?;
    if lock_file.try_lock_exclusive().is_err() {
        println!("swarmseed is already running.");
        return Ok(());
    }

    match config::save_default_settings() {
        Ok(true) => tracing::info!("Wrote default settings file"),
        Ok(false) => {}
        Err(e) => tracing::error!("Failed to write default settings: {}", e),
    }
    let settings = config::load_settings();
    let result = run_daemon(settings, &base_data_dir, cli.command).await;
    if let Err(e) = &result {
        tracing::error!("Daemon failed: {}", e);
    }

    let _ = FileExt::unlock(&lock_file);
    result
}

fn init_logging(data_dir: &Path, verbose: bool) -> Result<WorkerGuard, Box<dyn std::error::Error>> {
    let log_dir = data_dir.join("logs");
    fs::create_dir_all(&log_dir)?;

    let general_log = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(31)
        .filename_prefix("swarmseed")
        .filename_suffix("log")
        .build(&log_dir)?;
    let (non_blocking_general, guard) = tracing_appender::non_blocking(general_log);

    let general_layer = fmt::layer()
        .with_writer(non_blocking_general)
        .with_ansi(false)
        .with_filter(Targets::new().with_default(DEFAULT_LOG_FILTER));

    let stderr_layer = verbose.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(Targets::new().with_default(DEFAULT_LOG_FILTER))
    });

    tracing_subscriber::registry()
        .with(general_layer)
        .with(stderr_layer)
        .try_init()?;
    Ok(guard)
}

fn print_status(data_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = status::read_snapshot(&status::status_path(data_dir))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn run_daemon(
    settings: Settings,
    data_dir: &Path,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let store = DirStore::open(data_dir.join("catalog"))?;
    let seeds = Arc::new(SeedList::new());

    let engine = Engine::start(EngineParameters {
        config: settings.engine_config(data_dir),
        transport: Arc::new(TcpTransport),
        store: Arc::new(store),
        payments: Arc::new(LocalPayments),
        discovery: seeds,
    })
    .await?;

    let listener = TcpListener::bind(("0.0.0.0", settings.listen_port)).await?;
    tracing::info!(port = settings.listen_port, "Listening for peers");
    tokio::spawn(accept_loop(listener, engine.clone(), shutdown_tx.subscribe()));
    tokio::spawn(log_events(engine.clone(), shutdown_tx.subscribe()));

    run_command(&engine, &settings, command).await;

    let mut status_interval =
        tokio::time::interval(Duration::from_secs(settings.status_interval_secs.max(1)));
    status_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let started = Instant::now();
    let mut last_sample = Instant::now();

    loop {
        tokio::select! {
            _ = status_interval.tick() => {
                engine.sample_bandwidth(last_sample.elapsed());
                last_sample = Instant::now();
                let snapshot = EngineStatus::capture(&engine, started.elapsed().as_secs());
                status::dump(snapshot, data_dir, shutdown_tx.clone());
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!("Failed to listen for ctrl-c: {}", e);
                }
                break;
            }
        }
    }

    tracing::info!("Shutting down");
    engine.shutdown();
    let _ = shutdown_tx.send(());

    let final_snapshot = EngineStatus::capture(&engine, started.elapsed().as_secs());
    let status_path = status::status_path(data_dir);
    tokio::task::spawn_blocking(move || status::write_snapshot(&status_path, &final_snapshot))
        .await??;
    Ok(())
}

async fn run_command(engine: &Engine, settings: &Settings, command: Commands) {
    if let Some(remote) = command.remote_file(&settings.default_topic) {
        let file_hash = remote.file_hash.clone();
        let started = match engine.add_remote_file(remote).await {
            Ok(_) => engine.download_file_by_hash(&file_hash).await,
            Err(e) => Err(e),
        };
        match started {
            Ok(handle) => {
                tokio::spawn(async move {
                    match handle.await {
                        Ok(Ok(record)) => {
                            tracing::info!(file_hash = %record.file_hash, path = %record.local_path.display(), "Fetch complete")
                        }
                        Ok(Err(e)) => tracing::error!(file_hash = %file_hash, "Fetch failed: {}", e),
                        Err(e) => tracing::error!(file_hash = %file_hash, "Fetch task failed: {}", e),
                    }
                });
            }
            Err(e) => tracing::error!(file_hash = %file_hash, "Could not start fetch: {}", e),
        }
        return;
    }

    if let Commands::Seed { path, topic } = command {
        match engine.seed_file(&path, topic.as_deref()).await {
            Ok(record) => {
                println!("{}", record.file_hash);
                tracing::info!(file_hash = %record.file_hash, "Seeding {}", path.display());
            }
            Err(e) => tracing::error!("Could not seed {}: {}", path.display(), e),
        }
    }
}

async fn accept_loop(listener: TcpListener, engine: Engine, mut shutdown_rx: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    engine.accept_inbound(Box::new(stream), &addr.to_string());
                }
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                }
            },
            _ = shutdown_rx.recv() => break,
        }
    }
}

async fn log_events(engine: Engine, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut events = engine.subscribe();
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(EngineEvent::DownloadStarted { file_hash, file_name }) => {
                    tracing::info!(%file_hash, "Download started: {}", file_name);
                }
                Ok(EngineEvent::DownloadFinished { file_hash, file_name }) => {
                    tracing::info!(%file_hash, "Download finished: {}", file_name);
                }
                Ok(EngineEvent::Error { label, message }) => {
                    tracing::error!(%label, "{}", message);
                }
                Ok(EngineEvent::PeerCount(count)) => {
                    tracing::debug!(count, "Connected peers");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
}
