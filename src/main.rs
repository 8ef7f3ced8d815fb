mod backend;
mod config;
mod console;
mod controller;
mod error;
mod pipeline;
#[cfg(test)]
mod testing;
mod types;

use std::{io, path::PathBuf, sync::Arc, thread};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;

use crate::{
    backend::HttpBackend,
    config::ConsoleConfig,
    controller::{Event, ModeController, SubmitPolicy},
    pipeline::{
        camera::{NokhwaProvider, available_cameras},
        session::SessionManager,
        subprocess::SubprocessDetectorFactory,
    },
};

/// Operator console for live gesture recognition and sample recording.
#[derive(Debug, Parser)]
#[command(name = "gesture-console", version)]
struct Args {
    /// Config file to load instead of ./gesture-console.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Gesture backend base URL
    #[arg(long)]
    backend_url: Option<String>,

    /// Camera to open, see --list-cameras
    #[arg(long)]
    camera_index: Option<u32>,

    /// Print the available cameras and exit
    #[arg(long)]
    list_cameras: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_cameras {
        for camera in available_cameras()? {
            println!("{}: {}", camera.index, camera.label);
        }
        return Ok(());
    }

    let (mut config, files) = ConsoleConfig::load(args.config.as_deref())?;
    for file in &files {
        log::info!("loaded config from {}", file.display());
    }
    if let Some(url) = args.backend_url {
        config.backend.url = url;
    }
    if let Some(index) = args.camera_index {
        config.camera.index = index;
    }

    let backend = Arc::new(HttpBackend::new(
        &config.backend.url,
        config.backend.timeout(),
    )?);

    let (events_tx, events_rx) = unbounded();
    let (updates_tx, updates_rx) = unbounded();

    let sessions = SessionManager::new(
        Arc::new(NokhwaProvider::new(config.camera.index)),
        Arc::new(SubprocessDetectorFactory::new(config.detector.clone())),
        config.detector.landmark_count,
        events_tx.clone(),
    );
    let controller = ModeController::new(
        sessions,
        backend,
        SubmitPolicy {
            retries: config.backend.submit_retries,
            backoff: config.backend.submit_backoff(),
        },
        events_tx.clone(),
        updates_tx,
    );

    let controller_thread = thread::Builder::new()
        .name("controller".into())
        .spawn(move || controller.run(events_rx))
        .context("failed to spawn controller thread")?;
    let printer = console::spawn_printer(updates_rx, io::stdout())
        .context("failed to spawn console printer")?;

    eprintln!("gesture console ready, backend at {}. Type `help` for commands.", config.backend.url);
    let result = console::run(
        io::stdin().lock(),
        io::stderr(),
        &events_tx,
        config.recording.default_target,
    );

    let _ = events_tx.send(Event::Shutdown);
    if controller_thread.join().is_err() {
        log::error!("controller thread panicked");
    }
    // The printer ends once the controller has dropped its update sender.
    if printer.join().is_err() {
        log::error!("console printer panicked");
    }

    result
}
