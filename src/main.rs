//! cavewarp - warp-mesh calibration for clustered projection displays
//!
//! Each render node of a cave-style installation runs one cavewarp process.
//! The authoritative node takes operator input, applies each calibration
//! edit locally and broadcasts the same parameters to every replica, which
//! replays them through the identical deterministic apply path. Calibration
//! state is written through to per-display config files on every edit.

mod cluster;
mod config;
mod display;
mod influence;
mod input;
mod mesh;
mod net;
mod replicator;
mod store;

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::input::CalibratorAction;
use crate::net::{BroadcastPublisher, CalibrationCommand, CommandPublisher, NullPublisher};
use crate::replicator::{CalibrationReplicator, ReplicatorError};

/// cavewarp - distributed warp calibration for cave-style display clusters
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "cavewarp.toml")]
    config: PathBuf,

    /// Run as the authoritative operator node
    #[arg(long)]
    authority: bool,

    /// Machine identity override (defaults to the config value)
    #[arg(long)]
    machine: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("cavewarp v{}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::load_or_create(&args.config)?;
    let machine = args
        .machine
        .clone()
        .unwrap_or_else(|| config.machine.clone());
    info!("Machine identity: {}", machine);
    info!(
        "Role: {}",
        if args.authority { "authority" } else { "replica" }
    );

    let store = store::CalibrationStore::new(&config.calibration_dir);
    let targets = cluster::build_targets(&config, &store)?;

    let publisher: Box<dyn CommandPublisher> = if args.authority {
        Box::new(BroadcastPublisher::bind(&config.network.bind).await?)
    } else {
        Box::new(NullPublisher)
    };

    let replicator = Arc::new(Mutex::new(CalibrationReplicator::new(targets, publisher)));

    if args.authority {
        let (action_tx, action_rx) = mpsc::unbounded_channel();

        let key_tx = action_tx.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = input::run_key_loop(key_tx) {
                error!("Key loop failed: {}", e);
            }
        });

        // Deferred first display of the on-screen info overlay, so every
        // node has finished its own setup before the overlay is placed.
        let overlay_tx = action_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let _ = overlay_tx.send(CalibratorAction::FocusOverlay);
        });

        tokio::select! {
            result = run_authority(replicator.clone(), action_rx) => result?,
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
    } else {
        let commands = net::subscribe(&config.network.authority).await?;
        tokio::select! {
            result = run_replica(replicator.clone(), commands) => result?,
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
    }

    replicator
        .lock()
        .save_all(&machine, config.save_this_machine_only);
    info!("Calibration saved, exiting");
    Ok(())
}

/// Authority update loop: one cooperative tick drains the pending operator
/// actions in arrival order and turns each into a replicated edit.
async fn run_authority(
    replicator: Arc<Mutex<CalibrationReplicator>>,
    mut actions: mpsc::UnboundedReceiver<CalibratorAction>,
) -> Result<()> {
    let mut tick = tokio::time::interval(Duration::from_millis(16));
    loop {
        tick.tick().await;
        loop {
            match actions.try_recv() {
                Ok(CalibratorAction::Quit) => {
                    info!("Operator quit");
                    return Ok(());
                }
                Ok(action) => {
                    let mut rep = replicator.lock();
                    if let Err(e) = dispatch(&mut rep, action) {
                        error!("Edit failed: {}", e);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("Input channel closed");
                    return Ok(());
                }
            }
        }
    }
}

fn dispatch(
    rep: &mut CalibrationReplicator,
    action: CalibratorAction,
) -> Result<(), ReplicatorError> {
    match action {
        CalibratorAction::Nudge(direction) => {
            let delta = input::delta_for_mode(rep.mode());
            rep.shift(direction, delta)
        }
        CalibratorAction::CycleMode => {
            rep.cycle_mode();
            Ok(())
        }
        CalibratorAction::GrowSelection => {
            rep.adjust_grid_select_size(true);
            Ok(())
        }
        CalibratorAction::ShrinkSelection => {
            rep.adjust_grid_select_size(false);
            Ok(())
        }
        CalibratorAction::SelectNext => rep.select_next(),
        CalibratorAction::SelectPrevious => rep.select_previous(),
        CalibratorAction::NextVertex => rep.select_next_vertex(),
        CalibratorAction::PreviousVertex => rep.select_previous_vertex(),
        CalibratorAction::FocusOverlay => {
            rep.focus_info_display();
            Ok(())
        }
        CalibratorAction::Quit => Ok(()),
    }
}

/// Replica update loop: replay commands in exactly the order the authority
/// published them. A command addressing outside the local target list means
/// the cluster lists diverged, which is unrecoverable since every edit is a
/// relative delta.
async fn run_replica(
    replicator: Arc<Mutex<CalibrationReplicator>>,
    mut commands: mpsc::UnboundedReceiver<CalibrationCommand>,
) -> Result<()> {
    let mut tick = tokio::time::interval(Duration::from_millis(16));
    loop {
        tick.tick().await;
        loop {
            match commands.try_recv() {
                Ok(command) => {
                    let mut rep = replicator.lock();
                    match rep.apply(command) {
                        Ok(()) => {}
                        Err(e @ ReplicatorError::SelectionOutOfRange { .. })
                        | Err(e @ ReplicatorError::VertexOutOfRange { .. }) => {
                            return Err(anyhow::Error::new(e)
                                .context("Cluster selection lists diverged"));
                        }
                        Err(ReplicatorError::Store(e)) => {
                            error!("Persist failed: {}", e);
                        }
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("Authority disconnected");
                    return Ok(());
                }
            }
        }
    }
}
