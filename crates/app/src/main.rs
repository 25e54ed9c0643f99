use std::{
    path::PathBuf,
    sync::{mpsc, Arc},
    thread,
};

use clap::{Parser, Subcommand};
use framestore_core::{
    ClientMask, ClientRole, ExposureInfo, FrameObject, FrameObjectPool, Histogram,
    SimulationConfig, StoreConfig, WellKnownKind, WhiteBalanceGains,
};
use tracing_subscriber::EnvFilter;

fn main() -> framestore_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_json_file(path)?,
        None => StoreConfig::default(),
    };

    match cli.command {
        Commands::Kinds => run_kinds(&config),
        Commands::Simulate { frames } => {
            if let Some(frames) = frames {
                config.simulation.frames = frames;
            }
            run_simulation(&config)
        }
    }
}

fn run_kinds(config: &StoreConfig) -> framestore_core::Result<()> {
    let pool = FrameObjectPool::new(&config.pool)?;
    for (kind, id) in pool.kinds().iter() {
        let range = if kind.is_private() { "private" } else { "public" };
        println!("{:>4}  {:<8} {:<30} {}", id.get(), range, kind.name(), kind.description());
    }
    Ok(())
}

fn run_simulation(config: &StoreConfig) -> framestore_core::Result<()> {
    tracing::info!(capacity = config.pool.capacity, frames = config.simulation.frames, "starting simulation");

    let pool = Arc::new(FrameObjectPool::new(&config.pool)?);
    let (alg_tx, alg_rx) = mpsc::channel::<Arc<FrameObject>>();
    let (display_tx, display_rx) = mpsc::channel::<Arc<FrameObject>>();

    let alg = {
        let pool = pool.clone();
        thread::spawn(move || run_auto_alg(&pool, alg_rx))
    };
    let display = {
        let pool = pool.clone();
        let simulation = config.simulation.clone();
        thread::spawn(move || run_display(&pool, &simulation, display_rx))
    };

    let captured = run_capture(&pool, &config.simulation, &alg_tx, &display_tx);
    drop(alg_tx);
    drop(display_tx);

    for (stage, handle) in [("auto-alg", alg), ("display", display)] {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => tracing::error!(stage, "stage thread panicked"),
        }
    }
    captured?;

    let reclaimed = pool.reclaim_ready()?;
    let stats = pool.stats()?;
    tracing::info!(reclaimed, ?stats, "simulation finished");
    Ok(())
}

fn run_capture(
    pool: &FrameObjectPool,
    simulation: &SimulationConfig,
    alg_tx: &mpsc::Sender<Arc<FrameObject>>,
    display_tx: &mpsc::Sender<Arc<FrameObject>>,
) -> framestore_core::Result<()> {
    for sequence in 1..=simulation.frames {
        let dummy = simulation.dummy_every > 0 && sequence % simulation.dummy_every == 0;
        let frame = acquire_with_backpressure(pool, dummy)?;
        frame.set_client_mask(
            [ClientRole::Capture, ClientRole::AutoAlg, ClientRole::Display]
                .into_iter()
                .collect::<ClientMask>(),
        )?;

        if !dummy {
            frame.insert(
                pool.kind_id(WellKnownKind::Exposure),
                ExposureInfo {
                    exposure_time_us: 10_000 + (sequence % 8) as u32 * 250,
                    analog_gain: 1.0,
                    digital_gain: 1.0,
                },
            )?;
            frame.insert(
                pool.kind_id(WellKnownKind::Histogram),
                Histogram {
                    bins: vec![sequence as u32; 64],
                },
            )?;
        }

        // A closed channel means the stage already stopped; drop our bit anyway.
        if alg_tx.send(frame.clone()).is_err() {
            frame.clear_client_mask(ClientRole::AutoAlg)?;
        }
        if display_tx.send(frame.clone()).is_err() {
            frame.clear_client_mask(ClientRole::Display)?;
        }
        frame.clear_client_mask(ClientRole::Capture)?;
    }
    Ok(())
}

fn acquire_with_backpressure(
    pool: &FrameObjectPool,
    dummy: bool,
) -> framestore_core::Result<Arc<FrameObject>> {
    loop {
        let acquired = if dummy {
            pool.acquire_dummy()
        } else {
            pool.acquire()
        };
        match acquired {
            Ok(frame) => return Ok(frame),
            Err(err) if err.kind() == framestore_core::ErrorKind::InvalidState => {
                if pool.reclaim_ready()? == 0 {
                    thread::yield_now();
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn run_auto_alg(
    pool: &FrameObjectPool,
    frames: mpsc::Receiver<Arc<FrameObject>>,
) -> framestore_core::Result<()> {
    let exposure = pool.kind_id(WellKnownKind::Exposure);
    let white_balance = pool.kind_id(WellKnownKind::WhiteBalance);

    for frame in frames {
        if !frame.is_dummy() {
            let info = frame.get_as::<ExposureInfo>(exposure)?;
            let gain = 10_000.0 / info.exposure_time_us.max(1) as f32;
            frame.release(exposure)?;
            frame.insert(
                white_balance,
                WhiteBalanceGains {
                    red: 1.8 * gain,
                    green: 1.0,
                    blue: 1.5 * gain,
                },
            )?;
        }
        frame.clear_client_mask(ClientRole::AutoAlg)?;
    }
    Ok(())
}

fn run_display(
    pool: &FrameObjectPool,
    simulation: &SimulationConfig,
    frames: mpsc::Receiver<Arc<FrameObject>>,
) -> framestore_core::Result<()> {
    let histogram = pool.kind_id(WellKnownKind::Histogram);
    let mut shown = 0_u64;
    let mut reprocessed = 0_u64;

    for frame in frames {
        if !frame.is_dummy() {
            let bins = frame.get_as::<Histogram>(histogram)?;
            tracing::debug!(
                frame = frame.unique_id(),
                bins = bins.bins.len(),
                item = ?frame.item_name(histogram),
                "frame displayed"
            );
            frame.release(histogram)?;
            shown += 1;

            if simulation.reprocess_every > 0 && frame.unique_id() % simulation.reprocess_every == 0 {
                frame.set_reprocess_id(Some(frame.unique_id()))?;
                let copy = frame.clone_frame(false)?;
                tracing::debug!(
                    frame = copy.unique_id(),
                    items = copy.item_ids()?.len(),
                    "frame cloned for reprocessing"
                );
                reprocessed += 1;
            }
        }
        frame.clear_client_mask(ClientRole::Display)?;
    }

    tracing::info!(shown, reprocessed, "display stage drained");
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Frame metadata store driver", long_about = None)]
struct Cli {
    /// Optional JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the well-known kinds and the ids they were registered under.
    Kinds,
    /// Push frames through a capture, auto-alg and display pipeline.
    Simulate {
        /// Override the number of frames from the configuration.
        #[arg(short, long)]
        frames: Option<u64>,
    },
}
