use std::path::PathBuf;
use std::rc::Rc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pint_net::comm::{mesh, SingleComm};
use pint_net::config::Config;
use pint_net::optim::run_training;

/// Train a residual network with a parallel-in-time multigrid solver.
#[derive(Parser)]
#[command(name = "pint-train", version)]
struct Args {
    /// Path to the key/value configuration file.
    config: PathBuf,

    /// Number of workers distributing the layers along the time axis.
    #[arg(long, default_value_t = 1)]
    workers: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config).context("failed to load configuration")?;

    if args.workers <= 1 {
        let summary = run_training(config, Rc::new(SingleComm))?;
        tracing::info!(
            iterations = summary.iterations,
            objective = summary.objective,
            gnorm = summary.gnorm,
            val_accuracy = summary.val_accuracy,
            "training finished"
        );
        return Ok(());
    }

    if args.workers > config.nlayers {
        bail!("more workers ({}) than layers ({})", args.workers, config.nlayers);
    }

    let handles: Vec<_> = mesh(args.workers)
        .into_iter()
        .map(|comm| {
            let config = config.clone();
            thread::spawn(move || run_training(config, Rc::new(comm)))
        })
        .collect();

    let mut summary = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(s)) => {
                if rank == 0 {
                    summary = Some(s);
                }
            }
            Ok(Err(e)) => bail!("worker {rank} failed: {e}"),
            Err(_) => bail!("worker {rank} panicked"),
        }
    }
    if let Some(summary) = summary {
        tracing::info!(
            iterations = summary.iterations,
            objective = summary.objective,
            gnorm = summary.gnorm,
            val_accuracy = summary.val_accuracy,
            "training finished"
        );
    }
    Ok(())
}
