use std::path::PathBuf;

use basenji::{
    commands::{basenji_evaluate, basenji_predict, basenji_train, basenji_windows},
    dataset::CancellationToken,
    prelude::BasenjiError,
    reporting::Report,
    Position,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const INFO: &str = "\
basenji: predict regulatory signal tracks from DNA sequence
usage: basenji [--help] <subcommand>

Subcommands:

  windows: tile regions (or whole sequences) with fixed-width windows.
  train: train a model as described by a TOML run configuration.
  evaluate: score a checkpoint on held-out regions.
  predict: write per-bin predictions of a checkpoint.

";

#[derive(Parser)]
#[clap(name = "basenji")]
#[clap(about = INFO)]
struct Cli {
    /// increase logging verbosity (-d: debug, -dd: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Windows {
        /// a TSV genome file of chromosome names and their lengths
        #[arg(long, required = true)]
        seqlens: PathBuf,

        /// a BED file of regions to tile (whole sequences if not specified)
        #[arg(long)]
        regions: Option<PathBuf>,

        /// the window width
        #[arg(long, required = true)]
        width: Position,

        /// the distance between window starts (the width if not specified)
        #[arg(long)]
        step: Option<Position>,

        /// a BED file of regions that windows should avoid
        #[arg(long)]
        blacklist: Option<PathBuf>,

        /// the largest blacklisted fraction of a window that is kept
        #[arg(long, default_value_t = 0.0)]
        max_blacklist_fraction: f64,

        /// an optional output file (standard output will be used if not specified)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Train {
        /// the TOML run configuration
        #[arg(long, required = true)]
        config: PathBuf,

        /// the output directory for checkpoints and metrics
        #[arg(long)]
        out: Option<PathBuf>,

        /// the random seed
        #[arg(long)]
        seed: Option<u64>,

        /// the number of optimizer steps to stop after
        #[arg(long)]
        max_steps: Option<u64>,

        /// a checkpoint to continue training from
        #[arg(long)]
        resume: Option<PathBuf>,
    },
    Evaluate {
        /// the TOML run configuration
        #[arg(long, required = true)]
        config: PathBuf,

        /// the checkpoint to evaluate
        #[arg(long, required = true)]
        checkpoint: PathBuf,

        /// a BED file of held-out regions (the configuration's if not specified)
        #[arg(long)]
        regions: Option<PathBuf>,

        /// an optional output file (standard output will be used if not specified)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Predict {
        /// the TOML run configuration
        #[arg(long, required = true)]
        config: PathBuf,

        /// the checkpoint to predict with
        #[arg(long, required = true)]
        checkpoint: PathBuf,

        /// a BED file of the regions to predict
        #[arg(long, required = true)]
        regions: PathBuf,

        /// an optional output file (standard output will be used if not specified)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_logging(debug: u8) {
    let level = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<(), BasenjiError> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let report: Report = match &cli.command {
        Some(Commands::Windows {
            seqlens,
            regions,
            width,
            step,
            blacklist,
            max_blacklist_fraction,
            output,
        }) => basenji_windows(
            seqlens,
            regions.as_ref(),
            *width,
            *step,
            blacklist.as_ref(),
            *max_blacklist_fraction,
            output.as_ref(),
        )?
        .into_parts()
        .1,
        Some(Commands::Train {
            config,
            out,
            seed,
            max_steps,
            resume,
        }) => {
            // Ctrl-C stops the run after the current step and flushes a final checkpoint
            let token = CancellationToken::new();
            token.cancel_on(tokio::signal::ctrl_c())?;
            let output = basenji_train(
                config,
                *seed,
                out.as_ref(),
                *max_steps,
                resume.as_ref(),
                token,
            )?;
            eprintln!("training stopped: {}", output.value());
            output.into_parts().1
        }
        Some(Commands::Evaluate {
            config,
            checkpoint,
            regions,
            output,
        }) => basenji_evaluate(config, checkpoint, regions.as_ref(), output.as_ref())?
            .into_parts()
            .1,
        Some(Commands::Predict {
            config,
            checkpoint,
            regions,
            output,
        }) => basenji_predict(config, checkpoint, regions, output.as_ref())?
            .into_parts()
            .1,
        None => {
            println!("{}\n", INFO);
            std::process::exit(1);
        }
    };
    if !report.is_empty() {
        eprint!("{}", report);
    }
    Ok(())
}

fn main() {
    match run() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
