use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use slice_augment::{
    apply::{AntsApplyTransforms, DEFAULT_APPLY_BIN},
    error::{EXIT_INVALID_INPUT, EXIT_RUN_ABORTED},
    registration::{AntsRegistration, DEFAULT_REGISTRATION_BIN},
    tools::{ToolRegistry, ToolRunner},
    CancelToken, Pipeline, RoleOverrides, RunConfig, Services, VolumePair,
};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "slice-augment")]
#[command(about = "Synthesise 2D training pairs by warping slices through registered deformation fields")]
#[command(version)]
struct Cli {
    /// 0 warnings only, 1 progress, 2 debug output including external tools.
    #[arg(short, long, global = true, default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(0..=2))]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate augmented image/segmentation pairs.
    Augment(AugmentArgs),

    /// Check that the external registration tools can be launched.
    CheckTools(ToolArgs),
}

#[derive(Debug, Clone, Args)]
struct ToolArgs {
    /// Registration executable.
    #[arg(long, default_value = DEFAULT_REGISTRATION_BIN)]
    registration_bin: PathBuf,

    /// Field application executable.
    #[arg(long, default_value = DEFAULT_APPLY_BIN)]
    apply_bin: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct AugmentArgs {
    /// Folder holding the volumes and their segmentations.
    #[arg(short = 'f', long)]
    input_folder: Option<PathBuf>,

    /// Use this image for every source instead of sampling.
    #[arg(short = 'i', long, requires = "source_seg")]
    source: Option<PathBuf>,

    /// Segmentation of --source.
    #[arg(long, requires = "source")]
    source_seg: Option<PathBuf>,

    /// Use this image for every destination instead of sampling.
    #[arg(short = 'd', long, requires = "destination_seg")]
    destination: Option<PathBuf>,

    /// Segmentation of --destination.
    #[arg(long, requires = "destination")]
    destination_seg: Option<PathBuf>,

    /// Use this image for every target instead of sampling.
    #[arg(short = 't', long, requires = "target_seg")]
    target: Option<PathBuf>,

    /// Segmentation of --target.
    #[arg(long, requires = "target")]
    target_seg: Option<PathBuf>,

    /// Output slice size along x.
    #[arg(long)]
    lx: usize,

    /// Output slice size along y.
    #[arg(long)]
    ly: usize,

    /// Target slices warped by every deformation field.
    #[arg(long = "nb", visible_alias = "slices")]
    slices: usize,

    /// Number of deformation fields to compute.
    #[arg(long = "nw", visible_alias = "wraps")]
    wraps: usize,

    /// Folder receiving the augmented pairs.
    #[arg(short = 'o', long, default_value = ".")]
    output: PathBuf,

    /// Worker threads, 0 runs serially (default: available cores).
    #[arg(long = "cpu-nb", visible_alias = "workers")]
    workers: Option<usize>,

    /// Cache every usable slice of every volume before sampling.
    #[arg(long)]
    all_slices: bool,

    /// Centre crops on the segmentation instead of the slice.
    #[arg(long)]
    center_seg: bool,

    /// Also write a PNG preview of every augmented image.
    #[arg(long)]
    preview: bool,

    /// Seed for sampling and slice selection.
    #[arg(long)]
    seed: Option<u64>,

    /// Parent folder of the slice cache (default: current directory).
    #[arg(long, default_value = ".")]
    cache_dir: PathBuf,

    /// Folder for transient deformation fields (default: output folder).
    #[arg(long)]
    work_dir: Option<PathBuf>,

    #[command(flatten)]
    tools: ToolArgs,
}

impl AugmentArgs {
    fn to_config(&self, verbosity: u8) -> RunConfig {
        let pair = |image: &Option<PathBuf>, seg: &Option<PathBuf>| {
            image
                .clone()
                .zip(seg.clone())
                .map(|(image, seg)| VolumePair::new(image, seg))
        };
        let workers = self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        });

        let mut config = RunConfig::new((self.lx, self.ly), self.slices, self.wraps);
        config.input_folder = self.input_folder.clone();
        config.overrides = RoleOverrides {
            source: pair(&self.source, &self.source_seg),
            destination: pair(&self.destination, &self.destination_seg),
            target: pair(&self.target, &self.target_seg),
        };
        config.output_folder = self.output.clone();
        config.cache_root = self.cache_dir.clone();
        config.work_dir = self.work_dir.clone().unwrap_or_else(|| self.output.clone());
        config.workers = workers;
        config.pre_slice_all = self.all_slices;
        config.center_on_segmentation = self.center_seg;
        config.previews = self.preview;
        config.verbosity = verbosity;
        config.seed = self.seed;
        config
    }
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Augment(args) => run_augment(args, cli.verbose).await,
        Commands::CheckTools(args) => run_check_tools(&args),
    }
}

async fn run_augment(args: AugmentArgs, verbosity: u8) -> ExitCode {
    let config = args.to_config(verbosity);
    let services = Services::ants(
        &args.tools.registration_bin,
        &args.tools.apply_bin,
        verbosity >= 2,
    );
    let cancel = CancelToken::new();
    let pipeline = Pipeline::new(config, services, cancel.clone());

    let mut handle = tokio::task::spawn_blocking(move || pipeline.run());
    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, stopping workers and cleaning up");
            cancel.cancel();
            handle.await
        }
    };

    match joined {
        Ok(Ok(report)) => {
            info!(
                "Wrote {} augmented pairs to {} (seed {})",
                report.samples.len(),
                args.output.display(),
                report.seed
            );
            ExitCode::SUCCESS
        }
        Ok(Err(err)) => {
            error!("{err}");
            ExitCode::from(err.exit_code())
        }
        Err(err) => {
            error!("Augmentation thread failed: {err}");
            ExitCode::from(EXIT_RUN_ABORTED)
        }
    }
}

fn run_check_tools(args: &ToolArgs) -> ExitCode {
    let mut registry = ToolRegistry::new();
    registry
        .register(Box::new(AntsRegistration::new(ToolRunner::new(
            &args.registration_bin,
        ))))
        .register(Box::new(AntsApplyTransforms::new(ToolRunner::new(
            &args.apply_bin,
        ))));

    let mut healthy = true;
    for (key, description, status) in registry.probe_all() {
        match status {
            Ok(()) => println!("OK    {key:<18} {description}"),
            Err(err) => {
                healthy = false;
                println!("FAIL  {key:<18} {description}: {err}");
            }
        }
    }
    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INVALID_INPUT)
    }
}
