//! Applies the piecewise-smooth volume solver to `.dat` volumes.

use std::{fs, path::PathBuf, process::exit};

use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{error, info, warn};

use mumford_shah_3d::{
    dat,
    volume::{ArrayDim, Layout, Volume},
    EngineKind, Par, Solver,
};

// ======================================================================
// Args

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EngineArg {
    Cpu,
    Cuda,
}

#[derive(Parser, Debug)]
#[command(name = "msvol", version, about = "Piecewise-smooth approximation of .dat volumes")]
struct Args {
    /// Input volumes in .dat format.
    #[arg(short = 'i', long = "input", num_args = 1..)]
    input: Vec<PathBuf>,

    /// Length penalty for discontinuities; negative means infinity.
    #[arg(long, default_value_t = 0.1, allow_negative_numbers = true)]
    lambda: f64,

    /// Smoothness penalty; negative means infinity.
    #[arg(long, default_value_t = 20.0, allow_negative_numbers = true)]
    alpha: f64,

    /// Temporal coupling between inputs; 0 off, negative means
    /// infinity.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    temporal: f64,

    /// Maximal number of iterations; non-positive disables solving.
    #[arg(long, default_value_t = 10_000, allow_negative_numbers = true)]
    iterations: i64,

    /// Convergence threshold.
    #[arg(long, default_value_t = 5e-5)]
    stop_eps: f64,

    /// Check convergence every k-th iteration; non-positive disables
    /// the check.
    #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
    stop_k: i64,

    /// Rescale lambda and alpha with the volume size.
    #[arg(long)]
    adapt_params: bool,

    /// Edge-preserving gradient weighting.
    #[arg(long)]
    weight: bool,

    /// Overlay detected discontinuities on the output.
    #[arg(long)]
    edges: bool,

    /// Compute in double precision.
    #[arg(long)]
    use_double: bool,

    /// Execution backend.
    #[arg(long, value_enum, default_value_t = EngineArg::Cpu)]
    engine: EngineArg,

    /// Log run statistics.
    #[arg(long)]
    verbose: bool,

    /// Process only slice k of each volume, as a 2D image.
    #[arg(long)]
    slice2d: Option<usize>,

    /// Directory to save the results to.
    #[arg(long)]
    save: Option<PathBuf>,

    /// Display the results (not supported, reported as skipped).
    #[arg(long)]
    show: bool,
}

impl Args {
    fn par(&self) -> Par {
        Par {
            lambda: self.lambda,
            alpha: self.alpha,
            temporal: self.temporal,
            iterations: self.iterations.max(0) as usize,
            stop_eps: self.stop_eps,
            stop_k: self.stop_k.max(0) as usize,
            adapt_params: self.adapt_params,
            weight: self.weight,
            edges: self.edges,
            use_double: self.use_double,
            engine: match self.engine {
                EngineArg::Cpu => EngineKind::Cpu,
                EngineArg::Cuda => EngineKind::Cuda,
            },
            verbose: self.verbose,
        }
    }
}

// ======================================================================
// FUNCTIONS

// Extracts slice `z` as a depth-1 volume. Interlaced slices are
// contiguous, so this is a single sub-range of the storage.
fn extract_slice(volume: &Volume<u8>, z: usize) -> Option<Volume<u8>> {
    let dim = volume.dim();
    if z >= dim.d {
        return None;
    }
    let slice_len = dim.c * dim.w * dim.h;
    let data = volume.data()[z * slice_len..(z + 1) * slice_len].to_vec();
    let slice_dim = ArrayDim::new(dim.w, dim.h, 1, dim.c);
    Volume::from_vec(data, slice_dim, Layout::Interlaced).ok()
}

fn output_path(dir: &std::path::Path, input: &std::path::Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "volume".to_string());
    dir.join(format!("{}_result.dat", stem))
}

// ======================================================================
// MAIN

fn main() {
    let args = Args::parse();
    env_logger::Builder::from_env(
        Env::default().default_filter_or(if args.verbose { "info" } else { "warn" }),
    )
    .init();

    let par = args.par();
    if par.verbose {
        info!("{:?}", par);
    }

    let inputs = if args.input.is_empty() {
        vec![PathBuf::from("volumes/sphere.dat")]
    } else {
        args.input.clone()
    };

    let mut volumes = Vec::new();
    for path in inputs {
        match dat::load(&path) {
            Ok(volume) => volumes.push((path, volume)),
            Err(err) => error!("could not load volume {}: {}", path.display(), err),
        }
    }
    if volumes.is_empty() {
        error!("no input volumes");
        exit(-1);
    }

    if let Some(dir) = &args.save {
        if let Err(err) = fs::create_dir_all(dir) {
            error!("could not create {}: {}", dir.display(), err);
            exit(-1);
        }
    }

    let mut solver = Solver::new();
    let mut skipped_rendering = false;
    for (path, volume) in volumes {
        let volume = match args.slice2d {
            Some(z) => match extract_slice(&volume, z) {
                Some(slice) => slice,
                None => {
                    error!(
                        "slice {} out of range for {} ({})",
                        z,
                        path.display(),
                        volume.dim()
                    );
                    continue;
                }
            },
            None => volume,
        };

        info!("solving {} ({})", path.display(), volume.dim());
        let result = match solver.run(&volume, &par) {
            Ok(result) => result,
            Err(err) => {
                error!("solving {} failed: {}", path.display(), err);
                continue;
            }
        };

        match &args.save {
            Some(dir) => {
                let out = output_path(dir, &path);
                match dat::save(&out, &result) {
                    Ok(()) => info!("saved {}", out.display()),
                    Err(err) => error!("could not save {}: {}", out.display(), err),
                }
            }
            None => {
                if args.show {
                    warn!("displaying results is not supported, result discarded");
                }
                skipped_rendering = true;
            }
        }
    }

    exit(if skipped_rendering { 1 } else { 0 });
}
