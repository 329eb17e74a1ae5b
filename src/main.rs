// Copyright 2024 Mikael Lund
//
// Licensed under the Apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// You may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// See the license for the specific language governing permissions and
// limitations under the license.

#[macro_use]
extern crate log;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use thomson::{
    backend::{ComputeBackend, CpuBackend, SimdBackend},
    report, BackendKind, ExperimentConfig, ExperimentResult,
};

/// Relax N points on the unit sphere towards low energy configurations
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// YAML file with experiment settings
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
    /// Number of points
    #[arg(short = 'n', long, allow_negative_numbers = true)]
    points: Option<i64>,
    /// Number of iterations
    #[arg(short = 'i', long, allow_negative_numbers = true)]
    iterations: Option<i64>,
    /// Seed for the random number generator
    #[arg(long)]
    seed: Option<u64>,
    /// Compute backend
    #[arg(short = 'b', long, value_enum)]
    backend: Option<BackendKind>,
    /// Time step, dt
    #[arg(long)]
    time_step: Option<f64>,
    /// Lanes per work batch
    #[arg(long)]
    workgroup_size: Option<u32>,
    /// Write energy per iteration to this file
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
    /// Write a JSON summary to this file
    #[arg(long)]
    json: Option<PathBuf>,
    /// Show a progress bar
    #[arg(long, default_value_t = false)]
    progress: bool,
}

impl Args {
    /// Settings from the config file, if any, with command line overrides
    fn experiment(&self) -> anyhow::Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::from_yaml_file(path)
                .with_context(|| format!("Cannot load config {}", path.display()))?,
            None => ExperimentConfig::default(),
        };
        if let Some(points) = self.points {
            config.points = points;
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(time_step) = self.time_step {
            config.time_step = time_step;
        }
        if let Some(workgroup_size) = self.workgroup_size {
            config.workgroup_size = workgroup_size;
        }
        config.progress |= self.progress;
        Ok(config)
    }
}

fn run<B: ComputeBackend>(
    backend: &B,
    config: &ExperimentConfig,
    args: &Args,
) -> anyhow::Result<()> {
    let run_report = thomson::relax(backend, config)?;
    report::report_run(&run_report);
    if let Some(path) = &args.output {
        report::write_history(path, &run_report.history)?;
        info!("Wrote energy history to {}", path.display());
    }
    if let Some(path) = &args.json {
        report::write_json(path, &ExperimentResult::from(&run_report))?;
        info!("Wrote summary to {}", path.display());
    }
    Ok(())
}

fn do_main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let args = Args::parse();
    let config = args.experiment()?;
    info!(
        "{} points, {} iterations, dt = {} on '{}' backend",
        config.points, config.iterations, config.time_step, config.backend
    );

    match config.backend {
        BackendKind::Cpu => run(&CpuBackend::new(), &config, &args),
        BackendKind::Simd => run(&SimdBackend::new(), &config, &args),
        #[cfg(feature = "gpu")]
        BackendKind::Gpu => {
            let backend = thomson::backend::GpuBackend::new()
                .context("Cannot initialize GPU backend")?;
            run(&backend, &config, &args)
        }
        #[cfg(not(feature = "gpu"))]
        BackendKind::Gpu => anyhow::bail!("GPU backend requires building with `--features gpu`"),
    }
}

fn main() {
    if let Err(err) = do_main() {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
