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

//! Relaxation of N points on the unit sphere by repeated parallel evaluation
//! of an all-pairs energy field on a pluggable compute backend.

pub mod backend;
pub mod config;
mod configuration;
pub mod energy;
pub mod error;
pub mod optimizer;
pub mod report;
pub mod sampler;
pub use config::{BackendKind, ExperimentConfig};
pub use configuration::Configuration;
pub use error::{BackendError, Result, ThomsonError};
pub use optimizer::{EnergyHistory, Optimizer, RunReport};
extern crate pretty_env_logger;
#[macro_use]
extern crate log;

use backend::{ComputeBackend, CpuBackend};
use serde::{Deserialize, Serialize};

/// Precision of buffers exchanged with a compute backend
pub type DeviceFloat = f32;
pub type Vector3 = nalgebra::Vector3<DeviceFloat>;

/// Energy history of an experiment and its lowest value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// Total energy of each iteration
    pub energies: Vec<f64>,
    /// Minimum of `energies`; +∞ for zero iterations
    pub min_energy: f64,
}

impl From<&RunReport> for ExperimentResult {
    fn from(report: &RunReport) -> Self {
        Self {
            energies: report.history.energies().to_vec(),
            min_energy: report.best_energy(),
        }
    }
}

/// Relax a freshly sampled configuration as described by `config`
pub fn relax<B: ComputeBackend>(backend: &B, config: &ExperimentConfig) -> Result<RunReport> {
    let (n, iterations) = config.validate()?;
    let mut rng = config.rng();
    config
        .optimizer()
        .run(backend, None, n, iterations, &mut rng)
}

/// Run one experiment and return its energy history
pub fn run_experiment<B: ComputeBackend>(
    backend: &B,
    config: &ExperimentConfig,
) -> Result<ExperimentResult> {
    let report = relax(backend, config)?;
    info!(
        "Relaxed {} points: final energy {:.6}, minimum {:.6}",
        report.configuration.len(),
        report.history.last().unwrap_or(f64::NAN),
        report.best_energy()
    );
    Ok(ExperimentResult::from(&report))
}

/// Run an experiment with default settings on the CPU backend
pub fn run_experiment_cpu(n: i64, iterations: i64) -> Result<ExperimentResult> {
    run_experiment(&CpuBackend::new(), &ExperimentConfig::new(n, iterations))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experiment_result_from_report() {
        let config = ExperimentConfig {
            seed: Some(1),
            ..ExperimentConfig::new(8, 4)
        };
        let report = relax(&CpuBackend::default(), &config).unwrap();
        let result = ExperimentResult::from(&report);
        assert_eq!(result.energies, report.history.energies());
        assert_eq!(result.min_energy, report.best_energy());
    }

    #[test]
    fn test_zero_iterations() {
        let result = run_experiment_cpu(4, 0).unwrap();
        assert!(result.energies.is_empty());
        assert_eq!(result.min_energy, f64::INFINITY);
    }
}
