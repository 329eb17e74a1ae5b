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

use crate::{
    backend::{ComputeBackend, DEFAULT_WORKGROUP_SIZE},
    energy::{total_energy, EnergyField},
    sampler, Configuration, DeviceFloat, Result, ThomsonError,
};
use indicatif::{ProgressBar, ProgressIterator};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default time step, dt
pub const DEFAULT_TIME_STEP: f64 = 1.0;

/// Default norm below which a point counts as collapsed onto the origin
pub const DEFAULT_EPSILON: f64 = 1e-6;

/// Total energy of each iteration, in order, plus the running minimum
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnergyHistory {
    energies: Vec<f64>,
    min_energy: f64,
}

impl Default for EnergyHistory {
    fn default() -> Self {
        Self {
            energies: Vec::new(),
            min_energy: f64::INFINITY,
        }
    }
}

impl EnergyHistory {
    /// Append the total energy of an iteration
    pub fn push(&mut self, total: f64) {
        self.energies.push(total);
        self.min_energy = self.min_energy.min(total);
    }

    pub fn energies(&self) -> &[f64] {
        &self.energies
    }

    /// Lowest total energy seen so far; +∞ when empty
    pub fn min_energy(&self) -> f64 {
        self.min_energy
    }

    pub fn len(&self) -> usize {
        self.energies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.energies.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.energies.last().copied()
    }
}

/// Outcome of [`Optimizer::run`]
#[derive(Clone, Debug)]
pub struct RunReport {
    pub history: EnergyHistory,
    /// Configuration after the last update
    pub configuration: Configuration,
    /// Number of collapsed points that were re-sampled
    pub reseeded: usize,
}

impl RunReport {
    /// Lowest total energy of the run
    pub fn best_energy(&self) -> f64 {
        self.history.min_energy()
    }
}

/// Fixed-length relaxation of points on the unit sphere.
///
/// Every iteration evaluates the energy field, records the total, scales each
/// point by its own energy times dt (taking absolute values per axis) and
/// projects it back onto the sphere. There is no convergence check and no
/// step size schedule.
#[derive(Clone, Debug)]
pub struct Optimizer {
    time_step: DeviceFloat,
    epsilon: DeviceFloat,
    workgroup_size: u32,
    show_progress: bool,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            time_step: DEFAULT_TIME_STEP as DeviceFloat,
            epsilon: DEFAULT_EPSILON as DeviceFloat,
            workgroup_size: DEFAULT_WORKGROUP_SIZE,
            show_progress: false,
        }
    }
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time step, dt > 0
    pub fn with_time_step(mut self, time_step: f64) -> Self {
        self.time_step = time_step as DeviceFloat;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon as DeviceFloat;
        self
    }

    /// Lanes per work batch when dispatching the energy field
    pub fn with_workgroup_size(mut self, workgroup_size: u32) -> Self {
        self.workgroup_size = workgroup_size;
        self
    }

    /// Show a progress bar over iterations
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn time_step(&self) -> f64 {
        self.time_step as f64
    }

    /// Relax `n` points for exactly `iterations` iterations.
    ///
    /// Starts from `initial` or, if `None`, from points sampled with `rng`.
    /// All input is checked before the backend is touched. Backend failures
    /// abort the run; collapsed points are re-sampled and the run continues.
    pub fn run<B: ComputeBackend, R: Rng>(
        &self,
        backend: &B,
        initial: Option<Configuration>,
        n: usize,
        iterations: usize,
        rng: &mut R,
    ) -> Result<RunReport> {
        self.check(n, initial.as_ref())?;
        let mut configuration = initial.unwrap_or_else(|| sampler::generate(n, rng));
        let mut field = EnergyField::new(backend, n, self.workgroup_size)?;
        let mut history = EnergyHistory::default();
        let mut reseeded = 0;

        log::info!(
            "Relaxing {} points for {} iterations on '{}' backend (dt = {})",
            n,
            iterations,
            backend.name(),
            self.time_step
        );

        let progress = if self.show_progress {
            ProgressBar::new(iterations as u64)
        } else {
            ProgressBar::hidden()
        };
        for iteration in (0..iterations).progress_with(progress) {
            reseeded += self.step(&mut field, &mut configuration, &mut history, rng)?;
            log::debug!(
                "Iteration {}: energy = {:.6}, min = {:.6}",
                iteration,
                history.last().unwrap_or(f64::NAN),
                history.min_energy()
            );
        }

        log::info!(
            "Finished {} iterations; minimum energy {:.6}, {} point(s) re-seeded",
            history.len(),
            history.min_energy(),
            reseeded
        );
        Ok(RunReport {
            history,
            configuration,
            reseeded,
        })
    }

    /// One iteration: evaluate, record the total energy, then update and renormalize.
    ///
    /// Returns the number of points that had to be re-sampled.
    pub fn step<B: ComputeBackend, R: Rng>(
        &self,
        field: &mut EnergyField<'_, B>,
        configuration: &mut Configuration,
        history: &mut EnergyHistory,
        rng: &mut R,
    ) -> Result<usize> {
        self.check_parameters()?;
        let energies = field.evaluate(configuration)?;
        history.push(total_energy(&energies));

        let mut reseeded = 0;
        for (i, energy) in energies.iter().enumerate() {
            configuration.scale_point(i, *energy, self.time_step);
            match configuration.normalize_point(i, self.epsilon) {
                Ok(()) => {}
                Err(err @ ThomsonError::DegenerateConfiguration { .. }) => {
                    log::warn!("{err}; re-seeding point {i}");
                    configuration.set_point(i, sampler::random_point(rng));
                    reseeded += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(reseeded)
    }

    fn check(&self, n: usize, initial: Option<&Configuration>) -> Result<()> {
        if n == 0 {
            return Err(ThomsonError::InvalidInput(
                "number of points must be positive".into(),
            ));
        }
        if let Some(initial) = initial.filter(|initial| initial.len() != n) {
            return Err(ThomsonError::InvalidInput(format!(
                "initial configuration has {} points, expected {}",
                initial.len(),
                n
            )));
        }
        self.check_parameters()
    }

    fn check_parameters(&self) -> Result<()> {
        if !(self.time_step.is_finite() && self.time_step > 0.0) {
            return Err(ThomsonError::InvalidInput(format!(
                "time step must be positive, got {}",
                self.time_step
            )));
        }
        // A negative epsilon would let zero-norm points through to the division
        if !(self.epsilon.is_finite() && self.epsilon >= 0.0) {
            return Err(ThomsonError::InvalidInput(format!(
                "epsilon must be non-negative, got {}",
                self.epsilon
            )));
        }
        if self.workgroup_size == 0 {
            return Err(ThomsonError::InvalidInput(
                "work batch size must be positive".into(),
            ));
        }
        Ok(())
    }
}
