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

//! Experiment settings, read from YAML and overridden from the command line.

use crate::{
    backend::DEFAULT_WORKGROUP_SIZE,
    optimizer::{Optimizer, DEFAULT_EPSILON, DEFAULT_TIME_STEP},
    Result, ThomsonError,
};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path};

/// Compute backend used to evaluate the energy field
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// rayon work batches
    #[default]
    Cpu,
    /// rayon work batches with vectorized lanes
    Simd,
    /// wgpu compute shader (requires the `gpu` feature)
    Gpu,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Cpu => "cpu",
            BackendKind::Simd => "simd",
            BackendKind::Gpu => "gpu",
        };
        write!(f, "{name}")
    }
}

/// Settings of a single relaxation experiment.
///
/// Counts are signed so that malformed input is reported by [`ExperimentConfig::validate`]
/// rather than by the parser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Number of points, N
    pub points: i64,
    /// Number of iterations
    pub iterations: i64,
    /// Time step, dt
    pub time_step: f64,
    /// Norm below which a point is re-sampled
    pub epsilon: f64,
    /// Seed for the random number generator; drawn from entropy if absent
    pub seed: Option<u64>,
    /// Lanes per work batch
    pub workgroup_size: u32,
    pub backend: BackendKind,
    /// Show a progress bar
    pub progress: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            points: 16,
            iterations: 5,
            time_step: DEFAULT_TIME_STEP,
            epsilon: DEFAULT_EPSILON,
            seed: None,
            workgroup_size: DEFAULT_WORKGROUP_SIZE,
            backend: BackendKind::default(),
            progress: false,
        }
    }
}

impl ExperimentConfig {
    pub fn new(points: i64, iterations: i64) -> Self {
        Self {
            points,
            iterations,
            ..Default::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Check all settings; returns the number of points and iterations
    pub fn validate(&self) -> Result<(usize, usize)> {
        let points = usize::try_from(self.points)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                ThomsonError::InvalidInput(format!(
                    "number of points must be positive, got {}",
                    self.points
                ))
            })?;
        let iterations = usize::try_from(self.iterations).map_err(|_| {
            ThomsonError::InvalidInput(format!(
                "number of iterations must be non-negative, got {}",
                self.iterations
            ))
        })?;
        if !(self.time_step.is_finite() && self.time_step > 0.0) {
            return Err(ThomsonError::InvalidInput(format!(
                "time step must be positive, got {}",
                self.time_step
            )));
        }
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
        Ok((points, iterations))
    }

    /// Optimizer carrying these settings
    pub fn optimizer(&self) -> Optimizer {
        Optimizer::new()
            .with_time_step(self.time_step)
            .with_epsilon(self.epsilon)
            .with_workgroup_size(self.workgroup_size)
            .with_progress(self.progress)
    }

    /// Random number generator; seeded if a seed is given
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}
