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

use crate::backend::{ComputeBackend, DispatchShape, KERNEL_ENTRY_POINT, KERNEL_SOURCE};
use crate::{Configuration, DeviceFloat, Result, ThomsonError};

/// Per-point energies, `energy[i] = Σ_{j≠i} |p_i - p_j|`, as read back from the device
pub type EnergyVector = Vec<DeviceFloat>;

/// Relative tolerance between device results (`f32`) and [`reference_energies`] (`f64`)
pub const ENERGY_TOLERANCE: f64 = 1e-4;

/// Per-point energy field evaluated on a compute backend.
///
/// Note that the "energy" of a point is the plain sum of its distances to all
/// other points; it grows with separation and is not a repulsive potential.
///
/// The kernel is compiled and the result buffer allocated once; each call to
/// [`EnergyField::evaluate`] uploads the points, dispatches one lane per point
/// and blocks until the results are downloaded.
pub struct EnergyField<'a, B: ComputeBackend> {
    backend: &'a B,
    kernel: B::Kernel,
    result: B::Buffer,
    n: usize,
    shape: DispatchShape,
}

impl<'a, B: ComputeBackend> EnergyField<'a, B> {
    /// Prepare evaluation of `n` points using work batches of `workgroup_size` lanes.
    ///
    /// The grid is padded up to a whole number of batches.
    pub fn new(backend: &'a B, n: usize, workgroup_size: u32) -> Result<Self> {
        if n == 0 {
            return Err(ThomsonError::InvalidInput(
                "number of points must be positive".into(),
            ));
        }
        if u32::try_from(n).is_err() {
            return Err(ThomsonError::InvalidInput(format!(
                "{n} points exceeds the dispatch range"
            )));
        }
        let kernel = backend.compile(KERNEL_SOURCE, KERNEL_ENTRY_POINT)?;
        let result = backend.upload(&vec![0.0; n])?;
        let shape = DispatchShape::covering(n, workgroup_size);
        log::debug!(
            "Energy field for {} points on '{}' backend: {} batches of {} lanes",
            n,
            backend.name(),
            shape.workgroups(),
            shape.local
        );
        Ok(Self {
            backend,
            kernel,
            result,
            n,
            shape,
        })
    }

    /// Override the dispatch shape, e.g. with [`DispatchShape::reference`].
    ///
    /// The grid must have at least one lane per point; [`EnergyField::evaluate`]
    /// fails with a dispatch error otherwise.
    pub fn with_shape(mut self, shape: DispatchShape) -> Self {
        self.shape = shape;
        self
    }

    /// Number of points
    pub fn n(&self) -> usize {
        self.n
    }

    pub fn shape(&self) -> DispatchShape {
        self.shape
    }

    /// Evaluate the energy of every point in `config`
    pub fn evaluate(&mut self, config: &Configuration) -> Result<EnergyVector> {
        if config.len() != self.n {
            return Err(ThomsonError::InvalidInput(format!(
                "energy field expects {} points, got {}",
                self.n,
                config.len()
            )));
        }
        let points = self.backend.upload(config.as_flat())?;
        self.backend.invoke(
            &self.kernel,
            self.shape,
            &points,
            &mut self.result,
            self.n as u32,
        )?;
        let mut energies = vec![0.0; self.n];
        self.backend.download(&self.result, &mut energies)?;
        log::trace!("Evaluated energy field of {} points", self.n);
        Ok(energies)
    }
}

/// Sequential double precision energies, for validating backends
pub fn reference_energies(config: &Configuration) -> Vec<f64> {
    let points: Vec<[f64; 3]> = config
        .points()
        .map(|p| [p[0] as f64, p[1] as f64, p[2] as f64])
        .collect();
    points
        .iter()
        .enumerate()
        .map(|(i, a)| {
            points
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, b)| {
                    let sq = (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2);
                    sq.sqrt()
                })
                .sum::<f64>()
        })
        .collect()
}

/// Total energy, summed in double precision
pub fn total_energy(energies: &[DeviceFloat]) -> f64 {
    energies.iter().map(|e| *e as f64).sum()
}
