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

use crate::{DeviceFloat, Result, ThomsonError, Vector3};
use serde::{Deserialize, Serialize};

/// Ordered set of N points stored as a flat `[x0, y0, z0, x1, y1, z1, ...]` buffer.
///
/// The flat layout is what gets uploaded to a compute backend, so no repacking
/// is needed per iteration. Points are expected to lie on the unit sphere
/// except transiently while being updated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub(crate) coords: Vec<DeviceFloat>,
}

impl Configuration {
    /// Wrap a flat coordinate buffer of length 3N, N ≥ 1
    pub fn from_flat(coords: Vec<DeviceFloat>) -> Result<Self> {
        if coords.is_empty() || coords.len() % 3 != 0 {
            return Err(ThomsonError::InvalidInput(format!(
                "expected 3N coordinates with N ≥ 1, got {}",
                coords.len()
            )));
        }
        Ok(Self { coords })
    }

    /// Build from a list of (x, y, z) points
    pub fn from_points(points: impl IntoIterator<Item = [DeviceFloat; 3]>) -> Result<Self> {
        Self::from_flat(points.into_iter().flatten().collect())
    }

    /// Number of points, N
    pub fn len(&self) -> usize {
        self.coords.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Flat coordinate buffer of length 3N
    pub fn as_flat(&self) -> &[DeviceFloat] {
        &self.coords
    }

    /// Iterate over points as `[x, y, z]` slices
    pub fn points(&self) -> impl ExactSizeIterator<Item = &[DeviceFloat]> + '_ {
        self.coords.chunks_exact(3)
    }

    /// Position of the i'th point
    pub fn point(&self, i: usize) -> Vector3 {
        Vector3::from_column_slice(&self.coords[3 * i..3 * i + 3])
    }

    /// Overwrite the position of the i'th point
    pub fn set_point(&mut self, i: usize, pos: [DeviceFloat; 3]) {
        self.coords[3 * i..3 * i + 3].copy_from_slice(&pos);
    }

    /// Apply a transformation to all positions
    pub fn transform(&mut self, transform: impl Fn(Vector3) -> Vector3) {
        self.coords.chunks_exact_mut(3).for_each(|p| {
            let new = transform(Vector3::from_column_slice(p));
            p.copy_from_slice(new.as_slice());
        });
    }

    /// Euclidean norm of the i'th point
    pub fn norm(&self, i: usize) -> DeviceFloat {
        self.point(i).norm()
    }

    /// Scale every coordinate of point i by its energy and the time step, keeping the magnitude only.
    ///
    /// The absolute value keeps points from flipping to the antipodal side but
    /// pulls them towards the positive octant.
    pub fn scale_point(&mut self, i: usize, energy: DeviceFloat, time_step: DeviceFloat) {
        self.coords[3 * i..3 * i + 3]
            .iter_mut()
            .for_each(|x| *x = (*x * energy * time_step).abs());
    }

    /// Project point i back onto the unit sphere.
    ///
    /// Fails if the norm is not finite or is at or below `epsilon`, in which case
    /// the point is left untouched.
    pub fn normalize_point(&mut self, i: usize, epsilon: DeviceFloat) -> Result<()> {
        let norm = self.norm(i);
        if !norm.is_finite() || norm <= epsilon {
            return Err(ThomsonError::DegenerateConfiguration { index: i, norm });
        }
        self.coords[3 * i..3 * i + 3]
            .iter_mut()
            .for_each(|x| *x /= norm);
        Ok(())
    }
}
