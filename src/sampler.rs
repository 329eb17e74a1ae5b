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

use crate::Configuration;
use rand::Rng;
use std::f32::consts::PI;

/// Draw a single point uniformly on the unit sphere.
///
/// The azimuth θ is uniform in [0, 2π) and the height u = cos(polar angle) is
/// uniform in [-1, 1]; sampling u rather than the polar angle avoids clustering
/// at the poles. Consumes two draws from `rng`, θ first.
pub fn random_point<R: Rng>(rng: &mut R) -> [f32; 3] {
    let theta = rng.gen_range(0.0..2.0 * PI);
    let u: f32 = rng.gen_range(-1.0..=1.0);
    let r = (1.0 - u * u).max(0.0).sqrt();
    let (theta_sin, theta_cos) = theta.sin_cos();
    [r * theta_cos, r * theta_sin, u]
}

/// Generate `n` points uniformly distributed on the unit sphere
pub fn generate<R: Rng>(n: usize, rng: &mut R) -> Configuration {
    Configuration {
        coords: (0..n).flat_map(|_| random_point(rng)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_points_on_unit_sphere() {
        let mut rng = StdRng::seed_from_u64(42);
        for n in [2, 3, 16, 100, 1000] {
            let config = generate(n, &mut rng);
            assert_eq!(config.len(), n);
            assert_eq!(config.as_flat().len(), 3 * n);
            for point in config.points() {
                let norm = (point[0] * point[0] + point[1] * point[1] + point[2] * point[2]).sqrt();
                assert_relative_eq!(norm, 1.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_uniform_coverage() {
        // Mass center of many uniform points should be close to the origin
        // and each hemisphere should hold roughly half of them
        let mut rng = StdRng::seed_from_u64(7);
        let config = generate(20000, &mut rng);
        let mut center = [0.0f64; 3];
        let mut north = 0usize;
        for p in config.points() {
            center.iter_mut().zip(p).for_each(|(c, x)| *c += *x as f64);
            if p[2] > 0.0 {
                north += 1;
            }
        }
        let n = config.len() as f64;
        for c in center {
            assert_relative_eq!(c / n, 0.0, epsilon = 2e-2);
        }
        assert_relative_eq!(north as f64 / n, 0.5, epsilon = 2e-2);
    }

    #[test]
    fn test_same_seed_same_points() {
        let a = generate(16, &mut StdRng::seed_from_u64(3));
        let b = generate(16, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }
}
