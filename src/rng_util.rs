/// Generate a random `f64` in the range `[low, high)`.
#[inline]
pub(crate) fn f64_range(rng: &mut fastrand::Rng, low: f64, high: f64) -> f64 {
    low + rng.f64() * (high - low)
}

/// Draw a standard normal variate (Box-Muller).
pub(crate) fn standard_normal(rng: &mut fastrand::Rng) -> f64 {
    // 1 - u keeps the log argument in (0, 1].
    let u1 = 1.0 - rng.f64();
    let u2 = rng.f64();
    (-2.0 * u1.ln()).sqrt() * (core::f64::consts::TAU * u2).cos()
}

/// Draw `n` uniform points in the unit hypercube `[0, 1)^d`.
///
/// With the `sobol` feature the points come from an Owen-scrambled Sobol
/// sequence seeded from `rng`, otherwise they are plain uniform draws.
#[cfg(feature = "sobol")]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn unit_points(rng: &mut fastrand::Rng, n: usize, d: usize) -> Vec<Vec<f64>> {
    let seed = rng.u32(..);
    (0..n)
        .map(|i| {
            (0..d)
                .map(|j| f64::from(sobol_burley::sample(i as u32, j as u32, seed)))
                .collect()
        })
        .collect()
}

#[cfg(not(feature = "sobol"))]
pub(crate) fn unit_points(rng: &mut fastrand::Rng, n: usize, d: usize) -> Vec<Vec<f64>> {
    (0..n).map(|_| (0..d).map(|_| rng.f64()).collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_normal_moments() {
        let mut rng = fastrand::Rng::with_seed(7);
        let n = 20_000;
        let draws: Vec<f64> = (0..n).map(|_| standard_normal(&mut rng)).collect();
        #[allow(clippy::cast_precision_loss)]
        let mean = draws.iter().sum::<f64>() / n as f64;
        #[allow(clippy::cast_precision_loss)]
        let var = draws.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "var {var}");
    }

    #[test]
    fn unit_points_in_cube() {
        let mut rng = fastrand::Rng::with_seed(1);
        let pts = unit_points(&mut rng, 32, 3);
        assert_eq!(pts.len(), 32);
        assert!(pts.iter().flatten().all(|v| (0.0..1.0).contains(v)));
    }
}
