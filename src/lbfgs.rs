//! Box-constrained limited-memory BFGS.
//!
//! A projected variant: the search direction comes from the usual two-loop
//! recursion restricted to the free variables, and the backtracking line
//! search moves along the projection of that direction onto the box.

use std::collections::VecDeque;

/// Stopping rules and memory size.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LbfgsOptions {
    pub(crate) max_iter: usize,
    pub(crate) memory: usize,
    /// Stop when the projected gradient's largest entry falls below this.
    pub(crate) pg_tol: f64,
    /// Stop when the relative decrease of `f` falls below this.
    pub(crate) f_tol: f64,
}

impl Default for LbfgsOptions {
    fn default() -> Self {
        Self {
            max_iter: 200,
            memory: 10,
            pg_tol: 1e-5,
            f_tol: 1e-9,
        }
    }
}

/// Outcome of a minimization.
#[derive(Clone, Debug)]
pub(crate) struct Minimum {
    pub(crate) x: Vec<f64>,
    pub(crate) f: f64,
    pub(crate) iterations: usize,
    pub(crate) converged: bool,
    /// Objective value after every accepted step, starting point first.
    pub(crate) history: Vec<f64>,
}

const ARMIJO: f64 = 1e-4;
const MAX_BACKTRACK: usize = 40;

/// Minimize `f` over `[lower, upper]` starting from `x0`.
///
/// `f` returns the value and gradient, or `None` where it cannot be
/// evaluated; such points are rejected by the line search. Returns `None`
/// only when the (projected) starting point itself cannot be evaluated.
pub(crate) fn minimize<F>(
    mut f: F,
    x0: &[f64],
    lower: &[f64],
    upper: &[f64],
    opts: &LbfgsOptions,
) -> Option<Minimum>
where
    F: FnMut(&[f64]) -> Option<(f64, Vec<f64>)>,
{
    let mut x = project(x0, lower, upper);
    let (mut fx, mut g) = evaluate(&mut f, &x)?;
    let mut history = vec![fx];
    let mut memory: VecDeque<(Vec<f64>, Vec<f64>, f64)> = VecDeque::with_capacity(opts.memory);

    for iter in 0..opts.max_iter {
        if projected_gradient_norm(&x, &g, lower, upper) < opts.pg_tol {
            return Some(Minimum {
                x,
                f: fx,
                iterations: iter,
                converged: true,
                history,
            });
        }

        let free: Vec<bool> = (0..x.len())
            .map(|i| !((x[i] <= lower[i] && g[i] > 0.0) || (x[i] >= upper[i] && g[i] < 0.0)))
            .collect();
        let mut d = direction(&g, &memory, &free);
        if dot(&d, &g) >= 0.0 {
            memory.clear();
            d = steepest(&g, &free);
        }

        let Some((x_new, f_new, g_new)) = line_search(&mut f, &x, fx, &g, &d, lower, upper) else {
            if memory.is_empty() {
                return Some(Minimum {
                    x,
                    f: fx,
                    iterations: iter,
                    converged: false,
                    history,
                });
            }
            // The quasi-Newton model misled the search; restart from the gradient.
            memory.clear();
            continue;
        };

        let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        if sy > 1e-10 * dot(&y, &y).max(f64::MIN_POSITIVE) {
            if memory.len() == opts.memory {
                memory.pop_front();
            }
            memory.push_back((s, y, 1.0 / sy));
        }

        let rel = (fx - f_new).abs() / fx.abs().max(f_new.abs()).max(1.0);
        x = x_new;
        fx = f_new;
        g = g_new;
        history.push(fx);
        if rel < opts.f_tol {
            return Some(Minimum {
                x,
                f: fx,
                iterations: iter + 1,
                converged: true,
                history,
            });
        }
    }

    Some(Minimum {
        x,
        f: fx,
        iterations: opts.max_iter,
        converged: false,
        history,
    })
}

fn evaluate<F>(f: &mut F, x: &[f64]) -> Option<(f64, Vec<f64>)>
where
    F: FnMut(&[f64]) -> Option<(f64, Vec<f64>)>,
{
    f(x).filter(|(v, g)| v.is_finite() && g.iter().all(|c| c.is_finite()))
}

fn line_search<F>(
    f: &mut F,
    x: &[f64],
    fx: f64,
    g: &[f64],
    d: &[f64],
    lower: &[f64],
    upper: &[f64],
) -> Option<(Vec<f64>, f64, Vec<f64>)>
where
    F: FnMut(&[f64]) -> Option<(f64, Vec<f64>)>,
{
    let mut t = 1.0;
    for _ in 0..MAX_BACKTRACK {
        let trial: Vec<f64> = x.iter().zip(d).map(|(xi, di)| xi + t * di).collect();
        let trial = project(&trial, lower, upper);
        let step: Vec<f64> = trial.iter().zip(x).map(|(a, b)| a - b).collect();
        if step.iter().all(|s| s.abs() < 1e-16) {
            return None;
        }
        if let Some((f_new, g_new)) = evaluate(f, &trial) {
            if f_new <= fx + ARMIJO * dot(g, &step) {
                return Some((trial, f_new, g_new));
            }
        }
        t *= 0.5;
    }
    None
}

/// Two-loop recursion, zeroing the fixed variables.
fn direction(g: &[f64], memory: &VecDeque<(Vec<f64>, Vec<f64>, f64)>, free: &[bool]) -> Vec<f64> {
    let mut q: Vec<f64> = g
        .iter()
        .zip(free)
        .map(|(gi, &f)| if f { *gi } else { 0.0 })
        .collect();
    let mut alphas = Vec::with_capacity(memory.len());
    for (s, y, rho) in memory.iter().rev() {
        let a = rho * masked_dot(s, &q, free);
        for i in 0..q.len() {
            if free[i] {
                q[i] -= a * y[i];
            }
        }
        alphas.push(a);
    }
    let gamma = memory
        .back()
        .map_or(1.0, |(s, y, _)| {
            let yy = masked_dot(y, y, free);
            if yy > 0.0 { masked_dot(s, y, free) / yy } else { 1.0 }
        })
        .max(1e-10);
    for v in &mut q {
        *v *= gamma;
    }
    for ((s, y, rho), a) in memory.iter().zip(alphas.iter().rev()) {
        let b = rho * masked_dot(y, &q, free);
        for i in 0..q.len() {
            if free[i] {
                q[i] += s[i] * (a - b);
            }
        }
    }
    q.iter().map(|v| -v).collect()
}

fn steepest(g: &[f64], free: &[bool]) -> Vec<f64> {
    g.iter()
        .zip(free)
        .map(|(gi, &f)| if f { -gi } else { 0.0 })
        .collect()
}

fn project(x: &[f64], lower: &[f64], upper: &[f64]) -> Vec<f64> {
    x.iter()
        .zip(lower.iter().zip(upper))
        .map(|(v, (lo, hi))| v.clamp(*lo, *hi))
        .collect()
}

fn projected_gradient_norm(x: &[f64], g: &[f64], lower: &[f64], upper: &[f64]) -> f64 {
    (0..x.len())
        .map(|i| (x[i] - (x[i] - g[i]).clamp(lower[i], upper[i])).abs())
        .fold(0.0, f64::max)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(p, q)| p * q).sum()
}

fn masked_dot(a: &[f64], b: &[f64], mask: &[bool]) -> f64 {
    a.iter()
        .zip(b)
        .zip(mask)
        .filter(|(_, m)| **m)
        .map(|((p, q), _)| p * q)
        .sum()
}

/// Central-difference gradient of `f` at `x`, stepping one-sided at the
/// bounds. Returns `None` when any evaluation fails.
pub(crate) fn numeric_gradient<F>(
    f: &mut F,
    x: &[f64],
    fx: f64,
    lower: &[f64],
    upper: &[f64],
    h: f64,
) -> Option<Vec<f64>>
where
    F: FnMut(&[f64]) -> Option<f64>,
{
    let mut grad = Vec::with_capacity(x.len());
    let mut probe = x.to_vec();
    for i in 0..x.len() {
        let up = (x[i] + h).min(upper[i]);
        let down = (x[i] - h).max(lower[i]);
        let f_up = if up > x[i] {
            probe[i] = up;
            f(&probe)?
        } else {
            fx
        };
        let f_down = if down < x[i] {
            probe[i] = down;
            f(&probe)?
        } else {
            fx
        };
        probe[i] = x[i];
        let span = up - down;
        grad.push(if span > 0.0 { (f_up - f_down) / span } else { 0.0 });
    }
    Some(grad)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rosenbrock(x: &[f64]) -> Option<(f64, Vec<f64>)> {
        let (a, b) = (x[0], x[1]);
        let f = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
        let g = vec![
            -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
            200.0 * (b - a * a),
        ];
        Some((f, g))
    }

    #[test]
    fn finds_rosenbrock_minimum() {
        let opts = LbfgsOptions {
            max_iter: 500,
            ..LbfgsOptions::default()
        };
        let m = minimize(rosenbrock, &[-1.2, 1.0], &[-5.0, -5.0], &[5.0, 5.0], &opts).unwrap();
        assert!((m.x[0] - 1.0).abs() < 1e-3, "{:?}", m.x);
        assert!((m.x[1] - 1.0).abs() < 1e-3, "{:?}", m.x);
        assert!(m.history.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn respects_active_bound() {
        // Unconstrained minimum at (2, -1); the box cuts it to (1, -1).
        let f = |x: &[f64]| {
            Some((
                (x[0] - 2.0).powi(2) + (x[1] + 1.0).powi(2),
                vec![2.0 * (x[0] - 2.0), 2.0 * (x[1] + 1.0)],
            ))
        };
        let m = minimize(f, &[0.0, 0.0], &[0.0, -3.0], &[1.0, 3.0], &LbfgsOptions::default())
            .unwrap();
        assert!((m.x[0] - 1.0).abs() < 1e-9);
        assert!((m.x[1] + 1.0).abs() < 1e-5);
        assert!(m.converged);
    }

    #[test]
    fn unevaluable_start_returns_none() {
        let f = |_: &[f64]| None;
        assert!(minimize(f, &[0.0], &[-1.0], &[1.0], &LbfgsOptions::default()).is_none());
    }

    #[test]
    fn numeric_gradient_of_quadratic() {
        let mut f = |x: &[f64]| Some(x[0] * x[0] + 3.0 * x[1]);
        let x = [0.5, 1.0];
        let fx = 0.25 + 3.0;
        let g = numeric_gradient(&mut f, &x, fx, &[0.0, 0.0], &[1.0, 1.0], 1e-6).unwrap();
        assert!((g[0] - 1.0).abs() < 1e-6);
        assert!((g[1] - 3.0).abs() < 1e-6);
    }
}
