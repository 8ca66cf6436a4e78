//! Acquisition maximization by an ordered chain of optimizers.
//!
//! All strategies work in the unit hypercube spanned by the input bounds, so
//! every candidate they return is inside the box by construction. Each
//! strategy receives the candidates found so far (best first) as starting
//! points, which is how `"root_5-botorch-ga"` refines its own results.
//!
//! | Token | Strategy |
//! |-------|----------|
//! | `botorch`, `gradient` | multi-start projected L-BFGS on the acquisition |
//! | `ga` | differential evolution on the acquisition |
//! | `root`, `root_<n>` | Levenberg–Marquardt on the residual components from `n` starts |

use std::cell::Cell;
use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::acquisition::Evaluators;
use crate::bounds::Bounds;
use crate::error::{Error, Result};
use crate::lbfgs::{self, LbfgsOptions};
use crate::rng_util;

/// Default number of root-finding starts.
const DEFAULT_ROOT_STARTS: usize = 5;

/// One optimizer of the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// Multi-start gradient ascent.
    Gradient,
    /// Differential evolution.
    Genetic,
    /// Least-squares root finding of the residual components.
    Root {
        /// Number of starting points.
        starts: usize,
    },
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Gradient => f.write_str("botorch"),
            OptimizerKind::Genetic => f.write_str("ga"),
            OptimizerKind::Root { starts } => write!(f, "root_{starts}"),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "botorch" | "gradient" => Ok(OptimizerKind::Gradient),
            "ga" => Ok(OptimizerKind::Genetic),
            "root" => Ok(OptimizerKind::Root {
                starts: DEFAULT_ROOT_STARTS,
            }),
            other => match other.strip_prefix("root_").map(str::parse::<usize>) {
                Some(Ok(starts)) if starts > 0 => Ok(OptimizerKind::Root { starts }),
                _ => Err(Error::UnknownOptimizer(other.to_string())),
            },
        }
    }
}

/// Ordered optimizer chain, written `a-b-c`.
///
/// # Examples
///
/// ```
/// use surrogate_optimizer::{OptimizerChain, OptimizerKind};
///
/// let chain: OptimizerChain = "root_5-botorch-ga".parse().unwrap();
/// assert_eq!(chain.kinds()[0], OptimizerKind::Root { starts: 5 });
/// assert_eq!(chain.to_string(), "root_5-botorch-ga");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OptimizerChain(Vec<OptimizerKind>);

impl OptimizerChain {
    /// Chain of the given strategies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty chain.
    pub fn new(kinds: Vec<OptimizerKind>) -> Result<Self> {
        if kinds.is_empty() {
            return Err(Error::InvalidConfig(String::from("optimizer chain is empty")));
        }
        Ok(Self(kinds))
    }

    /// Strategies in execution order.
    #[must_use]
    pub fn kinds(&self) -> &[OptimizerKind] {
        &self.0
    }
}

impl Default for OptimizerChain {
    fn default() -> Self {
        Self(vec![OptimizerKind::Gradient])
    }
}

impl fmt::Display for OptimizerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, k) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            write!(f, "{k}")?;
        }
        Ok(())
    }
}

impl FromStr for OptimizerChain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kinds = s
            .split('-')
            .filter(|t| !t.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>>>()?;
        Self::new(kinds)
    }
}

impl TryFrom<String> for OptimizerChain {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<OptimizerChain> for String {
    fn from(chain: OptimizerChain) -> Self {
        chain.to_string()
    }
}

/// Multi-start L-BFGS settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradientOptions {
    /// Random points scored to pick the starts.
    pub raw_samples: usize,
    /// Number of local optimizations.
    pub num_restarts: usize,
    /// Iterations per local optimization.
    pub max_iterations: usize,
    /// Finite-difference step in normalized coordinates.
    pub fd_step: f64,
}

impl Default for GradientOptions {
    fn default() -> Self {
        Self {
            raw_samples: 256,
            num_restarts: 8,
            max_iterations: 100,
            fd_step: 1e-4,
        }
    }
}

/// Mutation rule of the differential evolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeStrategy {
    /// `v = x_r1 + F (x_r2 − x_r3)`.
    #[default]
    Rand1,
    /// `v = x_best + F (x_r1 − x_r2)`.
    Best1,
    /// `v = x_i + F (x_best − x_i) + F (x_r1 − x_r2)`.
    CurrentToBest1,
}

/// Differential evolution settings.
///
/// | Option | Default |
/// |--------|---------|
/// | `population_size` | `max(10 d, 15)` |
/// | `generations` | 50 |
/// | `mutation_factor` | 0.8 |
/// | `crossover_rate` | 0.9 |
/// | `strategy` | `Rand1` |
/// | `tolerance` | 1e-10 |
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaOptions {
    /// Members per generation; `None` scales with the dimension.
    pub population_size: Option<usize>,
    /// Maximum number of generations.
    pub generations: usize,
    /// Differential weight `F`.
    pub mutation_factor: f64,
    /// Crossover probability `CR`.
    pub crossover_rate: f64,
    /// Mutation rule.
    pub strategy: DeStrategy,
    /// Stop once the population's acquisition spread falls below this.
    pub tolerance: f64,
}

impl Default for GaOptions {
    fn default() -> Self {
        Self {
            population_size: None,
            generations: 50,
            mutation_factor: 0.8,
            crossover_rate: 0.9,
            strategy: DeStrategy::Rand1,
            tolerance: 1e-10,
        }
    }
}

/// Levenberg–Marquardt settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RootOptions {
    /// Iterations per start.
    pub max_iterations: usize,
    /// Stop once the component norm falls below this.
    pub tolerance: f64,
    /// Finite-difference step in normalized coordinates.
    pub fd_step: f64,
    /// Initial damping.
    pub damping: f64,
    /// Random points scored to complete the starts.
    pub raw_samples: usize,
}

impl Default for RootOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-8,
            fd_step: 1e-6,
            damping: 1e-3,
            raw_samples: 64,
        }
    }
}

/// How the final candidates are ordered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum ProximityPolicy {
    /// Descending residual.
    #[default]
    Raw,
    /// Residual relative to the best so far, with improvements beyond
    /// `good_enough` treated as equal and ties broken by normalized distance
    /// to the best point.
    FavorProximity {
        /// Relative residual below which further improvement is ignored.
        good_enough: f64,
        /// Weight of the normalized distance.
        distance_weight: f64,
    },
}

impl ProximityPolicy {
    /// Proximity favoring with the usual constants: a 100x improvement is
    /// already good enough.
    #[must_use]
    pub fn favor_proximity() -> Self {
        ProximityPolicy::FavorProximity {
            good_enough: 1e-2,
            distance_weight: 1e-6,
        }
    }
}

/// Everything the chain needs besides the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Strategies in order.
    pub chain: OptimizerChain,
    /// Candidates to return.
    pub n_candidates: usize,
    /// Gradient strategy settings.
    pub gradient: GradientOptions,
    /// Genetic strategy settings.
    pub genetic: GaOptions,
    /// Root strategy settings.
    pub root: RootOptions,
    /// Final ordering.
    pub proximity: ProximityPolicy,
    /// Candidates closer than this (normalized distance) are merged.
    pub dedup_tolerance: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            chain: OptimizerChain::default(),
            n_candidates: 1,
            gradient: GradientOptions::default(),
            genetic: GaOptions::default(),
            root: RootOptions::default(),
            proximity: ProximityPolicy::Raw,
            dedup_tolerance: 1e-6,
        }
    }
}

impl SearchOptions {
    /// Check ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let bad = |what: &str| Err(Error::InvalidConfig(format!("search option {what}")));
        if self.n_candidates == 0 {
            return bad("n_candidates must be at least 1");
        }
        if self.gradient.num_restarts == 0 || self.gradient.max_iterations == 0 {
            return bad("gradient restarts and iterations must be at least 1");
        }
        if !(self.gradient.fd_step > 0.0 && self.root.fd_step > 0.0) {
            return bad("finite-difference steps must be positive");
        }
        if !(self.genetic.mutation_factor > 0.0 && self.genetic.mutation_factor <= 2.0) {
            return bad("mutation_factor must lie in (0, 2]");
        }
        if !(0.0..=1.0).contains(&self.genetic.crossover_rate) {
            return bad("crossover_rate must lie in [0, 1]");
        }
        if self.genetic.population_size.is_some_and(|p| p < 4) {
            return bad("population_size must be at least 4");
        }
        if !(self.root.damping > 0.0) {
            return bad("root damping must be positive");
        }
        if let ProximityPolicy::FavorProximity {
            good_enough,
            distance_weight,
        } = self.proximity
        {
            if !(good_enough > 0.0 && distance_weight >= 0.0) {
                return bad("proximity constants must be positive");
            }
        }
        Ok(())
    }
}

/// A proposed point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Raw input vector.
    pub x: Vec<f64>,
    /// Acquisition value.
    pub acquisition: f64,
    /// Residual of the posterior mean.
    pub residual: f64,
    /// Strategy that produced it.
    pub found_by: OptimizerKind,
}

/// Best evaluated point so far, the anchor of proximity ranking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BestPoint {
    /// Raw input vector.
    pub x: Vec<f64>,
    /// Its residual.
    pub residual: f64,
}

/// What one strategy of the chain did.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyReport {
    /// Strategy token.
    pub optimizer: String,
    /// Starting points (or population size).
    pub starts: usize,
    /// Acquisition or residual evaluations.
    pub evaluations: usize,
    /// Candidates contributed.
    pub candidates: usize,
    /// Starts that met their convergence test.
    pub converged: usize,
    /// Best acquisition value among the candidates contributed.
    pub best_acquisition: Option<f64>,
    /// Why the strategy contributed nothing, if so.
    pub message: Option<String>,
}

/// Diagnostics of a whole chain run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchDiagnostics {
    /// One report per strategy, in chain order.
    pub strategies: Vec<StrategyReport>,
    /// Distinct candidates before truncation.
    pub pool_size: usize,
    /// Whether the proximity policy changed the first candidate.
    pub proximity_changed_best: bool,
}

/// A point in the unit cube and its acquisition value.
#[derive(Clone, Debug)]
struct Found {
    u: Vec<f64>,
    acquisition: f64,
    by: OptimizerKind,
}

/// Evaluation wrapper in unit-cube coordinates.
struct Problem<'a> {
    evaluators: &'a Evaluators,
    bounds: &'a Bounds,
    evaluations: Cell<usize>,
}

impl Problem<'_> {
    fn dim(&self) -> usize {
        self.bounds.len()
    }

    fn raw(&self, us: &[Vec<f64>]) -> DMatrix<f64> {
        let d = self.dim();
        let rows: Vec<Vec<f64>> = us.iter().map(|u| self.bounds.denormalize(u)).collect();
        DMatrix::from_fn(rows.len(), d, |i, j| rows[i][j])
    }

    /// Acquisition values, non-finite mapped to −∞.
    fn acquisition(&self, us: &[Vec<f64>]) -> Result<Vec<f64>> {
        if us.is_empty() {
            return Ok(Vec::new());
        }
        self.evaluations.set(self.evaluations.get() + us.len());
        let v = self.evaluators.acquisition().evaluate(&self.raw(us))?;
        Ok(v.iter().map(|a| finite_or_worst(*a)).collect())
    }

    fn acquisition_at(&self, u: &[f64]) -> Option<f64> {
        self.acquisition(&[u.to_vec()])
            .ok()
            .and_then(|v| v.first().copied())
            .filter(|a| a.is_finite())
    }

    fn residuals(&self, us: &[Vec<f64>]) -> Result<Vec<f64>> {
        if us.is_empty() {
            return Ok(Vec::new());
        }
        self.evaluations.set(self.evaluations.get() + us.len());
        let v = self.evaluators.residual(&self.raw(us))?;
        Ok(v.iter().map(|a| finite_or_worst(*a)).collect())
    }

    fn components_at(&self, u: &[f64]) -> Option<DVector<f64>> {
        self.evaluations.set(self.evaluations.get() + 1);
        let c = self
            .evaluators
            .residual_components(&self.raw(&[u.to_vec()]))
            .ok()?;
        let row = c.row(0).transpose();
        row.iter().all(|v| v.is_finite()).then_some(row)
    }
}

fn finite_or_worst(v: f64) -> f64 {
    if v.is_nan() { f64::NEG_INFINITY } else { v }
}

/// Descending by value, then ascending by index.
fn order_desc(values: &[f64]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| {
        finite_or_worst(values[b])
            .total_cmp(&finite_or_worst(values[a]))
            .then(a.cmp(&b))
    });
    idx
}

/// Run every strategy of the chain and return up to `n_candidates` ranked
/// candidates.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] for bad options or a bounds/model
/// dimension mismatch, and [`Error::AcquisitionFailed`] (with the full
/// diagnostics) when the chain produced no candidate.
pub fn run_chain(
    evaluators: &Evaluators,
    bounds: &Bounds,
    options: &SearchOptions,
    seed: u64,
    best: Option<&BestPoint>,
) -> Result<(Vec<Candidate>, SearchDiagnostics)> {
    options.validate()?;
    if bounds.len() != evaluators.model().n_inputs() {
        return Err(Error::ShapeMismatch {
            what: "bounds vs model inputs",
            expected: evaluators.model().n_inputs(),
            got: bounds.len(),
        });
    }
    let problem = Problem {
        evaluators,
        bounds,
        evaluations: Cell::new(0),
    };
    let mut diagnostics = SearchDiagnostics::default();
    let mut pool: Vec<Found> = Vec::new();

    for (step, kind) in options.chain.kinds().iter().enumerate() {
        let mut rng = fastrand::Rng::with_seed(seed.wrapping_add(step as u64));
        let seeds: Vec<Vec<f64>> = pool.iter().map(|f| f.u.clone()).collect();
        problem.evaluations.set(0);
        let (found, mut report) = match *kind {
            OptimizerKind::Gradient => gradient_search(&problem, &seeds, &options.gradient, &mut rng)?,
            OptimizerKind::Genetic => {
                genetic_search(&problem, &seeds, &options.genetic, options.n_candidates, &mut rng)?
            }
            OptimizerKind::Root { starts } => {
                root_search(&problem, &seeds, &options.root, starts, &mut rng)?
            }
        };
        report.optimizer = kind.to_string();
        report.evaluations = problem.evaluations.get();
        report.candidates = found.len();
        report.best_acquisition = found
            .iter()
            .map(|f| f.acquisition)
            .filter(|a| a.is_finite())
            .reduce(f64::max);
        trace_info!(
            optimizer = %kind,
            candidates = report.candidates,
            converged = report.converged,
            evaluations = report.evaluations,
            best = report.best_acquisition.unwrap_or(f64::NAN),
            "optimizer finished"
        );
        diagnostics.strategies.push(report);
        pool.extend(found);
        pool = dedup(pool, bounds, options.dedup_tolerance);
        let order = order_desc(&pool.iter().map(|f| f.acquisition).collect::<Vec<_>>());
        pool = order.into_iter().map(|i| pool[i].clone()).collect();
    }

    pool.retain(|f| f.acquisition > f64::NEG_INFINITY);
    diagnostics.pool_size = pool.len();
    if pool.is_empty() {
        return Err(Error::AcquisitionFailed {
            reason: format!("no optimizer in '{}' produced a candidate", options.chain),
            diagnostics: Box::new(diagnostics),
        });
    }

    let raw: Vec<Vec<f64>> = pool.iter().map(|f| force_in_bounds(bounds, &f.u)).collect();
    let residuals = evaluators.residual(&DMatrix::from_fn(raw.len(), bounds.len(), |i, j| raw[i][j]))?;
    let mut candidates: Vec<Candidate> = pool
        .iter()
        .zip(raw)
        .enumerate()
        .map(|(i, (f, x))| Candidate {
            x,
            acquisition: f.acquisition,
            residual: residuals[i],
            found_by: f.by,
        })
        .collect();

    let raw_order = rank_candidates(&candidates, None, bounds, ProximityPolicy::Raw);
    let order = rank_candidates(&candidates, best, bounds, options.proximity);
    diagnostics.proximity_changed_best = order.first() != raw_order.first();
    if diagnostics.proximity_changed_best {
        trace_info!("selection of the best candidate accounted for proximity");
    }
    let mut slots: Vec<Option<Candidate>> = candidates.drain(..).map(Some).collect();
    let ranked: Vec<Candidate> = order
        .into_iter()
        .take(options.n_candidates)
        .filter_map(|i| slots[i].take())
        .collect();
    if ranked.len() < options.n_candidates {
        trace_warn!(
            requested = options.n_candidates,
            found = ranked.len(),
            "fewer distinct candidates than requested"
        );
    }
    Ok((ranked, diagnostics))
}

/// Order candidates by `policy`; returns indices into `candidates`.
///
/// `FavorProximity` scores each candidate by `max(res / res_best,
/// good_enough) + distance_weight · dist(x, x_best)` (ascending), so once a
/// candidate is already `good_enough` times better than the best point, a
/// nearer one wins. Without an anchor, or with a non-negative best residual,
/// it falls back to descending residual.
///
/// # Examples
///
/// ```
/// use surrogate_optimizer::{BestPoint, Bounds, Candidate, OptimizerKind, ProximityPolicy, rank_candidates};
///
/// let bounds = Bounds::new([("x", 0.0, 1.0)]).unwrap();
/// let c = |x: f64, residual: f64| Candidate {
///     x: vec![x],
///     acquisition: residual,
///     residual,
///     found_by: OptimizerKind::Gradient,
/// };
/// let cands = [c(1.0, -0.001), c(0.05, -0.005)];
/// let best = BestPoint { x: vec![0.0], residual: -1.0 };
/// assert_eq!(rank_candidates(&cands, Some(&best), &bounds, ProximityPolicy::Raw), vec![0, 1]);
/// let favor = ProximityPolicy::favor_proximity();
/// assert_eq!(rank_candidates(&cands, Some(&best), &bounds, favor), vec![1, 0]);
/// ```
#[must_use]
pub fn rank_candidates(
    candidates: &[Candidate],
    best: Option<&BestPoint>,
    bounds: &Bounds,
    policy: ProximityPolicy,
) -> Vec<usize> {
    let residuals: Vec<f64> = candidates.iter().map(|c| c.residual).collect();
    let raw = order_desc(&residuals);
    let ProximityPolicy::FavorProximity {
        good_enough,
        distance_weight,
    } = policy
    else {
        return raw;
    };
    let Some(best) = best.filter(|b| b.residual < 0.0 && b.residual.is_finite()) else {
        return raw;
    };
    let scores: Vec<f64> = candidates
        .iter()
        .map(|c| {
            let relative = if c.residual.is_nan() {
                f64::INFINITY
            } else {
                (c.residual / best.residual).max(good_enough)
            };
            relative + distance_weight * bounds.normalized_distance(&best.x, &c.x)
        })
        .collect();
    let mut idx: Vec<usize> = (0..candidates.len()).collect();
    idx.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]).then(a.cmp(&b)));
    idx
}

fn force_in_bounds(bounds: &Bounds, u: &[f64]) -> Vec<f64> {
    let clamped: Vec<f64> = u.iter().map(|v| v.clamp(0.0, 1.0)).collect();
    bounds.clip(&bounds.denormalize(&clamped))
}

/// Merge points closer than `tol`, keeping the higher acquisition.
fn dedup(pool: Vec<Found>, bounds: &Bounds, tol: f64) -> Vec<Found> {
    let unit = |u: &[f64]| bounds.denormalize(u);
    let mut kept: Vec<Found> = Vec::with_capacity(pool.len());
    for f in pool {
        let x = unit(&f.u);
        match kept
            .iter_mut()
            .find(|k| bounds.normalized_distance(&unit(&k.u), &x) < tol)
        {
            Some(k) if f.acquisition > k.acquisition => *k = f,
            Some(_) => {}
            None => kept.push(f),
        }
    }
    kept
}

fn gradient_search(
    problem: &Problem<'_>,
    seeds: &[Vec<f64>],
    opts: &GradientOptions,
    rng: &mut fastrand::Rng,
) -> Result<(Vec<Found>, StrategyReport)> {
    let d = problem.dim();
    let lower = vec![0.0; d];
    let upper = vec![1.0; d];
    let raw = rng_util::unit_points(rng, opts.raw_samples, d);
    let values = problem.acquisition(&raw)?;

    let mut starts: Vec<Vec<f64>> = seeds.iter().take(opts.num_restarts).cloned().collect();
    starts.extend(
        order_desc(&values)
            .into_iter()
            .filter(|&i| values[i] > f64::NEG_INFINITY)
            .take(opts.num_restarts.saturating_sub(starts.len()))
            .map(|i| raw[i].clone()),
    );

    let lbfgs_opts = LbfgsOptions {
        max_iter: opts.max_iterations,
        ..LbfgsOptions::default()
    };
    let mut found = Vec::with_capacity(starts.len());
    let mut report = StrategyReport {
        starts: starts.len(),
        ..StrategyReport::default()
    };
    for start in &starts {
        let objective = |u: &[f64]| {
            let fx = -problem.acquisition_at(u)?;
            let mut value = |v: &[f64]| problem.acquisition_at(v).map(|a| -a);
            let g = lbfgs::numeric_gradient(&mut value, u, fx, &lower, &upper, opts.fd_step)?;
            Some((fx, g))
        };
        match lbfgs::minimize(objective, start, &lower, &upper, &lbfgs_opts) {
            Some(min) => {
                report.converged += usize::from(min.converged);
                found.push(Found {
                    u: min.x,
                    acquisition: -min.f,
                    by: OptimizerKind::Gradient,
                });
            }
            None => trace_debug!("gradient start could not be evaluated"),
        }
    }
    if found.is_empty() {
        report.message = Some(String::from("no start could be evaluated"));
    }
    Ok((found, report))
}

fn genetic_search(
    problem: &Problem<'_>,
    seeds: &[Vec<f64>],
    opts: &GaOptions,
    keep: usize,
    rng: &mut fastrand::Rng,
) -> Result<(Vec<Found>, StrategyReport)> {
    let d = problem.dim();
    let size = opts.population_size.unwrap_or((10 * d).max(15)).max(4);
    let mut pop: Vec<Vec<f64>> = seeds.iter().take(size).cloned().collect();
    pop.extend(rng_util::unit_points(rng, size - pop.len(), d));
    let mut values = problem.acquisition(&pop)?;
    let mut report = StrategyReport {
        starts: size,
        ..StrategyReport::default()
    };

    for generation in 0..opts.generations {
        let best = order_desc(&values)[0];
        let trials: Vec<Vec<f64>> = (0..size)
            .map(|i| {
                let mutant = mutant(rng, &pop, i, best, opts);
                let j_rand = rng.usize(0..d.max(1));
                (0..d)
                    .map(|j| {
                        let v = if j == j_rand || rng.f64() < opts.crossover_rate {
                            mutant[j]
                        } else {
                            pop[i][j]
                        };
                        v.clamp(0.0, 1.0)
                    })
                    .collect()
            })
            .collect();
        let trial_values = problem.acquisition(&trials)?;
        for (i, (t, v)) in trials.into_iter().zip(trial_values).enumerate() {
            if v >= values[i] {
                pop[i] = t;
                values[i] = v;
            }
        }
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let spread = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            - finite.iter().copied().fold(f64::INFINITY, f64::min);
        if finite.len() == size && spread < opts.tolerance {
            trace_debug!(generation, "population collapsed, stopping early");
            report.converged = 1;
            break;
        }
    }

    let found: Vec<Found> = order_desc(&values)
        .into_iter()
        .filter(|&i| values[i] > f64::NEG_INFINITY)
        .take(keep.max(1))
        .map(|i| Found {
            u: pop[i].clone(),
            acquisition: values[i],
            by: OptimizerKind::Genetic,
        })
        .collect();
    if found.is_empty() {
        report.message = Some(String::from("no member of the population could be evaluated"));
    }
    Ok((found, report))
}

/// Mutant vector for member `target`; partners are drawn without
/// replacement and never include `target`.
fn mutant(
    rng: &mut fastrand::Rng,
    pop: &[Vec<f64>],
    target: usize,
    best: usize,
    opts: &GaOptions,
) -> Vec<f64> {
    let f = opts.mutation_factor;
    let d = pop[target].len();
    match opts.strategy {
        DeStrategy::Rand1 => {
            let r = distinct_indices(rng, pop.len(), 3, target);
            (0..d)
                .map(|j| pop[r[0]][j] + f * (pop[r[1]][j] - pop[r[2]][j]))
                .collect()
        }
        DeStrategy::Best1 => {
            let r = distinct_indices(rng, pop.len(), 2, target);
            (0..d)
                .map(|j| pop[best][j] + f * (pop[r[0]][j] - pop[r[1]][j]))
                .collect()
        }
        DeStrategy::CurrentToBest1 => {
            let r = distinct_indices(rng, pop.len(), 2, target);
            (0..d)
                .map(|j| {
                    pop[target][j]
                        + f * (pop[best][j] - pop[target][j])
                        + f * (pop[r[0]][j] - pop[r[1]][j])
                })
                .collect()
        }
    }
}

fn distinct_indices(rng: &mut fastrand::Rng, n: usize, count: usize, exclude: usize) -> Vec<usize> {
    let mut selected = Vec::with_capacity(count);
    while selected.len() < count {
        let idx = rng.usize(0..n);
        if idx != exclude && !selected.contains(&idx) {
            selected.push(idx);
        }
    }
    selected
}

fn root_search(
    problem: &Problem<'_>,
    seeds: &[Vec<f64>],
    opts: &RootOptions,
    n_starts: usize,
    rng: &mut fastrand::Rng,
) -> Result<(Vec<Found>, StrategyReport)> {
    let d = problem.dim();
    let mut starts: Vec<Vec<f64>> = seeds.iter().take(n_starts).cloned().collect();
    if starts.len() < n_starts {
        let raw = rng_util::unit_points(rng, opts.raw_samples.max(n_starts), d);
        let res = problem.residuals(&raw)?;
        starts.extend(
            order_desc(&res)
                .into_iter()
                .take(n_starts - starts.len())
                .map(|i| raw[i].clone()),
        );
    }
    let mut report = StrategyReport {
        starts: starts.len(),
        ..StrategyReport::default()
    };

    let mut solved = Vec::with_capacity(starts.len());
    for start in starts {
        if let Some((u, converged)) = levenberg_marquardt(problem, start, opts) {
            report.converged += usize::from(converged);
            solved.push(u);
        }
    }
    let values = problem.acquisition(&solved)?;
    let found: Vec<Found> = solved
        .into_iter()
        .zip(values)
        .map(|(u, acquisition)| Found {
            u,
            acquisition,
            by: OptimizerKind::Root { starts: n_starts },
        })
        .collect();
    if found.is_empty() {
        report.message = Some(String::from("residual components could not be evaluated"));
    }
    Ok((found, report))
}

/// Damped Gauss–Newton on `½‖r(u)‖²` inside the unit cube.
fn levenberg_marquardt(
    problem: &Problem<'_>,
    start: Vec<f64>,
    opts: &RootOptions,
) -> Option<(Vec<f64>, bool)> {
    let d = start.len();
    let mut u = start;
    let mut r = problem.components_at(&u)?;
    if r.is_empty() {
        return None;
    }
    let mut cost = r.norm_squared();
    let mut lambda = opts.damping;

    for _ in 0..opts.max_iterations {
        if cost.sqrt() < opts.tolerance {
            return Some((u, true));
        }
        let mut jac = DMatrix::zeros(r.len(), d);
        for j in 0..d {
            let mut probe = u.clone();
            let h = if u[j] + opts.fd_step <= 1.0 { opts.fd_step } else { -opts.fd_step };
            probe[j] += h;
            let rp = problem.components_at(&probe)?;
            jac.set_column(j, &((rp - &r) / h));
        }
        let g = jac.transpose() * &r;
        if g.amax() < opts.tolerance * opts.tolerance {
            return Some((u, true));
        }
        let jtj = jac.transpose() * &jac;
        let scale = DMatrix::from_diagonal(&jtj.diagonal().map(|v| v.max(1e-12)));
        let Some(delta) = (&jtj + scale * lambda).lu().solve(&(-g)) else {
            lambda *= 10.0;
            continue;
        };
        let trial: Vec<f64> = u
            .iter()
            .zip(delta.iter())
            .map(|(a, b)| (a + b).clamp(0.0, 1.0))
            .collect();
        let step = trial
            .iter()
            .zip(&u)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        if step < 1e-12 {
            return Some((u, false));
        }
        match problem.components_at(&trial) {
            Some(rt) if rt.norm_squared() < cost => {
                u = trial;
                cost = rt.norm_squared();
                r = rt;
                lambda = (lambda / 3.0).max(1e-12);
            }
            _ => {
                lambda *= 4.0;
                if lambda > 1e10 {
                    return Some((u, false));
                }
            }
        }
    }
    Some((u, false))
}
