use surrogate_optimizer::prelude::*;
use surrogate_optimizer::rank_candidates;

fn candidate(x: f64, residual: f64) -> Candidate {
    Candidate {
        x: vec![x],
        acquisition: residual,
        residual,
        found_by: OptimizerKind::Gradient,
    }
}

fn bounds() -> Bounds {
    Bounds::new([("x", 0.0, 10.0)]).unwrap()
}

#[test]
fn raw_order_is_descending_residual() {
    let cands = [candidate(9.0, -0.5), candidate(1.0, -0.1), candidate(5.0, -0.3)];
    let best = BestPoint { x: vec![0.0], residual: -2.0 };
    assert_eq!(rank_candidates(&cands, Some(&best), &bounds(), ProximityPolicy::Raw), vec![1, 2, 0]);
}

#[test]
fn near_candidate_wins_once_both_are_good_enough() {
    // Far: improves the best residual 10000x. Near: 500x. Both pass 1e-2.
    let cands = [candidate(9.5, -1e-4), candidate(0.5, -2e-3)];
    let best = BestPoint { x: vec![0.0], residual: -1.0 };
    let order = rank_candidates(&cands, Some(&best), &bounds(), ProximityPolicy::favor_proximity());
    assert_eq!(order, vec![1, 0]);
}

#[test]
fn far_candidate_keeps_the_lead_when_the_near_one_is_not_good_enough() {
    let cands = [candidate(9.5, -1e-4), candidate(0.5, -0.5)];
    let best = BestPoint { x: vec![0.0], residual: -1.0 };
    let order = rank_candidates(&cands, Some(&best), &bounds(), ProximityPolicy::favor_proximity());
    assert_eq!(order, vec![0, 1]);
}

#[test]
fn without_an_anchor_proximity_falls_back_to_raw() {
    let cands = [candidate(9.5, -1e-4), candidate(0.5, -2e-3)];
    let order = rank_candidates(&cands, None, &bounds(), ProximityPolicy::favor_proximity());
    assert_eq!(order, vec![0, 1]);
    let perfect = BestPoint { x: vec![0.0], residual: 0.0 };
    let order = rank_candidates(&cands, Some(&perfect), &bounds(), ProximityPolicy::favor_proximity());
    assert_eq!(order, vec![0, 1]);
}

#[test]
fn nan_residuals_rank_last() {
    let cands = [candidate(0.1, f64::NAN), candidate(9.0, -0.9)];
    let best = BestPoint { x: vec![0.0], residual: -1.0 };
    let order = rank_candidates(&cands, Some(&best), &bounds(), ProximityPolicy::favor_proximity());
    assert_eq!(order, vec![1, 0]);
}
