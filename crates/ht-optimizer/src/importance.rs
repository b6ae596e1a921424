//! Parameter importance from finished trials.
//!
//! Each parameter is scored by the absolute Spearman rank correlation between
//! its values and the objective across Complete trials, then the scores are
//! normalized to sum to 1.0. Monotone effects are caught regardless of scale;
//! interactions are not.

use std::collections::{BTreeMap, BTreeSet};

use crate::trial::{Trial, TrialStatus};

/// Importance per parameter name. Empty with fewer than two Complete trials.
pub fn param_importance(trials: &[Trial]) -> BTreeMap<String, f64> {
    let complete: Vec<&Trial> = trials
        .iter()
        .filter(|t| t.status == TrialStatus::Complete && t.score.is_finite())
        .collect();
    if complete.len() < 2 {
        return BTreeMap::new();
    }

    let names: BTreeSet<&String> = complete.iter().flat_map(|t| t.params.keys()).collect();
    let mut scores = BTreeMap::new();
    for name in names {
        let (xs, ys): (Vec<f64>, Vec<f64>) = complete
            .iter()
            .filter_map(|t| t.params.get(name).map(|v| (v.as_f64(), t.score)))
            .unzip();
        if xs.len() < 2 {
            continue;
        }
        scores.insert(name.clone(), spearman(&xs, &ys).abs());
    }

    let sum: f64 = scores.values().sum();
    if sum > 0.0 {
        for score in scores.values_mut() {
            *score /= sum;
        }
    }
    scores
}

/// Ranks starting at 1, ties sharing their average rank.
fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let average = (start + end + 1) as f64 / 2.0;
        for &index in &order[start..end] {
            ranks[index] = average;
        }
        start = end;
    }
    ranks
}

/// Spearman correlation; 0.0 when either side is constant.
fn spearman(xs: &[f64], ys: &[f64]) -> f64 {
    let rx = ranks(xs);
    let ry = ranks(ys);
    let n = rx.len() as f64;
    let mean_x = rx.iter().sum::<f64>() / n;
    let mean_y = ry.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in rx.iter().zip(&ry) {
        let (dx, dy) = (x - mean_x, y - mean_y);
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return 0.0;
    }
    cov / (var_x * var_y).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{ParamValue, Params};

    fn finished(id: u64, x: f64, noise: i64, score: f64) -> Trial {
        let mut params = Params::new();
        params.insert("x".into(), ParamValue::Float(x));
        params.insert("noise".into(), ParamValue::Int(noise));
        let mut trial = Trial::new(id, params);
        trial.mark_running();
        trial.complete(score);
        trial
    }

    #[test]
    fn ranks_average_ties() {
        assert_eq!(ranks(&[3.0, 1.0, 3.0, 2.0]), vec![3.5, 1.0, 3.5, 2.0]);
    }

    #[test]
    fn spearman_detects_monotone_relations() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert!((spearman(&xs, &[1.0, 8.0, 27.0, 64.0]) - 1.0).abs() < 1e-12);
        assert!((spearman(&xs, &[4.0, 3.0, 2.0, 1.0]) + 1.0).abs() < 1e-12);
        assert_eq!(spearman(&xs, &[5.0; 4]), 0.0);
    }

    #[test]
    fn driving_parameter_dominates() {
        let noise = [2, 0, 3, 1, 2, 0];
        let trials: Vec<Trial> = (0..6)
            .map(|i| {
                let x = i as f64 / 5.0;
                finished(i, x, noise[i as usize], x * x)
            })
            .collect();

        let importance = param_importance(&trials);
        assert_eq!(importance.len(), 2);
        assert!(importance["x"] > importance["noise"]);
        let total: f64 = importance.values().sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn needs_two_complete_trials() {
        assert!(param_importance(&[]).is_empty());
        let mut failed = finished(1, 0.5, 1, 0.0);
        failed.status = TrialStatus::Failed;
        assert!(param_importance(&[finished(0, 0.1, 0, 1.0), failed]).is_empty());
    }
}
