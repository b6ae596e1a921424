//! Samplers: strategies that propose the next parameter vector.
//!
//! All samplers work in the *internal* space of each domain (natural log for
//! log-scale parameters), so a log-scale range is explored uniformly in
//! log-space. Results are always mapped back through
//! [`ParamDomain::from_internal`] and therefore stay inside the domain.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use ht_types::ConfigError;

use crate::search::{ParamDomain, ParamValue, Params, SearchSpace};
use crate::trial::{Direction, Trial, TrialStatus};

/// Common trait for all parameter samplers.
pub trait Sampler: Send {
    /// Propose parameters for `trial_id`. `history` holds every terminal trial
    /// so far, in creation order.
    fn propose(&mut self, trial_id: u64, space: &SearchSpace, history: &[Trial]) -> Params;

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

fn sample_uniform<R: Rng>(rng: &mut R, domain: &ParamDomain) -> ParamValue {
    match *domain {
        ParamDomain::Int {
            min,
            max,
            log_scale: false,
        } => ParamValue::Int(rng.random_range(min..=max)),
        _ => {
            let (lo, hi) = domain.internal_bounds();
            domain.from_internal(rng.random_range(lo..=hi))
        }
    }
}

fn completed_trials(history: &[Trial]) -> Vec<&Trial> {
    history
        .iter()
        .filter(|t| t.status == TrialStatus::Complete && t.score.is_finite())
        .collect()
}

// ---------------------------------------------------------------------------
// Random
// ---------------------------------------------------------------------------

/// Independent uniform sampling; ignores history.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    rng: ChaCha8Rng,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn sample_space(&mut self, space: &SearchSpace) -> Params {
        space
            .iter()
            .map(|(name, domain)| (name.clone(), sample_uniform(&mut self.rng, domain)))
            .collect()
    }
}

impl Sampler for RandomSampler {
    fn propose(&mut self, _trial_id: u64, space: &SearchSpace, _history: &[Trial]) -> Params {
        self.sample_space(space)
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---------------------------------------------------------------------------
// Tree-structured Parzen estimator
// ---------------------------------------------------------------------------

/// Gaussian kernel density over internal-space coordinates.
#[derive(Debug, Clone)]
struct Parzen {
    centers: Vec<f64>,
    bandwidth: f64,
}

impl Parzen {
    /// Scott's rule bandwidth, floored at 1% of the range so a cluster of
    /// identical observations still spreads a little.
    fn new(centers: Vec<f64>, lo: f64, hi: f64) -> Self {
        let n = centers.len() as f64;
        let mean = centers.iter().sum::<f64>() / n;
        let variance = centers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let floor = ((hi - lo) / 100.0).max(f64::EPSILON);
        let bandwidth = (n.powf(-0.2) * variance.sqrt()).max(floor);
        Self { centers, bandwidth }
    }

    fn pdf(&self, x: f64) -> f64 {
        let inv = 1.0 / self.bandwidth;
        let norm = inv / (2.0 * std::f64::consts::PI).sqrt();
        let density: f64 = self
            .centers
            .iter()
            .map(|&c| {
                let z = (x - c) * inv;
                norm * (-0.5 * z * z).exp()
            })
            .sum();
        density / self.centers.len() as f64
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        let center = self.centers[rng.random_range(0..self.centers.len())];
        // Box-Muller
        let u1: f64 = rng.random_range(f64::EPSILON..1.0);
        let u2: f64 = rng.random();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        center + z * self.bandwidth
    }
}

/// Model-based sequential sampler.
///
/// Completed trials are split into a "good" set (the best `gamma` fraction)
/// and a "bad" set. For each parameter, `n_ei_candidates` draws from the good
/// density are ranked by `l(x) / g(x)` and the best one is proposed. Until
/// `n_startup_trials` trials have completed it samples uniformly.
#[derive(Debug, Clone)]
pub struct TpeSampler {
    direction: Direction,
    rng: ChaCha8Rng,
    n_startup_trials: usize,
    gamma: f64,
    n_ei_candidates: usize,
}

impl TpeSampler {
    pub fn new(direction: Direction, seed: u64) -> Self {
        Self {
            direction,
            rng: ChaCha8Rng::seed_from_u64(seed),
            n_startup_trials: 10,
            gamma: 0.25,
            n_ei_candidates: 24,
        }
    }

    pub fn with_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn with_ei_candidates(mut self, n: usize) -> Self {
        self.n_ei_candidates = n.max(1);
        self
    }

    fn sample_param(
        &mut self,
        name: &str,
        domain: &ParamDomain,
        good: &[&Trial],
        bad: &[&Trial],
    ) -> ParamValue {
        let (lo, hi) = domain.internal_bounds();
        if hi <= lo {
            return domain.from_internal(lo);
        }

        let coords = |trials: &[&Trial]| -> Vec<f64> {
            trials
                .iter()
                .filter_map(|t| t.params.get(name))
                .filter(|v| domain.contains(*v))
                .map(|v| domain.to_internal(v))
                .collect()
        };
        let good_coords = coords(good);
        if good_coords.is_empty() {
            return sample_uniform(&mut self.rng, domain);
        }
        let bad_coords = coords(bad);

        let l = Parzen::new(good_coords, lo, hi);
        let g = (!bad_coords.is_empty()).then(|| Parzen::new(bad_coords, lo, hi));
        let uniform = 1.0 / (hi - lo);

        let mut best_x = lo;
        let mut best_ratio = f64::NEG_INFINITY;
        for _ in 0..self.n_ei_candidates {
            let x = l.sample(&mut self.rng).clamp(lo, hi);
            let denom = g.as_ref().map_or(uniform, |g| g.pdf(x)).max(1e-300);
            let ratio = l.pdf(x).max(1e-300).ln() - denom.ln();
            if ratio > best_ratio {
                best_ratio = ratio;
                best_x = x;
            }
        }
        domain.from_internal(best_x)
    }
}

impl Sampler for TpeSampler {
    fn propose(&mut self, _trial_id: u64, space: &SearchSpace, history: &[Trial]) -> Params {
        let mut completed = completed_trials(history);
        if completed.len() < self.n_startup_trials.max(1) {
            return space
                .iter()
                .map(|(name, domain)| (name.clone(), sample_uniform(&mut self.rng, domain)))
                .collect();
        }

        let direction = self.direction;
        completed.sort_by(|a, b| direction.cmp_best_first(a.score, b.score));
        let n_good = ((self.gamma * completed.len() as f64).ceil() as usize)
            .clamp(1, completed.len());
        let (good, bad) = completed.split_at(n_good);

        space
            .iter()
            .map(|(name, domain)| {
                let value = self.sample_param(name, domain, good, bad);
                (name.clone(), value)
            })
            .collect()
    }

    fn name(&self) -> &str {
        "tpe"
    }
}

// ---------------------------------------------------------------------------
// Evolutionary
// ---------------------------------------------------------------------------

/// Population-based sampler.
///
/// The best `population_size` completed trials form the parent pool. Each
/// proposal picks two parents by binary tournament, mixes them with uniform
/// crossover and applies Gaussian mutation scaled to each parameter's range.
#[derive(Debug, Clone)]
pub struct EvolutionSampler {
    direction: Direction,
    rng: ChaCha8Rng,
    population_size: usize,
    mutation_scale: f64,
}

impl EvolutionSampler {
    pub fn new(direction: Direction, seed: u64) -> Self {
        Self {
            direction,
            rng: ChaCha8Rng::seed_from_u64(seed),
            population_size: 10,
            mutation_scale: 0.1,
        }
    }

    pub fn with_population_size(mut self, n: usize) -> Self {
        self.population_size = n.max(2);
        self
    }

    pub fn with_mutation_scale(mut self, scale: f64) -> Self {
        self.mutation_scale = scale;
        self
    }

    fn tournament<'a>(&mut self, pool: &[&'a Trial]) -> &'a Trial {
        let a = pool[self.rng.random_range(0..pool.len())];
        let b = pool[self.rng.random_range(0..pool.len())];
        if self.direction.is_better(b.score, a.score) {
            b
        } else {
            a
        }
    }

    fn gaussian(&mut self) -> f64 {
        let u1: f64 = self.rng.random_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.random();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

impl Sampler for EvolutionSampler {
    fn propose(&mut self, _trial_id: u64, space: &SearchSpace, history: &[Trial]) -> Params {
        let mut pool = completed_trials(history);
        if pool.len() < self.population_size {
            return space
                .iter()
                .map(|(name, domain)| (name.clone(), sample_uniform(&mut self.rng, domain)))
                .collect();
        }

        let direction = self.direction;
        pool.sort_by(|a, b| direction.cmp_best_first(a.score, b.score));
        pool.truncate(self.population_size);

        let mother = self.tournament(&pool);
        let father = self.tournament(&pool);

        let mut child = Params::new();
        for (name, domain) in space.iter() {
            let parent = if self.rng.random_bool(0.5) { mother } else { father };
            let value = match parent.params.get(name).filter(|v| domain.contains(*v)) {
                Some(inherited) => {
                    let (lo, hi) = domain.internal_bounds();
                    let noise = self.gaussian() * self.mutation_scale * (hi - lo);
                    domain.from_internal((domain.to_internal(inherited) + noise).clamp(lo, hi))
                }
                // Parameter added after the parents ran
                None => sample_uniform(&mut self.rng, domain),
            };
            child.insert(name.clone(), value);
        }
        child
    }

    fn name(&self) -> &str {
        "evolution"
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_startup_trials() -> usize {
    10
}

fn default_gamma() -> f64 {
    0.25
}

fn default_ei_candidates() -> usize {
    24
}

fn default_population() -> usize {
    10
}

fn default_mutation_scale() -> f64 {
    0.1
}

/// Which sampler to build, and its knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SamplerConfig {
    Tpe {
        #[serde(default = "default_startup_trials")]
        n_startup_trials: usize,
        #[serde(default = "default_gamma")]
        gamma: f64,
        #[serde(default = "default_ei_candidates")]
        n_ei_candidates: usize,
    },
    Evolution {
        #[serde(default = "default_population")]
        population_size: usize,
        #[serde(default = "default_mutation_scale")]
        mutation_scale: f64,
    },
    Random,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::Tpe {
            n_startup_trials: default_startup_trials(),
            gamma: default_gamma(),
            n_ei_candidates: default_ei_candidates(),
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidStrategy {
            strategy: "sampler".to_string(),
            message,
        };
        match self {
            Self::Tpe { gamma, .. } if !(*gamma > 0.0 && *gamma < 1.0) => {
                Err(invalid(format!("gamma must be in (0, 1), got {gamma}")))
            }
            Self::Evolution { population_size, .. } if *population_size < 2 => Err(invalid(
                format!("population_size must be at least 2, got {population_size}"),
            )),
            Self::Evolution { mutation_scale, .. }
                if !mutation_scale.is_finite() || *mutation_scale < 0.0 =>
            {
                Err(invalid(format!(
                    "mutation_scale must be finite and non-negative, got {mutation_scale}"
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn build(&self, direction: Direction, seed: u64) -> Box<dyn Sampler> {
        match *self {
            Self::Tpe {
                n_startup_trials,
                gamma,
                n_ei_candidates,
            } => Box::new(
                TpeSampler::new(direction, seed)
                    .with_startup_trials(n_startup_trials)
                    .with_gamma(gamma)
                    .with_ei_candidates(n_ei_candidates),
            ),
            Self::Evolution {
                population_size,
                mutation_scale,
            } => Box::new(
                EvolutionSampler::new(direction, seed)
                    .with_population_size(population_size)
                    .with_mutation_scale(mutation_scale),
            ),
            Self::Random => Box::new(RandomSampler::new(seed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_space() -> SearchSpace {
        SearchSpace::new()
            .add_log_float("lr0", 1e-5, 1e-2)
            .add_float("momentum", 0.8, 0.99)
            .add_int("warmup_epochs", 1, 10)
            .add_log_int("batch", 8, 256)
    }

    fn completed(id: u64, params: Params, score: f64) -> Trial {
        let mut trial = Trial::new(id, params);
        trial.mark_running();
        trial.complete(score);
        trial
    }

    #[test]
    fn random_sampler_respects_bounds() {
        let space = sample_space();
        let mut sampler = RandomSampler::new(42);
        for id in 0..500 {
            let params = sampler.propose(id, &space, &[]);
            assert!(space.contains(&params), "out of domain: {params:?}");
        }
    }

    #[test]
    fn log_scale_samples_stay_in_bounds() {
        let space = SearchSpace::new().add_log_float("lr", 1e-5, 1e-2);
        let mut sampler = RandomSampler::new(7);
        for id in 0..10_000 {
            let params = sampler.propose(id, &space, &[]);
            let lr = params["lr"].as_f64();
            assert!((1e-5..=1e-2).contains(&lr), "lr out of bounds: {lr}");
        }
    }

    #[test]
    fn log_scale_is_uniform_in_log_space() {
        // Each decade of [1e-5, 1e-2] should receive about a third of the draws.
        let space = SearchSpace::new().add_log_float("lr", 1e-5, 1e-2);
        let mut sampler = RandomSampler::new(11);
        let mut decades = [0usize; 3];
        let n = 9_000;
        for id in 0..n {
            let lr = sampler.propose(id, &space, &[])["lr"].as_f64();
            let idx = ((lr.log10() + 5.0).floor() as usize).min(2);
            decades[idx] += 1;
        }
        for count in decades {
            let share = count as f64 / n as f64;
            assert!((share - 1.0 / 3.0).abs() < 0.05, "decade share {share}");
        }
    }

    #[test]
    fn same_seed_same_proposals() {
        let space = sample_space();
        let mut a = RandomSampler::new(3);
        let mut b = RandomSampler::new(3);
        for id in 0..20 {
            assert_eq!(a.propose(id, &space, &[]), b.propose(id, &space, &[]));
        }
    }

    #[test]
    fn tpe_respects_bounds_after_startup() {
        let space = sample_space();
        let mut warmup = RandomSampler::new(1);
        let history: Vec<Trial> = (0..20)
            .map(|id| {
                let params = warmup.propose(id, &space, &[]);
                let score = params["momentum"].as_f64();
                completed(id, params, score)
            })
            .collect();

        let mut tpe = TpeSampler::new(Direction::Maximize, 42).with_startup_trials(5);
        for id in 20..220 {
            let params = tpe.propose(id, &space, &history);
            assert!(space.contains(&params), "out of domain: {params:?}");
        }
    }

    #[test]
    fn tpe_concentrates_near_good_region() {
        let space = SearchSpace::new().add_float("x", 0.0, 1.0);
        let history: Vec<Trial> = (0..40)
            .map(|i| {
                let x = i as f64 / 39.0;
                let mut params = Params::new();
                params.insert("x".into(), ParamValue::Float(x));
                // Best scores near x = 0.9
                completed(i, params, -(x - 0.9).abs())
            })
            .collect();

        let mut tpe = TpeSampler::new(Direction::Maximize, 5).with_startup_trials(10);
        let mean: f64 = (0..200)
            .map(|id| tpe.propose(100 + id, &space, &history)["x"].as_f64())
            .sum::<f64>()
            / 200.0;
        assert!(mean > 0.6, "expected proposals biased toward 0.9, mean {mean}");
    }

    #[test]
    fn tpe_ignores_failed_trials() {
        let space = SearchSpace::new().add_float("x", 0.0, 1.0);
        let history: Vec<Trial> = (0..5)
            .map(|id| {
                let mut params = Params::new();
                params.insert("x".into(), ParamValue::Float(0.5));
                let mut trial = Trial::new(id, params);
                trial.mark_running();
                trial.fail(f64::NEG_INFINITY, "boom".into());
                trial
            })
            .collect();
        let mut tpe = TpeSampler::new(Direction::Maximize, 9).with_startup_trials(2);
        let params = tpe.propose(5, &space, &history);
        assert!(space.contains(&params));
    }

    #[test]
    fn evolution_respects_bounds_and_uses_population() {
        let space = sample_space();
        let mut warmup = RandomSampler::new(2);
        let history: Vec<Trial> = (0..15)
            .map(|id| {
                let params = warmup.propose(id, &space, &[]);
                let score = params["warmup_epochs"].as_f64();
                completed(id, params, score)
            })
            .collect();

        let mut evo = EvolutionSampler::new(Direction::Minimize, 8).with_population_size(5);
        for id in 15..215 {
            let params = evo.propose(id, &space, &history);
            assert!(space.contains(&params), "out of domain: {params:?}");
        }
    }

    #[test]
    fn config_builds_named_samplers() {
        let cases = [
            (SamplerConfig::default(), "tpe"),
            (SamplerConfig::Random, "random"),
            (
                SamplerConfig::Evolution {
                    population_size: 4,
                    mutation_scale: 0.2,
                },
                "evolution",
            ),
        ];
        for (config, name) in cases {
            assert!(config.validate().is_ok());
            assert_eq!(config.build(Direction::Maximize, 42).name(), name);
        }
    }

    #[test]
    fn config_rejects_bad_gamma() {
        let config = SamplerConfig::Tpe {
            n_startup_trials: 10,
            gamma: 1.5,
            n_ei_candidates: 24,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidStrategy { .. })
        ));
    }

    #[test]
    fn config_parses_from_yaml() {
        let config: SamplerConfig = serde_yaml::from_str("kind: tpe\nn_startup_trials: 5\n").unwrap();
        assert_eq!(
            config,
            SamplerConfig::Tpe {
                n_startup_trials: 5,
                gamma: 0.25,
                n_ei_candidates: 24
            }
        );
    }
}
