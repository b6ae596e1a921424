//! The scorer contract: turn a parameter vector into a score.

use tracing::{debug, warn};

use ht_types::EvalError;

use crate::pruner::Pruner;
use crate::search::Params;
use crate::trial::Trial;

/// An opaque, possibly expensive and possibly failing evaluation function.
///
/// Implementations may report intermediate progress through the
/// [`EvalContext`]; when the pruner decides to stop the trial, `report`
/// returns [`EvalError::Pruned`], which the scorer should propagate with `?`.
pub trait Scorer {
    fn evaluate(&mut self, params: &Params, ctx: &mut EvalContext<'_>) -> Result<f64, EvalError>;
}

impl<F> Scorer for F
where
    F: FnMut(&Params, &mut EvalContext<'_>) -> Result<f64, EvalError>,
{
    fn evaluate(&mut self, params: &Params, ctx: &mut EvalContext<'_>) -> Result<f64, EvalError> {
        self(params, ctx)
    }
}

/// Per-trial handle given to the scorer.
pub struct EvalContext<'a> {
    trial_id: u64,
    pruner: &'a dyn Pruner,
    history: &'a [Trial],
    intermediate_values: Vec<(u64, f64)>,
}

impl<'a> EvalContext<'a> {
    pub fn new(trial_id: u64, pruner: &'a dyn Pruner, history: &'a [Trial]) -> Self {
        Self {
            trial_id,
            pruner,
            history,
            intermediate_values: Vec::new(),
        }
    }

    pub fn trial_id(&self) -> u64 {
        self.trial_id
    }

    /// Record `value` at `step` and ask the pruner whether to continue.
    ///
    /// Steps must increase; a repeated or earlier step is ignored.
    pub fn report(&mut self, step: u64, value: f64) -> Result<(), EvalError> {
        if let Some((last_step, _)) = self.intermediate_values.last() {
            if step <= *last_step {
                warn!(trial = self.trial_id, step, last_step, "ignoring out-of-order report");
                return Ok(());
            }
        }
        self.intermediate_values.push((step, value));

        if self
            .pruner
            .should_prune(self.trial_id, step, value, self.history)
        {
            debug!(trial = self.trial_id, step, value, pruner = self.pruner.name(), "pruning trial");
            return Err(EvalError::Pruned { step, value });
        }
        Ok(())
    }

    pub fn intermediate_values(&self) -> &[(u64, f64)] {
        &self.intermediate_values
    }

    pub fn last_value(&self) -> Option<f64> {
        self.intermediate_values.last().map(|(_, v)| *v)
    }

    pub(crate) fn into_intermediate_values(self) -> Vec<(u64, f64)> {
        self.intermediate_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pruner::NopPruner;
    use crate::search::ParamValue;

    struct PruneAfter(u64);

    impl Pruner for PruneAfter {
        fn should_prune(&self, _: u64, step: u64, _: f64, _: &[Trial]) -> bool {
            step >= self.0
        }

        fn name(&self) -> &str {
            "prune-after"
        }
    }

    fn curve(params: &Params, ctx: &mut EvalContext<'_>) -> Result<f64, EvalError> {
        let x = params["x"].as_f64();
        for step in 1..=5 {
            ctx.report(step, x * step as f64)?;
        }
        Ok(x * 10.0)
    }

    fn params() -> Params {
        let mut params = Params::new();
        params.insert("x".into(), ParamValue::Float(0.5));
        params
    }

    #[test]
    fn closure_scorer_runs_to_completion() {
        let pruner = NopPruner;
        let mut ctx = EvalContext::new(0, &pruner, &[]);
        let mut scorer = curve;
        assert_eq!(scorer.evaluate(&params(), &mut ctx), Ok(5.0));
        assert_eq!(ctx.intermediate_values().len(), 5);
        assert_eq!(ctx.last_value(), Some(2.5));
    }

    #[test]
    fn report_surfaces_prune_decision() {
        let pruner = PruneAfter(3);
        let mut ctx = EvalContext::new(7, &pruner, &[]);
        let mut scorer = curve;
        assert_eq!(
            scorer.evaluate(&params(), &mut ctx),
            Err(EvalError::Pruned { step: 3, value: 1.5 })
        );
        assert_eq!(ctx.intermediate_values(), &[(1, 0.5), (2, 1.0), (3, 1.5)]);
    }

    #[test]
    fn out_of_order_reports_are_ignored() {
        let pruner = NopPruner;
        let mut ctx = EvalContext::new(0, &pruner, &[]);
        ctx.report(5, 1.0).unwrap();
        ctx.report(5, 2.0).unwrap();
        ctx.report(3, 3.0).unwrap();
        assert_eq!(ctx.intermediate_values(), &[(5, 1.0)]);
    }
}
