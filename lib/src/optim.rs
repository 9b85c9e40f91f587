//! Bounded minimization of an `Objective`.
//!
//! `Lbfgs` drives argmin's L-BFGS solver, but stops after a fixed number of
//! objective evaluations rather than iterations, and always hands back the
//! best point it has seen.

use crate::{Error, Evaluation, Objective};
use argmin::core::{CostFunction, Error as ArgminError, Executor, Gradient};
use argmin::solver::{linesearch::MoreThuenteLineSearch, quasinewton::LBFGS};
use log::{debug, warn};
use std::cell::RefCell;

/// The result of a single bounded minimization
#[derive(Clone, Debug)]
pub struct Minimum {
    /// The best point found
    pub x: Vec<f64>,
    /// The objective's value at `x`
    pub loss: f64,
    /// The number of distinct points the objective was evaluated at
    pub evaluations: usize,
}

/// Something that can minimize an `Objective`, starting from `x0` and
/// evaluating it at no more than `max_evaluations` distinct points.
pub trait Minimizer {
    fn minimize(
        &mut self,
        objective: &mut dyn Objective,
        x0: Vec<f64>,
        max_evaluations: usize,
    ) -> Result<Minimum, Error>;
}

/// Limited memory BFGS with a More-Thuente line search
#[derive(Copy, Clone, Debug)]
pub struct Lbfgs {
    history: usize,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self { history: 10 }
    }
}

impl Lbfgs {
    /// `history` is the number of past updates used to approximate the
    /// inverse Hessian
    pub fn new(history: usize) -> Self {
        Self {
            history: history.max(1),
        }
    }
}

#[derive(Default)]
struct Progress {
    last: Option<(Vec<f64>, Evaluation)>,
    evaluations: usize,
    best: Option<(Vec<f64>, f64)>,
    exhausted: bool,
    failure: Option<Error>,
}

/// Adapts an `Objective` to argmin's separate cost and gradient queries,
/// and enforces the evaluation budget
struct BoundedProblem<'o, 'p> {
    objective: RefCell<&'o mut dyn Objective>,
    progress: &'p RefCell<Progress>,
    budget: usize,
}

impl BoundedProblem<'_, '_> {
    fn evaluate(&self, x: &[f64]) -> Result<Evaluation, ArgminError> {
        let mut progress = self.progress.borrow_mut();

        if let Some((ref point, ref evaluation)) = progress.last {
            if point.as_slice() == x {
                return Ok(evaluation.clone());
            }
        }

        if progress.evaluations >= self.budget {
            progress.exhausted = true;
            return Err(ArgminError::msg("evaluation budget exhausted"));
        }

        let evaluation = match self.objective.borrow_mut().evaluate(x) {
            Ok(evaluation) => evaluation,
            Err(err) => {
                let msg = err.to_string();
                progress.failure = Some(err);
                return Err(ArgminError::msg(msg));
            }
        };

        progress.evaluations += 1;

        let improved = match progress.best {
            Some((_, best)) => evaluation.loss < best,
            None => true,
        };
        if improved {
            progress.best = Some((x.to_vec(), evaluation.loss));
        }

        progress.last = Some((x.to_vec(), evaluation.clone()));
        Ok(evaluation)
    }
}

impl CostFunction for BoundedProblem<'_, '_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, ArgminError> {
        Ok(self.evaluate(param)?.loss)
    }
}

impl Gradient for BoundedProblem<'_, '_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, ArgminError> {
        Ok(self.evaluate(param)?.gradient)
    }
}

impl Minimizer for Lbfgs {
    fn minimize(
        &mut self,
        objective: &mut dyn Objective,
        x0: Vec<f64>,
        max_evaluations: usize,
    ) -> Result<Minimum, Error> {
        let progress = RefCell::new(Progress::default());

        let outcome = {
            let problem = BoundedProblem {
                objective: RefCell::new(objective),
                progress: &progress,
                budget: max_evaluations,
            };

            let linesearch = MoreThuenteLineSearch::new();
            let solver = LBFGS::new(linesearch, self.history);

            // Every iteration evaluates at least once, so the evaluation
            // budget is also an upper bound on iterations
            Executor::new(problem, solver)
                .configure(|state| state.param(x0).max_iters(max_evaluations as u64))
                .run()
                .map(|_| ())
        };

        let progress = progress.into_inner();

        if let Some(err) = progress.failure {
            return Err(err);
        }

        match outcome {
            Ok(()) => debug!(
                "L-BFGS converged after {} evaluations",
                progress.evaluations
            ),
            Err(_) if progress.exhausted => debug!(
                "L-BFGS stopped after exhausting {} evaluations",
                progress.evaluations
            ),
            Err(err) => warn!(
                "L-BFGS stopped early after {} evaluations: {}",
                progress.evaluations, err
            ),
        }

        let (x, loss) = progress
            .best
            .ok_or_else(|| Error::Optimizer("the objective was never evaluated".to_owned()))?;

        Ok(Minimum {
            x,
            loss,
            evaluations: progress.evaluations,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// `sum((x_i - i)^2)`, counting how often it's called
    struct Bowl {
        calls: usize,
    }

    impl Objective for Bowl {
        fn evaluate(&mut self, x: &[f64]) -> Result<Evaluation, Error> {
            self.calls += 1;

            let loss = x
                .iter()
                .enumerate()
                .map(|(i, v)| (v - i as f64).powi(2))
                .sum();
            let gradient = x
                .iter()
                .enumerate()
                .map(|(i, v)| 2.0 * (v - i as f64))
                .collect();

            Ok(Evaluation { loss, gradient })
        }
    }

    struct Broken;

    impl Objective for Broken {
        fn evaluate(&mut self, _x: &[f64]) -> Result<Evaluation, Error> {
            Err(Error::NoStyleLayers)
        }
    }

    #[test]
    fn finds_the_minimum() {
        let mut bowl = Bowl { calls: 0 };
        let minimum = Lbfgs::default()
            .minimize(&mut bowl, vec![10.0, -4.0, 7.5], 20)
            .unwrap();

        assert!(minimum.loss < 1e-4, "loss {}", minimum.loss);
        for (i, v) in minimum.x.iter().enumerate() {
            assert!((v - i as f64).abs() < 1e-2);
        }
    }

    #[test]
    fn respects_the_evaluation_budget() {
        let mut bowl = Bowl { calls: 0 };
        let x0 = vec![100.0; 8];
        let start = bowl.evaluate(&x0).unwrap().loss;
        bowl.calls = 0;

        let minimum = Lbfgs::default().minimize(&mut bowl, x0, 2).unwrap();

        assert!(minimum.evaluations <= 2);
        assert!(bowl.calls <= 2);
        assert!(minimum.loss <= start);
    }

    #[test]
    fn objective_errors_propagate() {
        let result = Lbfgs::default().minimize(&mut Broken, vec![0.0; 4], 20);
        assert!(matches!(result, Err(Error::NoStyleLayers)));
    }
}
