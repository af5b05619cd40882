//! Spline weight initialization.
//!
//! Before sampling, the spline weights are fitted by directly minimizing the
//! negative Whittle log-likelihood of the log-periodogram. The default is a
//! fixed number of Adam steps with no convergence check, so the result is a
//! deterministic function of the inputs and the starting vector. A BFGS
//! alternative gives a converged point estimate.

use crate::likelihood::{whittle_lnlike, whittle_lnlike_grad};
use crate::model::LogPSplines;
use ndarray::{Array1, ArrayView1, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

#[derive(Error, Debug)]
pub enum InitError {
    #[error("The log-periodogram has {found} entries, but the model grid has {expected}.")]
    TargetLengthMismatch { found: usize, expected: usize },

    #[error("Initial weights have length {found}, but the model has {expected} basis functions.")]
    WeightLengthMismatch { found: usize, expected: usize },

    #[error("BFGS weight optimization failed: {0}")]
    BfgsFailed(String),
}

/// Optimizer used to pre-fit the spline weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WeightOptimizer {
    /// Fixed-step Adam, the warm start for MCMC.
    Adam,
    /// Quasi-Newton with a Wolfe line search, run to `tolerance`.
    Bfgs {
        tolerance: f64,
        max_iterations: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightInitConfig {
    pub num_steps: usize,
    pub learning_rate: f64,
    pub optimizer: WeightOptimizer,
}

impl Default for WeightInitConfig {
    fn default() -> Self {
        Self {
            num_steps: 5000,
            learning_rate: 1e-2,
            optimizer: WeightOptimizer::Adam,
        }
    }
}

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

/// Negative Whittle log-likelihood of the spline and its gradient in the weights.
struct WhittleLoss<'a> {
    log_pdgrm: ArrayView1<'a, f64>,
    basis: ArrayView2<'a, f64>,
    log_parametric: ArrayView1<'a, f64>,
}

impl WhittleLoss<'_> {
    fn loss_and_grad(&self, weights: &Array1<f64>) -> (f64, Array1<f64>) {
        let log_psd = self.basis.dot(weights) + &self.log_parametric;
        let loss = -whittle_lnlike(self.log_pdgrm, log_psd.view());
        let grad_log_psd = whittle_lnlike_grad(self.log_pdgrm, log_psd.view());
        let grad = -self.basis.t().dot(&grad_log_psd);
        (loss, grad)
    }
}

/// Optimizes the spline weights against `log_pdgrm`.
///
/// Starts from `init` or from zeros. The model itself is not modified; the
/// fitted weights are returned.
///
/// The loss is taken on the full log-PSD, `B w + log S_par`. With a
/// parametric model the spline is fitted to the residual
/// `log_pdgrm - log S_par`, the same likelihood the posterior uses, rather
/// than to the raw log-periodogram.
pub fn init_weights<'a>(
    log_pdgrm: ArrayView1<'a, f64>,
    model: &'a LogPSplines,
    init: Option<ArrayView1<f64>>,
    config: &WeightInitConfig,
) -> Result<Array1<f64>, InitError> {
    if log_pdgrm.len() != model.n() {
        return Err(InitError::TargetLengthMismatch {
            found: log_pdgrm.len(),
            expected: model.n(),
        });
    }
    let start = match init {
        Some(w) if w.len() != model.n_basis() => {
            return Err(InitError::WeightLengthMismatch {
                found: w.len(),
                expected: model.n_basis(),
            });
        }
        Some(w) => w.to_owned(),
        None => Array1::zeros(model.n_basis()),
    };
    if log_pdgrm.iter().any(|v| !v.is_finite()) {
        log::warn!("Log-periodogram contains non-finite values; the weight fit will not be meaningful");
    }

    let objective = WhittleLoss {
        log_pdgrm,
        basis: model.basis(),
        log_parametric: model.log_parametric_model(),
    };

    match config.optimizer {
        WeightOptimizer::Adam => Ok(run_adam(
            &objective,
            start,
            config.num_steps,
            config.learning_rate,
        )),
        WeightOptimizer::Bfgs {
            tolerance,
            max_iterations,
        } => run_bfgs(&objective, start, tolerance, max_iterations),
    }
}

fn run_adam(
    objective: &WhittleLoss,
    mut weights: Array1<f64>,
    num_steps: usize,
    learning_rate: f64,
) -> Array1<f64> {
    let mut m = Array1::<f64>::zeros(weights.len());
    let mut v = Array1::<f64>::zeros(weights.len());
    let mut beta1_t = 1.0;
    let mut beta2_t = 1.0;

    let initial_loss = objective.loss_and_grad(&weights).0;
    log::info!(
        "Starting Adam weight fit: {} steps, learning rate {:.1e}, initial loss {:.6}",
        num_steps,
        learning_rate,
        initial_loss
    );

    for step in 0..num_steps {
        let (loss, grad) = objective.loss_and_grad(&weights);
        if step % 1000 == 0 {
            log::debug!("Adam step {}: loss {:.6}", step, loss);
        }

        beta1_t *= ADAM_BETA1;
        beta2_t *= ADAM_BETA2;
        Zip::from(&mut weights)
            .and(&mut m)
            .and(&mut v)
            .and(&grad)
            .for_each(|w, m, v, &g| {
                *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                let m_hat = *m / (1.0 - beta1_t);
                let v_hat = *v / (1.0 - beta2_t);
                *w -= learning_rate * m_hat / (v_hat.sqrt() + ADAM_EPS);
            });
    }

    let final_loss = objective.loss_and_grad(&weights).0;
    if final_loss.is_finite() {
        log::info!("Adam weight fit finished with loss {:.6}", final_loss);
    } else {
        log::warn!("Adam weight fit finished with non-finite loss {}", final_loss);
    }
    weights
}

fn run_bfgs(
    objective: &WhittleLoss,
    start: Array1<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> Result<Array1<f64>, InitError> {
    log::info!(
        "Starting BFGS weight fit with {} parameters (tolerance {:.1e})",
        start.len(),
        tolerance
    );
    let cost_and_grad = |w: &Array1<f64>| -> (f64, Array1<f64>) {
        let (loss, grad) = objective.loss_and_grad(w);
        if loss.is_finite() {
            (loss, grad)
        } else {
            log::warn!("Non-finite Whittle loss encountered, returning large finite value");
            (1e10, grad.mapv(|g| if g.is_finite() { g } else { 0.0 }))
        }
    };

    let BfgsSolution {
        final_point,
        final_value,
        iterations,
        ..
    } = Bfgs::new(start, cost_and_grad)
        .with_tolerance(tolerance)
        .with_max_iterations(max_iterations)
        .run()
        .map_err(|e| InitError::BfgsFailed(format!("{:?}", e)))?;

    log::info!(
        "BFGS weight fit finished in {} iterations with loss {:.6}",
        iterations,
        final_value
    );
    Ok(final_point)
}
