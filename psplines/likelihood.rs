//! Whittle Likelihood and the P-spline Posterior
//!
//! The spline models the log power spectral density as
//! `log S(f) = B w + log S_par(f)`, where `B` is the normalized basis, `w` the
//! spline weights and `S_par` an optional parametric multiplier. The data enter
//! only through the Whittle likelihood of the periodogram.
//!
//! The posterior exposed to samplers is defined on the unconstrained vector
//! `theta = [w, ln phi, ln delta]` with the hierarchy
//!
//! - `delta ~ Gamma(alpha_delta, beta_delta)`
//! - `phi | delta ~ Gamma(alpha_phi, delta * beta_phi)`
//! - `w | phi ~ N(0, (phi P)^-1)`, `P` the penalty matrix
//!
//! Gradients are computed analytically with ndarray, so a sampler only needs
//! `logp_and_grad`. Log-densities are reported up to an additive constant
//! (the Gamma normalizers are dropped).
//!
//! Large read-only inputs are wrapped in `Arc` so that samplers which clone
//! the target per chain share the underlying allocations.

use ndarray::{Array1, Array2, ArrayView1, Zip, s};
use ndarray_linalg::{Cholesky, UPLO};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PosteriorError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("The penalty matrix is not positive definite: {0}")]
    PenaltyNotPositiveDefinite(#[from] ndarray_linalg::error::LinalgError),

    #[error("Hyperprior {name} must be positive and finite, but was {value}.")]
    InvalidHyperprior { name: &'static str, value: f64 },
}

/// Whittle log-likelihood of a log-periodogram given a log-PSD model:
/// `-1/2 * sum(log_psd + exp(log_pdgrm - log_psd))`.
pub fn whittle_lnlike(log_pdgrm: ArrayView1<f64>, log_psd: ArrayView1<f64>) -> f64 {
    let integrand: f64 = Zip::from(&log_pdgrm)
        .and(&log_psd)
        .fold(0.0, |acc, &y, &s| acc + s + (y - s).exp());
    -0.5 * integrand
}

/// Gradient of `whittle_lnlike` with respect to `log_psd`.
pub fn whittle_lnlike_grad(log_pdgrm: ArrayView1<f64>, log_psd: ArrayView1<f64>) -> Array1<f64> {
    Zip::from(&log_pdgrm)
        .and(&log_psd)
        .map_collect(|&y, &s| 0.5 * ((y - s).exp() - 1.0))
}

/// Gamma hyperpriors on the smoothing parameters `phi` and `delta`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HyperPriors {
    pub alpha_phi: f64,
    pub beta_phi: f64,
    pub alpha_delta: f64,
    pub beta_delta: f64,
}

impl Default for HyperPriors {
    fn default() -> Self {
        Self {
            alpha_phi: 1.0,
            beta_phi: 1.0,
            alpha_delta: 1e-4,
            beta_delta: 1e-4,
        }
    }
}

impl HyperPriors {
    fn validate(&self) -> Result<(), PosteriorError> {
        for (name, value) in [
            ("alpha_phi", self.alpha_phi),
            ("beta_phi", self.beta_phi),
            ("alpha_delta", self.alpha_delta),
            ("beta_delta", self.beta_delta),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(PosteriorError::InvalidHyperprior { name, value });
            }
        }
        Ok(())
    }

    /// Prior mean of `delta`, used as the chain's starting value.
    pub fn delta_0(&self) -> f64 {
        self.alpha_delta / self.beta_delta
    }

    /// `alpha_phi / (beta_phi * delta_0)`, the matching start for `phi`.
    pub fn phi_0(&self) -> f64 {
        self.alpha_phi / (self.beta_phi * self.delta_0())
    }
}

/// Shared read-only data for the posterior.
#[derive(Clone)]
struct SharedData {
    /// Log-periodogram `[n]`
    log_pdgrm: Arc<Array1<f64>>,
    /// Normalized basis `[n, k]`
    basis: Arc<Array2<f64>>,
    /// Penalty `[k, k]`
    penalty: Arc<Array2<f64>>,
    /// Log of the parametric multiplier `[n]`
    log_parametric: Arc<Array1<f64>>,
}

/// Log-posterior over `theta = [w, ln phi, ln delta]`.
#[derive(Clone)]
pub struct LogPosterior {
    data: SharedData,
    priors: HyperPriors,
    /// `log |P|`, from the Cholesky factor.
    penalty_logdet: f64,
    n_basis: usize,
}

impl LogPosterior {
    pub fn new(
        log_pdgrm: Array1<f64>,
        basis: Array2<f64>,
        penalty: Array2<f64>,
        log_parametric: Array1<f64>,
        priors: HyperPriors,
    ) -> Result<Self, PosteriorError> {
        let (n, k) = basis.dim();
        if log_pdgrm.len() != n || log_parametric.len() != n {
            return Err(PosteriorError::ShapeMismatch(format!(
                "basis has {} rows, log-periodogram has {}, parametric model has {}",
                n,
                log_pdgrm.len(),
                log_parametric.len()
            )));
        }
        if penalty.dim() != (k, k) {
            return Err(PosteriorError::ShapeMismatch(format!(
                "penalty is {:?}, expected ({}, {})",
                penalty.dim(),
                k,
                k
            )));
        }
        priors.validate()?;

        let chol = penalty.cholesky(UPLO::Lower)?;
        let penalty_logdet = 2.0 * chol.diag().mapv(f64::ln).sum();

        Ok(Self {
            data: SharedData {
                log_pdgrm: Arc::new(log_pdgrm),
                basis: Arc::new(basis),
                penalty: Arc::new(penalty),
                log_parametric: Arc::new(log_parametric),
            },
            priors,
            penalty_logdet,
            n_basis: k,
        })
    }

    /// Dimension of `theta`: the spline weights plus the two log-hyperparameters.
    pub fn dim(&self) -> usize {
        self.n_basis + 2
    }

    pub fn n_basis(&self) -> usize {
        self.n_basis
    }

    pub fn priors(&self) -> &HyperPriors {
        &self.priors
    }

    /// Starting point `[weights, ln phi_0, ln delta_0]`.
    pub fn initial_point(&self, weights: ArrayView1<f64>) -> Result<Array1<f64>, PosteriorError> {
        if weights.len() != self.n_basis {
            return Err(PosteriorError::ShapeMismatch(format!(
                "initial weights have length {}, expected {}",
                weights.len(),
                self.n_basis
            )));
        }
        let mut theta = Array1::zeros(self.dim());
        theta.slice_mut(s![..self.n_basis]).assign(&weights);
        theta[self.n_basis] = self.priors.phi_0().ln();
        theta[self.n_basis + 1] = self.priors.delta_0().ln();
        Ok(theta)
    }

    /// Log-PSD curve `B w + log S_par`.
    pub fn log_psd(&self, weights: ArrayView1<f64>) -> Array1<f64> {
        self.data.basis.dot(&weights) + self.data.log_parametric.as_ref()
    }

    pub fn logp(&self, theta: ArrayView1<f64>) -> f64 {
        self.logp_and_grad(theta).0
    }

    /// Log-posterior and its gradient with respect to `theta`.
    pub fn logp_and_grad(&self, theta: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let k = self.n_basis;
        let p = &self.priors;
        let weights = theta.slice(s![..k]);
        let ln_phi = theta[k];
        let ln_delta = theta[k + 1];
        let phi = ln_phi.exp();
        let delta = ln_delta.exp();

        // Likelihood
        let log_psd = self.log_psd(weights);
        let ll = whittle_lnlike(self.data.log_pdgrm.view(), log_psd.view());
        let grad_log_psd = whittle_lnlike_grad(self.data.log_pdgrm.view(), log_psd.view());
        let grad_ll_w = self.data.basis.t().dot(&grad_log_psd);

        // Weights prior: N(0, (phi P)^-1)
        let p_w = self.data.penalty.dot(&weights);
        let quad = weights.dot(&p_w);
        let kf = k as f64;
        let lp_w = 0.5 * kf * ln_phi + 0.5 * self.penalty_logdet
            - 0.5 * kf * (2.0 * std::f64::consts::PI).ln()
            - 0.5 * phi * quad;

        // Hyperpriors, including the log-Jacobian of the log transform.
        let rate_phi = delta * p.beta_phi;
        let lp_phi = p.alpha_phi * (ln_delta + p.beta_phi.ln()) + p.alpha_phi * ln_phi - rate_phi * phi;
        let lp_delta = p.alpha_delta * ln_delta - p.beta_delta * delta;

        let logp = ll + lp_w + lp_phi + lp_delta;

        let mut grad = Array1::zeros(k + 2);
        grad.slice_mut(s![..k]).assign(&(&grad_ll_w - &(p_w * phi)));
        grad[k] = p.alpha_phi + 0.5 * kf - phi * (rate_phi + 0.5 * quad);
        grad[k + 1] = p.alpha_phi - rate_phi * phi + p.alpha_delta - p.beta_delta * delta;

        (logp, grad)
    }
}
