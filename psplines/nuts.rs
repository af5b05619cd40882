//! NUTS sampler using mini-mcmc
//!
//! `LogPosterior` already provides the log-density and its gradient in
//! closed form, so it is handed to mini-mcmc's No-U-Turn sampler directly:
//! `unnorm_logp_and_grad` is overridden to call `logp_and_grad` on ndarray
//! data, bypassing burn's autodiff.
//!
//! The sampler runs in the unconstrained `theta = [w, ln phi, ln delta]`
//! space with mini-mcmc's identity mass matrix and dual-averaging step size.
//! Chains start at the fitted weights and prior-mean hyperparameters, plus a
//! small seeded jitter so that multiple chains are not identical.

use crate::likelihood::LogPosterior;
use crate::mcmc::{McmcConfig, PosteriorSampler};
use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::TensorData;
use mini_mcmc::distributions::GradientTarget;
use mini_mcmc::nuts::NUTS;
use ndarray::{Array1, Array2, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Backend type for NUTS - uses f64 for numerical precision
pub type NutsBackend = Autodiff<NdArray<f64>>;

fn tensor_to_array(z: Tensor<NutsBackend, 1>) -> Option<Array1<f64>> {
    z.into_data().to_vec::<f64>().ok().map(Array1::from_vec)
}

fn scalar_tensor(value: f64, device: &<NutsBackend as Backend>::Device) -> Tensor<NutsBackend, 1> {
    Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![value], [1]), device)
}

/// Analytical-gradient target for NUTS.
impl GradientTarget<f64, NutsBackend> for LogPosterior {
    fn unnorm_logp(&self, z: Tensor<NutsBackend, 1>) -> Tensor<NutsBackend, 1> {
        let device = z.device();
        let logp = match tensor_to_array(z) {
            Some(theta) if theta.len() == self.dim() => self.logp(theta.view()),
            _ => f64::NEG_INFINITY,
        };
        scalar_tensor(logp, &device)
    }

    fn unnorm_logp_and_grad(
        &self,
        z: Tensor<NutsBackend, 1>,
    ) -> (Tensor<NutsBackend, 1>, Tensor<NutsBackend, 1>) {
        let device = z.device();
        let dim = self.dim();

        let (logp, grad) = match tensor_to_array(z) {
            Some(theta) if theta.len() == dim => self.logp_and_grad(theta.view()),
            _ => (f64::NEG_INFINITY, Array1::zeros(dim)),
        };

        let grad_tensor =
            Tensor::<NutsBackend, 1>::from_data(TensorData::new(grad.to_vec(), [dim]), &device);
        (scalar_tensor(logp, &device), grad_tensor)
    }
}

/// mini-mcmc NUTS behind the `PosteriorSampler` seam.
///
/// Each chain keeps `num_samples` draws after `num_warmup` adaptation steps,
/// so the returned matrix has `n_chains * num_samples` rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutsSampler {
    /// Number of parallel chains
    pub n_chains: usize,
    /// Target acceptance probability for step-size adaptation
    pub target_accept: f64,
    /// Standard deviation of the Gaussian jitter added to each chain's start
    pub init_jitter: f64,
}

impl Default for NutsSampler {
    fn default() -> Self {
        Self {
            n_chains: 1,
            target_accept: 0.8,
            init_jitter: 1e-2,
        }
    }
}

impl PosteriorSampler for NutsSampler {
    fn sample(
        &mut self,
        target: &LogPosterior,
        init: ArrayView1<f64>,
        config: &McmcConfig,
    ) -> Result<Array2<f64>, String> {
        if self.n_chains == 0 {
            return Err("NUTS needs at least one chain".to_string());
        }
        if init.len() != target.dim() {
            return Err(format!(
                "initial point has length {}, target dimension is {}",
                init.len(),
                target.dim()
            ));
        }

        let mut rng = StdRng::seed_from_u64(config.rng_seed);
        let jitter = Normal::new(0.0, self.init_jitter).map_err(|e| e.to_string())?;
        let initial_positions: Vec<Vec<f64>> = (0..self.n_chains)
            .map(|_| init.iter().map(|&x| x + jitter.sample(&mut rng)).collect())
            .collect();

        let mut sampler = NUTS::<f64, NutsBackend, LogPosterior>::new(
            target.clone(),
            initial_positions,
            self.target_accept,
        )
        .set_seed(config.rng_seed);

        let (draws, run_stats) = sampler
            .run_progress(config.num_samples, config.num_warmup)
            .map_err(|e| format!("NUTS sampling failed: {}", e))?;
        log::info!("NUTS sampling complete: {}", run_stats);

        // Draws come back as [chain, draw, dim]; stack the chains.
        let [n_chains, n_draws, dim] = draws.dims();
        let data: Vec<f64> = draws
            .into_data()
            .to_vec()
            .map_err(|e| format!("Could not read NUTS draws: {:?}", e))?;
        Array2::from_shape_vec((n_chains * n_draws, dim), data).map_err(|e| e.to_string())
    }
}
