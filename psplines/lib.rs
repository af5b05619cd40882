#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod basis;
pub mod initialisation;
pub mod knots;
pub mod likelihood;
pub mod mcmc;
pub mod model;
pub mod nuts;
pub mod spectrum;

pub use mcmc::{McmcConfig, McmcOutput, PosteriorSampler, PosteriorSummary, run_mcmc};
pub use model::{FitConfig, LogPSplines, ModelError};
pub use nuts::NutsSampler;
pub use spectrum::Periodogram;
