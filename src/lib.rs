//! `restart-diffusion` implements the restart sampling strategy from the paper
//! ["Restart Sampling for Improving Generative Processes"][restart] on top of a small noise-schedule ("scheduler")
//! abstraction for denoising diffusion models.
//!
//! The denoising model itself is an external collaborator: anything that holds a scheduler and can advance a latent
//! one schedule position implements [`DiffusionModel`], and the sampler drives it through a freshly derived
//! sub-schedule of timesteps, repeatedly re-noising and re-denoising the latent over a bounded noise-level interval:
//! ```ignore
//! use rand::{rngs::StdRng, SeedableRng};
//! use restart_diffusion::{RestartOptions, RestartSampler};
//!
//! let mut rng = StdRng::seed_from_u64(42);
//! let mut sampler = RestartSampler::new(model, RestartOptions::default().with_steps(10))?;
//! let refined = sampler.sample(latent.view(), &conditioning, &mut rng)?;
//! ```
//!
//! Restart sampling is defined for schedule families exposing cumulative signal-scale factors and noise standard
//! deviations over the full raw timestep range; in this crate that is the [`DDIMScheduler`] family (any scheduler
//! implementing [`RestartCompatible`]).
//!
//! [restart]: https://arxiv.org/pdf/2306.14878.pdf

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub mod models;
pub mod samplers;
pub mod schedulers;

pub use self::models::*;
pub use self::samplers::*;
pub use self::schedulers::*;

/// The output prediction type of the denoising model, determining how a scheduler converts model outputs into
/// denoised samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerPredictionType {
	/// The model predicts the noise component ε added to the sample.
	Epsilon,
	/// The model directly predicts the denoised sample `x_0`.
	Sample,
	/// The model predicts velocity, `v = sqrt(ᾱ)ε - sqrt(1 - ᾱ)x`; see section 2.4 of [Imagen Video][iv].
	///
	/// [iv]: https://imagen.research.google/video/paper.pdf
	VPrediction
}

/// Schedulers implementing this trait provide a constructor with known-good defaults for Stable Diffusion v1 models.
pub trait SchedulerOptimizedDefaults {
	/// Creates a new instance of the scheduler, optimized for Stable Diffusion v1 models.
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized;
}
