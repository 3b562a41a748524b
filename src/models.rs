//! The denoising-model collaborator interface.
//!
//! This crate does not implement any noise-prediction network; samplers drive whatever the caller provides through
//! the narrow [`DiffusionModel`] surface — schedule access and a single stepping call.

use ndarray::{Array4, ArrayView4};
use rand::Rng;

use crate::DiffusionScheduler;

/// An iterative denoising model: a noise-prediction network paired with an active noise schedule.
///
/// Implementations typically wrap a latent-diffusion UNet (ONNX session, remote endpoint, ...) together with the
/// classifier-free-guidance math, but none of that is visible here: a model is anything that can advance a noisy
/// latent one schedule position toward a cleaner one.
pub trait DiffusionModel {
	/// The schedule family this model steps with.
	type Scheduler: DiffusionScheduler;
	/// Caller-supplied conditioning (text embeddings, guidance scale, ...), forwarded verbatim to every stepping
	/// call by samplers.
	type Conditioning;

	/// Returns the model's active scheduler.
	fn scheduler(&self) -> &Self::Scheduler;

	/// Swaps the model's active scheduler, returning the previously active one.
	///
	/// Samplers use this to temporarily install a derived sub-schedule; the previous scheduler value is returned
	/// intact so it can be reinstated afterwards.
	fn replace_scheduler(&mut self, scheduler: Self::Scheduler) -> Self::Scheduler;

	/// Advances `sample` one position of the active schedule.
	///
	/// `step` indexes positions in the active scheduler's timestep sequence, matching
	/// [`DiffusionScheduler::step`]; implementations must tolerate being invoked with an overridden sub-schedule
	/// installed. Errors from the underlying compute device propagate unchanged.
	fn step<R: Rng + ?Sized>(
		&mut self,
		sample: ArrayView4<'_, f32>,
		step: usize,
		conditioning: &Self::Conditioning,
		rng: &mut R
	) -> anyhow::Result<Array4<f32>>;
}
