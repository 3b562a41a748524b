//! The schedule functions, denoted Schedulers in the library, hold the noise schedule of a diffusion model: for an
//! ordered set of discrete timesteps, how much of the original signal survives and how much noise has accumulated.
//!
//! * Schedulers define the methodology for iteratively adding noise to a sample or for updating a sample based on model
//! outputs.
//!   - adding noise in different manners represent the algorithmic processes to train a diffusion model by adding noise
//!     to images.
//!   - for inference, the scheduler defines how to update a sample based on an output from a pretrained model.
//! * Schedule families additionally exposing their raw cumulative scale-factor & noise-std arrays (see
//! [`RestartCompatible`]) can be driven by the restart sampling strategy in [`crate::samplers`].

use ndarray::{Array1, Array4, ArrayBase, ArrayView1, ArrayView4};
use rand::Rng;

mod ddim;
pub use self::ddim::*;

/// A mapping from a beta range to a sequence of betas for stepping the model.
pub enum BetaSchedule {
	/// Linear beta schedule.
	Linear,
	/// Scaled linear beta schedule.
	ScaledLinear,
	/// Glide cosine schedule.
	SquaredcosCapV2,
	/// Pre-trained betas.
	TrainedBetas(Array1<f32>)
}

/// Beta table for [`BetaSchedule::SquaredcosCapV2`]: discretizes the `cos²` alpha-bar function, capping betas at
/// `max_beta`.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f32) -> Array1<f32> {
	let alpha_bar = |time_step: f32| ((time_step + 0.008) / 1.008 * std::f32::consts::FRAC_PI_2).cos().powi(2);
	Array1::from_iter((0..num_diffusion_timesteps).map(|i| {
		let t1 = i as f32 / num_diffusion_timesteps as f32;
		let t2 = (i + 1) as f32 / num_diffusion_timesteps as f32;
		(1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
	}))
}

/// The output returned by a scheduler's `step` function.
pub struct SchedulerStepOutput {
	pub(crate) prev_sample: Array4<f32>,
	pub(crate) pred_original_sample: Option<Array4<f32>>
}

impl SchedulerStepOutput {
	/// Computed sample (`x_{t-1}`) of the previous timestep. `prev_sample` should be used as the next model input in
	/// the denoising loop.
	pub fn prev_sample(&self) -> ArrayView4<'_, f32> {
		self.prev_sample.view()
	}

	/// The predicted denoised sample (`x_{0}`) based on the model output from the current timestep.
	/// `pred_original_sample` can be used to preview progress or for guidance.
	pub fn pred_original_sample(&self) -> Option<ArrayView4<'_, f32>> {
		self.pred_original_sample.as_ref().map(ArrayBase::view)
	}

	/// Consumes the output, returning the computed previous sample.
	pub fn into_prev_sample(self) -> Array4<f32> {
		self.prev_sample
	}
}

/// A noise scheduler to be used with denoising diffusion models.
#[allow(clippy::len_without_is_empty)]
pub trait DiffusionScheduler: Default + Clone {
	/// Sets the number of inference steps, computing the subsampled timestep sequence the denoising loop will visit.
	/// This should be called before `step`.
	fn set_timesteps(&mut self, num_inference_steps: usize);

	/// Predict the sample at the next schedule position by reversing the SDE. Core function to propagate the diffusion
	/// process from the learned model outputs (most often the predicted noise).
	///
	/// `step` indexes *positions* in the current timestep sequence (see [`DiffusionScheduler::timesteps`]); the update
	/// moves the sample from `timesteps[step]` to `timesteps[step + 1]` (or to the terminal state for the last
	/// position). This consecutive-pair convention is what lets samplers install arbitrary sub-schedules.
	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, step: usize, sample: ArrayView4<'_, f32>, rng: &mut R) -> SchedulerStepOutput;

	/// Adds noise to the given samples, forward-diffusing them to the given raw timestep.
	// NOTE: in huggingface diffusers, `timestep` is an array of shape `[batch_size]`, but all elements are identical
	// in the pipelines that call this, so this was simplified to a single timestep
	fn add_noise(&self, original_samples: ArrayView4<'_, f32>, noise: ArrayView4<'_, f32>, timestep: usize) -> Array4<f32>;

	/// Returns the computed scheduler timesteps: the subsampled (typically descending) sequence of raw timesteps the
	/// denoising loop visits.
	fn timesteps(&self) -> ArrayView1<'_, usize>;

	/// Returns the initial sigma noise value.
	fn init_noise_sigma(&self) -> f32;

	/// Returns the number of train timesteps, i.e. the length of the raw timestep range.
	fn len(&self) -> usize;
}

/// The capability set required by the restart sampling strategy.
///
/// Restart sampling is only defined for schedule families whose cumulative signal-scale factors and noise standard
/// deviations are addressable over the full raw timestep range, and whose subsampled timestep sequence can be
/// overridden on a cloned instance. Families that cannot express this (sigma-space schedulers like Euler or LMS)
/// simply do not implement this trait, so pairing them with [`crate::RestartSampler`] is rejected at compile time.
pub trait RestartCompatible: DiffusionScheduler {
	/// The fraction of original signal retained after diffusing to each raw timestep, in `(0, 1]`, indexed by raw
	/// timestep.
	fn cumulative_scale_factors(&self) -> ArrayView1<'_, f32>;

	/// The standard deviation of the noise accumulated by each raw timestep, indexed by raw timestep.
	fn noise_std(&self) -> ArrayView1<'_, f32>;

	/// Replaces the subsampled timestep sequence wholesale.
	///
	/// All entries must be valid raw timesteps. Samplers call this on a *clone* of a model's scheduler to install a
	/// sub-schedule, never on the original.
	fn override_timesteps(&mut self, timesteps: Array1<usize>);

	/// The noise level at a raw timestep, measured independently of the timestep indexing: `noise_std / scale`.
	fn sigma(&self, timestep: usize) -> f32 {
		self.noise_std()[timestep] / self.cumulative_scale_factors()[timestep]
	}
}
